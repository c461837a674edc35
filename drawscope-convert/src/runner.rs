//! 外部命令执行：带超时地运行一个进程，返回退出码与输出。

use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use drawscope_core::cancel::CancelToken;
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[inline]
    pub fn program(&self) -> &Path {
        &self.program
    }

    #[inline]
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// 第 `index` 个参数按路径解释。
    pub fn path_arg(&self, index: usize) -> Option<&Path> {
        self.args.get(index).map(Path::new)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// 进程被信号终止（崩溃）时为 None。
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success() -> Self {
        Self {
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn crashed() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// 报错时使用的输出摘要：优先 stderr。
    pub fn diagnostic(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        text.to_string()
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("process exceeded its timeout of {0:?}")]
    Timeout(Duration),
    #[error("failed to start process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("process was cancelled")]
    Cancelled,
}

/// 运行外部命令的窄接口，转换逻辑只依赖它，测试中可以用闭包代替真实进程。
/// 实现应在 `cancel` 被触发后尽快结束并返回 `RunError::Cancelled`。
pub trait ProcessRunner: Send + Sync {
    fn run(&self, command: &CommandSpec, timeout: Duration, cancel: &CancelToken) -> Result<ProcessOutput, RunError>;
}

impl<F> ProcessRunner for F
where
    F: Fn(&CommandSpec, Duration, &CancelToken) -> Result<ProcessOutput, RunError> + Send + Sync,
{
    fn run(&self, command: &CommandSpec, timeout: Duration, cancel: &CancelToken) -> Result<ProcessOutput, RunError> {
        self(command, timeout, cancel)
    }
}

/// 基于 `std::process` 的实现：轮询等待，超时或取消即终止进程。
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, command: &CommandSpec, timeout: Duration, cancel: &CancelToken) -> Result<ProcessOutput, RunError> {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        debug!(program = %command.program().display(), args = ?command.args(), "启动外部进程");
        let mut child = Command::new(command.program())
            .args(command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(RunError::Spawn)?;

        // 管道写满会阻塞子进程，因此在独立线程中读取
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if cancel.is_cancelled() => {
                    warn!(program = %command.program().display(), "外部进程被取消，强制结束");
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(RunError::Cancelled);
                }
                Ok(None) if started.elapsed() >= timeout => {
                    warn!(program = %command.program().display(), ?timeout, "外部进程超时，强制结束");
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(RunError::Timeout(timeout));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) => return Err(RunError::Spawn(err)),
            }
        };

        Ok(ProcessOutput {
            exit_code: status.code(),
            stdout: stdout.map(collect).unwrap_or_default(),
            stderr: stderr.map(collect).unwrap_or_default(),
        })
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = reader.read_to_end(&mut bytes);
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

fn collect(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}
