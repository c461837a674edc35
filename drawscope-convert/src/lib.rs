//! 二进制图纸（DWG）到 DXF 的转换，委托给外部转换工具。
//!
//! 工具以目录为单位工作：每个文件先复制进私有的临时输入目录，转换到私有的临时输出目录，
//! 成功后再原子地移动到目标位置，失败或取消时不会留下半成品。

pub mod runner;
pub mod version;

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use drawscope_core::cancel::CancelToken;
use rayon::prelude::*;
use serde::Serialize;
use tempfile::{NamedTempFile, TempDir};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub use runner::{CommandSpec, ProcessOutput, ProcessRunner, RunError, SystemRunner};
pub use version::{OutputKind, OutputVersion};

/// 指定转换工具位置的环境变量。
pub const TOOL_ENV_VAR: &str = "ODA_FILE_CONVERTER";

const KNOWN_TOOL_PATHS: [&str; 4] = [
    "/Applications/ODAFileConverter.app/Contents/MacOS/ODAFileConverter",
    "/usr/local/bin/ODAFileConverter",
    "/usr/bin/ODAFileConverter",
    "/opt/ODAFileConverter/ODAFileConverter",
];

const SOURCE_EXTENSION: &str = "dwg";
const BATCH_OUTPUT_DIR: &str = "converted";
const BACKOFF_SLICE: Duration = Duration::from_millis(50);

/// 单个文件所处的处理阶段。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Staging,
    Audit,
    Convert,
    Collect,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Staging => "staging",
            Stage::Audit => "audit",
            Stage::Convert => "convert",
            Stage::Collect => "collect",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("source path does not exist: {}", .0.display())]
    SourceNotFound(PathBuf),
    #[error("not a DWG file: {}", .0.display())]
    NotBinaryDrawing(PathBuf),
    #[error("conversion tool not found (set ODA_FILE_CONVERTER or converter.tool_path)")]
    ToolNotFound,
    #[error("unsupported output version: {0}")]
    UnsupportedVersion(String),
    #[error("conversion of {} failed during {}: {message}", .path.display(), .stage.as_str())]
    ConversionFailed {
        path: PathBuf,
        stage: Stage,
        message: String,
    },
    #[error(
        "conversion of {} timed out during {} after {attempts} attempt(s) of {timeout_secs}s",
        .path.display(),
        .stage.as_str()
    )]
    ConversionTimeout {
        path: PathBuf,
        stage: Stage,
        attempts: u32,
        timeout_secs: u64,
    },
    #[error("audit rejected {}: {message}", .path.display())]
    AuditFailed { path: PathBuf, message: String },
    #[error("conversion of {} was cancelled", .0.display())]
    Cancelled(PathBuf),
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        stage: Stage,
        #[source]
        source: io::Error,
    },
    #[error("failed to build conversion worker pool: {0}")]
    Pool(String),
}

impl ConvertError {
    /// 出错的文件（如有）。
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConvertError::SourceNotFound(path)
            | ConvertError::NotBinaryDrawing(path)
            | ConvertError::Cancelled(path)
            | ConvertError::ConversionFailed { path, .. }
            | ConvertError::ConversionTimeout { path, .. }
            | ConvertError::AuditFailed { path, .. }
            | ConvertError::Io { path, .. } => Some(path),
            ConvertError::ToolNotFound | ConvertError::UnsupportedVersion(_) | ConvertError::Pool(_) => None,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            ConvertError::ConversionFailed { stage, .. }
            | ConvertError::ConversionTimeout { stage, .. }
            | ConvertError::Io { stage, .. } => Some(*stage),
            ConvertError::AuditFailed { .. } => Some(Stage::Audit),
            _ => None,
        }
    }

    /// 重新提交可能成功的错误。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConvertError::ConversionTimeout { .. } | ConvertError::Cancelled(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct ConverterSettings {
    pub tool_path: Option<PathBuf>,
    /// 单次进程调用的时限。
    pub timeout: Duration,
    /// 瞬时失败（超时、崩溃）后的最多重试次数。
    pub max_retries: u32,
    /// 第一次重试前的等待时间，之后每次翻倍。
    pub backoff: Duration,
    pub max_workers: usize,
}

impl Default for ConverterSettings {
    fn default() -> Self {
        Self {
            tool_path: None,
            timeout: Duration::from_secs(300),
            max_retries: 2,
            backoff: Duration::from_millis(500),
            max_workers: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvertRequest {
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    pub version: OutputVersion,
    pub recursive: bool,
    pub audit: bool,
}

impl ConvertRequest {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: None,
            version: OutputVersion::default(),
            recursive: false,
            audit: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvertedFile {
    pub output_path: PathBuf,
    pub file_size: u64,
    /// 转换阶段实际调用工具的次数。
    pub attempts: u32,
}

#[derive(Debug)]
pub struct FileResult {
    pub source: PathBuf,
    pub result: Result<ConvertedFile, ConvertError>,
}

impl FileResult {
    #[inline]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub files_converted: usize,
    pub files_failed: usize,
    /// 与文件清单顺序一致，每个文件恰好一条。
    pub per_file_results: Vec<FileResult>,
}

#[derive(Debug)]
pub enum ConversionOutcome {
    Single(FileResult),
    Batch(BatchOutcome),
}

impl ConversionOutcome {
    pub fn is_success(&self) -> bool {
        match self {
            ConversionOutcome::Single(file) => file.is_success(),
            ConversionOutcome::Batch(batch) => batch.files_failed == 0,
        }
    }
}

/// 查找转换工具：显式配置、环境变量、常见安装位置，依次尝试。
pub fn locate_tool(configured: Option<&Path>) -> Result<PathBuf, ConvertError> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        warn!(path = %path.display(), "配置的转换工具不存在");
    }
    if let Some(path) = env::var_os(TOOL_ENV_VAR).map(PathBuf::from) {
        if path.is_file() {
            return Ok(path);
        }
        warn!(path = %path.display(), "环境变量指定的转换工具不存在");
    }
    let home = env::var_os("HOME").map(|home| {
        PathBuf::from(home).join("Applications/ODAFileConverter.app/Contents/MacOS/ODAFileConverter")
    });
    KNOWN_TOOL_PATHS
        .iter()
        .map(PathBuf::from)
        .chain(home)
        .find(|path| path.is_file())
        .ok_or(ConvertError::ToolNotFound)
}

pub struct FormatConverter<R = SystemRunner> {
    tool: PathBuf,
    runner: R,
    settings: ConverterSettings,
}

impl FormatConverter<SystemRunner> {
    /// 使用真实进程；找不到工具时在接触任何文件之前失败。
    pub fn discover(settings: ConverterSettings) -> Result<Self, ConvertError> {
        let tool = locate_tool(settings.tool_path.as_deref())?;
        info!(tool = %tool.display(), "已找到转换工具");
        Ok(Self::with_runner(tool, SystemRunner, settings))
    }
}

impl<R: ProcessRunner> FormatConverter<R> {
    pub fn with_runner(tool: impl Into<PathBuf>, runner: R, settings: ConverterSettings) -> Self {
        Self {
            tool: tool.into(),
            runner,
            settings,
        }
    }

    #[inline]
    pub fn tool(&self) -> &Path {
        &self.tool
    }

    #[inline]
    pub fn settings(&self) -> &ConverterSettings {
        &self.settings
    }

    /// 转换单个文件或目录。只有源路径本身的问题会作为 `Err` 返回；
    /// 逐文件的失败记录在结果中，不影响其他文件。
    pub fn convert(&self, request: &ConvertRequest, cancel: &CancelToken) -> Result<ConversionOutcome, ConvertError> {
        let source = &request.source;
        if !source.exists() {
            return Err(ConvertError::SourceNotFound(source.clone()));
        }
        if source.is_dir() {
            let destination = request
                .destination
                .clone()
                .unwrap_or_else(|| source.join(BATCH_OUTPUT_DIR));
            return self
                .convert_batch(source, &destination, request, cancel)
                .map(ConversionOutcome::Batch);
        }
        if !has_source_extension(source) {
            return Err(ConvertError::NotBinaryDrawing(source.clone()));
        }
        let destination = request
            .destination
            .clone()
            .unwrap_or_else(|| source.with_extension(OutputKind::Dxf.extension()));
        let result = self.convert_file(source, &destination, request.version, request.audit, cancel);
        Ok(ConversionOutcome::Single(FileResult {
            source: source.clone(),
            result,
        }))
    }

    fn convert_batch(
        &self,
        root: &Path,
        destination: &Path,
        request: &ConvertRequest,
        cancel: &CancelToken,
    ) -> Result<BatchOutcome, ConvertError> {
        let worklist = collect_sources(root, destination, request.recursive);
        info!(
            root = %root.display(),
            files = worklist.len(),
            workers = self.settings.max_workers,
            "开始批量转换"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.max_workers.max(1))
            .thread_name(|i| format!("drawscope-convert-{i}"))
            .build()
            .map_err(|err| ConvertError::Pool(err.to_string()))?;

        let per_file_results: Vec<FileResult> = pool.install(|| {
            worklist
                .par_iter()
                .map(|source| {
                    let relative = source.strip_prefix(root).unwrap_or(source);
                    let target = destination
                        .join(relative)
                        .with_extension(OutputKind::Dxf.extension());
                    FileResult {
                        source: source.clone(),
                        result: self.convert_file(source, &target, request.version, request.audit, cancel),
                    }
                })
                .collect()
        });

        let files_converted = per_file_results.iter().filter(|file| file.is_success()).count();
        let files_failed = per_file_results.len() - files_converted;
        info!(files_converted, files_failed, "批量转换结束");
        Ok(BatchOutcome {
            files_converted,
            files_failed,
            per_file_results,
        })
    }

    fn convert_file(
        &self,
        source: &Path,
        destination: &Path,
        version: OutputVersion,
        audit: bool,
        cancel: &CancelToken,
    ) -> Result<ConvertedFile, ConvertError> {
        if cancel.is_cancelled() {
            return Err(ConvertError::Cancelled(source.to_path_buf()));
        }
        let staging = Staging::prepare(source)?;

        if audit {
            self.audit(source, &staging, version, cancel)?;
        }

        let command = self.command(&staging.input, &staging.output, version, OutputKind::Dxf, false);
        let (output, attempts) = self.run_with_retry(source, Stage::Convert, &command, cancel)?;
        if !output.is_success() {
            return Err(ConvertError::ConversionFailed {
                path: source.to_path_buf(),
                stage: Stage::Convert,
                message: describe_exit(&output),
            });
        }

        let produced = find_output(&staging.output, OutputKind::Dxf).ok_or_else(|| ConvertError::ConversionFailed {
            path: source.to_path_buf(),
            stage: Stage::Collect,
            message: "工具未生成 DXF 文件".to_string(),
        })?;
        let file_size = publish(&produced, destination).map_err(|err| ConvertError::Io {
            path: destination.to_path_buf(),
            stage: Stage::Collect,
            source: err,
        })?;
        debug!(
            source = %source.display(),
            output = %destination.display(),
            file_size,
            attempts,
            "文件转换完成"
        );
        Ok(ConvertedFile {
            output_path: destination.to_path_buf(),
            file_size,
            attempts,
        })
    }

    /// 审计阶段：开启审计并输出到临时目录。非零退出或生成 `.err` 报告都视为源文件损坏。
    fn audit(
        &self,
        source: &Path,
        staging: &Staging,
        version: OutputVersion,
        cancel: &CancelToken,
    ) -> Result<(), ConvertError> {
        let command = self.command(&staging.input, &staging.scratch, version, OutputKind::Dwg, true);
        let (output, _) = self.run_with_retry(source, Stage::Audit, &command, cancel)?;
        if !output.is_success() {
            return Err(ConvertError::AuditFailed {
                path: source.to_path_buf(),
                message: describe_exit(&output),
            });
        }
        if let Some(report) = find_error_report(&staging.scratch) {
            let message = fs::read_to_string(&report)
                .map(|text| text.trim().to_string())
                .unwrap_or_else(|_| "审计生成了错误报告".to_string());
            return Err(ConvertError::AuditFailed {
                path: source.to_path_buf(),
                message,
            });
        }
        Ok(())
    }

    /// `<tool> <in_dir> <out_dir> <version> <DXF|DWG> <recurse 0|1> <audit 0|1>`
    fn command(&self, input: &Path, output: &Path, version: OutputVersion, kind: OutputKind, audit: bool) -> CommandSpec {
        CommandSpec::new(&self.tool)
            .arg(input)
            .arg(output)
            .arg(version.as_str())
            .arg(kind.as_str())
            .arg("0")
            .arg(if audit { "1" } else { "0" })
    }

    /// 超时与崩溃按瞬时失败处理，带指数退避重试；非零退出码直接返回给调用方判断。
    /// 每次尝试与每段退避之前都检查取消标记。
    fn run_with_retry(
        &self,
        source: &Path,
        stage: Stage,
        command: &CommandSpec,
        cancel: &CancelToken,
    ) -> Result<(ProcessOutput, u32), ConvertError> {
        let cancelled = || {
            info!(source = %source.display(), stage = stage.as_str(), "转换已取消");
            ConvertError::Cancelled(source.to_path_buf())
        };
        let max_attempts = self.settings.max_retries + 1;
        let mut last_transient = None;
        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            match self.runner.run(command, self.settings.timeout, cancel) {
                Ok(output) if output.exit_code.is_some() => return Ok((output, attempt)),
                Ok(output) => {
                    warn!(source = %source.display(), stage = stage.as_str(), attempt, "转换工具异常退出");
                    last_transient = Some(ConvertError::ConversionFailed {
                        path: source.to_path_buf(),
                        stage,
                        message: describe_exit(&output),
                    });
                }
                Err(RunError::Timeout(timeout)) => {
                    warn!(source = %source.display(), stage = stage.as_str(), attempt, ?timeout, "转换工具超时");
                    last_transient = Some(ConvertError::ConversionTimeout {
                        path: source.to_path_buf(),
                        stage,
                        attempts: attempt,
                        timeout_secs: timeout.as_secs(),
                    });
                }
                Err(RunError::Cancelled) => return Err(cancelled()),
                Err(RunError::Spawn(err)) => {
                    return Err(ConvertError::ConversionFailed {
                        path: source.to_path_buf(),
                        stage,
                        message: err.to_string(),
                    });
                }
            }
            if attempt < max_attempts {
                let delay = self.settings.backoff.saturating_mul(1 << (attempt - 1).min(16));
                if !wait_backoff(delay, cancel) {
                    return Err(cancelled());
                }
            }
        }
        Err(last_transient.unwrap_or(ConvertError::ConversionFailed {
            path: source.to_path_buf(),
            stage,
            message: "未执行转换".to_string(),
        }))
    }
}

/// 单个文件的私有临时目录：`input/` 放源文件副本，`output/` 接收转换结果，`scratch/` 供审计使用。
struct Staging {
    _root: TempDir,
    input: PathBuf,
    output: PathBuf,
    scratch: PathBuf,
}

impl Staging {
    fn prepare(source: &Path) -> Result<Self, ConvertError> {
        let io_error = |err: io::Error| ConvertError::Io {
            path: source.to_path_buf(),
            stage: Stage::Staging,
            source: err,
        };
        let root = tempfile::Builder::new()
            .prefix("drawscope-convert-")
            .tempdir()
            .map_err(io_error)?;
        let input = root.path().join("input");
        let output = root.path().join("output");
        let scratch = root.path().join("scratch");
        for dir in [&input, &output, &scratch] {
            fs::create_dir(dir).map_err(io_error)?;
        }
        let file_name = source
            .file_name()
            .ok_or_else(|| ConvertError::NotBinaryDrawing(source.to_path_buf()))?;
        fs::copy(source, input.join(file_name)).map_err(io_error)?;
        Ok(Self {
            _root: root,
            input,
            output,
            scratch,
        })
    }
}

/// 分段等待，取消时提前返回 false。
fn wait_backoff(delay: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        thread::sleep(remaining.min(BACKOFF_SLICE));
    }
}

fn has_source_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(SOURCE_EXTENSION))
}

/// 目录下待转换的文件，按路径排序；目标目录本身不参与遍历。
fn collect_sources(root: &Path, destination: &Path, recursive: bool) -> Vec<PathBuf> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|entry| entry.path() != destination)
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, "遍历目录时跳过不可读的条目");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && has_source_extension(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

fn find_output(dir: &Path, kind: OutputKind) -> Option<PathBuf> {
    find_with_extension(dir, kind.extension())
}

fn find_error_report(dir: &Path) -> Option<PathBuf> {
    find_with_extension(dir, "err")
}

fn find_with_extension(dir: &Path, extension: &str) -> Option<PathBuf> {
    let mut matches: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
        })
        .collect();
    matches.sort();
    matches.into_iter().next()
}

/// 先写到目标目录中的临时文件，再改名为最终文件名。
fn publish(produced: &Path, destination: &Path) -> io::Result<u64> {
    let parent = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    let mut staged = NamedTempFile::new_in(&parent)?;
    let mut reader = fs::File::open(produced)?;
    io::copy(&mut reader, staged.as_file_mut())?;
    staged.as_file().sync_all()?;
    staged.persist(destination).map_err(|err| err.error)?;
    Ok(fs::metadata(destination)?.len())
}

fn describe_exit(output: &ProcessOutput) -> String {
    let detail = output.diagnostic();
    match (output.exit_code, detail.is_empty()) {
        (Some(code), true) => format!("退出码 {code}"),
        (Some(code), false) => format!("退出码 {code}: {detail}"),
        (None, true) => "进程异常终止".to_string(),
        (None, false) => format!("进程异常终止: {detail}"),
    }
}
