use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use drawscope_convert::{
    CommandSpec, ConversionOutcome, ConvertError, ConvertRequest, ConverterSettings, FormatConverter,
    ProcessOutput, RunError, Stage,
};
use drawscope_core::cancel::CancelToken;

#[derive(Default)]
struct Calls {
    audit: AtomicUsize,
    convert: AtomicUsize,
}

/// 模拟转换工具：按文件名决定行为。
/// `corrupt` 非零退出，`slow` 总是超时，`flaky` 首次超时，`crash` 异常终止，
/// `broken` 审计时生成 `.err` 报告，`stall` 审计时超时，其余正常输出同名 DXF。
fn fake_tool(
    calls: &Calls,
) -> impl Fn(&CommandSpec, Duration, &CancelToken) -> Result<ProcessOutput, RunError> + Send + Sync + '_ {
    move |command: &CommandSpec, timeout: Duration, _cancel: &CancelToken| {
        let input = command.path_arg(0).expect("缺少输入目录");
        let output = command.path_arg(1).expect("缺少输出目录");
        let kind = command.args()[3].to_string_lossy().into_owned();
        let source = fs::read_dir(input)
            .expect("读取输入目录失败")
            .next()
            .expect("输入目录为空")
            .expect("读取目录项失败")
            .path();
        let name = source
            .file_name()
            .expect("缺少文件名")
            .to_string_lossy()
            .into_owned();

        if kind == "DWG" {
            calls.audit.fetch_add(1, Ordering::SeqCst);
            if name.contains("stall") {
                return Err(RunError::Timeout(timeout));
            }
            if name.contains("broken") {
                fs::write(output.join("report.err"), "invalid object map").expect("写入失败");
            }
            return Ok(ProcessOutput::success());
        }

        let call = calls.convert.fetch_add(1, Ordering::SeqCst);
        if name.contains("corrupt") {
            return Ok(ProcessOutput::failure(1, "file is corrupt"));
        }
        if name.contains("slow") || (name.contains("flaky") && call == 0) {
            return Err(RunError::Timeout(timeout));
        }
        if name.contains("crash") {
            return Ok(ProcessOutput::crashed());
        }
        let stem = source.file_stem().expect("缺少文件名").to_string_lossy().into_owned();
        fs::write(output.join(format!("{stem}.dxf")), b"0\nSECTION\n0\nEOF\n").expect("写入失败");
        Ok(ProcessOutput::success())
    }
}

fn settings() -> ConverterSettings {
    ConverterSettings {
        tool_path: None,
        timeout: Duration::from_secs(1),
        max_retries: 2,
        backoff: Duration::ZERO,
        max_workers: 2,
    }
}

fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("创建目录失败");
    }
    fs::write(path, b"AC1032").expect("写入失败");
}

fn single(outcome: ConversionOutcome) -> drawscope_convert::FileResult {
    match outcome {
        ConversionOutcome::Single(file) => file,
        ConversionOutcome::Batch(_) => panic!("单文件转换不应返回批量结果"),
    }
}

#[test]
fn single_file_lands_next_to_source() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let source = dir.path().join("plan.dwg");
    touch(&source);
    let calls = Calls::default();
    let converter = FormatConverter::with_runner("/opt/tool", fake_tool(&calls), settings());

    let outcome = converter
        .convert(&ConvertRequest::new(&source), &CancelToken::new())
        .expect("转换请求失败");
    let file = single(outcome);
    let converted = file.result.expect("转换应当成功");
    assert_eq!(converted.output_path, dir.path().join("plan.dxf"));
    assert_eq!(converted.file_size, 16);
    assert_eq!(converted.attempts, 1);
    assert_eq!(calls.audit.load(Ordering::SeqCst), 0);
}

#[test]
fn missing_and_foreign_sources_fail_fast() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let calls = Calls::default();
    let converter = FormatConverter::with_runner("/opt/tool", fake_tool(&calls), settings());

    let err = converter
        .convert(&ConvertRequest::new(dir.path().join("absent.dwg")), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, ConvertError::SourceNotFound(_)));

    let text = dir.path().join("notes.txt");
    touch(&text);
    let err = converter
        .convert(&ConvertRequest::new(&text), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, ConvertError::NotBinaryDrawing(_)));
    assert_eq!(calls.convert.load(Ordering::SeqCst), 0);
}

#[test]
fn batch_reports_every_file_once() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let root = dir.path().join("drawings");
    touch(&root.join("a.dwg"));
    touch(&root.join("corrupt.dwg"));
    touch(&root.join("sub/c.DWG"));
    touch(&root.join("readme.txt"));
    let calls = Calls::default();
    let converter = FormatConverter::with_runner("/opt/tool", fake_tool(&calls), settings());

    let request = ConvertRequest {
        recursive: true,
        ..ConvertRequest::new(&root)
    };
    let outcome = converter.convert(&request, &CancelToken::new()).expect("批量转换失败");
    let ConversionOutcome::Batch(batch) = outcome else {
        panic!("目录转换应返回批量结果");
    };
    assert_eq!(batch.per_file_results.len(), 3);
    assert_eq!(batch.files_converted, 2);
    assert_eq!(batch.files_failed, 1);

    let converted = root.join("converted");
    assert!(converted.join("a.dxf").is_file());
    assert!(converted.join("sub/c.dxf").is_file());
    assert!(!converted.join("corrupt.dxf").exists());

    let failure = batch
        .per_file_results
        .iter()
        .find(|file| !file.is_success())
        .expect("应当有失败的文件");
    assert!(failure.source.ends_with("corrupt.dwg"));
    let err = failure.result.as_ref().unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Convert));
    // 非零退出属于持久失败，不重试
    assert_eq!(calls.convert.load(Ordering::SeqCst), 3);
}

#[test]
fn non_recursive_batch_skips_subdirectories() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let root = dir.path().join("drawings");
    touch(&root.join("a.dwg"));
    touch(&root.join("sub/b.dwg"));
    let calls = Calls::default();
    let converter = FormatConverter::with_runner("/opt/tool", fake_tool(&calls), settings());
    let destination = dir.path().join("out");

    let request = ConvertRequest {
        destination: Some(destination.clone()),
        ..ConvertRequest::new(&root)
    };
    let ConversionOutcome::Batch(batch) = converter.convert(&request, &CancelToken::new()).expect("批量转换失败")
    else {
        panic!("目录转换应返回批量结果");
    };
    assert_eq!(batch.per_file_results.len(), 1);
    assert!(destination.join("a.dxf").is_file());
}

#[test]
fn timeouts_are_retried_then_surfaced() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let source = dir.path().join("slow.dwg");
    touch(&source);
    let calls = Calls::default();
    let converter = FormatConverter::with_runner("/opt/tool", fake_tool(&calls), settings());

    let file = single(
        converter
            .convert(&ConvertRequest::new(&source), &CancelToken::new())
            .expect("转换请求失败"),
    );
    let err = file.result.unwrap_err();
    assert!(matches!(err, ConvertError::ConversionTimeout { attempts: 3, timeout_secs: 1, .. }));
    assert!(err.is_retryable());
    assert_eq!(calls.convert.load(Ordering::SeqCst), 3);
    assert!(!dir.path().join("slow.dxf").exists());
}

#[test]
fn transient_timeout_recovers_on_retry() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let source = dir.path().join("flaky.dwg");
    touch(&source);
    let calls = Calls::default();
    let converter = FormatConverter::with_runner("/opt/tool", fake_tool(&calls), settings());

    let file = single(
        converter
            .convert(&ConvertRequest::new(&source), &CancelToken::new())
            .expect("转换请求失败"),
    );
    assert_eq!(file.result.expect("重试后应当成功").attempts, 2);
}

#[test]
fn crashes_exhaust_retries_as_failures() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let source = dir.path().join("crash.dwg");
    touch(&source);
    let calls = Calls::default();
    let converter = FormatConverter::with_runner("/opt/tool", fake_tool(&calls), settings());

    let file = single(
        converter
            .convert(&ConvertRequest::new(&source), &CancelToken::new())
            .expect("转换请求失败"),
    );
    assert!(matches!(
        file.result,
        Err(ConvertError::ConversionFailed { stage: Stage::Convert, .. })
    ));
    assert_eq!(calls.convert.load(Ordering::SeqCst), 3);
}

#[test]
fn audit_report_blocks_conversion() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let source = dir.path().join("broken.dwg");
    touch(&source);
    let calls = Calls::default();
    let converter = FormatConverter::with_runner("/opt/tool", fake_tool(&calls), settings());

    let request = ConvertRequest {
        audit: true,
        ..ConvertRequest::new(&source)
    };
    let file = single(converter.convert(&request, &CancelToken::new()).expect("转换请求失败"));
    match file.result {
        Err(ConvertError::AuditFailed { message, .. }) => assert_eq!(message, "invalid object map"),
        other => panic!("应当审计失败，实际为 {other:?}"),
    }
    assert_eq!(calls.audit.load(Ordering::SeqCst), 1);
    assert_eq!(calls.convert.load(Ordering::SeqCst), 0);
}

#[test]
fn audited_clean_file_converts() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let source = dir.path().join("plan.dwg");
    touch(&source);
    let calls = Calls::default();
    let converter = FormatConverter::with_runner("/opt/tool", fake_tool(&calls), settings());

    let request = ConvertRequest {
        audit: true,
        destination: Some(dir.path().join("nested/out.dxf")),
        ..ConvertRequest::new(&source)
    };
    let file = single(converter.convert(&request, &CancelToken::new()).expect("转换请求失败"));
    let converted = file.result.expect("转换应当成功");
    assert_eq!(converted.output_path, dir.path().join("nested/out.dxf"));
    assert_eq!(calls.audit.load(Ordering::SeqCst), 1);
}

#[test]
fn cancelled_batch_schedules_nothing() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let root = dir.path().join("drawings");
    touch(&root.join("a.dwg"));
    touch(&root.join("b.dwg"));
    let calls = Calls::default();
    let converter = FormatConverter::with_runner("/opt/tool", fake_tool(&calls), settings());
    let cancel = CancelToken::new();
    cancel.cancel();

    let ConversionOutcome::Batch(batch) = converter
        .convert(&ConvertRequest::new(&root), &cancel)
        .expect("批量转换失败")
    else {
        panic!("目录转换应返回批量结果");
    };
    assert_eq!(batch.files_failed, 2);
    assert!(batch
        .per_file_results
        .iter()
        .all(|file| matches!(file.result, Err(ConvertError::Cancelled(_)))));
    assert_eq!(calls.convert.load(Ordering::SeqCst), 0);
    assert!(!root.join("converted").exists());
}

#[test]
fn audit_timeout_names_audit_stage() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let source = dir.path().join("stall.dwg");
    touch(&source);
    let calls = Calls::default();
    let converter = FormatConverter::with_runner("/opt/tool", fake_tool(&calls), settings());

    let request = ConvertRequest {
        audit: true,
        ..ConvertRequest::new(&source)
    };
    let file = single(converter.convert(&request, &CancelToken::new()).expect("转换请求失败"));
    let err = file.result.unwrap_err();
    assert!(matches!(
        err,
        ConvertError::ConversionTimeout {
            stage: Stage::Audit,
            attempts: 3,
            ..
        }
    ));
    assert_eq!(err.stage(), Some(Stage::Audit));
    assert_eq!(calls.audit.load(Ordering::SeqCst), 3);
    assert_eq!(calls.convert.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_during_execution_stops_retries() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let source = dir.path().join("a.dwg");
    touch(&source);
    let attempts = AtomicUsize::new(0);
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    // 第一次调用期间取消，并报告超时，模拟运行中被打断
    let runner = |_: &CommandSpec, timeout: Duration, _: &CancelToken| -> Result<ProcessOutput, RunError> {
        attempts.fetch_add(1, Ordering::SeqCst);
        trigger.cancel();
        Err(RunError::Timeout(timeout))
    };
    let converter = FormatConverter::with_runner(
        "/opt/tool",
        runner,
        ConverterSettings {
            backoff: Duration::from_secs(30),
            ..settings()
        },
    );

    let started = Instant::now();
    let file = single(converter.convert(&ConvertRequest::new(&source), &cancel).expect("转换请求失败"));
    assert!(matches!(file.result, Err(ConvertError::Cancelled(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!dir.path().join("a.dxf").exists());
}

#[test]
fn runner_cancellation_is_reported_as_cancelled() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let source = dir.path().join("a.dwg");
    touch(&source);
    let runner = |_: &CommandSpec, _: Duration, _: &CancelToken| -> Result<ProcessOutput, RunError> {
        Err(RunError::Cancelled)
    };
    let converter = FormatConverter::with_runner("/opt/tool", runner, settings());

    let file = single(
        converter
            .convert(&ConvertRequest::new(&source), &CancelToken::new())
            .expect("转换请求失败"),
    );
    assert!(matches!(file.result, Err(ConvertError::Cancelled(_))));
}
