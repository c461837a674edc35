use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use drawscope_config::{AppConfig, ThresholdMode};
use drawscope_convert::{CommandSpec, FormatConverter, ProcessOutput, RunError};
use drawscope_core::cancel::CancelToken;
use drawscope_core::index::BoundsState;
use drawscope_frontend::{ConversionRequest, DrawingService, RectPayload, RenderParams};

/// 范围 (0,0)-(50000,30000) 的图纸，(3000,3500) 处有一行 8 单位高的文字。
const WIDE_PLAN: &str = "0\nSECTION\n2\nENTITIES\n\
0\nLINE\n8\nWALL\n10\n0\n20\n0\n11\n50000\n21\n30000\n\
0\nLINE\n8\nWALL\n10\n0\n20\n30000\n11\n50000\n21\n0\n\
0\nTEXT\n8\nTEXT\n10\n3000\n20\n3500\n40\n8\n1\nA\n\
0\nENDSEC\n0\nEOF\n";

const EMPTY_PLAN: &str = "0\nSECTION\n2\nENTITIES\n0\nENDSEC\n0\nEOF\n";

fn floor_plan() -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("../drawscope-io/tests/data/floor_plan.dxf");
    path
}

fn service(dir: &Path) -> DrawingService {
    let mut config = AppConfig::default();
    config.render.output_dir = dir.join("rendered");
    config.render.worker_threads = 2;
    DrawingService::new(config).expect("创建服务失败")
}

fn write_plan(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).expect("写入图纸失败");
    path
}

fn rect(x: f64, y: f64, width: f64, height: f64) -> RectPayload {
    RectPayload { x, y, width, height }
}

fn sized(width: u32, height: u32) -> RenderParams {
    RenderParams {
        output_size: Some((width, height)),
        ..RenderParams::default()
    }
}

#[test]
fn bounds_report_extent_and_fallback_region() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let plan = write_plan(dir.path(), "wide.dxf", WIDE_PLAN);
    let summary = service(dir.path())
        .get_drawing_bounds(&plan, None, None)
        .expect("计算范围失败");

    assert_eq!(summary.bounds.state, BoundsState::Normal);
    let extent = summary.bounds.extent.expect("应有范围");
    assert!((extent.width - 50000.0).abs() < 1e-9);
    assert!((extent.height - 30000.0).abs() < 1e-9);
    assert_eq!(summary.entity_count, 3);
    assert_eq!(summary.layers, vec!["TEXT".to_string(), "WALL".to_string()]);

    // 每个网格最多三个实体，默认阈值下没有活跃网格，退化为整图区域
    assert!(summary.used_fallback);
    assert_eq!(summary.regions.len(), 1);
    assert_eq!(summary.regions[0].priority, 1);
    assert_eq!(summary.regions[0].entity_count, 3);
}

#[test]
fn region_render_keeps_inner_bbox_and_scale() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let plan = write_plan(dir.path(), "wide.dxf", WIDE_PLAN);
    let service = service(dir.path());
    let bbox = rect(1000.0, 2000.0, 5000.0, 3000.0);

    let payload = service
        .render_region(&plan, bbox, &sized(2048, 2048), &CancelToken::new())
        .expect("渲染失败");
    assert!((payload.scale - 0.4096).abs() < 1e-9);
    assert!(!payload.clamped);
    assert_eq!(
        payload.actual_bbox,
        RectPayload {
            x: 1000.0,
            y: 2000.0,
            width: 5000.0,
            height: 3000.0
        }
    );
    assert_eq!(payload.output_size, [2048, 2048]);
    assert!(payload.image_path.starts_with(dir.path().join("rendered")));
    let bytes = fs::read(&payload.image_path).expect("读取输出图像失败");
    assert_eq!(&bytes[1..4], b"PNG");
}

#[test]
fn small_canvas_suggests_zoom() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let plan = write_plan(dir.path(), "wide.dxf", WIDE_PLAN);
    let bbox = rect(1000.0, 2000.0, 5000.0, 3000.0);

    let payload = service(dir.path())
        .render_region(&plan, bbox, &sized(64, 64), &CancelToken::new())
        .expect("渲染失败");
    assert!(payload.needs_zoom);
    let zoom = payload.zoom.expect("应当给出缩放建议");
    assert!((zoom.required_scale - 2.5).abs() < 1e-9);
    assert!(zoom.suggested_bbox.width < 5000.0);
    assert!(zoom.suggested_bbox.height < 3000.0);
}

#[test]
fn zero_width_bbox_is_degenerate() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let plan = write_plan(dir.path(), "wide.dxf", WIDE_PLAN);
    let service = service(dir.path());

    let err = service
        .render_region(
            &plan,
            rect(0.0, 0.0, 0.0, 100.0),
            &sized(256, 256),
            &CancelToken::new(),
        )
        .unwrap_err();
    let report = err.report();
    assert_eq!(report.kind, "DegenerateBBox");
    assert_eq!(report.stage, Some("render"));
    assert!(!report.retryable);

    let tiny = service
        .render_region(
            &plan,
            rect(10.0, 10.0, 1e-6, 1e-6),
            &sized(16, 16),
            &CancelToken::new(),
        )
        .expect("极小的正尺寸不应报错");
    assert!(tiny.scale > 0.0);
}

#[test]
fn positive_width_far_from_origin_is_not_degenerate() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let plan = write_plan(dir.path(), "wide.dxf", WIDE_PLAN);
    let service = service(dir.path());

    let err = service
        .render_region(&plan, rect(1_000_000.0, 0.0, 1e-11, 100.0), &sized(64, 64), &CancelToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidBBox");
    assert_eq!(err.report().stage, Some("render"));

    let err = service
        .render_region(&plan, rect(1_000_000.0, 0.0, 0.0, 100.0), &sized(64, 64), &CancelToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), "DegenerateBBox");
}

#[test]
fn grid_size_can_be_overridden_per_call() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let service = service(dir.path());

    let configured = service
        .get_drawing_bounds(&floor_plan(), None, None)
        .expect("计算范围失败");
    let fine = service
        .get_drawing_bounds(&floor_plan(), None, Some(500.0))
        .expect("计算范围失败");
    assert_eq!(configured.bounds, fine.bounds);
    assert!(fine.regions.iter().all(|region| region.bbox.width > 0.0));

    let err = service
        .get_drawing_bounds(&floor_plan(), None, Some(0.0))
        .unwrap_err();
    assert_eq!(err.kind(), "DetectionFailed");
}

#[test]
fn overview_matches_full_extent_region() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let plan = write_plan(dir.path(), "wide.dxf", WIDE_PLAN);
    let service = service(dir.path());
    let params = sized(512, 512);

    let overview = service
        .render_overview(&plan, &params, &CancelToken::new())
        .expect("总览渲染失败");
    assert_eq!(overview.bounds.state, BoundsState::Normal);
    assert!((overview.render.scale - 512.0 / 50000.0).abs() < 1e-12);

    let region = service
        .render_region(&plan, overview.render.actual_bbox, &params, &CancelToken::new())
        .expect("渲染失败");
    assert_eq!(region.scale, overview.render.scale);
    assert_eq!(region.actual_bbox, overview.render.actual_bbox);
    assert_eq!(region.image_path, overview.render.image_path);
    assert_eq!(service.cache_stats().hits, 1);
}

#[test]
fn repeated_requests_are_served_from_cache() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let plan = write_plan(dir.path(), "wide.dxf", WIDE_PLAN);
    let service = service(dir.path());
    let bbox = rect(0.0, 0.0, 10000.0, 10000.0);

    let first = service
        .render_region(&plan, bbox, &sized(128, 128), &CancelToken::new())
        .expect("渲染失败");
    let second = service
        .render_region(&plan, bbox, &sized(128, 128), &CancelToken::new())
        .expect("渲染失败");
    assert_eq!(first, second);
    let stats = service.cache_stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 1);
}

#[test]
fn edited_drawing_invalidates_cached_renders() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let plan = write_plan(dir.path(), "plan.dxf", WIDE_PLAN);
    let service = service(dir.path());
    let bbox = rect(0.0, 0.0, 10000.0, 10000.0);

    let before = service
        .render_region(&plan, bbox, &sized(128, 128), &CancelToken::new())
        .expect("渲染失败");
    let edited = WIDE_PLAN.replace("50000", "400000");
    fs::write(&plan, edited).expect("改写图纸失败");
    let after = service
        .render_region(&plan, bbox, &sized(128, 128), &CancelToken::new())
        .expect("渲染失败");

    assert_ne!(before.image_path, after.image_path);
    let stats = service.cache_stats();
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.entries, 1);
}

#[test]
fn empty_drawing_is_a_state_not_an_error() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let plan = write_plan(dir.path(), "empty.dxf", EMPTY_PLAN);
    let service = service(dir.path());

    let summary = service.get_drawing_bounds(&plan, None, None).expect("空图纸不应报错");
    assert_eq!(summary.bounds.state, BoundsState::Empty);
    assert!(summary.bounds.extent.is_none());
    assert!(summary.regions.is_empty());

    let err = service
        .render_overview(&plan, &sized(64, 64), &CancelToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), "EmptyDrawing");

    let blank = service
        .render_region(
            &plan,
            rect(0.0, 0.0, 100.0, 100.0),
            &sized(32, 32),
            &CancelToken::new(),
        )
        .expect("空图纸的区域渲染应得到空白画布");
    assert_eq!(blank.entities_drawn, 0);
}

#[test]
fn missing_source_is_reported_with_its_path() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let missing = dir.path().join("absent.dxf");
    let err = service(dir.path()).get_drawing_bounds(&missing, None, None).unwrap_err();
    let report = err.report();
    assert_eq!(report.kind, "SourceNotFound");
    assert_eq!(report.file, Some(missing));
}

#[test]
fn top_regions_render_in_parallel() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let mut config = AppConfig::default();
    config.render.output_dir = dir.path().join("rendered");
    config.detection.grid_cell_size = 500.0;
    config.detection.density_threshold = 1;
    config.detection.threshold_mode = ThresholdMode::Absolute;
    let service = DrawingService::new(config).expect("创建服务失败");

    let results = service
        .render_regions(&floor_plan(), 2, &sized(128, 128), &CancelToken::new())
        .expect("区域渲染失败");
    assert!(!results.is_empty() && results.len() <= 2);
    for (rank, item) in results.iter().enumerate() {
        assert_eq!(item.region.priority, rank + 1);
        let render = item.render.as_ref().expect("区域渲染应当成功");
        assert!(render.image_path.is_file());
        assert!(item.error.is_none());
    }
}

#[test]
fn layer_filter_applies_to_bounds() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let service = service(dir.path());
    let layers = vec!["COLUMN".to_string()];
    let summary = service
        .get_drawing_bounds(&floor_plan(), Some(&layers), None)
        .expect("计算范围失败");
    let extent = summary.bounds.extent.expect("应有范围");
    assert!((extent.min_x - 2700.0).abs() < 1e-9);
    assert!((extent.width - 600.0).abs() < 1e-9);
}

#[test]
fn conversion_payload_lists_every_file() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let root = dir.path().join("drawings");
    fs::create_dir_all(&root).expect("创建目录失败");
    fs::write(root.join("a.dwg"), b"AC1032").expect("写入失败");
    fs::write(root.join("bad.dwg"), b"AC1032").expect("写入失败");
    let service = service(dir.path());

    let runner = |command: &CommandSpec, _timeout: Duration, _cancel: &CancelToken| -> Result<ProcessOutput, RunError> {
        let input = command.path_arg(0).expect("缺少输入目录");
        let output = command.path_arg(1).expect("缺少输出目录");
        let source = fs::read_dir(input)
            .expect("读取输入目录失败")
            .next()
            .expect("输入目录为空")
            .expect("读取目录项失败")
            .path();
        let stem = source.file_stem().expect("缺少文件名").to_string_lossy().into_owned();
        if stem == "bad" {
            return Ok(ProcessOutput::failure(1, "unreadable"));
        }
        fs::write(output.join(format!("{stem}.dxf")), b"0\nEOF\n").expect("写入失败");
        Ok(ProcessOutput::success())
    };
    let converter = FormatConverter::with_runner("/opt/tool", runner, service.converter_settings());

    let payload = service
        .convert_with(&converter, &ConversionRequest::new(&root), &CancelToken::new())
        .expect("批量转换失败");
    assert!(payload.batch);
    assert!(!payload.success);
    assert_eq!(payload.files.len(), 2);
    assert_eq!(payload.files_converted, 1);
    assert_eq!(payload.files_failed, 1);
    assert_eq!(payload.total_bytes, 6);
    assert_eq!(payload.output_paths, vec![root.join("converted").join("a.dxf")]);

    let failed = payload.files.iter().find(|file| !file.success).expect("应当有失败的文件");
    let error = failed.error.as_ref().expect("失败项应带错误");
    assert_eq!(error.kind, "ConversionFailed");
    assert_eq!(error.stage, Some("convert"));
}
