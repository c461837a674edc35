use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use drawscope_core::cancel::CancelToken;
use drawscope_core::geometry::Bounds2D;
use drawscope_core::index::{DrawingIndex, LayerFilter};
use drawscope_engine::cache::{CacheKey, RenderCache};
use drawscope_engine::regions::{DetectionParams, ThresholdMode, detect};
use drawscope_engine::render::{AdaptiveRenderer, RasterFormat, RenderOptions, RenderRequest};
use drawscope_io::{DocumentLoader, DxfFacade};
use rayon::prelude::*;

fn floor_plan() -> DrawingIndex {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("../drawscope-io/tests/data/floor_plan.dxf");
    let document = DxfFacade::new().load(&path).expect("读取示例图纸失败");
    DrawingIndex::build(document)
}

#[test]
fn detected_regions_stay_inside_bounds_and_are_ranked() {
    let index = floor_plan();
    let params = DetectionParams {
        grid_cell_size: 500.0,
        threshold: ThresholdMode::Absolute { count: 1 },
        ..DetectionParams::default()
    };
    let detection = detect(&index, &params, &LayerFilter::all()).expect("区域识别失败");
    let bounds = detection.bounds.extent().expect("示例图纸不应为空");
    assert!(!detection.regions.is_empty());
    for (rank, region) in detection.regions.iter().enumerate() {
        assert_eq!(region.priority, rank + 1);
        assert!(bounds.contains(&region.bbox));
        assert!(region.entity_count > 0);
    }
    assert!(detection.regions.windows(2).all(|w| w[0].density >= w[1].density));
    for (i, a) in detection.regions.iter().enumerate() {
        for b in &detection.regions[i + 1..] {
            let overlap = a.bbox.intersection(&b.bbox);
            assert!(overlap.is_none_or(|o| o.area() == 0.0), "区域不应重叠");
        }
    }
}

#[test]
fn overview_draws_every_indexed_entity() {
    let index = floor_plan();
    let renderer = AdaptiveRenderer::new(RenderOptions::default());
    let result = renderer
        .render_overview(&index, 512, 512, &LayerFilter::all(), RasterFormat::Png, &CancelToken::new())
        .expect("总览渲染失败");
    assert_eq!(result.entities_drawn, index.len());
    assert!(result.layers_rendered.contains(&"WALL".to_string()));
    assert!((result.scale - 512.0 / 7100.0).abs() < 1e-9);
    assert_eq!(&result.image[1..4], b"PNG");
}

#[test]
fn layer_filter_limits_rendered_layers() {
    let index = floor_plan();
    let renderer = AdaptiveRenderer::new(RenderOptions::default());
    let filter = LayerFilter::from_names(["COLUMN"]);
    let request = RenderRequest::new(Bounds2D::from_origin_size(2000.0, 1000.0, 2000.0, 2000.0), 256, 256)
        .with_layers(filter);
    let result = renderer
        .render(&index, &request, &CancelToken::new())
        .expect("渲染失败");
    assert_eq!(result.layers_rendered, vec!["COLUMN".to_string()]);
    assert_eq!(result.entities_drawn, 1);
    // 过滤后的图纸范围只剩柱子，请求被裁剪到它
    assert!(result.clamped);
    assert_eq!(result.actual_bbox, Bounds2D::from_origin_size(2700.0, 1700.0, 600.0, 600.0));
}

#[test]
fn parallel_requests_share_one_render() {
    let index = floor_plan();
    let renderer = AdaptiveRenderer::new(RenderOptions::default());
    let cache = RenderCache::new(8, None);
    let renders = AtomicUsize::new(0);
    let bbox = Bounds2D::from_origin_size(0.0, 0.0, 3000.0, 3000.0);
    let request = RenderRequest::new(bbox, 128, 128);

    let results: Vec<_> = (0..16)
        .into_par_iter()
        .map(|_| {
            let key = CacheKey::new("floor_plan", &bbox, 128, 128, &LayerFilter::all(), RasterFormat::Png);
            cache
                .get_or_render(key, || {
                    renders.fetch_add(1, Ordering::SeqCst);
                    renderer.render(&index, &request, &CancelToken::new())
                })
                .expect("渲染失败")
        })
        .collect();

    assert_eq!(renders.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
}
