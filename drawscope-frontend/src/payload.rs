//! 对外接口的 JSON 结构。坐标与尺寸均为图纸单位，像素尺寸单独标注。

use std::path::PathBuf;

use drawscope_convert::{BatchOutcome, ConversionOutcome, FileResult};
use drawscope_core::geometry::Bounds2D;
use drawscope_core::index::{BoundsState, DrawingBounds};
use drawscope_engine::regions::Region;
use drawscope_engine::render::{RasterFormat, RenderResult, ZoomAdvice};
use serde::{Deserialize, Serialize};

use crate::errors::ErrorReport;

/// `{x, y, width, height}`，以左下角为原点。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RectPayload {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl From<&Bounds2D> for RectPayload {
    fn from(bounds: &Bounds2D) -> Self {
        Self {
            x: bounds.min().x(),
            y: bounds.min().y(),
            width: bounds.width(),
            height: bounds.height(),
        }
    }
}

/// 空图纸只输出 `state`。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundsPayload {
    pub state: BoundsState,
    #[serde(flatten)]
    pub extent: Option<ExtentPayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExtentPayload {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
    pub width: f64,
    pub height: f64,
}

impl From<&DrawingBounds> for BoundsPayload {
    fn from(bounds: &DrawingBounds) -> Self {
        Self {
            state: bounds.state(),
            extent: bounds.extent().map(|extent| ExtentPayload {
                min_x: extent.min().x(),
                min_y: extent.min().y(),
                max_x: extent.max().x(),
                max_y: extent.max().y(),
                width: extent.width(),
                height: extent.height(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionPayload {
    pub bbox: RectPayload,
    pub entity_count: usize,
    pub density: f64,
    pub layers: Vec<String>,
    pub priority: usize,
    pub cell_count: usize,
    pub label: String,
}

impl From<&Region> for RegionPayload {
    fn from(region: &Region) -> Self {
        Self {
            bbox: RectPayload::from(&region.bbox),
            entity_count: region.entity_count,
            density: region.density,
            layers: region.layers.clone(),
            priority: region.priority,
            cell_count: region.cell_count,
            label: region.label.clone(),
        }
    }
}

/// `get_drawing_bounds` 的结果。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrawingSummary {
    pub path: PathBuf,
    pub source_identity: String,
    pub entity_count: usize,
    pub layers: Vec<String>,
    pub bounds: BoundsPayload,
    pub regions: Vec<RegionPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    pub used_fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoomPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smallest_text_px: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinnest_line_px: Option<f64>,
    pub required_scale: f64,
    pub suggested_bbox: RectPayload,
}

impl From<&ZoomAdvice> for ZoomPayload {
    fn from(advice: &ZoomAdvice) -> Self {
        Self {
            smallest_text_px: advice.smallest_text_px,
            thinnest_line_px: advice.thinnest_line_px,
            required_scale: advice.required_scale,
            suggested_bbox: RectPayload::from(&advice.suggested_bbox),
        }
    }
}

/// `render_region` 的结果；图像以文件路径作为句柄。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderPayload {
    pub image_path: PathBuf,
    pub format: RasterFormat,
    pub requested_bbox: RectPayload,
    pub actual_bbox: RectPayload,
    pub clamped: bool,
    pub scale: f64,
    pub output_size: [u32; 2],
    pub layers_rendered: Vec<String>,
    pub entities_drawn: usize,
    pub needs_zoom: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zoom: Option<ZoomPayload>,
}

impl RenderPayload {
    pub fn new(image_path: PathBuf, result: &RenderResult) -> Self {
        Self {
            image_path,
            format: result.format,
            requested_bbox: RectPayload::from(&result.requested_bbox),
            actual_bbox: RectPayload::from(&result.actual_bbox),
            clamped: result.clamped,
            scale: result.scale,
            output_size: [result.output_width, result.output_height],
            layers_rendered: result.layers_rendered.clone(),
            entities_drawn: result.entities_drawn,
            needs_zoom: result.needs_zoom(),
            zoom: result.needs_zoom.as_ref().map(ZoomPayload::from),
        }
    }
}

/// `render_overview` 的结果：渲染信息加图纸范围。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverviewPayload {
    pub bounds: BoundsPayload,
    #[serde(flatten)]
    pub render: RenderPayload,
}

/// 批量区域渲染中的一项，失败不影响其他区域。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionRenderPayload {
    pub region: RegionPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render: Option<RenderPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileConversionPayload {
    pub source: PathBuf,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl From<&FileResult> for FileConversionPayload {
    fn from(file: &FileResult) -> Self {
        match &file.result {
            Ok(converted) => Self {
                source: file.source.clone(),
                success: true,
                output_path: Some(converted.output_path.clone()),
                file_size: Some(converted.file_size),
                attempts: Some(converted.attempts),
                error: None,
            },
            Err(err) => Self {
                source: file.source.clone(),
                success: false,
                output_path: None,
                file_size: None,
                attempts: None,
                error: Some(ErrorReport::from_convert(err)),
            },
        }
    }
}

/// `convert` 的结果。单文件与目录批量共用同一结构。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionPayload {
    pub success: bool,
    pub batch: bool,
    pub files_converted: usize,
    pub files_failed: usize,
    pub total_bytes: u64,
    pub output_paths: Vec<PathBuf>,
    pub files: Vec<FileConversionPayload>,
}

impl From<&ConversionOutcome> for ConversionPayload {
    fn from(outcome: &ConversionOutcome) -> Self {
        let (batch, files): (bool, Vec<FileConversionPayload>) = match outcome {
            ConversionOutcome::Single(file) => (false, vec![FileConversionPayload::from(file)]),
            ConversionOutcome::Batch(BatchOutcome { per_file_results, .. }) => {
                (true, per_file_results.iter().map(FileConversionPayload::from).collect())
            }
        };
        let files_converted = files.iter().filter(|file| file.success).count();
        Self {
            success: outcome.is_success(),
            batch,
            files_converted,
            files_failed: files.len() - files_converted,
            total_bytes: files.iter().filter_map(|file| file.file_size).sum(),
            output_paths: files.iter().filter_map(|file| file.output_path.clone()).collect(),
            files,
        }
    }
}
