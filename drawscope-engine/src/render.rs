//! 自适应渲染：在固定画布尺寸下计算比例、裁剪请求范围、栅格化并编码。
//!
//! 像素坐标原点在画布左上角，y 轴向下；图纸坐标 y 轴向上。

use std::collections::BTreeSet;
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ab_glyph::{FontVec, PxScale};
use drawscope_core::cancel::CancelToken;
use drawscope_core::document::LINE_SPACING_FACTOR;
use drawscope_core::geometry::{Bounds2D, Point2};
use drawscope_core::index::{DrawingIndex, LayerFilter};
use drawscope_core::shapes::{Primitive, Tessellator};
use glam::DVec2;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_antialiased_line_segment_mut, draw_filled_circle_mut, draw_polygon_mut, draw_text_mut,
};
use imageproc::pixelops::interpolate;
use imageproc::point::Point;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::RenderError;
use crate::regions::{DensityGrid, fit_window};

/// 画布单边最大像素数。
pub const MAX_OUTPUT_SIDE: u32 = 16_384;

/// 每绘制这么多实体检查一次取消与超时。
const CHECK_INTERVAL: usize = 64;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const INK: Rgb<u8> = Rgb([0, 0, 0]);

const LAYER_COLORS: [(&str, Rgb<u8>); 12] = [
    ("WALL", Rgb([0xCC, 0x00, 0x00])),
    ("S_WALL", Rgb([0xCC, 0x00, 0x00])),
    ("COLUMN", Rgb([0xFF, 0x66, 0x00])),
    ("WINDOW", Rgb([0x00, 0x99, 0xCC])),
    ("E_WINDOW", Rgb([0x00, 0x99, 0xCC])),
    ("DIM", Rgb([0x00, 0x00, 0xCC])),
    ("PUB_DIM", Rgb([0x00, 0x00, 0xCC])),
    ("TEXT", Rgb([0x00, 0x88, 0x00])),
    ("PUB_TEXT", Rgb([0x00, 0x88, 0x00])),
    ("AXIS", Rgb([0xCC, 0x88, 0x00])),
    ("STAIR", Rgb([0xCC, 0x00, 0xCC])),
    ("E_STAIR", Rgb([0xCC, 0x00, 0xCC])),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RasterFormat {
    #[default]
    Png,
    Jpeg,
}

impl RasterFormat {
    pub fn extension(self) -> &'static str {
        match self {
            RasterFormat::Png => "png",
            RasterFormat::Jpeg => "jpg",
        }
    }

    pub fn is_lossless(self) -> bool {
        matches!(self, RasterFormat::Png)
    }
}

impl fmt::Display for RasterFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RasterFormat::Png => f.write_str("png"),
            RasterFormat::Jpeg => f.write_str("jpeg"),
        }
    }
}

impl FromStr for RasterFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "png" | "lossless" => Ok(RasterFormat::Png),
            "jpeg" | "jpg" | "lossy" => Ok(RasterFormat::Jpeg),
            other => Err(format!("不支持的图像格式: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    #[default]
    ByLayer,
    Monochrome,
}

/// 按图层名称取颜色：先精确匹配（不区分大小写），再按子串匹配。
pub fn layer_color(layer: &str, mode: ColorMode) -> Rgb<u8> {
    if mode == ColorMode::Monochrome {
        return INK;
    }
    let upper = layer.to_uppercase();
    LAYER_COLORS
        .iter()
        .find(|(name, _)| *name == upper)
        .or_else(|| LAYER_COLORS.iter().find(|(name, _)| upper.contains(name)))
        .map(|(_, color)| *color)
        .unwrap_or(INK)
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub min_text_height_px: f64,
    pub min_line_width_px: f64,
    /// `None` 表示不限时。
    pub timeout: Option<Duration>,
    pub color_mode: ColorMode,
    pub jpeg_quality: u8,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            min_text_height_px: 20.0,
            min_line_width_px: 2.0,
            timeout: Some(Duration::from_secs(30)),
            color_mode: ColorMode::ByLayer,
            jpeg_quality: 85,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub bbox: Bounds2D,
    pub output_width: u32,
    pub output_height: u32,
    pub layer_filter: LayerFilter,
    pub format: RasterFormat,
}

impl RenderRequest {
    pub fn new(bbox: Bounds2D, output_width: u32, output_height: u32) -> Self {
        Self {
            bbox,
            output_width,
            output_height,
            layer_filter: LayerFilter::all(),
            format: RasterFormat::Png,
        }
    }

    pub fn with_layers(mut self, filter: LayerFilter) -> Self {
        self.layer_filter = filter;
        self
    }

    pub fn with_format(mut self, format: RasterFormat) -> Self {
        self.format = format;
        self
    }
}

/// 图纸坐标到像素坐标的精确映射。空白边距在两侧均分。
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PixelMapping {
    pub scale: f64,
    pub offset_x: f64,
    pub offset_y: f64,
    pub bbox: Bounds2D,
}

impl PixelMapping {
    fn fit(bbox: Bounds2D, width: u32, height: u32) -> Self {
        let scale = (width as f64 / bbox.width()).min(height as f64 / bbox.height());
        Self {
            scale,
            offset_x: (width as f64 - bbox.width() * scale) / 2.0,
            offset_y: (height as f64 - bbox.height() * scale) / 2.0,
            bbox,
        }
    }

    #[inline]
    pub fn to_pixel(&self, point: DVec2) -> DVec2 {
        DVec2::new(
            self.offset_x + (point.x - self.bbox.min().x()) * self.scale,
            self.offset_y + (self.bbox.max().y() - point.y) * self.scale,
        )
    }

    #[inline]
    pub fn to_drawing(&self, pixel: DVec2) -> Point2 {
        Point2::new(
            self.bbox.min().x() + (pixel.x - self.offset_x) / self.scale,
            self.bbox.max().y() - (pixel.y - self.offset_y) / self.scale,
        )
    }
}

/// 可读性不足时的放大建议。
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZoomAdvice {
    pub smallest_text_px: Option<f64>,
    pub thinnest_line_px: Option<f64>,
    pub required_scale: f64,
    pub suggested_bbox: Bounds2D,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderResult {
    pub image: Vec<u8>,
    pub format: RasterFormat,
    pub requested_bbox: Bounds2D,
    pub actual_bbox: Bounds2D,
    pub clamped: bool,
    /// 每图纸单位对应的像素数。
    pub scale: f64,
    pub output_width: u32,
    pub output_height: u32,
    pub layers_rendered: Vec<String>,
    pub mapping: PixelMapping,
    pub needs_zoom: Option<ZoomAdvice>,
    pub entities_drawn: usize,
}

impl RenderResult {
    #[inline]
    pub fn needs_zoom(&self) -> bool {
        self.needs_zoom.is_some()
    }
}

pub struct AdaptiveRenderer {
    options: RenderOptions,
    font: Option<Arc<FontVec>>,
}

impl fmt::Debug for AdaptiveRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveRenderer")
            .field("options", &self.options)
            .field("font", &self.font.is_some())
            .finish()
    }
}

impl AdaptiveRenderer {
    pub fn new(options: RenderOptions) -> Self {
        Self { options, font: None }
    }

    pub fn with_font(mut self, font: FontVec) -> Self {
        self.font = Some(Arc::new(font));
        self
    }

    pub fn load_font(path: &Path) -> Result<FontVec, RenderError> {
        let bytes = std::fs::read(path)
            .map_err(|err| RenderError::Font(format!("{}: {err}", path.display())))?;
        FontVec::try_from_vec(bytes).map_err(|err| RenderError::Font(format!("{}: {err}", path.display())))
    }

    #[inline]
    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    /// 渲染请求的矩形范围。请求超出图纸范围时裁剪为交集并标记 `clamped`。
    pub fn render(
        &self,
        index: &DrawingIndex,
        request: &RenderRequest,
        cancel: &CancelToken,
    ) -> Result<RenderResult, RenderError> {
        let started = Instant::now();
        let requested = validate_bbox(&request.bbox)?;
        validate_output(request.output_width, request.output_height)?;
        if cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }

        let actual = match index.bounds(&request.layer_filter).extent() {
            Some(extent) => clamp_to_drawing(&requested, &extent)?,
            None => requested,
        };
        let clamped = actual != requested;
        let mapping = PixelMapping::fit(actual, request.output_width, request.output_height);
        let needs_zoom = self.legibility(index, &actual, &mapping, request);

        let mut canvas = RgbImage::from_pixel(request.output_width, request.output_height, BACKGROUND);
        let (entities_drawn, layers_rendered) =
            self.rasterize(index, request, &mapping, &mut canvas, started, cancel)?;
        let image = encode(&canvas, request.format, self.options.jpeg_quality)?;

        debug!(
            scale = mapping.scale,
            clamped,
            entities = entities_drawn,
            needs_zoom = needs_zoom.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "渲染完成"
        );
        Ok(RenderResult {
            image,
            format: request.format,
            requested_bbox: requested,
            actual_bbox: actual,
            clamped,
            scale: mapping.scale,
            output_width: request.output_width,
            output_height: request.output_height,
            layers_rendered,
            mapping,
            needs_zoom,
            entities_drawn,
        })
    }

    /// 以图纸范围为请求矩形的渲染。退化范围在零长度的轴上向两侧各留一点空白。
    pub fn render_overview(
        &self,
        index: &DrawingIndex,
        output_width: u32,
        output_height: u32,
        filter: &LayerFilter,
        format: RasterFormat,
        cancel: &CancelToken,
    ) -> Result<RenderResult, RenderError> {
        let extent = index.bounds(filter).extent().ok_or(RenderError::EmptyDrawing)?;
        let request = RenderRequest {
            bbox: overview_bbox(&extent),
            output_width,
            output_height,
            layer_filter: filter.clone(),
            format,
        };
        self.render(index, &request, cancel)
    }

    fn legibility(
        &self,
        index: &DrawingIndex,
        actual: &Bounds2D,
        mapping: &PixelMapping,
        request: &RenderRequest,
    ) -> Option<ZoomAdvice> {
        let mut smallest_text: Option<f64> = None;
        let mut thinnest_line: Option<f64> = None;
        for entry in index.query(*actual, &request.layer_filter) {
            if let Some(height) = entry.text_height.filter(|h| *h > 0.0) {
                smallest_text = Some(smallest_text.map_or(height, |s| s.min(height)));
            }
            if let Some(width) = entry.stroke_width.filter(|w| *w > 0.0) {
                thinnest_line = Some(thinnest_line.map_or(width, |s| s.min(width)));
            }
        }

        let scale = mapping.scale;
        let mut required = scale;
        if let Some(height) = smallest_text {
            if height * scale < self.options.min_text_height_px {
                required = required.max(self.options.min_text_height_px / height);
            }
        }
        if let Some(width) = thinnest_line {
            if width * scale < self.options.min_line_width_px {
                required = required.max(self.options.min_line_width_px / width);
            }
        }
        if required <= scale {
            return None;
        }

        let window_width = (request.output_width as f64 / required).min(actual.width());
        let window_height = (request.output_height as f64 / required).min(actual.height());
        let center = densest_center(index, actual, window_width, window_height, &request.layer_filter);
        let advice = ZoomAdvice {
            smallest_text_px: smallest_text.map(|h| h * scale),
            thinnest_line_px: thinnest_line.map(|w| w * scale),
            required_scale: required,
            suggested_bbox: fit_window(center, window_width, window_height, actual),
        };
        debug!(
            required_scale = required,
            scale,
            "当前比例下文字或线宽不可读，给出放大建议"
        );
        Some(advice)
    }

    fn rasterize(
        &self,
        index: &DrawingIndex,
        request: &RenderRequest,
        mapping: &PixelMapping,
        canvas: &mut RgbImage,
        started: Instant,
        cancel: &CancelToken,
    ) -> Result<(usize, Vec<String>), RenderError> {
        let deadline = self.options.timeout.map(|timeout| started + timeout);
        let tessellator = Tessellator::new(index.document(), 0.25 / mapping.scale);
        let mut primitives = Vec::new();
        let mut layers = BTreeSet::new();
        let mut drawn = 0;

        for (position, entry) in index.query(mapping.bbox, &request.layer_filter).enumerate() {
            if position % CHECK_INTERVAL == 0 {
                if cancel.is_cancelled() {
                    return Err(RenderError::Cancelled);
                }
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        let timeout_ms = self.options.timeout.map_or(0, |t| t.as_millis() as u64);
                        warn!(timeout_ms, drawn, "渲染超时，放弃本次结果");
                        return Err(RenderError::RenderTimeout { timeout_ms });
                    }
                }
            }
            let Some(entity) = index.entity_of(entry) else {
                continue;
            };
            let layer = index.layer_name(entry.layer);
            let color = layer_color(layer, self.options.color_mode);
            primitives.clear();
            tessellator.tessellate(entity, &mut primitives);
            for primitive in &primitives {
                self.draw_primitive(canvas, mapping, primitive, color);
            }
            layers.insert(layer.to_string());
            drawn += 1;
        }
        Ok((drawn, layers.into_iter().collect()))
    }

    fn draw_primitive(&self, canvas: &mut RgbImage, mapping: &PixelMapping, primitive: &Primitive, color: Rgb<u8>) {
        match primitive {
            Primitive::Stroke { points, closed, width } => {
                let pixels: Vec<DVec2> = points.iter().map(|p| mapping.to_pixel(*p)).collect();
                draw_path(canvas, &pixels, *closed, width * mapping.scale, color);
            }
            Primitive::Label {
                text,
                height,
                rotation,
                corners,
            } => {
                let height_px = height * mapping.scale;
                if height_px < 1.0 {
                    return;
                }
                let pixels: [DVec2; 4] = std::array::from_fn(|i| mapping.to_pixel(corners[i]));
                let upright = rotation.sin().abs() < 1e-3 && rotation.cos() > 0.0;
                let fits = height_px <= canvas.height() as f64 * 2.0;
                match &self.font {
                    Some(font) if upright && fits => {
                        let scale = PxScale::from(height_px as f32);
                        let step = height_px * LINE_SPACING_FACTOR;
                        for (line_no, line) in text.lines().enumerate() {
                            let y = pixels[3].y + line_no as f64 * step;
                            draw_text_mut(
                                canvas,
                                color,
                                pixels[3].x.round() as i32,
                                y.round() as i32,
                                scale,
                                font.as_ref(),
                                line,
                            );
                        }
                    }
                    _ => draw_path(canvas, &pixels, true, 0.0, color),
                }
            }
        }
    }
}

/// 请求矩形的合法性检查。宽或高恰为零时报 `DegenerateBBox`，任意小的正值均合法。
fn validate_bbox(bbox: &Bounds2D) -> Result<Bounds2D, RenderError> {
    let (min, max) = (bbox.min(), bbox.max());
    if ![min.x(), min.y(), max.x(), max.y()].iter().all(|v| v.is_finite()) {
        return Err(RenderError::InvalidBBox("坐标必须为有限数".to_string()));
    }
    let width = max.x() - min.x();
    let height = max.y() - min.y();
    if width == 0.0 || height == 0.0 {
        return Err(RenderError::DegenerateBBox { width, height });
    }
    if width < 0.0 || height < 0.0 {
        return Err(RenderError::InvalidBBox(format!("宽高不能为负: {width} x {height}")));
    }
    Ok(*bbox)
}

/// 由原点与宽高构造请求矩形。退化按调用方给出的宽高判断，不受坐标相减的舍入影响；
/// 正的宽高在远离原点处因 f64 精度坍缩为零时报 `InvalidBBox`。
pub fn requested_bbox(x: f64, y: f64, width: f64, height: f64) -> Result<Bounds2D, RenderError> {
    if ![x, y, width, height].iter().all(|v| v.is_finite()) {
        return Err(RenderError::InvalidBBox("坐标与宽高必须为有限数".to_string()));
    }
    if width == 0.0 || height == 0.0 {
        return Err(RenderError::DegenerateBBox { width, height });
    }
    if width < 0.0 || height < 0.0 {
        return Err(RenderError::InvalidBBox(format!("宽高不能为负: {width} x {height}")));
    }
    let bbox = Bounds2D::from_origin_size(x, y, width, height);
    if bbox.width() <= 0.0 || bbox.height() <= 0.0 {
        return Err(RenderError::InvalidBBox(format!(
            "宽高 {width} x {height} 在 ({x}, {y}) 处小于坐标精度"
        )));
    }
    Ok(bbox)
}

fn validate_output(width: u32, height: u32) -> Result<(), RenderError> {
    if width == 0 || height == 0 || width > MAX_OUTPUT_SIDE || height > MAX_OUTPUT_SIDE {
        return Err(RenderError::InvalidOutputSize { width, height });
    }
    Ok(())
}

/// 逐轴裁剪到图纸范围。图纸在某轴上长度为零时，该轴保留请求范围，只要求覆盖图纸所在位置。
fn clamp_to_drawing(requested: &Bounds2D, extent: &Bounds2D) -> Result<Bounds2D, RenderError> {
    let (min_x, max_x) = clamp_axis(
        requested.min().x(),
        requested.max().x(),
        extent.min().x(),
        extent.max().x(),
    )?;
    let (min_y, max_y) = clamp_axis(
        requested.min().y(),
        requested.max().y(),
        extent.min().y(),
        extent.max().y(),
    )?;
    Ok(Bounds2D::new(Point2::new(min_x, min_y), Point2::new(max_x, max_y)))
}

fn clamp_axis(lo: f64, hi: f64, drawing_lo: f64, drawing_hi: f64) -> Result<(f64, f64), RenderError> {
    if drawing_hi > drawing_lo {
        let (clamped_lo, clamped_hi) = (lo.max(drawing_lo), hi.min(drawing_hi));
        if clamped_hi <= clamped_lo {
            return Err(RenderError::OutsideDrawing);
        }
        Ok((clamped_lo, clamped_hi))
    } else if lo <= drawing_lo && drawing_lo <= hi {
        Ok((lo, hi))
    } else {
        Err(RenderError::OutsideDrawing)
    }
}

/// 总览实际请求的矩形：退化轴两侧补白，正常范围原样返回。
pub fn overview_bbox(extent: &Bounds2D) -> Bounds2D {
    let span = extent.width().max(extent.height());
    let pad = if span > 0.0 { span * 0.05 } else { 0.5 };
    let (mut min, mut max) = (extent.min().as_vec2(), extent.max().as_vec2());
    if extent.width() <= 0.0 {
        min.x -= pad;
        max.x += pad;
    }
    if extent.height() <= 0.0 {
        min.y -= pad;
        max.y += pad;
    }
    Bounds2D::new(Point2::from_vec(min), Point2::from_vec(max))
}

/// 窗口大小的网格中实体最多的格子的中心；网格过大或没有实体时取范围中心。
fn densest_center(
    index: &DrawingIndex,
    area: &Bounds2D,
    window_width: f64,
    window_height: f64,
    filter: &LayerFilter,
) -> Point2 {
    match DensityGrid::build(index, *area, window_width, window_height, filter) {
        Ok(grid) => match grid.densest_cell() {
            Some((row, col)) => grid.cell_bounds(row, col).center(),
            None => area.center(),
        },
        Err(err) => {
            debug!(error = %err, "放大建议退回范围中心");
            area.center()
        }
    }
}

fn draw_path(canvas: &mut RgbImage, points: &[DVec2], closed: bool, width_px: f64, color: Rgb<u8>) {
    if points.len() < 2 {
        return;
    }
    let segments = points
        .windows(2)
        .map(|pair| (pair[0], pair[1]))
        .chain(closed.then(|| (points[points.len() - 1], points[0])));
    if width_px <= 1.5 {
        for (a, b) in segments {
            draw_thin_segment(canvas, a, b, color);
        }
        return;
    }
    let half = width_px / 2.0;
    for (a, b) in segments {
        draw_thick_segment(canvas, a, b, half, color);
    }
}

fn draw_thin_segment(canvas: &mut RgbImage, a: DVec2, b: DVec2, color: Rgb<u8>) {
    let Some((a, b)) = clip_segment(a, b, canvas.width() as f64, canvas.height() as f64, 2.0) else {
        return;
    };
    draw_antialiased_line_segment_mut(
        canvas,
        (a.x.round() as i32, a.y.round() as i32),
        (b.x.round() as i32, b.y.round() as i32),
        color,
        interpolate,
    );
}

fn draw_thick_segment(canvas: &mut RgbImage, a: DVec2, b: DVec2, half: f64, color: Rgb<u8>) {
    let margin = half + 2.0;
    let Some((a, b)) = clip_segment(a, b, canvas.width() as f64, canvas.height() as f64, margin) else {
        return;
    };
    let radius = half.round().max(1.0) as i32;
    let direction = b - a;
    let length = direction.length();
    if length > f64::EPSILON {
        let normal = direction.perp() / length * half;
        let quad: Vec<Point<i32>> = [a + normal, b + normal, b - normal, a - normal]
            .iter()
            .map(|p| Point::new(p.x.round() as i32, p.y.round() as i32))
            .collect();
        let mut distinct = quad.clone();
        distinct.dedup();
        if distinct.len() >= 3 && distinct.first() != distinct.last() {
            draw_polygon_mut(canvas, &distinct, color);
        }
    }
    for end in [a, b] {
        draw_filled_circle_mut(canvas, (end.x.round() as i32, end.y.round() as i32), radius, color);
    }
}

/// Liang–Barsky 裁剪到 `[-margin, width + margin] × [-margin, height + margin]`。
fn clip_segment(a: DVec2, b: DVec2, width: f64, height: f64, margin: f64) -> Option<(DVec2, DVec2)> {
    if !(a.is_finite() && b.is_finite()) {
        return None;
    }
    let delta = b - a;
    let (mut t0, mut t1) = (0.0_f64, 1.0_f64);
    let edges = [
        (-delta.x, a.x + margin),
        (delta.x, width + margin - a.x),
        (-delta.y, a.y + margin),
        (delta.y, height + margin - a.y),
    ];
    for (p, q) in edges {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let t = q / p;
        if p < 0.0 {
            t0 = t0.max(t);
        } else {
            t1 = t1.min(t);
        }
        if t0 > t1 {
            return None;
        }
    }
    Some((a + delta * t0, a + delta * t1))
}

fn encode(canvas: &RgbImage, format: RasterFormat, jpeg_quality: u8) -> Result<Vec<u8>, RenderError> {
    let mut buffer = Vec::new();
    let written = match format {
        RasterFormat::Png => canvas.write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png),
        RasterFormat::Jpeg => {
            let quality = jpeg_quality.clamp(1, 100);
            canvas.write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, quality))
        }
    };
    written.map_err(|err| RenderError::Encode(err.to_string()))?;
    Ok(buffer)
}
