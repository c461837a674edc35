//! 基于网格密度的区域识别。
//!
//! 网格以二维数组（行优先的扁平 `Vec`）保存，连通分量通过显式工作队列遍历，
//! 不依赖递归。

use std::cmp::Ordering;
use std::collections::BTreeSet;

use drawscope_core::geometry::{Bounds2D, Point2};
use drawscope_core::index::{DrawingBounds, DrawingIndex, LayerFilter, LayerId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::DetectError;

/// 单次检测允许的最大网格数。
pub const MAX_GRID_CELLS: usize = 16_000_000;

/// 活跃网格的判定方式。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ThresholdMode {
    /// 网格实体数严格大于该值时为活跃。
    Absolute { count: usize },
    /// 取非空网格实体数的分位值（不低于 `floor`），达到即活跃。
    Percentile { percentile: f64, floor: usize },
}

impl Default for ThresholdMode {
    fn default() -> Self {
        ThresholdMode::Absolute { count: 3 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    pub grid_cell_size: f64,
    pub threshold: ThresholdMode,
    pub min_region_area: f64,
    pub fallback_to_full_drawing: bool,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            grid_cell_size: 1000.0,
            threshold: ThresholdMode::default(),
            min_region_area: 0.0,
            fallback_to_full_drawing: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Region {
    pub bbox: Bounds2D,
    pub entity_count: usize,
    pub density: f64,
    pub layers: Vec<String>,
    /// 从 1 开始，数值越小越先检查。
    pub priority: usize,
    pub cell_count: usize,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub bounds: DrawingBounds,
    pub regions: Vec<Region>,
    /// 实际使用的活跃阈值；空图纸时为 None。
    pub threshold: Option<f64>,
    pub used_fallback: bool,
}

/// 单个网格：实体计数、实体序号（指向 `DrawingIndex::entries`）与涉及的图层。
#[derive(Debug, Clone, Default)]
pub struct GridCell {
    entities: Vec<usize>,
    layers: BTreeSet<LayerId>,
}

impl GridCell {
    #[inline]
    pub fn count(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn entities(&self) -> &[usize] {
        &self.entities
    }

    #[inline]
    pub fn layers(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.layers.iter().copied()
    }
}

/// 覆盖某一矩形的均匀网格，单元可为长方形。每次调用临时构建。
#[derive(Debug)]
pub struct DensityGrid {
    area: Bounds2D,
    cell_width: f64,
    cell_height: f64,
    rows: usize,
    cols: usize,
    cells: Vec<GridCell>,
}

impl DensityGrid {
    /// 统计与 `area` 相交且通过图层过滤的实体。实体落入其范围覆盖的所有网格。
    pub fn build(
        index: &DrawingIndex,
        area: Bounds2D,
        cell_width: f64,
        cell_height: f64,
        filter: &LayerFilter,
    ) -> Result<Self, DetectError> {
        for size in [cell_width, cell_height] {
            if !(size.is_finite() && size > 0.0) {
                return Err(DetectError::InvalidCellSize(size));
            }
        }
        let cols = axis_cells(area.width(), cell_width);
        let rows = axis_cells(area.height(), cell_height);
        if rows.saturating_mul(cols) > MAX_GRID_CELLS {
            return Err(DetectError::GridTooLarge { rows, cols });
        }

        let mut grid = Self {
            area,
            cell_width,
            cell_height,
            rows,
            cols,
            cells: vec![GridCell::default(); rows * cols],
        };
        for (slot, entry) in index.entries().iter().enumerate() {
            if !index.passes(entry, filter) || !entry.bbox.intersects(&area) {
                continue;
            }
            let (col_start, col_end) = grid.col_span(entry.bbox.min().x(), entry.bbox.max().x());
            let (row_start, row_end) = grid.row_span(entry.bbox.min().y(), entry.bbox.max().y());
            for row in row_start..=row_end {
                for col in col_start..=col_end {
                    let cell = &mut grid.cells[row * cols + col];
                    cell.entities.push(slot);
                    cell.layers.insert(entry.layer);
                }
            }
        }
        Ok(grid)
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn cell(&self, row: usize, col: usize) -> &GridCell {
        &self.cells[row * self.cols + col]
    }

    /// 网格在图纸空间中的矩形（与网格对齐，可能超出 `area`）。
    pub fn cell_bounds(&self, row: usize, col: usize) -> Bounds2D {
        let min = self.area.min();
        Bounds2D::from_origin_size(
            min.x() + col as f64 * self.cell_width,
            min.y() + row as f64 * self.cell_height,
            self.cell_width,
            self.cell_height,
        )
    }

    /// 实体最多的网格；并列时取行、列序号最小者。
    pub fn densest_cell(&self) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize, usize)> = None;
        for (position, cell) in self.cells.iter().enumerate() {
            let count = cell.count();
            if count == 0 {
                continue;
            }
            if best.is_none_or(|(_, _, best_count)| count > best_count) {
                best = Some((position / self.cols, position % self.cols, count));
            }
        }
        best.map(|(row, col, _)| (row, col))
    }

    fn col_span(&self, min_x: f64, max_x: f64) -> (usize, usize) {
        let origin = self.area.min().x();
        (
            clamp_index((min_x - origin) / self.cell_width, self.cols),
            clamp_index((max_x - origin) / self.cell_width, self.cols),
        )
    }

    fn row_span(&self, min_y: f64, max_y: f64) -> (usize, usize) {
        let origin = self.area.min().y();
        (
            clamp_index((min_y - origin) / self.cell_height, self.rows),
            clamp_index((max_y - origin) / self.cell_height, self.rows),
        )
    }
}

fn axis_cells(extent: f64, cell: f64) -> usize {
    let count = (extent / cell).ceil();
    if count.is_finite() && count >= 1.0 {
        count as usize
    } else {
        1
    }
}

fn clamp_index(value: f64, len: usize) -> usize {
    if !(value > 0.0) {
        return 0;
    }
    (value.floor() as usize).min(len - 1)
}

/// 对过滤后的图纸执行密度聚类，返回按优先级排序的区域。
pub fn detect(
    index: &DrawingIndex,
    params: &DetectionParams,
    filter: &LayerFilter,
) -> Result<Detection, DetectError> {
    if !(params.grid_cell_size.is_finite() && params.grid_cell_size > 0.0) {
        return Err(DetectError::InvalidCellSize(params.grid_cell_size));
    }
    if let ThresholdMode::Percentile { percentile, .. } = params.threshold {
        if !(0.0..=1.0).contains(&percentile) {
            return Err(DetectError::InvalidPercentile(percentile));
        }
    }

    let bounds = index.bounds(filter);
    let Some(extent) = bounds.extent() else {
        debug!("图纸为空，跳过区域识别");
        return Ok(Detection {
            bounds,
            regions: Vec::new(),
            threshold: None,
            used_fallback: false,
        });
    };

    let grid = DensityGrid::build(
        index,
        extent,
        params.grid_cell_size,
        params.grid_cell_size,
        filter,
    )?;
    let threshold = effective_threshold(&grid, params.threshold);
    let active: Vec<bool> = grid
        .cells
        .iter()
        .map(|cell| cell.count() > 0 && is_active(cell.count(), threshold, params.threshold))
        .collect();

    let mut components = connected_components(&grid, &active);
    merge_overlapping(&grid, &extent, &mut components);

    let active_count = active.iter().filter(|flag| **flag).count();
    let mut stamp = vec![usize::MAX; index.len()];
    let mut regions: Vec<Region> = components
        .iter()
        .enumerate()
        .filter_map(|(component_id, cells)| {
            let region = build_region(index, &grid, &extent, cells, component_id, &mut stamp);
            (region_area(&region, &grid) >= params.min_region_area).then_some(region)
        })
        .collect();

    let mut used_fallback = false;
    if active_count == 0 && params.fallback_to_full_drawing {
        regions.push(full_drawing_region(index, &grid, &extent, filter));
        used_fallback = true;
    }

    regions.sort_by(compare_regions);
    for (rank, region) in regions.iter_mut().enumerate() {
        region.priority = rank + 1;
    }

    debug!(
        rows = grid.rows(),
        cols = grid.cols(),
        active = active_count,
        regions = regions.len(),
        threshold,
        used_fallback,
        "区域识别完成"
    );
    Ok(Detection {
        bounds,
        regions,
        threshold: Some(threshold),
        used_fallback,
    })
}

fn effective_threshold(grid: &DensityGrid, mode: ThresholdMode) -> f64 {
    match mode {
        ThresholdMode::Absolute { count } => count as f64,
        ThresholdMode::Percentile { percentile, floor } => {
            let mut counts: Vec<usize> = grid
                .cells
                .iter()
                .map(GridCell::count)
                .filter(|count| *count > 0)
                .collect();
            if counts.is_empty() {
                return floor as f64;
            }
            counts.sort_unstable();
            let rank = ((counts.len() as f64 * percentile) as usize).min(counts.len() - 1);
            counts[rank].max(floor) as f64
        }
    }
}

#[inline]
fn is_active(count: usize, threshold: f64, mode: ThresholdMode) -> bool {
    match mode {
        ThresholdMode::Absolute { .. } => count as f64 > threshold,
        ThresholdMode::Percentile { .. } => count as f64 >= threshold,
    }
}

/// 四连通分量，每个分量为网格下标列表（行优先）。
fn connected_components(grid: &DensityGrid, active: &[bool]) -> Vec<Vec<usize>> {
    let mut visited = vec![false; active.len()];
    let mut components = Vec::new();
    let mut worklist = Vec::new();
    for start in 0..active.len() {
        if !active[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        worklist.push(start);
        let mut cells = Vec::new();
        while let Some(position) = worklist.pop() {
            cells.push(position);
            let row = position / grid.cols;
            let col = position % grid.cols;
            let neighbours = [
                (row > 0).then(|| position - grid.cols),
                (row + 1 < grid.rows).then(|| position + grid.cols),
                (col > 0).then(|| position - 1),
                (col + 1 < grid.cols).then(|| position + 1),
            ];
            for next in neighbours.into_iter().flatten() {
                if active[next] && !visited[next] {
                    visited[next] = true;
                    worklist.push(next);
                }
            }
        }
        cells.sort_unstable();
        components.push(cells);
    }
    components
}

fn component_bounds(grid: &DensityGrid, extent: &Bounds2D, cells: &[usize]) -> Bounds2D {
    let mut bounds = Bounds2D::empty();
    for &position in cells {
        bounds.include_bounds(&grid.cell_bounds(position / grid.cols, position % grid.cols));
    }
    bounds.intersection(extent).unwrap_or(bounds)
}

/// 外接矩形内部相交的分量合并，保证结果区域两两不重叠。
fn merge_overlapping(grid: &DensityGrid, extent: &Bounds2D, components: &mut Vec<Vec<usize>>) {
    loop {
        let boxes: Vec<Bounds2D> = components
            .iter()
            .map(|cells| component_bounds(grid, extent, cells))
            .collect();
        let mut pair = None;
        'search: for i in 0..boxes.len() {
            for j in (i + 1)..boxes.len() {
                if overlaps_interior(&boxes[i], &boxes[j]) {
                    pair = Some((i, j));
                    break 'search;
                }
            }
        }
        let Some((i, j)) = pair else {
            return;
        };
        let absorbed = components.swap_remove(j);
        components[i].extend(absorbed);
        components[i].sort_unstable();
    }
}

fn overlaps_interior(a: &Bounds2D, b: &Bounds2D) -> bool {
    match a.intersection(b) {
        Some(shared) => shared.width() > 0.0 && shared.height() > 0.0,
        None => false,
    }
}

fn build_region(
    index: &DrawingIndex,
    grid: &DensityGrid,
    extent: &Bounds2D,
    cells: &[usize],
    component_id: usize,
    stamp: &mut [usize],
) -> Region {
    let mut entity_count = 0;
    let mut layer_ids = BTreeSet::new();
    for &position in cells {
        let cell = &grid.cells[position];
        layer_ids.extend(cell.layers());
        for &slot in cell.entities() {
            if stamp[slot] != component_id {
                stamp[slot] = component_id;
                entity_count += 1;
            }
        }
    }
    let bbox = component_bounds(grid, extent, cells);
    let layers = sorted_layer_names(index, layer_ids);
    let area = density_area(&bbox, cells.len(), grid);
    Region {
        bbox,
        entity_count,
        density: entity_count as f64 / area,
        label: region_label(&layers, entity_count),
        layers,
        priority: 0,
        cell_count: cells.len(),
    }
}

fn full_drawing_region(
    index: &DrawingIndex,
    grid: &DensityGrid,
    extent: &Bounds2D,
    filter: &LayerFilter,
) -> Region {
    let mut entity_count = 0;
    let mut layer_ids = BTreeSet::new();
    for entry in index.filtered(filter) {
        entity_count += 1;
        layer_ids.insert(entry.layer);
    }
    let area = density_area(extent, grid.cells.len(), grid);
    Region {
        bbox: *extent,
        entity_count,
        density: entity_count as f64 / area,
        layers: sorted_layer_names(index, layer_ids),
        priority: 0,
        cell_count: grid.cells.len(),
        label: "全图区域".to_string(),
    }
}

/// 区域面积；退化图纸（宽或高为零）退回按网格对齐的面积，避免密度为无穷大。
fn density_area(bbox: &Bounds2D, cell_count: usize, grid: &DensityGrid) -> f64 {
    let area = bbox.area();
    if area > 0.0 {
        area
    } else {
        cell_count as f64 * grid.cell_width * grid.cell_height
    }
}

fn region_area(region: &Region, grid: &DensityGrid) -> f64 {
    density_area(&region.bbox, region.cell_count, grid)
}

fn sorted_layer_names(index: &DrawingIndex, layer_ids: BTreeSet<LayerId>) -> Vec<String> {
    let mut names: Vec<String> = layer_ids
        .into_iter()
        .map(|id| index.layer_name(id).to_string())
        .collect();
    names.sort();
    names
}

fn compare_regions(a: &Region, b: &Region) -> Ordering {
    b.density
        .total_cmp(&a.density)
        .then_with(|| b.entity_count.cmp(&a.entity_count))
        .then_with(|| origin_key(&a.bbox).total_cmp(&origin_key(&b.bbox)))
        .then_with(|| a.bbox.min().x().total_cmp(&b.bbox.min().x()))
}

#[inline]
fn origin_key(bbox: &Bounds2D) -> f64 {
    bbox.min().y()
}

const LAYER_KEYWORDS: [(&str, &str); 6] = [
    ("WALL", "墙体"),
    ("COLUMN", "柱子"),
    ("WINDOW", "门窗"),
    ("DIM", "标注"),
    ("TEXT", "文字"),
    ("AXIS", "轴线"),
];

/// 由图层名称中的常见关键字生成区域名称，最多取两个。
pub fn region_label(layers: &[String], entity_count: usize) -> String {
    let mut names: Vec<&str> = Vec::new();
    for layer in layers {
        let upper = layer.to_uppercase();
        if let Some((_, name)) = LAYER_KEYWORDS.iter().find(|(keyword, _)| upper.contains(keyword)) {
            if !names.contains(name) {
                names.push(name);
            }
        }
    }
    if names.is_empty() {
        format!("区域({entity_count}个实体)")
    } else {
        names.truncate(2);
        format!("{}区域", names.join("/"))
    }
}

/// 围绕 `center` 放置 `width × height` 的窗口，并平移使其落在 `container` 内。
pub fn fit_window(center: Point2, width: f64, height: f64, container: &Bounds2D) -> Bounds2D {
    let width = width.min(container.width());
    let height = height.min(container.height());
    let min_x = (center.x() - width / 2.0)
        .max(container.min().x())
        .min(container.max().x() - width);
    let min_y = (center.y() - height / 2.0)
        .max(container.min().y())
        .min(container.max().y() - height);
    Bounds2D::from_origin_size(min_x, min_y, width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drawscope_core::document::Document;

    /// 在给定网格内放置 `count` 个小圆。
    fn scatter(doc: &mut Document, cell_x: f64, cell_y: f64, count: usize, layer: &str) {
        for i in 0..count {
            let offset = 100.0 + i as f64 * 50.0;
            doc.add_circle(Point2::new(cell_x + offset, cell_y + offset), 10.0, layer);
        }
    }

    fn frame(doc: &mut Document, width: f64, height: f64) {
        doc.add_line(Point2::new(0.0, 0.0), Point2::new(width, 0.0), "FRAME");
        doc.add_line(Point2::new(width, height), Point2::new(width, height - 1.0), "FRAME");
    }

    #[test]
    fn empty_drawing_yields_no_regions() {
        let index = DrawingIndex::build(Document::new());
        let detection = detect(&index, &DetectionParams::default(), &LayerFilter::all())
            .expect("空图纸不应报错");
        assert!(detection.regions.is_empty());
        assert!(detection.bounds.is_empty());
        assert!(!detection.used_fallback);
    }

    #[test]
    fn dense_cells_become_ranked_regions() {
        let mut doc = Document::new();
        frame(&mut doc, 10_000.0, 10_000.0);
        scatter(&mut doc, 1000.0, 1000.0, 6, "A-WALL");
        scatter(&mut doc, 2000.0, 1000.0, 6, "A-WALL");
        scatter(&mut doc, 7000.0, 7000.0, 10, "S-COLUMN");
        let index = DrawingIndex::build(doc);

        let detection = detect(&index, &DetectionParams::default(), &LayerFilter::all())
            .expect("检测失败");
        assert_eq!(detection.regions.len(), 2);

        let first = &detection.regions[0];
        assert_eq!(first.priority, 1);
        assert_eq!(first.entity_count, 10);
        assert_eq!(first.label, "柱子区域");
        assert!((first.density - 10.0 / 1_000_000.0).abs() < 1e-12);

        let second = &detection.regions[1];
        assert_eq!(second.cell_count, 2);
        assert_eq!(second.entity_count, 12);
        assert!((second.bbox.width() - 2000.0).abs() < 1e-9);
        assert_eq!(second.layers, vec!["A-WALL".to_string()]);

        let bounds = detection.bounds.extent().expect("应当有范围");
        for region in &detection.regions {
            assert!(bounds.contains(&region.bbox));
        }
        assert!(detection.regions.windows(2).all(|w| w[0].density >= w[1].density));
    }

    #[test]
    fn threshold_is_strictly_exceeded() {
        let mut doc = Document::new();
        frame(&mut doc, 5000.0, 5000.0);
        scatter(&mut doc, 1000.0, 1000.0, 3, "0");
        let index = DrawingIndex::build(doc);
        let params = DetectionParams {
            fallback_to_full_drawing: false,
            ..DetectionParams::default()
        };
        let detection = detect(&index, &params, &LayerFilter::all()).expect("检测失败");
        assert!(detection.regions.is_empty());
    }

    #[test]
    fn no_active_cell_falls_back_to_full_drawing() {
        let mut doc = Document::new();
        frame(&mut doc, 5000.0, 5000.0);
        let index = DrawingIndex::build(doc);
        let detection = detect(&index, &DetectionParams::default(), &LayerFilter::all())
            .expect("检测失败");
        assert!(detection.used_fallback);
        assert_eq!(detection.regions.len(), 1);
        assert_eq!(detection.regions[0].label, "全图区域");
        assert_eq!(detection.regions[0].entity_count, 2);
    }

    #[test]
    fn entity_spanning_cells_is_counted_once_per_region() {
        let mut doc = Document::new();
        for i in 0..5 {
            let y = 100.0 + i as f64 * 10.0;
            doc.add_line(Point2::new(100.0, y), Point2::new(1900.0, y), "WALL");
        }
        let index = DrawingIndex::build(doc);
        let params = DetectionParams {
            threshold: ThresholdMode::Absolute { count: 2 },
            ..DetectionParams::default()
        };
        let detection = detect(&index, &params, &LayerFilter::all()).expect("检测失败");
        assert_eq!(detection.regions.len(), 1);
        assert_eq!(detection.regions[0].entity_count, 5);
        assert_eq!(detection.regions[0].cell_count, 2);
    }

    #[test]
    fn diagonal_cells_are_separate_components() {
        let mut doc = Document::new();
        frame(&mut doc, 3000.0, 3000.0);
        scatter(&mut doc, 0.0, 0.0, 5, "0");
        scatter(&mut doc, 1000.0, 1000.0, 5, "0");
        let index = DrawingIndex::build(doc);
        let detection = detect(&index, &DetectionParams::default(), &LayerFilter::all())
            .expect("检测失败");
        assert_eq!(detection.regions.len(), 2);
        assert!(detection.regions.iter().all(|r| r.cell_count == 1));
    }

    #[test]
    fn min_area_discards_small_components() {
        let mut doc = Document::new();
        frame(&mut doc, 5000.0, 5000.0);
        scatter(&mut doc, 1000.0, 1000.0, 5, "0");
        let index = DrawingIndex::build(doc);
        let params = DetectionParams {
            min_region_area: 2_000_000.0,
            fallback_to_full_drawing: false,
            ..DetectionParams::default()
        };
        let detection = detect(&index, &params, &LayerFilter::all()).expect("检测失败");
        assert!(detection.regions.is_empty());
    }

    #[test]
    fn percentile_mode_uses_floor() {
        let mut doc = Document::new();
        frame(&mut doc, 5000.0, 5000.0);
        scatter(&mut doc, 1000.0, 1000.0, 3, "0");
        let index = DrawingIndex::build(doc);
        let params = DetectionParams {
            threshold: ThresholdMode::Percentile {
                percentile: 0.75,
                floor: 3,
            },
            ..DetectionParams::default()
        };
        let detection = detect(&index, &params, &LayerFilter::all()).expect("检测失败");
        assert_eq!(detection.threshold, Some(3.0));
        assert_eq!(detection.regions.len(), 1);
        assert_eq!(detection.regions[0].entity_count, 3);
    }

    #[test]
    fn invalid_cell_size_is_rejected() {
        let index = DrawingIndex::build(Document::new());
        let params = DetectionParams {
            grid_cell_size: 0.0,
            ..DetectionParams::default()
        };
        let err = detect(&index, &params, &LayerFilter::all()).unwrap_err();
        assert_eq!(err, DetectError::InvalidCellSize(0.0));
    }

    #[test]
    fn region_labels_follow_layer_keywords() {
        let layers = vec!["A-WALL".to_string(), "PUB_DIM".to_string(), "S_WALL".to_string()];
        assert_eq!(region_label(&layers, 9), "墙体/标注区域");
        assert_eq!(region_label(&["MISC".to_string()], 4), "区域(4个实体)");
    }

    #[test]
    fn window_is_kept_inside_container() {
        let container = Bounds2D::from_origin_size(0.0, 0.0, 100.0, 50.0);
        let window = fit_window(Point2::new(95.0, 2.0), 20.0, 10.0, &container);
        assert!(container.contains(&window));
        assert!((window.width() - 20.0).abs() < 1e-9);
        assert!((window.min().x() - 80.0).abs() < 1e-9);
        assert!(window.min().y().abs() < 1e-9);
    }
}
