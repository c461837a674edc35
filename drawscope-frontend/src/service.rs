//! 对外暴露的图纸操作：范围与区域、区域渲染、总览、格式转换。
//!
//! 服务持有配置、索引存储、渲染缓存与渲染线程池；除缓存与线程池外各调用互不共享可变状态。

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use drawscope_config::{self as config, AppConfig};
use drawscope_convert::{
    ConvertError, ConvertRequest, ConverterSettings, FormatConverter, OutputVersion, ProcessRunner,
};
use drawscope_core::cancel::CancelToken;
use drawscope_core::geometry::Bounds2D;
use drawscope_core::index::LayerFilter;
use drawscope_engine::cache::{CacheKey, CacheStats, RenderCache};
use drawscope_engine::errors::RenderError;
use drawscope_engine::regions::{self, DetectionParams, ThresholdMode};
use drawscope_engine::render::{
    AdaptiveRenderer, ColorMode, RasterFormat, RenderOptions, RenderRequest, RenderResult, overview_bbox,
    requested_bbox,
};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::errors::ServiceError;
use crate::loader::{IndexStore, LoadedDrawing};
use crate::payload::{
    BoundsPayload, ConversionPayload, DrawingSummary, OverviewPayload, RectPayload, RegionPayload,
    RegionRenderPayload, RenderPayload,
};

/// 渲染类操作共用的参数。`output_size` 缺省时使用配置中的尺寸。
#[derive(Debug, Clone, Default)]
pub struct RenderParams {
    pub output_size: Option<(u32, u32)>,
    pub layers: Option<Vec<String>>,
    pub format: RasterFormat,
}

impl RenderParams {
    fn filter(&self) -> LayerFilter {
        LayerFilter::from_option(self.layers.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    /// 缺省时使用 `converter.default_version`。
    pub version: Option<String>,
    pub recursive: bool,
    pub audit: bool,
}

impl ConversionRequest {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: None,
            version: None,
            recursive: false,
            audit: false,
        }
    }
}

pub struct DrawingService {
    config: AppConfig,
    store: IndexStore,
    cache: RenderCache,
    renderer: AdaptiveRenderer,
    pool: rayon::ThreadPool,
}

impl DrawingService {
    pub fn new(config: AppConfig) -> Result<Self, ServiceError> {
        config.validate()?;

        let mut renderer = AdaptiveRenderer::new(render_options(&config.render));
        if let Some(path) = &config.render.font_path {
            match AdaptiveRenderer::load_font(path) {
                Ok(font) => renderer = renderer.with_font(font),
                Err(err) => warn!(path = %path.display(), error = %err, "加载字体失败，文字将以外框绘制"),
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.render.worker_threads)
            .thread_name(|i| format!("drawscope-render-{i}"))
            .build()
            .map_err(|err| ServiceError::Pool(err.to_string()))?;

        let max_age = (config.cache.max_age_secs > 0).then(|| Duration::from_secs(config.cache.max_age_secs));
        let cache = RenderCache::new(config.cache.capacity, max_age);
        info!(
            workers = pool.current_num_threads(),
            cache_capacity = config.cache.capacity,
            output_dir = %config.render.output_dir.display(),
            "图纸服务已就绪"
        );

        Ok(Self {
            config,
            store: IndexStore::new(),
            cache,
            renderer,
            pool,
        })
    }

    #[inline]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// 图纸范围与按优先级排序的区域列表。空图纸返回 `empty` 状态和空列表。
    /// `grid_cell_size` 覆盖本次调用的网格边长，缺省时使用配置。
    pub fn get_drawing_bounds(
        &self,
        path: &Path,
        layers: Option<&[String]>,
        grid_cell_size: Option<f64>,
    ) -> Result<DrawingSummary, ServiceError> {
        let drawing = self.load(path)?;
        let filter = LayerFilter::from_option(layers);
        let mut params = detection_params(&self.config.detection);
        if let Some(size) = grid_cell_size {
            params.grid_cell_size = size;
        }
        let detection = regions::detect(&drawing.index, &params, &filter)
            .map_err(|source| ServiceError::Detect {
                path: path.to_path_buf(),
                source,
            })?;
        info!(
            path = %path.display(),
            state = ?detection.bounds.state(),
            regions = detection.regions.len(),
            fallback = detection.used_fallback,
            "图纸范围计算完成"
        );

        Ok(DrawingSummary {
            path: path.to_path_buf(),
            source_identity: drawing.identity.clone(),
            entity_count: drawing.index.len(),
            layers: drawing.index.layer_names().into_iter().map(str::to_string).collect(),
            bounds: BoundsPayload::from(&detection.bounds),
            regions: detection.regions.iter().map(RegionPayload::from).collect(),
            threshold: detection.threshold,
            used_fallback: detection.used_fallback,
        })
    }

    /// 渲染图纸坐标中的矩形。相同请求命中缓存，超时重试一次。
    /// 宽或高恰为零时报 `DegenerateBBox`，判断基于请求中的宽高本身。
    pub fn render_region(
        &self,
        path: &Path,
        rect: RectPayload,
        params: &RenderParams,
        cancel: &CancelToken,
    ) -> Result<RenderPayload, ServiceError> {
        let bbox = requested_bbox(rect.x, rect.y, rect.width, rect.height)
            .map_err(|source| ServiceError::render(path, source))?;
        let drawing = self.load(path)?;
        self.render_loaded(&drawing, bbox, params, cancel)
    }

    /// 以整张图纸（或过滤后的范围）为请求矩形的渲染。
    pub fn render_overview(&self, path: &Path, params: &RenderParams, cancel: &CancelToken) -> Result<OverviewPayload, ServiceError> {
        let drawing = self.load(path)?;
        let filter = params.filter();
        let bounds = drawing.index.bounds(&filter);
        let extent = bounds
            .extent()
            .ok_or_else(|| ServiceError::render(path, RenderError::EmptyDrawing))?;
        let (width, height) = params.output_size.unwrap_or((
            self.config.render.overview_size,
            self.config.render.overview_size,
        ));

        // 总览与以同一矩形调用 render_region 是同一算法，两者共享缓存条目
        let key = CacheKey::new(
            drawing.identity.clone(),
            &overview_bbox(&extent),
            width,
            height,
            &filter,
            params.format,
        );
        let render = self.render_cached(&drawing, key, || {
            self.renderer
                .render_overview(&drawing.index, width, height, &filter, params.format, cancel)
        })?;
        Ok(OverviewPayload {
            bounds: BoundsPayload::from(&bounds),
            render,
        })
    }

    /// 识别区域后并行渲染前 `top_n` 个。单个区域失败只记录在该项中。
    pub fn render_regions(
        &self,
        path: &Path,
        top_n: usize,
        params: &RenderParams,
        cancel: &CancelToken,
    ) -> Result<Vec<RegionRenderPayload>, ServiceError> {
        let drawing = self.load(path)?;
        let detection = regions::detect(&drawing.index, &detection_params(&self.config.detection), &params.filter())
            .map_err(|source| ServiceError::Detect {
                path: path.to_path_buf(),
                source,
            })?;
        let selected = &detection.regions[..detection.regions.len().min(top_n)];
        debug!(path = %path.display(), regions = selected.len(), "并行渲染区域");

        let results = self.pool.install(|| {
            selected
                .par_iter()
                .map(|region| match self.render_loaded(&drawing, region.bbox, params, cancel) {
                    Ok(render) => RegionRenderPayload {
                        region: RegionPayload::from(region),
                        render: Some(render),
                        error: None,
                    },
                    Err(err) => {
                        warn!(path = %path.display(), priority = region.priority, error = %err, "区域渲染失败");
                        RegionRenderPayload {
                            region: RegionPayload::from(region),
                            render: None,
                            error: Some(err.report()),
                        }
                    }
                })
                .collect()
        });
        Ok(results)
    }

    /// 使用配置中的转换工具转换单个 DWG 或整个目录。
    pub fn convert(&self, request: &ConversionRequest, cancel: &CancelToken) -> Result<ConversionPayload, ServiceError> {
        let version = self.output_version(request)?;
        let converter = FormatConverter::discover(self.converter_settings())?;
        self.run_conversion(&converter, request, version, cancel)
    }

    /// 与 `convert` 相同，但使用调用方提供的转换器（例如替换了进程执行方式）。
    pub fn convert_with<R: ProcessRunner>(
        &self,
        converter: &FormatConverter<R>,
        request: &ConversionRequest,
        cancel: &CancelToken,
    ) -> Result<ConversionPayload, ServiceError> {
        let version = self.output_version(request)?;
        self.run_conversion(converter, request, version, cancel)
    }

    pub fn converter_settings(&self) -> ConverterSettings {
        let converter = &self.config.converter;
        ConverterSettings {
            tool_path: converter.tool_path.clone(),
            timeout: Duration::from_secs(converter.timeout_secs),
            max_retries: converter.max_retries,
            backoff: Duration::from_millis(converter.backoff_ms),
            max_workers: converter.max_workers,
        }
    }

    fn output_version(&self, request: &ConversionRequest) -> Result<OutputVersion, ServiceError> {
        let wanted = request
            .version
            .as_deref()
            .unwrap_or(&self.config.converter.default_version);
        wanted
            .parse::<OutputVersion>()
            .map_err(|value| ServiceError::Convert(ConvertError::UnsupportedVersion(value)))
    }

    fn run_conversion<R: ProcessRunner>(
        &self,
        converter: &FormatConverter<R>,
        request: &ConversionRequest,
        version: OutputVersion,
        cancel: &CancelToken,
    ) -> Result<ConversionPayload, ServiceError> {
        let convert_request = ConvertRequest {
            source: request.source.clone(),
            destination: request.destination.clone(),
            version,
            recursive: request.recursive,
            audit: request.audit,
        };
        let outcome = converter.convert(&convert_request, cancel)?;
        let payload = ConversionPayload::from(&outcome);
        info!(
            source = %request.source.display(),
            %version,
            converted = payload.files_converted,
            failed = payload.files_failed,
            "转换结束"
        );
        Ok(payload)
    }

    fn load(&self, path: &Path) -> Result<LoadedDrawing, ServiceError> {
        let outcome = self.store.load(path)?;
        if let Some(previous) = outcome.replaced {
            info!(path = %path.display(), "图纸内容已变化，清除旧的渲染缓存");
            self.cache.invalidate_source(&previous);
        }
        Ok(outcome.drawing)
    }

    fn render_loaded(
        &self,
        drawing: &LoadedDrawing,
        bbox: Bounds2D,
        params: &RenderParams,
        cancel: &CancelToken,
    ) -> Result<RenderPayload, ServiceError> {
        let (width, height) = params.output_size.unwrap_or((
            self.config.render.default_size,
            self.config.render.default_size,
        ));
        let filter = params.filter();
        let key = CacheKey::new(drawing.identity.clone(), &bbox, width, height, &filter, params.format);
        let request = RenderRequest::new(bbox, width, height)
            .with_layers(filter)
            .with_format(params.format);
        self.render_cached(drawing, key, || self.renderer.render(&drawing.index, &request, cancel))
    }

    fn render_cached<F>(&self, drawing: &LoadedDrawing, key: CacheKey, render: F) -> Result<RenderPayload, ServiceError>
    where
        F: Fn() -> Result<RenderResult, RenderError>,
    {
        let result = self
            .cache
            .get_or_render(key.clone(), || retry_timeout_once(&drawing.path, &render))
            .map_err(|source| ServiceError::render(&drawing.path, source))?;
        let image_path = self.write_image(&drawing.path, &key, &result)?;
        Ok(RenderPayload::new(image_path, &result))
    }

    /// 输出文件名由缓存键派生，相同请求总是落在同一文件上。
    fn write_image(&self, source: &Path, key: &CacheKey, result: &RenderResult) -> Result<PathBuf, ServiceError> {
        let dir = &self.config.render.output_dir;
        let stem = source
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "drawing".to_string());
        let digest = format!("{:x}", Sha256::digest(key.canonical().as_bytes()));
        let path = dir.join(format!("{stem}_{}.{}", &digest[..16], result.format.extension()));

        if fs::metadata(&path).is_ok_and(|meta| meta.len() == result.image.len() as u64) {
            return Ok(path);
        }
        let output_error = |source: std::io::Error| ServiceError::Output {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(dir).map_err(output_error)?;
        // 先写临时文件再改名，并发的同名写入不会产生半个文件
        let mut staged = NamedTempFile::new_in(dir).map_err(output_error)?;
        staged.write_all(&result.image).map_err(output_error)?;
        staged.persist(&path).map_err(|err| output_error(err.error))?;
        debug!(path = %path.display(), bytes = result.image.len(), "渲染结果已写出");
        Ok(path)
    }
}

fn retry_timeout_once<F>(path: &Path, render: &F) -> Result<RenderResult, RenderError>
where
    F: Fn() -> Result<RenderResult, RenderError>,
{
    match render() {
        Err(err) if err.is_retryable() => {
            warn!(path = %path.display(), error = %err, "渲染超时，重试一次");
            render()
        }
        other => other,
    }
}

pub fn detection_params(detection: &config::DetectionConfig) -> DetectionParams {
    let threshold = match detection.threshold_mode {
        config::ThresholdMode::Absolute => ThresholdMode::Absolute {
            count: detection.density_threshold,
        },
        config::ThresholdMode::Percentile => ThresholdMode::Percentile {
            percentile: detection.percentile,
            floor: detection.density_threshold,
        },
    };
    DetectionParams {
        grid_cell_size: detection.grid_cell_size,
        threshold,
        min_region_area: detection.min_region_area,
        fallback_to_full_drawing: detection.fallback_to_full_drawing,
    }
}

pub fn render_options(render: &config::RenderConfig) -> RenderOptions {
    RenderOptions {
        min_text_height_px: render.min_text_height_px,
        min_line_width_px: render.min_line_width_px,
        timeout: (render.timeout_ms > 0).then(|| Duration::from_millis(render.timeout_ms)),
        color_mode: match render.color_mode {
            config::ColorMode::ByLayer => ColorMode::ByLayer,
            config::ColorMode::Monochrome => ColorMode::Monochrome,
        },
        jpeg_quality: render.jpeg_quality,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_mode_uses_threshold_as_floor() {
        let detection = config::DetectionConfig {
            threshold_mode: config::ThresholdMode::Percentile,
            percentile: 0.9,
            density_threshold: 2,
            ..config::DetectionConfig::default()
        };
        let params = detection_params(&detection);
        assert_eq!(
            params.threshold,
            ThresholdMode::Percentile {
                percentile: 0.9,
                floor: 2
            }
        );
        assert_eq!(
            detection_params(&config::DetectionConfig::default()).threshold,
            ThresholdMode::Absolute { count: 3 }
        );
    }

    #[test]
    fn zero_timeout_means_unlimited() {
        let render = config::RenderConfig {
            timeout_ms: 0,
            color_mode: config::ColorMode::Monochrome,
            ..config::RenderConfig::default()
        };
        let options = render_options(&render);
        assert!(options.timeout.is_none());
        assert_eq!(options.color_mode, ColorMode::Monochrome);
        assert_eq!(
            render_options(&config::RenderConfig::default()).timeout,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn converter_settings_follow_config() {
        let mut cfg = AppConfig::default();
        cfg.converter.timeout_secs = 12;
        cfg.converter.backoff_ms = 0;
        cfg.converter.max_workers = 3;
        let service = DrawingService::new(cfg).expect("创建服务失败");
        let settings = service.converter_settings();
        assert_eq!(settings.timeout, Duration::from_secs(12));
        assert_eq!(settings.backoff, Duration::ZERO);
        assert_eq!(settings.max_workers, 3);
        assert_eq!(settings.max_retries, 2);
    }

    #[test]
    fn unknown_version_is_rejected_before_tool_lookup() {
        let service = DrawingService::new(AppConfig::default()).expect("创建服务失败");
        let request = ConversionRequest {
            version: Some("ACAD2019".to_string()),
            ..ConversionRequest::new("plan.dwg")
        };
        let err = service.convert(&request, &CancelToken::new()).unwrap_err();
        assert_eq!(err.kind(), "UnsupportedVersion");
    }
}
