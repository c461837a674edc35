use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// 指定配置文件路径的环境变量。
pub const CONFIG_ENV_VAR: &str = "DRAWSCOPE_CONFIG";

/// 应用配置的根结构。所有字段都有默认值，缺少的段落按默认处理。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub converter: ConverterConfig,
}

impl AppConfig {
    /// 从显式路径加载配置。
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 自动发现配置文件：优先读取环境变量 `DRAWSCOPE_CONFIG`，否则寻找 `./config/default.toml`。
    /// 若文件缺失，则返回默认配置。
    pub fn discover() -> Result<Self, ConfigError> {
        Self::discover_with(None)
    }

    /// 显式路径优先于自动发现。
    pub fn discover_with(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Some(path) = env::var_os(CONFIG_ENV_VAR) {
            return Self::from_file(PathBuf::from(path));
        }

        let default_path = env::current_dir()
            .map(|dir| dir.join("config").join("default.toml"))
            .map_err(|source| ConfigError::Context {
                message: "获取当前工作目录失败".to_string(),
                source,
            })?;

        if default_path.exists() {
            Self::from_file(default_path)
        } else {
            Ok(Self::default())
        }
    }

    /// 检查数值范围；解析成功但取值无意义的配置在这里拒绝。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let detection = &self.detection;
        if !(detection.grid_cell_size.is_finite() && detection.grid_cell_size > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "detection.grid_cell_size 必须为正数，当前为 {}",
                detection.grid_cell_size
            )));
        }
        if !(0.0..=1.0).contains(&detection.percentile) {
            return Err(ConfigError::Invalid(format!(
                "detection.percentile 必须位于 [0, 1]，当前为 {}",
                detection.percentile
            )));
        }
        if detection.min_region_area < 0.0 {
            return Err(ConfigError::Invalid("detection.min_region_area 不能为负".to_string()));
        }
        let render = &self.render;
        if render.overview_size == 0 || render.default_size == 0 {
            return Err(ConfigError::Invalid("render 的画布尺寸必须大于 0".to_string()));
        }
        if !(1..=100).contains(&render.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "render.jpeg_quality 必须位于 1..=100，当前为 {}",
                render.jpeg_quality
            )));
        }
        if self.converter.max_workers == 0 {
            return Err(ConfigError::Invalid("converter.max_workers 必须大于 0".to_string()));
        }
        Ok(())
    }
}

/// 日志配置，支持设置默认等级。
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMode {
    #[default]
    Absolute,
    Percentile,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub grid_cell_size: f64,
    /// 绝对模式下的计数阈值，百分位模式下的下限。
    pub density_threshold: usize,
    pub threshold_mode: ThresholdMode,
    pub percentile: f64,
    pub min_region_area: f64,
    pub fallback_to_full_drawing: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            grid_cell_size: 1000.0,
            density_threshold: 3,
            threshold_mode: ThresholdMode::Absolute,
            percentile: 0.75,
            min_region_area: 0.0,
            fallback_to_full_drawing: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    #[default]
    ByLayer,
    Monochrome,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub min_text_height_px: f64,
    pub min_line_width_px: f64,
    pub overview_size: u32,
    pub default_size: u32,
    /// 0 表示不限时。
    pub timeout_ms: u64,
    pub output_dir: PathBuf,
    pub font_path: Option<PathBuf>,
    pub color_mode: ColorMode,
    pub jpeg_quality: u8,
    /// 0 表示使用全部 CPU 核心。
    pub worker_threads: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            min_text_height_px: 20.0,
            min_line_width_px: 2.0,
            overview_size: 1024,
            default_size: 2048,
            timeout_ms: 30_000,
            output_dir: PathBuf::from("workspace/rendered"),
            font_path: None,
            color_mode: ColorMode::ByLayer,
            jpeg_quality: 85,
            worker_threads: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    /// 0 表示只按容量淘汰。
    pub max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            max_age_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    pub tool_path: Option<PathBuf>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub max_workers: usize,
    pub default_version: String,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            tool_path: None,
            timeout_secs: 300,
            max_retries: 2,
            backoff_ms: 500,
            max_workers: 4,
            default_version: "ACAD2018".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件 {path:?} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("解析配置文件 {path:?} 失败: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("配置取值无效: {0}")]
    Invalid(String),
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_cover_every_section() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.logging.level, "info");
        assert!((cfg.detection.grid_cell_size - 1000.0).abs() < 1e-9);
        assert_eq!(cfg.detection.density_threshold, 3);
        assert_eq!(cfg.detection.threshold_mode, ThresholdMode::Absolute);
        assert!(cfg.detection.fallback_to_full_drawing);
        assert_eq!(cfg.render.overview_size, 1024);
        assert_eq!(cfg.render.default_size, 2048);
        assert_eq!(cfg.render.output_dir, PathBuf::from("workspace/rendered"));
        assert_eq!(cfg.cache.capacity, 64);
        assert_eq!(cfg.converter.default_version, "ACAD2018");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn shipped_default_file_matches_builtin_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../config/default.toml");
        let cfg = AppConfig::from_file(&path).expect("load shipped config");
        let builtin = AppConfig::default();
        assert_eq!(cfg.detection.density_threshold, builtin.detection.density_threshold);
        assert_eq!(cfg.render.output_dir, builtin.render.output_dir);
        assert_eq!(cfg.render.timeout_ms, builtin.render.timeout_ms);
        assert_eq!(cfg.converter.default_version, builtin.converter.default_version);
        assert!(cfg.render.font_path.is_none());
    }

    #[test]
    fn load_from_temp_file() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(
            file,
            r#"
            [logging]
            level = "debug"

            [detection]
            grid_cell_size = 500.0
            threshold_mode = "percentile"
            percentile = 0.9

            [render]
            color_mode = "monochrome"
            font_path = "../fonts/simhei.ttf"
            timeout_ms = 0

            [converter]
            tool_path = "/opt/oda/ODAFileConverter"
            max_retries = 0
            "#
        )
        .expect("写入临时配置失败");

        let cfg = AppConfig::from_file(file.path()).expect("load config");
        assert_eq!(cfg.logging.level, "debug");
        assert!((cfg.detection.grid_cell_size - 500.0).abs() < 1e-9);
        assert_eq!(cfg.detection.threshold_mode, ThresholdMode::Percentile);
        assert_eq!(cfg.detection.density_threshold, 3);
        assert_eq!(cfg.render.color_mode, ColorMode::Monochrome);
        assert_eq!(
            cfg.render
                .font_path
                .as_deref()
                .map(|p| p.to_string_lossy().to_string()),
            Some("../fonts/simhei.ttf".to_string())
        );
        assert_eq!(cfg.render.timeout_ms, 0);
        assert_eq!(cfg.render.jpeg_quality, 85);
        assert_eq!(cfg.converter.max_retries, 0);
        assert_eq!(cfg.converter.timeout_secs, 300);
        assert_eq!(cfg.cache.max_age_secs, 600);
    }

    #[test]
    fn explicit_path_takes_precedence() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(file, "[cache]\ncapacity = 8").expect("写入临时配置失败");
        let cfg = AppConfig::discover_with(Some(file.path())).expect("load config");
        assert_eq!(cfg.cache.capacity, 8);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(file, "[detection]\ngrid_cell_size = 0.0").expect("写入临时配置失败");
        let err = AppConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_toml_reports_parse_error() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(file, "[render\noverview_size = ").expect("写入临时配置失败");
        let err = AppConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_reports_io_error() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let err = AppConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
