use std::path::{Path, PathBuf};

use drawscope_config::ConfigError;
use drawscope_convert::ConvertError;
use drawscope_engine::errors::{DetectError, RenderError};
use drawscope_io::IoError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("source path does not exist: {}", .0.display())]
    SourceNotFound(PathBuf),
    #[error("failed to load {}: {source}", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: IoError,
    },
    #[error("region detection failed for {}: {source}", .path.display())]
    Detect {
        path: PathBuf,
        #[source]
        source: DetectError,
    },
    #[error("render of {} failed: {source}", .path.display())]
    Render {
        path: PathBuf,
        #[source]
        source: RenderError,
    },
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to write {}: {source}", .path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build render worker pool: {0}")]
    Pool(String),
}

impl ServiceError {
    pub(crate) fn render(path: &Path, source: RenderError) -> Self {
        ServiceError::Render {
            path: path.to_path_buf(),
            source,
        }
    }

    /// 错误类别名称，调用方据此决定重试、缩小请求或放弃。
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::SourceNotFound(_) => "SourceNotFound",
            ServiceError::Load { .. } => "LoadFailed",
            ServiceError::Detect { .. } => "DetectionFailed",
            ServiceError::Render { source, .. } => match source {
                RenderError::DegenerateBBox { .. } => "DegenerateBBox",
                RenderError::InvalidBBox(_) => "InvalidBBox",
                RenderError::InvalidOutputSize { .. } => "InvalidOutputSize",
                RenderError::OutsideDrawing => "OutsideDrawing",
                RenderError::EmptyDrawing => "EmptyDrawing",
                RenderError::RenderTimeout { .. } => "RenderTimeout",
                RenderError::Cancelled => "Cancelled",
                RenderError::Font(_) => "FontError",
                RenderError::Encode(_) => "EncodeFailed",
            },
            ServiceError::Convert(err) => convert_kind(err),
            ServiceError::Config(_) => "ConfigError",
            ServiceError::Output { .. } => "OutputFailed",
            ServiceError::Pool(_) => "PoolError",
        }
    }

    pub fn file(&self) -> Option<&Path> {
        match self {
            ServiceError::SourceNotFound(path)
            | ServiceError::Load { path, .. }
            | ServiceError::Detect { path, .. }
            | ServiceError::Render { path, .. }
            | ServiceError::Output { path, .. } => Some(path),
            ServiceError::Convert(err) => err.path(),
            _ => None,
        }
    }

    pub fn stage(&self) -> Option<&'static str> {
        match self {
            ServiceError::SourceNotFound(_) | ServiceError::Load { .. } => Some("load"),
            ServiceError::Detect { .. } => Some("detect"),
            ServiceError::Render { .. } => Some("render"),
            ServiceError::Output { .. } => Some("write"),
            ServiceError::Convert(err) => err.stage().map(|stage| stage.as_str()),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Render { source, .. } => {
                source.is_retryable() || matches!(source, RenderError::Cancelled)
            }
            ServiceError::Convert(err) => err.is_retryable(),
            _ => false,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            file: self.file().map(Path::to_path_buf),
            stage: self.stage(),
            retryable: self.is_retryable(),
        }
    }
}

pub(crate) fn convert_kind(err: &ConvertError) -> &'static str {
    match err {
        ConvertError::SourceNotFound(_) => "SourceNotFound",
        ConvertError::NotBinaryDrawing(_) => "NotBinaryDrawing",
        ConvertError::ToolNotFound => "ToolNotFound",
        ConvertError::UnsupportedVersion(_) => "UnsupportedVersion",
        ConvertError::ConversionFailed { .. } => "ConversionFailed",
        ConvertError::ConversionTimeout { .. } => "ConversionTimeout",
        ConvertError::AuditFailed { .. } => "AuditFailed",
        ConvertError::Cancelled(_) => "Cancelled",
        ConvertError::Io { .. } => "ConversionFailed",
        ConvertError::Pool(_) => "PoolError",
    }
}

/// 对外暴露的结构化错误：哪个文件、哪个阶段、能否重试。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<&'static str>,
    pub retryable: bool,
}

impl ErrorReport {
    pub(crate) fn from_convert(err: &ConvertError) -> Self {
        ErrorReport {
            kind: convert_kind(err),
            message: err.to_string(),
            file: err.path().map(Path::to_path_buf),
            stage: err.stage().map(|stage| stage.as_str()),
            retryable: err.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drawscope_convert::Stage;

    #[test]
    fn render_errors_keep_their_taxonomy_name() {
        let err = ServiceError::render(
            Path::new("plan.dxf"),
            RenderError::DegenerateBBox {
                width: 0.0,
                height: 100.0,
            },
        );
        let report = err.report();
        assert_eq!(report.kind, "DegenerateBBox");
        assert_eq!(report.stage, Some("render"));
        assert_eq!(report.file.as_deref(), Some(Path::new("plan.dxf")));
        assert!(!report.retryable);

        let timeout = ServiceError::render(Path::new("plan.dxf"), RenderError::RenderTimeout { timeout_ms: 10 });
        assert!(timeout.report().retryable);
    }

    #[test]
    fn conversion_errors_carry_file_and_stage() {
        let err = ServiceError::from(ConvertError::AuditFailed {
            path: PathBuf::from("a.dwg"),
            message: "bad".to_string(),
        });
        let report = err.report();
        assert_eq!(report.kind, "AuditFailed");
        assert_eq!(report.stage, Some("audit"));
        assert_eq!(report.file, Some(PathBuf::from("a.dwg")));

        let json = serde_json::to_value(&report).expect("序列化失败");
        assert_eq!(json["kind"], "AuditFailed");
        assert_eq!(json["retryable"], false);

        let timeout = ServiceError::from(ConvertError::ConversionTimeout {
            path: PathBuf::from("a.dwg"),
            stage: Stage::Audit,
            attempts: 3,
            timeout_secs: 300,
        })
        .report();
        assert_eq!(timeout.kind, "ConversionTimeout");
        assert_eq!(timeout.stage, Some("audit"));
        assert!(timeout.retryable);
    }

    #[test]
    fn absent_fields_are_omitted() {
        let report = ServiceError::Pool("no threads".to_string()).report();
        let json = serde_json::to_value(&report).expect("序列化失败");
        assert!(json.get("file").is_none());
        assert!(json.get("stage").is_none());
    }
}
