pub mod cache;
pub mod regions;
pub mod render;

pub mod errors {
    use thiserror::Error;

    #[derive(Debug, Clone, PartialEq, Error)]
    pub enum DetectError {
        #[error("grid cell size must be positive and finite, got {0}")]
        InvalidCellSize(f64),
        #[error("percentile must lie in [0, 1], got {0}")]
        InvalidPercentile(f64),
        #[error("grid of {rows}x{cols} cells exceeds the supported size")]
        GridTooLarge { rows: usize, cols: usize },
    }

    /// 渲染错误可克隆，等待同一缓存键的调用方会收到相同的失败。
    #[derive(Debug, Clone, PartialEq, Error)]
    pub enum RenderError {
        #[error("requested bbox has zero width or height ({width} x {height})")]
        DegenerateBBox { width: f64, height: f64 },
        #[error("requested bbox is invalid: {0}")]
        InvalidBBox(String),
        #[error("output size must be positive, got {width}x{height}")]
        InvalidOutputSize { width: u32, height: u32 },
        #[error("requested bbox does not overlap the drawing bounds")]
        OutsideDrawing,
        #[error("drawing has no entities to render")]
        EmptyDrawing,
        #[error("rasterization exceeded its time budget of {timeout_ms} ms")]
        RenderTimeout { timeout_ms: u64 },
        #[error("render was cancelled")]
        Cancelled,
        #[error("failed to load font: {0}")]
        Font(String),
        #[error("failed to encode image: {0}")]
        Encode(String),
    }

    impl RenderError {
        /// 调用方可以直接重试的错误。
        pub fn is_retryable(&self) -> bool {
            matches!(self, RenderError::RenderTimeout { .. })
        }
    }
}
