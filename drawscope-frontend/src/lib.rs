//! 面向调用方的图纸服务：加载与复用索引、区域识别、自适应渲染、格式转换，
//! 结果与错误都以可序列化的结构返回。

pub mod errors;
pub mod loader;
pub mod payload;
pub mod service;

pub use errors::{ErrorReport, ServiceError};
pub use payload::{
    BoundsPayload, ConversionPayload, DrawingSummary, OverviewPayload, RectPayload, RegionPayload,
    RegionRenderPayload, RenderPayload,
};
pub use service::{ConversionRequest, DrawingService, RenderParams};
