//! 数据模型定义

pub mod route_model;
pub mod usage_model;

pub use route_model::{format, ModelRoute, NewRoute};
pub use usage_model::{UsageBucket, UsageEntry};
