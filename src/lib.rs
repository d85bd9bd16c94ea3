//! routecast
//!
//! 多后端 LLM API 网关：对外提供 OpenAI 兼容的 chat-completions
//! 入口，按模型名解析到配置的后端路由，必要时做协议方言翻译
//! （Claude / Gemini / Deepseek），并按小时聚合用量。

pub mod adapter;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod proxy;
pub mod router;
pub mod server;
pub mod telemetry;

pub use config::ProxyConfig;
pub use error::ProxyError;
