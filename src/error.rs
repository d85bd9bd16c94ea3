//! 代理错误类型
//!
//! 定义请求代理过程中可能发生的错误，区分可直接透传给客户端的
//! 上游错误和网关自身的失败。

use axum::http::StatusCode;
use thiserror::Error;

/// 代理错误
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 请求体无效（缺少 model 字段或 JSON 解析失败）
    #[error("bad request: {0}")]
    BadRequest(String),

    /// 未找到匹配的路由
    #[error("model '{model}' not found in route list. Available models: {available:?}")]
    NotFound {
        model: String,
        /// 当前所有可用的 Name/Model 标识，用于客户端诊断
        available: Vec<String>,
    },

    /// 转发目标路由不存在或已禁用
    #[error("forwarding target route not found: {0}")]
    ForwardTargetNotFound(i64),

    /// 上游服务无法到达（传输层失败）
    #[error("backend service unavailable: {0}")]
    BackendUnavailable(String),

    /// 上游返回非 2xx 状态，响应体原样透传
    #[error("backend error: {status} - {body}")]
    BackendError { status: u16, body: String },

    /// 请求翻译失败（对该次调用是致命的）
    #[error("adaptation failed: {0}")]
    Adaptation(String),

    /// 存储层错误
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl ProxyError {
    /// 映射为对客户端的 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::NotFound { .. } | ProxyError::ForwardTargetNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ProxyError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::BackendError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::Adaptation(_) | ProxyError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
