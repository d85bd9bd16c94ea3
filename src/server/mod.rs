//! HTTP 服务
//!
//! 对外暴露 OpenAI 兼容入口：
//! - `POST /v1/chat/completions`：按请求体的 `stream` 标志分发一元/流式
//! - `GET /v1/models`：OpenAI 形状的模型列表
//! - `GET /stats`：用量统计总览
//!
//! 入站鉴权直接透传，网关不做校验。

use crate::config::ProxyConfig;
use crate::database::DbConnection;
use crate::error::ProxyError;
use crate::proxy::ProxyExecutor;
use crate::telemetry::StatsService;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;

#[cfg(test)]
mod tests;

/// 共享应用状态
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<ProxyExecutor>,
    pub db: DbConnection,
}

impl AppState {
    pub fn new(db: DbConnection, config: ProxyConfig) -> Result<Self, ProxyError> {
        let executor = Arc::new(ProxyExecutor::new(db.clone(), config)?);
        Ok(Self { executor, db })
    }
}

/// 构建路由表
pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/stats", get(stats))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

/// 错误统一为 OpenAI 风格的 JSON 响应体
fn error_response(err: ProxyError) -> Response {
    let status = err.status_code();
    tracing::warn!("[SERVER] 请求失败: status={} err={}", status, err);
    (
        status,
        Json(json!({"error": {"message": err.to_string()}})),
    )
        .into_response()
}

/// `POST /v1/chat/completions`
///
/// `stream: true` 时握手成功后才建立事件流，
/// 前置失败以普通 JSON 错误返回。
async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let caller_auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let is_stream = body
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if !is_stream {
        return match state.executor.execute_unary(body, caller_auth).await {
            Ok(raw) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                raw,
            )
                .into_response(),
            Err(e) => error_response(e),
        };
    }

    let active = match state.executor.begin_stream(body, caller_auth).await {
        Ok(active) => active,
        Err(e) => return error_response(e),
    };

    let (tx, mut rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        if let Err(e) = active.forward(tx).await {
            tracing::error!("[SERVER] 流式传输中断: {}", e);
        }
    });

    let body_stream = async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            yield Ok::<Bytes, std::convert::Infallible>(chunk);
        }
    };

    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
    {
        Ok(response) => response,
        Err(e) => error_response(ProxyError::Adaptation(format!(
            "failed to build stream response: {}",
            e
        ))),
    }
}

/// `GET /v1/models`
async fn list_models(State(state): State<AppState>) -> Response {
    let models = match state.executor.resolver().available_models_with_redirect() {
        Ok(models) => models,
        Err(e) => return error_response(e),
    };
    let data: Vec<Value> = models
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "owned_by": "routecast",
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data })).into_response()
}

/// `GET /stats`
async fn stats(State(state): State<AppState>) -> Response {
    let conn = state.db.lock();
    let summary = match StatsService::summary(&conn) {
        Ok(s) => s,
        Err(e) => return error_response(ProxyError::Database(e)),
    };
    let daily = match StatsService::daily(&conn, 7) {
        Ok(d) => d,
        Err(e) => return error_response(ProxyError::Database(e)),
    };
    let hourly = match StatsService::hourly(&conn) {
        Ok(h) => h,
        Err(e) => return error_response(ProxyError::Database(e)),
    };
    let ranking = match StatsService::model_ranking(&conn, 10) {
        Ok(r) => r,
        Err(e) => return error_response(ProxyError::Database(e)),
    };

    Json(json!({
        "summary": summary,
        "daily": daily,
        "hourly": hourly,
        "model_ranking": ranking,
    }))
    .into_response()
}
