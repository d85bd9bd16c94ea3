//! HTTP 入口测试
//!
//! 不出网：覆盖分发、错误形状与元数据端点，
//! 上游调用路径由 proxy 模块的测试承担。

use super::{build_router, AppState};
use crate::config::ProxyConfig;
use crate::database::dao::RouteDao;
use crate::database::init_in_memory;
use crate::models::{format, NewRoute};
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

fn test_state() -> AppState {
    let db = init_in_memory().unwrap();
    {
        let conn = db.lock();
        RouteDao::insert(
            &conn,
            &NewRoute {
                name: "openai".to_string(),
                model: "gpt-4".to_string(),
                api_url: "https://api.example.com".to_string(),
                api_key: "sk-test".to_string(),
                group: "default".to_string(),
                format: format::OPENAI.to_string(),
            },
        )
        .unwrap();
    }
    AppState::new(db, ProxyConfig::default()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_list_models() {
    let app = build_router(test_state(), 1024 * 1024);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "openai/gpt-4");
    assert_eq!(body["data"][0]["object"], "model");
}

#[tokio::test]
async fn test_chat_completions_requires_model() {
    let app = build_router(test_state(), 1024 * 1024);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "messages": [] }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("'model' field is required"));
}

#[tokio::test]
async fn test_chat_completions_unknown_model_is_404() {
    let app = build_router(test_state(), 1024 * 1024);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "model": "nope", "messages": [] }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    // 错误信息带可用模型列表，便于客户端排查
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("openai/gpt-4"));
}

#[tokio::test]
async fn test_stream_preflight_error_is_plain_json() {
    let app = build_router(test_state(), 1024 * 1024);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "model": "nope", "messages": [], "stream": true }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    // 路由失败发生在握手前，不会建立事件流
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers()["content-type"],
        "application/json"
    );
}

#[tokio::test]
async fn test_stats_endpoint_shape() {
    let app = build_router(test_state(), 1024 * 1024);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["summary"]["route_count"], 1);
    assert_eq!(body["summary"]["total_requests"], 0);
    assert!(body["daily"].is_array());
    assert!(body["hourly"].is_array());
    assert!(body["model_ranking"].is_array());
}

#[tokio::test]
async fn test_body_limit_rejects_oversized_request() {
    let app = build_router(test_state(), 64);
    let big = "x".repeat(1024);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "model": "gpt-4", "messages": [{ "content": big }] }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
