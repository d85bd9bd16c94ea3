//! 代理执行与流转发测试

use super::sse::{copy_raw, relay_adapted};
use super::{extract_usage, finish_unary, normalize_base, settle_stream};
use super::{ProxyExecutor, RelayOutcome};
use crate::adapter::AdapterKind;
use crate::config::ProxyConfig;
use crate::database::dao::{current_hour_key, RouteDao, UsageDao};
use crate::database::{init_in_memory, DbConnection};
use crate::error::ProxyError;
use crate::models::{format, NewRoute};
use bytes::Bytes;
use serde_json::{json, Value};
use std::convert::Infallible;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

fn byte_stream(
    frames: Vec<&str>,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> + Unpin {
    futures::stream::iter(
        frames
            .into_iter()
            .map(|f| Ok(Bytes::from(f.to_string())))
            .collect::<Vec<_>>(),
    )
}

async fn drain(rx: &mut mpsc::Receiver<Bytes>) -> String {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        out.extend_from_slice(&frame);
    }
    String::from_utf8(out).unwrap()
}

// ========== 用量提取 ==========

#[test]
fn test_extract_usage_unified() {
    let response = json!({
        "usage": { "prompt_tokens": 12, "completion_tokens": 8, "total_tokens": 20 },
    });
    assert_eq!(extract_usage(&response), (12, 8, 20));
}

#[test]
fn test_extract_usage_total_backfilled() {
    let response = json!({
        "usage": { "prompt_tokens": 12, "completion_tokens": 8 },
    });
    assert_eq!(extract_usage(&response), (12, 8, 20));
}

#[test]
fn test_extract_usage_claude_shape() {
    let response = json!({
        "usage": { "input_tokens": 5, "output_tokens": 7 },
    });
    assert_eq!(extract_usage(&response), (5, 7, 12));
}

#[test]
fn test_extract_usage_gemini_shape() {
    let response = json!({
        "usageMetadata": {
            "promptTokenCount": 3,
            "candidatesTokenCount": 4,
            "totalTokenCount": 7,
        },
    });
    assert_eq!(extract_usage(&response), (3, 4, 7));
}

#[test]
fn test_extract_usage_missing() {
    assert_eq!(extract_usage(&json!({ "choices": [] })), (0, 0, 0));
}

// ========== 直通复制 ==========

#[tokio::test]
async fn test_copy_raw_preserves_bytes() {
    // 注释行、心跳与不完整的分块都必须原样到达
    let frames = vec![
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"del",
        "ta\":{\"content\":\"hi\"}}]}\n\n",
        "data: [DONE]\n\n",
    ];
    let expected: String = frames.concat();

    let (tx, mut rx) = mpsc::channel(64);
    let outcome = copy_raw(byte_stream(frames), &tx).await.unwrap();
    drop(tx);

    assert_eq!(outcome, RelayOutcome::Completed);
    assert_eq!(drain(&mut rx).await, expected);
}

#[tokio::test]
async fn test_copy_raw_detects_disconnect() {
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let outcome = copy_raw(byte_stream(vec!["data: x\n\n"]), &tx)
        .await
        .unwrap();
    assert_eq!(outcome, RelayOutcome::Disconnected);
}

// ========== 适配转发 ==========

#[tokio::test]
async fn test_relay_adapted_claude_stream() {
    // 行跨分块边界切开，ping 与未知事件被跳过
    let frames = vec![
        "event: message_start\ndata: {\"type\":\"message_start\",\"message\"",
        ":{\"model\":\"claude-3\"}}\n\n",
        "data: {\"type\":\"ping\"}\n\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
        "data: {\"type\":\"mystery_event\"}\n\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"}}\n\n",
        "data: [DONE]\n\n",
    ];

    let (tx, mut rx) = mpsc::channel(64);
    let outcome = relay_adapted(byte_stream(frames), &tx, AdapterKind::Claude)
        .await
        .unwrap();
    drop(tx);
    assert_eq!(outcome, RelayOutcome::Completed);

    let output = drain(&mut rx).await;
    let events: Vec<&str> = output
        .split("\n\n")
        .filter(|s| !s.is_empty())
        .collect();

    // message_start + content delta + finish + [DONE]；ping 与未知事件无输出
    assert_eq!(events.len(), 4);
    assert_eq!(events[3], "data: [DONE]");

    let delta: Value =
        serde_json::from_str(events[1].strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(delta["object"], "chat.completion.chunk");
    assert_eq!(delta["choices"][0]["delta"]["content"], "Hello");

    let finish: Value =
        serde_json::from_str(events[2].strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(finish["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn test_relay_adapted_skips_malformed_payload() {
    let frames = vec![
        "data: {not json}\n\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"ok\"}}\n\n",
        "data: [DONE]\n\n",
    ];

    let (tx, mut rx) = mpsc::channel(64);
    let outcome = relay_adapted(byte_stream(frames), &tx, AdapterKind::Claude)
        .await
        .unwrap();
    drop(tx);
    assert_eq!(outcome, RelayOutcome::Completed);

    let output = drain(&mut rx).await;
    assert!(output.contains("\"content\":\"ok\""));
    assert!(output.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn test_relay_adapted_completes_without_done() {
    let frames = vec!["data: {\"type\":\"message_stop\"}\n\n"];
    let (tx, mut rx) = mpsc::channel(64);
    let outcome = relay_adapted(byte_stream(frames), &tx, AdapterKind::Claude)
        .await
        .unwrap();
    drop(tx);
    assert_eq!(outcome, RelayOutcome::Completed);
    assert!(drain(&mut rx).await.is_empty());
}

#[tokio::test]
async fn test_relay_adapted_rejects_oversized_line() {
    let big = format!("data: {}", "x".repeat(2 * 1024 * 1024));
    let (tx, _rx) = mpsc::channel(64);
    let result = relay_adapted(byte_stream(vec![&big]), &tx, AdapterKind::Claude).await;
    assert!(matches!(result, Err(ProxyError::Adaptation(_))));
}

// ========== 一元收尾与终态结算 ==========

fn test_db_with_route(model: &str, api_url: &str) -> (DbConnection, i64) {
    let db = init_in_memory().unwrap();
    let rid = RouteDao::insert(
        &db.lock(),
        &NewRoute {
            name: "Local".to_string(),
            model: model.to_string(),
            api_url: api_url.to_string(),
            api_key: String::new(),
            group: String::new(),
            format: format::OPENAI.to_string(),
        },
    )
    .unwrap();
    (db, rid)
}

fn bucket_now(db: &DbConnection, model: &str) -> crate::models::UsageBucket {
    UsageDao::get_bucket(&db.lock(), model, &current_hour_key())
        .unwrap()
        .unwrap()
}

#[test]
fn test_finish_unary_non_json_body_passes_through_as_success() {
    let (db, rid) = test_db_with_route("gpt-4", "https://api.example.com");
    let raw = Bytes::from_static(b"not json");

    let out = finish_unary(&db, raw.clone(), None, "gpt-4", rid);
    assert_eq!(out, raw);

    // 2xx 一律记成功，token 计零
    let bucket = bucket_now(&db, "gpt-4");
    assert!(bucket.success);
    assert_eq!(bucket.request_count, 1);
    assert_eq!(bucket.total_tokens, 0);
}

#[test]
fn test_finish_unary_records_extracted_usage() {
    let (db, rid) = test_db_with_route("gpt-4", "https://api.example.com");
    let raw = Bytes::from(
        json!({
            "choices": [],
            "usage": { "prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7 },
        })
        .to_string(),
    );

    finish_unary(&db, raw, None, "gpt-4", rid);
    let bucket = bucket_now(&db, "gpt-4");
    assert!(bucket.success);
    assert_eq!(bucket.request_tokens, 3);
    assert_eq!(bucket.response_tokens, 4);
    assert_eq!(bucket.total_tokens, 7);
}

#[test]
fn test_settle_stream_records_each_outcome_once() {
    let (db, rid) = test_db_with_route("gpt-4", "https://api.example.com");

    settle_stream(&db, Ok(RelayOutcome::Completed), "gpt-4", rid).unwrap();
    let bucket = bucket_now(&db, "gpt-4");
    assert!(bucket.success);
    assert_eq!(bucket.request_count, 1);

    settle_stream(&db, Ok(RelayOutcome::Disconnected), "gpt-4", rid).unwrap();
    let bucket = bucket_now(&db, "gpt-4");
    assert_eq!(bucket.request_count, 2);
    assert!(!bucket.success);
    assert_eq!(bucket.error_message, "client disconnected");

    let err = settle_stream(
        &db,
        Err(ProxyError::Adaptation("line too long".to_string())),
        "gpt-4",
        rid,
    );
    assert!(err.is_err());
    let bucket = bucket_now(&db, "gpt-4");
    assert_eq!(bucket.request_count, 3);
    assert_eq!(bucket.error_message, "adaptation failed: line too long");
}

#[test]
fn test_normalize_base() {
    assert_eq!(normalize_base("api.example.com/"), "https://api.example.com");
    assert_eq!(normalize_base("http://127.0.0.1:8080"), "http://127.0.0.1:8080");
    assert_eq!(
        normalize_base("https://api.example.com/v1/"),
        "https://api.example.com/v1"
    );
}

// ========== 端到端一元请求（本地伪上游） ==========

async fn read_http_request(socket: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&data[..pos]).to_ascii_lowercase();
            let body_len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if data.len() >= pos + 4 + body_len {
                break;
            }
        }
    }
    data
}

/// 起一个只处理一次请求的伪上游，返回监听端口
async fn spawn_upstream(response: Vec<u8>) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_http_request(&mut socket).await;
        socket.write_all(&response).await.unwrap();
        socket.shutdown().await.ok();
    });
    port
}

#[tokio::test]
async fn test_unary_truncated_body_records_failure() {
    // 状态行正常、响应体短于 Content-Length 后断开
    let port = spawn_upstream(
        b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nshort".to_vec(),
    )
    .await;
    let (db, _) = test_db_with_route("local-test", &format!("http://127.0.0.1:{}", port));
    let executor = ProxyExecutor::new(db.clone(), ProxyConfig::default()).unwrap();

    let result = executor
        .execute_unary(json!({"model": "local-test", "messages": []}), None)
        .await;
    assert!(matches!(result, Err(ProxyError::BackendUnavailable(_))));

    let bucket = bucket_now(&db, "local-test");
    assert!(!bucket.success);
    assert_eq!(bucket.request_count, 1);
}

#[tokio::test]
async fn test_unary_non_json_body_returns_raw() {
    let body = "not json";
    let port = spawn_upstream(
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes(),
    )
    .await;
    let (db, _) = test_db_with_route("local-test", &format!("http://127.0.0.1:{}", port));
    let executor = ProxyExecutor::new(db.clone(), ProxyConfig::default()).unwrap();

    let raw = executor
        .execute_unary(json!({"model": "local-test", "messages": []}), None)
        .await
        .unwrap();
    assert_eq!(raw, Bytes::from_static(b"not json"));

    let bucket = bucket_now(&db, "local-test");
    assert!(bucket.success);
    assert_eq!(bucket.total_tokens, 0);
}

#[tokio::test]
async fn test_fetch_remote_models() {
    let body = json!({"object": "list", "data": [{"id": "m1"}, {"id": "m2"}]}).to_string();
    let port = spawn_upstream(
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes(),
    )
    .await;
    let db = init_in_memory().unwrap();
    let executor = ProxyExecutor::new(db, ProxyConfig::default()).unwrap();

    let models = executor
        .fetch_remote_models(&format!("http://127.0.0.1:{}", port), "sk-test")
        .await
        .unwrap();
    assert_eq!(models, vec!["m1".to_string(), "m2".to_string()]);
}

#[tokio::test]
async fn test_relay_adapted_deepseek_reframes_chunks() {
    let frames = vec![
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"custom\":true}\n\n",
        "data: [DONE]\n\n",
    ];

    let (tx, mut rx) = mpsc::channel(64);
    relay_adapted(byte_stream(frames), &tx, AdapterKind::Deepseek)
        .await
        .unwrap();
    drop(tx);

    let output = drain(&mut rx).await;
    let first = output.split("\n\n").next().unwrap();
    let chunk: Value = serde_json::from_str(first.strip_prefix("data: ").unwrap()).unwrap();
    // 未知字段在透传翻译后保留
    assert_eq!(chunk["custom"], true);
}
