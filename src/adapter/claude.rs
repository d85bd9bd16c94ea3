//! Claude 方言翻译
//!
//! 统一请求与 Anthropic Messages API 之间的映射：
//! system 消息从消息列表中分离为顶层 `system` 字段，
//! 响应的 `content` 块与 `input_tokens`/`output_tokens` 用量
//! 归一化为 OpenAI 形状。

use crate::error::ProxyError;
use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Anthropic 要求显式的 max_tokens，未指定时的默认值
const DEFAULT_MAX_TOKENS: i64 = 4096;

/// 统一请求 -> Claude Messages 请求
pub fn adapt_request(request: &Value, model: &str) -> Result<Value, ProxyError> {
    let messages = request
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| ProxyError::Adaptation("missing 'messages' array".to_string()))?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut out_messages: Vec<Value> = Vec::new();

    for message in messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        if role == "system" {
            if let Some(text) = content_text(message.get("content")) {
                system_parts.push(text);
            }
            continue;
        }
        // user/assistant 消息内容原样透传，未知字段不丢失
        let role = if role == "assistant" { "assistant" } else { "user" };
        out_messages.push(json!({
            "role": role,
            "content": message.get("content").cloned().unwrap_or(Value::Null),
        }));
    }

    let mut body = Map::new();
    body.insert("model".to_string(), json!(model));
    body.insert("messages".to_string(), Value::Array(out_messages));
    body.insert(
        "max_tokens".to_string(),
        request
            .get("max_tokens")
            .cloned()
            .unwrap_or(json!(DEFAULT_MAX_TOKENS)),
    );
    if !system_parts.is_empty() {
        body.insert("system".to_string(), json!(system_parts.join("\n\n")));
    }
    for key in ["temperature", "top_p", "stream"] {
        if let Some(v) = request.get(key) {
            body.insert(key.to_string(), v.clone());
        }
    }
    if let Some(stop) = request.get("stop") {
        // OpenAI 的 stop 允许字符串或数组，Claude 只接受数组
        let sequences = match stop {
            Value::String(s) => json!([s]),
            other => other.clone(),
        };
        body.insert("stop_sequences".to_string(), sequences);
    }

    Ok(Value::Object(body))
}

/// Claude 一元响应 -> 统一响应
pub fn adapt_response(response: &Value) -> Result<Value, ProxyError> {
    let blocks = response
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ProxyError::Adaptation("missing 'content' blocks".to_string()))?;

    let text: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();

    let finish_reason = match response.get("stop_reason").and_then(Value::as_str) {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        _ => "stop",
    };

    let prompt = token_count(response, "input_tokens");
    let completion = token_count(response, "output_tokens");

    Ok(json!({
        "id": response.get("id").cloned().unwrap_or_else(|| json!(new_chat_id())),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": response.get("model").cloned().unwrap_or(json!("")),
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion,
        },
    }))
}

/// Claude SSE 事件 -> 统一流式增量
///
/// 心跳与内容块边界事件没有对应输出，返回 `Ok(None)` 跳过
pub fn adapt_stream_chunk(chunk: &Value) -> Result<Option<Value>, ProxyError> {
    let event_type = chunk
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::Adaptation("stream event missing 'type'".to_string()))?;

    match event_type {
        "message_start" => {
            let model = chunk
                .pointer("/message/model")
                .cloned()
                .unwrap_or(json!(""));
            Ok(Some(delta_chunk(
                model,
                json!({ "role": "assistant", "content": "" }),
                None,
            )))
        }
        "content_block_delta" => {
            let text = chunk
                .pointer("/delta/text")
                .and_then(Value::as_str)
                .unwrap_or("");
            Ok(Some(delta_chunk(
                json!(""),
                json!({ "content": text }),
                None,
            )))
        }
        "message_delta" => {
            let finish = match chunk.pointer("/delta/stop_reason").and_then(Value::as_str) {
                Some("max_tokens") => "length",
                Some("tool_use") => "tool_calls",
                _ => "stop",
            };
            Ok(Some(delta_chunk(json!(""), json!({}), Some(finish))))
        }
        // 其余事件（ping、content_block_start/stop、message_stop）无增量输出
        "ping" | "content_block_start" | "content_block_stop" | "message_stop" => Ok(None),
        other => Err(ProxyError::Adaptation(format!(
            "unknown stream event type: {}",
            other
        ))),
    }
}

/// 构造统一流式 chunk
fn delta_chunk(model: Value, delta: Value, finish_reason: Option<&str>) -> Value {
    json!({
        "id": new_chat_id(),
        "object": "chat.completion.chunk",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    })
}

fn new_chat_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4())
}

fn token_count(response: &Value, key: &str) -> i64 {
    response
        .pointer(&format!("/usage/{}", key))
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// 提取消息内容的纯文本（字符串或 parts 数组）
fn content_text(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let text: String = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            Some(text)
        }
        _ => None,
    }
}
