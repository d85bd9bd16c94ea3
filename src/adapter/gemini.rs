//! Gemini 方言翻译
//!
//! 统一消息列表重组为 Gemini 的 contents/parts 结构
//! （assistant 角色映射为 "model"，system 消息提升为
//! systemInstruction），usageMetadata 归一化为统一用量形状。

use crate::error::ProxyError;
use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// 统一请求 -> Gemini generateContent 请求
pub fn adapt_request(request: &Value, _model: &str) -> Result<Value, ProxyError> {
    let messages = request
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| ProxyError::Adaptation("missing 'messages' array".to_string()))?;

    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    for message in messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let text = content_text(message.get("content"));
        if role == "system" {
            system_parts.push(json!({ "text": text }));
            continue;
        }
        let gemini_role = if role == "assistant" { "model" } else { "user" };
        contents.push(json!({
            "role": gemini_role,
            "parts": [{ "text": text }],
        }));
    }

    let mut body = Map::new();
    body.insert("contents".to_string(), Value::Array(contents));
    if !system_parts.is_empty() {
        body.insert(
            "systemInstruction".to_string(),
            json!({ "parts": system_parts }),
        );
    }

    let mut generation_config = Map::new();
    if let Some(t) = request.get("temperature") {
        generation_config.insert("temperature".to_string(), t.clone());
    }
    if let Some(p) = request.get("top_p") {
        generation_config.insert("topP".to_string(), p.clone());
    }
    if let Some(m) = request.get("max_tokens") {
        generation_config.insert("maxOutputTokens".to_string(), m.clone());
    }
    if !generation_config.is_empty() {
        body.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
    }

    Ok(Value::Object(body))
}

/// Gemini 一元响应 -> 统一响应
pub fn adapt_response(response: &Value) -> Result<Value, ProxyError> {
    let candidate = response
        .pointer("/candidates/0")
        .ok_or_else(|| ProxyError::Adaptation("missing 'candidates'".to_string()))?;

    let text = candidate_text(candidate);
    let finish_reason = match candidate.get("finishReason").and_then(Value::as_str) {
        Some("MAX_TOKENS") => "length",
        Some("SAFETY") | Some("RECITATION") => "content_filter",
        _ => "stop",
    };

    let prompt = metadata_count(response, "promptTokenCount");
    let completion = metadata_count(response, "candidatesTokenCount");
    let total = response
        .pointer("/usageMetadata/totalTokenCount")
        .and_then(Value::as_i64)
        .unwrap_or(prompt + completion);

    Ok(json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4()),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": response.get("modelVersion").cloned().unwrap_or(json!("")),
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": total,
        },
    }))
}

/// Gemini 流式增量 -> 统一流式增量
pub fn adapt_stream_chunk(chunk: &Value) -> Result<Option<Value>, ProxyError> {
    let candidate = chunk
        .pointer("/candidates/0")
        .ok_or_else(|| ProxyError::Adaptation("stream chunk missing 'candidates'".to_string()))?;

    let text = candidate_text(candidate);
    let finish_reason = candidate
        .get("finishReason")
        .and_then(Value::as_str)
        .map(|r| match r {
            "MAX_TOKENS" => "length",
            "SAFETY" | "RECITATION" => "content_filter",
            _ => "stop",
        });

    if text.is_empty() && finish_reason.is_none() {
        return Ok(None);
    }

    Ok(Some(json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4()),
        "object": "chat.completion.chunk",
        "created": Utc::now().timestamp(),
        "model": chunk.get("modelVersion").cloned().unwrap_or(json!("")),
        "choices": [{
            "index": 0,
            "delta": { "content": text },
            "finish_reason": finish_reason,
        }],
    })))
}

/// 候选内容的全部文本
fn candidate_text(candidate: &Value) -> String {
    candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

fn metadata_count(response: &Value, key: &str) -> i64 {
    response
        .pointer(&format!("/usageMetadata/{}", key))
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// 提取消息内容的纯文本（字符串或 parts 数组）
fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}
