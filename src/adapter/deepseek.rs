//! Deepseek 方言翻译
//!
//! Deepseek 与 OpenAI 协议兼容，翻译只做模型字段覆写与
//! 用量字段兜底，其余字段原样透传。

use crate::error::ProxyError;
use serde_json::{json, Value};

/// 统一请求 -> Deepseek 请求（覆写 model，其余透传）
pub fn adapt_request(request: &Value, model: &str) -> Result<Value, ProxyError> {
    let mut body = request
        .as_object()
        .cloned()
        .ok_or_else(|| ProxyError::Adaptation("request body is not an object".to_string()))?;
    body.insert("model".to_string(), json!(model));
    Ok(Value::Object(body))
}

/// Deepseek 一元响应已是统一形状，补齐缺失的用量字段后透传
pub fn adapt_response(response: &Value) -> Result<Value, ProxyError> {
    let mut body = response
        .as_object()
        .cloned()
        .ok_or_else(|| ProxyError::Adaptation("response body is not an object".to_string()))?;

    if let Some(usage) = body.get_mut("usage").and_then(Value::as_object_mut) {
        let prompt = usage
            .get("prompt_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let completion = usage
            .get("completion_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        usage
            .entry("total_tokens".to_string())
            .or_insert(json!(prompt + completion));
    }

    Ok(Value::Object(body))
}

/// 流式增量透传
pub fn adapt_stream_chunk(chunk: &Value) -> Result<Option<Value>, ProxyError> {
    if !chunk.is_object() {
        return Err(ProxyError::Adaptation(
            "stream chunk is not an object".to_string(),
        ));
    }
    Ok(Some(chunk.clone()))
}
