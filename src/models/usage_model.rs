//! 用量模型
//!
//! 按 `(model, 小时)` 聚合的用量桶。每个键至多一行；
//! `success` 是并入该桶的所有调用结果的逻辑与，
//! `error_message` 只保留最近一次失败的文本。

use serde::{Deserialize, Serialize};

/// 小时级用量桶
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageBucket {
    pub id: i64,
    pub model: String,
    /// 首个写入者的路由 ID
    pub route_id: i64,
    pub request_tokens: i64,
    pub response_tokens: i64,
    pub total_tokens: i64,
    /// 并入该桶的调用次数
    pub request_count: i64,
    /// 所有调用均成功时为 true
    pub success: bool,
    /// 最近一次失败的错误文本
    pub error_message: String,
    /// 桶键: "YYYY-MM-DD HH"，压缩后的天级行为 "YYYY-MM-DD 00"
    pub bucket_hour: String,
    pub created_at: String,
}

/// 单次调用的用量记录输入
#[derive(Debug, Clone, Default)]
pub struct UsageEntry {
    pub model: String,
    pub route_id: i64,
    pub request_tokens: i64,
    pub response_tokens: i64,
    pub total_tokens: i64,
    pub success: bool,
    pub error_message: String,
}

impl UsageEntry {
    /// 成功调用的用量记录
    pub fn success(model: &str, route_id: i64, req: i64, resp: i64, total: i64) -> Self {
        Self {
            model: model.to_string(),
            route_id,
            request_tokens: req,
            response_tokens: resp,
            total_tokens: total,
            success: true,
            error_message: String::new(),
        }
    }

    /// 失败调用的用量记录，token 计为零
    pub fn failure(model: &str, route_id: i64, error: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            route_id,
            success: false,
            error_message: error.into(),
            ..Default::default()
        }
    }
}
