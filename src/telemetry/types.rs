//! 统计类型定义

use serde::{Deserialize, Serialize};

/// 总览统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSummary {
    /// 启用的路由数
    pub route_count: i64,
    /// 启用路由覆盖的去重模型数
    pub model_count: i64,
    pub total_requests: i64,
    pub total_tokens: i64,
    pub today_requests: i64,
    pub today_tokens: i64,
    /// 成功请求占比，百分数
    pub success_rate: f64,
}

/// 今日统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodayStats {
    pub today_requests: i64,
    pub today_tokens: i64,
}

/// 单日聚合（热力图数据）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStat {
    /// "YYYY-MM-DD"
    pub date: String,
    pub requests: i64,
    pub request_tokens: i64,
    pub response_tokens: i64,
    pub total_tokens: i64,
}

/// 今日单小时聚合
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyStat {
    /// 0..=23
    pub hour: i64,
    pub requests: i64,
    pub request_tokens: i64,
    pub response_tokens: i64,
    pub total_tokens: i64,
}

/// 模型排行条目，按总 token 降序
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRank {
    pub rank: usize,
    pub model: String,
    pub requests: i64,
    pub request_tokens: i64,
    pub response_tokens: i64,
    pub total_tokens: i64,
    /// 百分数，无请求时为 0
    pub success_rate: f64,
}
