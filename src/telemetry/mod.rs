//! 用量统计模块
//!
//! 在小时级用量桶之上提供聚合查询：总览、今日、按日、按小时
//! 与模型排行。查询直接走 SQL 聚合，不在内存里维护副本。

mod stats;
mod types;

pub use stats::StatsService;
pub use types::{DailyStat, HourlyStat, ModelRank, StatsSummary, TodayStats};
