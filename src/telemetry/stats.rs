//! 统计聚合查询
//!
//! 所有查询以 `substr(bucket_hour, 1, 10)` 作为日期维度，
//! 压缩后的天级桶（"YYYY-MM-DD 00"）自然落入对应日期。

use crate::telemetry::types::{DailyStat, HourlyStat, ModelRank, StatsSummary, TodayStats};
use rusqlite::Connection;

/// 内部路由专用的模型名前缀，不进入排行
const INTERNAL_MODEL_MARKERS: &[&str] = &["proxy_", "redirect_", "forward_"];

pub struct StatsService;

impl StatsService {
    /// 总览统计
    pub fn summary(conn: &Connection) -> Result<StatsSummary, rusqlite::Error> {
        let route_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM model_routes WHERE enabled = 1",
            [],
            |row| row.get(0),
        )?;
        let model_count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT model) FROM model_routes WHERE enabled = 1",
            [],
            |row| row.get(0),
        )?;
        let total_requests: i64 = conn.query_row(
            "SELECT COALESCE(SUM(request_count), 0) FROM usage_buckets",
            [],
            |row| row.get(0),
        )?;
        let total_tokens: i64 = conn.query_row(
            "SELECT COALESCE(SUM(total_tokens), 0) FROM usage_buckets",
            [],
            |row| row.get(0),
        )?;
        let today = Self::today(conn)?;

        // 成功标志是桶内所有调用的逻辑与，失败桶整桶计入失败
        let success_requests: i64 = conn.query_row(
            "SELECT COALESCE(SUM(CASE WHEN success = 1 THEN request_count ELSE 0 END), 0)
             FROM usage_buckets",
            [],
            |row| row.get(0),
        )?;
        let success_rate = if total_requests > 0 {
            success_requests as f64 / total_requests as f64 * 100.0
        } else {
            0.0
        };

        Ok(StatsSummary {
            route_count,
            model_count,
            total_requests,
            total_tokens,
            today_requests: today.today_requests,
            today_tokens: today.today_tokens,
            success_rate,
        })
    }

    /// 今日请求数与 token 消耗
    pub fn today(conn: &Connection) -> Result<TodayStats, rusqlite::Error> {
        conn.query_row(
            "SELECT COALESCE(SUM(request_count), 0), COALESCE(SUM(total_tokens), 0)
             FROM usage_buckets
             WHERE substr(bucket_hour, 1, 10) = date('now', 'localtime')",
            [],
            |row| {
                Ok(TodayStats {
                    today_requests: row.get(0)?,
                    today_tokens: row.get(1)?,
                })
            },
        )
    }

    /// 最近 `days` 天的按日聚合，日期升序
    pub fn daily(conn: &Connection, days: i64) -> Result<Vec<DailyStat>, rusqlite::Error> {
        let mut stmt = conn.prepare(
            "SELECT substr(bucket_hour, 1, 10) AS day,
                    COALESCE(SUM(request_count), 0),
                    COALESCE(SUM(request_tokens), 0),
                    COALESCE(SUM(response_tokens), 0),
                    COALESCE(SUM(total_tokens), 0)
             FROM usage_buckets
             WHERE day >= date('now', 'localtime', ?)
             GROUP BY day
             ORDER BY day",
        )?;
        let rows = stmt.query_map([format!("-{} days", days)], |row| {
            Ok(DailyStat {
                date: row.get(0)?,
                requests: row.get(1)?,
                request_tokens: row.get(2)?,
                response_tokens: row.get(3)?,
                total_tokens: row.get(4)?,
            })
        })?;
        rows.collect()
    }

    /// 今日按小时聚合，小时升序
    pub fn hourly(conn: &Connection) -> Result<Vec<HourlyStat>, rusqlite::Error> {
        let mut stmt = conn.prepare(
            "SELECT CAST(substr(bucket_hour, 12, 2) AS INTEGER) AS hour,
                    COALESCE(SUM(request_count), 0),
                    COALESCE(SUM(request_tokens), 0),
                    COALESCE(SUM(response_tokens), 0),
                    COALESCE(SUM(total_tokens), 0)
             FROM usage_buckets
             WHERE substr(bucket_hour, 1, 10) = date('now', 'localtime')
             GROUP BY hour
             ORDER BY hour",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(HourlyStat {
                hour: row.get(0)?,
                requests: row.get(1)?,
                request_tokens: row.get(2)?,
                response_tokens: row.get(3)?,
                total_tokens: row.get(4)?,
            })
        })?;
        rows.collect()
    }

    /// 模型排行，按总 token 降序，至多 `limit` 条
    ///
    /// 内部标记模型（重定向关键字等）不参与排行
    pub fn model_ranking(
        conn: &Connection,
        limit: usize,
    ) -> Result<Vec<ModelRank>, rusqlite::Error> {
        let mut stmt = conn.prepare(
            "SELECT model,
                    COALESCE(SUM(request_count), 0) AS requests,
                    COALESCE(SUM(request_tokens), 0),
                    COALESCE(SUM(response_tokens), 0),
                    COALESCE(SUM(total_tokens), 0) AS total,
                    COALESCE(
                        CAST(SUM(CASE WHEN success = 1 THEN request_count ELSE 0 END) AS REAL)
                            * 100.0 / NULLIF(SUM(request_count), 0),
                        0.0)
             FROM usage_buckets
             GROUP BY model
             ORDER BY total DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, f64>(5)?,
            ))
        })?;

        let mut ranking = Vec::new();
        for row in rows {
            let (model, requests, request_tokens, response_tokens, total_tokens, success_rate) =
                row?;
            let lowered = model.to_lowercase();
            if INTERNAL_MODEL_MARKERS.iter().any(|m| lowered.contains(m)) {
                continue;
            }
            ranking.push(ModelRank {
                rank: ranking.len() + 1,
                model,
                requests,
                request_tokens,
                response_tokens,
                total_tokens,
                success_rate,
            });
            if ranking.len() >= limit {
                break;
            }
        }
        Ok(ranking)
    }
}
