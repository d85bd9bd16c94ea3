//! 用量 DAO
//!
//! 小时桶的原子 upsert 与冷数据压缩。
//!
//! upsert 依赖 `(model, bucket_hour)` 唯一索引，单条
//! `INSERT .. ON CONFLICT DO UPDATE` 完成"有则累加、无则插入"，
//! 并发写同一桶不会出现双插。

use crate::models::{UsageBucket, UsageEntry};
use chrono::{Duration, Local};
use rusqlite::{params, Connection, Row};

/// 当前小时的桶键: "YYYY-MM-DD HH"
pub fn current_hour_key() -> String {
    Local::now().format("%Y-%m-%d %H").to_string()
}

/// 今天的日期键: "YYYY-MM-DD"
pub fn today_key() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

pub struct UsageDao;

impl UsageDao {
    fn map_row(row: &Row) -> Result<UsageBucket, rusqlite::Error> {
        Ok(UsageBucket {
            id: row.get(0)?,
            model: row.get(1)?,
            route_id: row.get(2)?,
            request_tokens: row.get(3)?,
            response_tokens: row.get(4)?,
            total_tokens: row.get(5)?,
            request_count: row.get(6)?,
            success: row.get::<_, i64>(7)? != 0,
            error_message: row.get(8)?,
            bucket_hour: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    /// 记录一次调用到当前小时桶
    pub fn record(conn: &Connection, entry: &UsageEntry) -> Result<(), rusqlite::Error> {
        Self::record_at(conn, entry, &current_hour_key())
    }

    /// 记录一次调用到指定小时桶
    ///
    /// 计数器累加，调用次数加一，success 做与运算，
    /// error_message 覆盖为最近一次的文本
    pub fn record_at(
        conn: &Connection,
        entry: &UsageEntry,
        bucket_hour: &str,
    ) -> Result<(), rusqlite::Error> {
        // route_id 列带外键约束，非正值写 NULL
        let route_id = (entry.route_id > 0).then_some(entry.route_id);
        conn.execute(
            r#"INSERT INTO usage_buckets
               (model, route_id, request_tokens, response_tokens, total_tokens,
                request_count, success, error_message, bucket_hour)
               VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8)
               ON CONFLICT(model, bucket_hour) DO UPDATE SET
                 request_tokens = request_tokens + excluded.request_tokens,
                 response_tokens = response_tokens + excluded.response_tokens,
                 total_tokens = total_tokens + excluded.total_tokens,
                 request_count = request_count + 1,
                 success = min(success, excluded.success),
                 error_message = CASE WHEN excluded.error_message != ''
                                      THEN excluded.error_message
                                      ELSE error_message END"#,
            params![
                entry.model,
                route_id,
                entry.request_tokens,
                entry.response_tokens,
                entry.total_tokens,
                entry.success as i64,
                entry.error_message,
                bucket_hour,
            ],
        )?;
        Ok(())
    }

    /// 获取指定 (model, 小时) 的桶
    pub fn get_bucket(
        conn: &Connection,
        model: &str,
        bucket_hour: &str,
    ) -> Result<Option<UsageBucket>, rusqlite::Error> {
        let mut stmt = conn.prepare(
            "SELECT id, model, COALESCE(route_id, 0), request_tokens, response_tokens, total_tokens,
                    request_count, success, COALESCE(error_message, ''), bucket_hour, created_at
             FROM usage_buckets WHERE model = ? AND bucket_hour = ?",
        )?;
        match stmt.query_row([model, bucket_hour], Self::map_row) {
            Ok(bucket) => Ok(Some(bucket)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 桶总数
    pub fn count(conn: &Connection) -> Result<i64, rusqlite::Error> {
        conn.query_row("SELECT COUNT(*) FROM usage_buckets", [], |row| row.get(0))
    }

    /// 压缩保留期之外的小时桶为天级桶
    ///
    /// 以本地日期计算截止日，调用 [`Self::compact_before`]
    pub fn compact(conn: &mut Connection, retention_days: i64) -> Result<usize, rusqlite::Error> {
        let cutoff_day = (Local::now() - Duration::days(retention_days))
            .format("%Y-%m-%d")
            .to_string();
        Self::compact_before(conn, &cutoff_day)
    }

    /// 将日期早于 `cutoff_day` 的小时桶按 (model, 天) 合并为单行
    ///
    /// 计数器求和，success 做与运算，error_message 保留最近一条非空文本。
    /// 不可逆的有损降采样；没有足够旧的数据时是严格 no-op。
    /// 返回减少的行数。
    pub fn compact_before(
        conn: &mut Connection,
        cutoff_day: &str,
    ) -> Result<usize, rusqlite::Error> {
        let tx = conn.transaction()?;

        // 按 (model, 小时) 升序扫描冷分区，在内存中按 (model, 天) 折叠
        struct DayAgg {
            model: String,
            day: String,
            route_id: i64,
            request_tokens: i64,
            response_tokens: i64,
            total_tokens: i64,
            request_count: i64,
            success: bool,
            error_message: String,
        }

        let mut aggs: Vec<DayAgg> = Vec::new();
        let mut removed: usize = 0;
        {
            let mut stmt = tx.prepare(
                "SELECT model, COALESCE(route_id, 0), request_tokens, response_tokens, total_tokens,
                        request_count, success, COALESCE(error_message, ''),
                        substr(bucket_hour, 1, 10) AS day
                 FROM usage_buckets
                 WHERE substr(bucket_hour, 1, 10) < ?
                 ORDER BY model, bucket_hour",
            )?;
            let mut rows = stmt.query([cutoff_day])?;
            while let Some(row) = rows.next()? {
                let model: String = row.get(0)?;
                let day: String = row.get(8)?;
                let error: String = row.get(7)?;
                let success = row.get::<_, i64>(6)? != 0;
                removed += 1;

                match aggs.last_mut() {
                    Some(agg) if agg.model == model && agg.day == day => {
                        agg.request_tokens += row.get::<_, i64>(2)?;
                        agg.response_tokens += row.get::<_, i64>(3)?;
                        agg.total_tokens += row.get::<_, i64>(4)?;
                        agg.request_count += row.get::<_, i64>(5)?;
                        agg.success = agg.success && success;
                        if !error.is_empty() {
                            agg.error_message = error;
                        }
                    }
                    _ => aggs.push(DayAgg {
                        model,
                        day,
                        route_id: row.get(1)?,
                        request_tokens: row.get(2)?,
                        response_tokens: row.get(3)?,
                        total_tokens: row.get(4)?,
                        request_count: row.get(5)?,
                        success,
                        error_message: error,
                    }),
                }
            }
        }

        if aggs.is_empty() {
            tx.commit()?;
            tracing::info!("[USAGE] 无需要压缩的冷数据");
            return Ok(0);
        }

        tx.execute(
            "DELETE FROM usage_buckets WHERE substr(bucket_hour, 1, 10) < ?",
            [cutoff_day],
        )?;

        let inserted = aggs.len();
        for agg in aggs {
            // 原路由可能已删除（SET NULL 读回为 0），回写时维持 NULL
            let route_id = (agg.route_id > 0).then_some(agg.route_id);
            tx.execute(
                r#"INSERT INTO usage_buckets
                   (model, route_id, request_tokens, response_tokens, total_tokens,
                    request_count, success, error_message, bucket_hour, created_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
                params![
                    agg.model,
                    route_id,
                    agg.request_tokens,
                    agg.response_tokens,
                    agg.total_tokens,
                    agg.request_count,
                    agg.success as i64,
                    agg.error_message,
                    format!("{} 00", agg.day),
                    format!("{} 00:00:00", agg.day),
                ],
            )?;
        }
        tx.commit()?;

        // 压缩后回收空间，失败不影响压缩结果
        if let Err(e) = conn.execute_batch("VACUUM") {
            tracing::warn!("[USAGE] 压缩后 VACUUM 失败: {}", e);
        }

        let reduced = removed - inserted;
        tracing::info!(
            "[USAGE] 冷数据压缩完成: {} 行小时桶合并为 {} 行天级桶",
            removed,
            inserted
        );
        Ok(reduced)
    }

    /// 清空所有用量数据
    pub fn clear(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute("DELETE FROM usage_buckets", [])?;
        tracing::info!("[USAGE] 用量数据已清空");
        Ok(())
    }
}
