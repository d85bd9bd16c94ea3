//! 表结构定义
//!
//! `model_routes` 存放路由表，`usage_buckets` 存放按小时聚合的用量。
//! `(model, bucket_hour)` 上的唯一索引是用量 upsert 原子性的前提：
//! 写入走单条 `INSERT .. ON CONFLICT DO UPDATE`，并发写同一桶不会双插。

use rusqlite::Connection;

/// 创建表结构
pub fn create_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS model_routes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            model TEXT NOT NULL,
            api_url TEXT NOT NULL,
            api_key TEXT DEFAULT '',
            "group" TEXT DEFAULT '',
            format TEXT DEFAULT 'openai',
            enabled INTEGER DEFAULT 1,
            target_route_id INTEGER DEFAULT 0,
            forwarding_enabled INTEGER DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_model_routes_name_model ON model_routes(name, model);
        CREATE INDEX IF NOT EXISTS idx_model_routes_model ON model_routes(model);
        CREATE INDEX IF NOT EXISTS idx_model_routes_enabled ON model_routes(enabled);

        CREATE TABLE IF NOT EXISTS usage_buckets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            model TEXT NOT NULL,
            route_id INTEGER,
            request_tokens INTEGER DEFAULT 0,
            response_tokens INTEGER DEFAULT 0,
            total_tokens INTEGER DEFAULT 0,
            request_count INTEGER DEFAULT 1,
            success INTEGER DEFAULT 1,
            error_message TEXT DEFAULT '',
            bucket_hour TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (route_id) REFERENCES model_routes(id) ON DELETE SET NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_usage_buckets_model_hour ON usage_buckets(model, bucket_hour);
        CREATE INDEX IF NOT EXISTS idx_usage_buckets_model ON usage_buckets(model);
        CREATE INDEX IF NOT EXISTS idx_usage_buckets_route_id ON usage_buckets(route_id);
        CREATE INDEX IF NOT EXISTS idx_usage_buckets_hour ON usage_buckets(bucket_hour);
        "#,
    )
}
