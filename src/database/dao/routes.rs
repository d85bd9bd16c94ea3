//! 路由 DAO
//!
//! 路由表的 CRUD 与解析查询。管理操作在写入时校验转发配置：
//! 转发只允许一跳，目标路由自身不得再配置转发目标。

use crate::error::ProxyError;
use crate::models::{ModelRoute, NewRoute};
use rusqlite::{params, Connection, Row};

const ROUTE_COLUMNS: &str = r#"id, name, model, api_url, COALESCE(api_key, ''), COALESCE("group", ''),
    COALESCE(format, 'openai'), enabled, COALESCE(target_route_id, 0),
    COALESCE(forwarding_enabled, 0), created_at, updated_at"#;

pub struct RouteDao;

impl RouteDao {
    fn map_row(row: &Row) -> Result<ModelRoute, rusqlite::Error> {
        Ok(ModelRoute {
            id: row.get(0)?,
            name: row.get(1)?,
            model: row.get(2)?,
            api_url: row.get(3)?,
            api_key: row.get(4)?,
            group: row.get(5)?,
            format: row.get(6)?,
            enabled: row.get::<_, i64>(7)? != 0,
            target_route_id: row.get(8)?,
            forwarding_enabled: row.get::<_, i64>(9)? != 0,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    /// 获取所有路由（含禁用项），按创建时间倒序
    pub fn get_all(conn: &Connection) -> Result<Vec<ModelRoute>, rusqlite::Error> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROUTE_COLUMNS} FROM model_routes ORDER BY created_at DESC"
        ))?;
        let routes = stmt.query_map([], Self::map_row)?;
        routes.collect()
    }

    /// 按 ID 获取启用的路由，禁用或不存在返回 None
    pub fn get_enabled_by_id(
        conn: &Connection,
        id: i64,
    ) -> Result<Option<ModelRoute>, rusqlite::Error> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROUTE_COLUMNS} FROM model_routes WHERE id = ? AND enabled = 1"
        ))?;
        match stmt.query_row([id], Self::map_row) {
            Ok(route) => Ok(Some(route)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 按 (name, model) 组合键精确查找启用的路由
    pub fn find_by_name_model(
        conn: &Connection,
        name: &str,
        model: &str,
    ) -> Result<Option<ModelRoute>, rusqlite::Error> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROUTE_COLUMNS} FROM model_routes WHERE name = ? AND model = ? AND enabled = 1"
        ))?;
        match stmt.query_row([name, model], Self::map_row) {
            Ok(route) => Ok(Some(route)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 查找 model 字段精确匹配的全部启用路由
    ///
    /// 返回全集而不是 `ORDER BY RANDOM() LIMIT 1`，由调用方做均匀负载均衡
    pub fn find_enabled_by_model(
        conn: &Connection,
        model: &str,
    ) -> Result<Vec<ModelRoute>, rusqlite::Error> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROUTE_COLUMNS} FROM model_routes WHERE model = ? AND enabled = 1"
        ))?;
        let routes = stmt.query_map([model], Self::map_row)?;
        routes.collect()
    }

    /// 所有启用路由的 `Name/Model` 标识，字典序排列
    pub fn available_models(conn: &Connection) -> Result<Vec<String>, rusqlite::Error> {
        let mut stmt =
            conn.prepare("SELECT name, model FROM model_routes WHERE enabled = 1")?;
        let rows = stmt.query_map([], |row| {
            Ok(format!("{}/{}", row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut models: Vec<String> = rows.collect::<Result<_, _>>()?;
        models.sort();
        Ok(models)
    }

    /// 新增路由
    pub fn insert(conn: &Connection, route: &NewRoute) -> Result<i64, rusqlite::Error> {
        conn.execute(
            r#"INSERT INTO model_routes (name, model, api_url, api_key, "group", format, enabled, target_route_id, forwarding_enabled)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 0, 0)"#,
            params![
                route.name,
                route.model,
                route.api_url,
                route.api_key,
                route.group,
                route.format,
            ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(
            "[ROUTER] 路由已添加: {} -> {} ({}) [{}]",
            route.model,
            route.api_url,
            route.name,
            route.format
        );
        Ok(id)
    }

    /// 批量新增路由，一个模型一条记录，共用同一路由名
    pub fn insert_many(
        conn: &Connection,
        base_name: &str,
        models: &[String],
        api_url: &str,
        api_key: &str,
        group: &str,
        format: &str,
    ) -> Result<usize, rusqlite::Error> {
        let mut inserted = 0;
        for model in models {
            Self::insert(
                conn,
                &NewRoute {
                    name: base_name.to_string(),
                    model: model.clone(),
                    api_url: api_url.to_string(),
                    api_key: api_key.to_string(),
                    group: group.to_string(),
                    format: format.to_string(),
                },
            )?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// 按 ID 更新路由基础字段
    pub fn update(conn: &Connection, id: i64, route: &NewRoute) -> Result<(), rusqlite::Error> {
        let affected = conn.execute(
            r#"UPDATE model_routes SET name = ?1, model = ?2, api_url = ?3, api_key = ?4,
               "group" = ?5, format = ?6, updated_at = CURRENT_TIMESTAMP WHERE id = ?7"#,
            params![
                route.name,
                route.model,
                route.api_url,
                route.api_key,
                route.group,
                route.format,
                id,
            ],
        )?;
        if affected == 0 {
            return Err(rusqlite::Error::QueryReturnedNoRows);
        }
        Ok(())
    }

    /// 按旧的 (name, model) 组合键更新路由
    pub fn update_by_key(
        conn: &Connection,
        old_name: &str,
        old_model: &str,
        route: &NewRoute,
    ) -> Result<(), rusqlite::Error> {
        let affected = conn.execute(
            r#"UPDATE model_routes SET name = ?1, model = ?2, api_url = ?3, api_key = ?4,
               "group" = ?5, format = ?6, updated_at = CURRENT_TIMESTAMP
               WHERE name = ?7 AND model = ?8"#,
            params![
                route.name,
                route.model,
                route.api_url,
                route.api_key,
                route.group,
                route.format,
                old_name,
                old_model,
            ],
        )?;
        if affected == 0 {
            return Err(rusqlite::Error::QueryReturnedNoRows);
        }
        Ok(())
    }

    /// 删除路由
    ///
    /// 级联清除其它路由指向它的转发配置，并删除其用量数据
    pub fn delete(conn: &Connection, id: i64) -> Result<(), rusqlite::Error> {
        conn.execute(
            "UPDATE model_routes SET target_route_id = 0, forwarding_enabled = 0 WHERE target_route_id = ?",
            [id],
        )?;
        conn.execute("DELETE FROM usage_buckets WHERE route_id = ?", [id])?;
        let affected = conn.execute("DELETE FROM model_routes WHERE id = ?", [id])?;
        if affected == 0 {
            return Err(rusqlite::Error::QueryReturnedNoRows);
        }
        tracing::info!("[ROUTER] 路由已删除: id={} (含关联用量数据)", id);
        Ok(())
    }

    /// 按 (name, model) 组合键删除路由
    pub fn delete_by_key(
        conn: &Connection,
        name: &str,
        model: &str,
    ) -> Result<(), rusqlite::Error> {
        let id: i64 = conn.query_row(
            "SELECT id FROM model_routes WHERE name = ? AND model = ?",
            [name, model],
            |row| row.get(0),
        )?;
        Self::delete(conn, id)
    }

    /// 启用/禁用路由
    pub fn set_enabled(conn: &Connection, id: i64, enabled: bool) -> Result<(), rusqlite::Error> {
        conn.execute(
            "UPDATE model_routes SET enabled = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![enabled as i64, id],
        )?;
        tracing::info!("[ROUTER] 路由开关: id={}, enabled={}", id, enabled);
        Ok(())
    }

    /// 设置路由的转发目标
    ///
    /// `target_id = 0` 清除转发。设置时校验：
    /// - 源路由与目标路由都必须存在且启用
    /// - 不允许指向自身
    /// - 目标自身不得再配置转发目标（只允许一跳）
    pub fn set_forwarding(conn: &Connection, id: i64, target_id: i64) -> Result<(), ProxyError> {
        let source = Self::get_enabled_by_id(conn, id)?
            .ok_or_else(|| ProxyError::BadRequest(format!("源路由不存在或已禁用: id={}", id)))?;

        if target_id > 0 {
            if target_id == id {
                return Err(ProxyError::BadRequest("转发目标不能是路由自身".to_string()));
            }
            let target = Self::get_enabled_by_id(conn, target_id)?
                .ok_or(ProxyError::ForwardTargetNotFound(target_id))?;
            if target.target_route_id > 0 {
                return Err(ProxyError::BadRequest(format!(
                    "目标路由 {} (id={}) 自身配置了转发，多跳转发不受支持",
                    target.name, target.id
                )));
            }
            tracing::info!(
                "[ROUTER] 更新转发: {} (id={}) -> {} (id={})",
                source.name,
                source.id,
                target.name,
                target.id
            );
        } else {
            tracing::info!("[ROUTER] 清除转发: {} (id={})", source.name, source.id);
        }

        // 设置目标时自动启用转发，清除时同时关闭开关
        conn.execute(
            "UPDATE model_routes SET target_route_id = ?1, forwarding_enabled = ?2,
             updated_at = CURRENT_TIMESTAMP WHERE id = ?3",
            params![target_id, (target_id > 0) as i64, id],
        )?;
        Ok(())
    }

    /// 切换单条路由的转发开关
    pub fn set_forwarding_enabled(
        conn: &Connection,
        id: i64,
        enabled: bool,
    ) -> Result<(), rusqlite::Error> {
        conn.execute(
            "UPDATE model_routes SET forwarding_enabled = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![enabled as i64, id],
        )?;
        Ok(())
    }

    /// 切换所有路由的转发开关（总开关）
    pub fn set_all_forwarding(conn: &Connection, enabled: bool) -> Result<usize, rusqlite::Error> {
        let affected = conn.execute(
            "UPDATE model_routes SET forwarding_enabled = ?1, updated_at = CURRENT_TIMESTAMP",
            params![enabled as i64],
        )?;
        tracing::info!(
            "[ROUTER] 全部转发开关: affected={}, enabled={}",
            affected,
            enabled
        );
        Ok(affected)
    }

    /// 清空所有路由及其用量数据，并重置自增 ID
    pub fn clear_all(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute("DELETE FROM usage_buckets", [])?;
        conn.execute("DELETE FROM model_routes", [])?;
        conn.execute("DELETE FROM sqlite_sequence WHERE name='model_routes'", [])?;
        Ok(())
    }
}
