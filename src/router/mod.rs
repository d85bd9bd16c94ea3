//! 路由解析模块
//!
//! 将请求的模型标识解析为具体的后端路由：
//! - 重定向关键字替换（精确或 `keyword:suffix` 形式）
//! - `RouteName/Model` 命名路由前缀解析
//! - 同一模型多条路由时的均匀随机负载均衡
//! - 单跳转发间接（目标禁用或缺失时解析失败，不回退到源路由）

use crate::config::ProxyConfig;
use crate::database::dao::RouteDao;
use crate::database::DbConnection;
use crate::error::ProxyError;
use crate::models::ModelRoute;
use rand::seq::SliceRandom;
use rusqlite::Connection;


/// 路由解析器
pub struct RouteResolver {
    db: DbConnection,
    config: ProxyConfig,
}

impl RouteResolver {
    /// 创建解析器
    pub fn new(db: DbConnection, config: ProxyConfig) -> Self {
        Self { db, config }
    }

    /// 应用重定向关键字替换
    ///
    /// `raw_model` 为已剥离流式后缀的模型名。命中关键字时返回配置的
    /// 目标模型；关键字命中但目标未配置时报 NotFound。
    pub fn apply_redirect(&self, raw_model: &str) -> Result<Option<String>, ProxyError> {
        if !self.config.matches_redirect(raw_model) {
            return Ok(None);
        }
        if self.config.redirect_target_model.is_empty() {
            return Err(ProxyError::NotFound {
                model: raw_model.to_string(),
                available: self.available_models()?,
            });
        }
        tracing::info!(
            "[ROUTER] 重定向 {} -> {}",
            raw_model,
            self.config.redirect_target_model
        );
        Ok(Some(self.config.redirect_target_model.clone()))
    }

    /// 解析模型标识为后端路由
    ///
    /// 传入的标识应已完成重定向替换与流式后缀剥离
    pub fn resolve(&self, model_identifier: &str) -> Result<ModelRoute, ProxyError> {
        let conn = self.db.lock();
        let route = self.resolve_base(&conn, model_identifier)?;
        self.follow_forwarding(&conn, route)
    }

    /// 基础解析：命名路由优先，其次按模型名负载均衡
    fn resolve_base(&self, conn: &Connection, identifier: &str) -> Result<ModelRoute, ProxyError> {
        // RouteName/Model 形式：按 (name, model) 精确匹配
        if let Some((route_name, original_model)) = identifier.split_once('/') {
            if let Some(mut route) =
                RouteDao::find_by_name_model(conn, route_name, original_model)?
            {
                if route.forwards() {
                    // 转发路径不做模型名替换，目标路由按自身配置使用
                    return Ok(route);
                }
                // 将 model 字段替换为请求的原始模型名，供上游调用使用
                route.model = original_model.to_string();
                tracing::info!(
                    "[ROUTER] 命名路由命中: {} (model: {})",
                    route_name,
                    original_model
                );
                return Ok(route);
            }
            // 命名查找失败时回退到整串模型名匹配
        }

        let mut candidates = RouteDao::find_enabled_by_model(conn, identifier)?;
        match candidates.len() {
            0 => Err(ProxyError::NotFound {
                model: identifier.to_string(),
                available: RouteDao::available_models(conn)?,
            }),
            1 => Ok(candidates.remove(0)),
            n => {
                // 同一模型的多条启用路由之间均匀随机选择
                let route = candidates
                    .choose(&mut rand::thread_rng())
                    .cloned()
                    .ok_or_else(|| ProxyError::NotFound {
                        model: identifier.to_string(),
                        available: Vec::new(),
                    })?;
                tracing::debug!(
                    "[ROUTER] 负载均衡: model={} 命中 {} 条路由，选中 id={}",
                    identifier,
                    n,
                    route.id
                );
                Ok(route)
            }
        }
    }

    /// 单跳转发：目标必须是启用路由，缺失或禁用直接报错
    fn follow_forwarding(
        &self,
        conn: &Connection,
        route: ModelRoute,
    ) -> Result<ModelRoute, ProxyError> {
        if !route.forwards() {
            return Ok(route);
        }
        match RouteDao::get_enabled_by_id(conn, route.target_route_id)? {
            Some(target) => {
                tracing::info!(
                    "[ROUTER] 转发: {} (id={}) -> {} (id={})",
                    route.name,
                    route.id,
                    target.name,
                    target.id
                );
                // 只解析一跳，目标路由原样返回
                Ok(target)
            }
            None => {
                tracing::error!(
                    "[ROUTER] 转发目标不可用: id={} (源路由 id={})",
                    route.target_route_id,
                    route.id
                );
                Err(ProxyError::ForwardTargetNotFound(route.target_route_id))
            }
        }
    }

    /// 所有启用路由的 `Name/Model` 标识，字典序排列
    pub fn available_models(&self) -> Result<Vec<String>, ProxyError> {
        let conn = self.db.lock();
        Ok(RouteDao::available_models(&conn)?)
    }

    /// 模型列表（配置了重定向关键字时将其一并列出）
    pub fn available_models_with_redirect(&self) -> Result<Vec<String>, ProxyError> {
        let mut models = self.available_models()?;
        if self.config.redirect_enabled && !self.config.redirect_keyword.is_empty() {
            models.push(self.config.redirect_keyword.clone());
            models.sort();
        }
        Ok(models)
    }
}
