//! 路由模型
//!
//! 模型标识到后端端点的映射记录。`(name, model)` 组合唯一；
//! 只有 `enabled` 的路由参与解析或作为转发目标。

use serde::{Deserialize, Serialize};

/// 后端方言格式
pub mod format {
    pub const OPENAI: &str = "openai";
    pub const CLAUDE: &str = "claude";
    pub const GEMINI: &str = "gemini";
    pub const DEEPSEEK: &str = "deepseek";
}

/// 单条模型路由
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoute {
    pub id: i64,
    /// 展示/分组用的路由名，单独不唯一
    pub name: String,
    /// 后端侧模型标识
    pub model: String,
    pub api_url: String,
    /// 路由配置的 API Key，空串表示透传客户端凭证
    pub api_key: String,
    pub group: String,
    /// 方言格式 (openai/claude/gemini/deepseek)
    pub format: String,
    pub enabled: bool,
    /// 转发目标路由 ID，0 表示不转发
    pub target_route_id: i64,
    /// 转发开关
    pub forwarding_enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl ModelRoute {
    /// 是否配置了生效的转发（不含指向自身的非法配置）
    pub fn forwards(&self) -> bool {
        self.forwarding_enabled && self.target_route_id > 0 && self.target_route_id != self.id
    }

    /// `Name/Model` 形式的展示标识
    pub fn display_id(&self) -> String {
        format!("{}/{}", self.name, self.model)
    }
}

/// 新增路由的输入参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRoute {
    pub name: String,
    pub model: String,
    pub api_url: String,
    pub api_key: String,
    pub group: String,
    pub format: String,
}
