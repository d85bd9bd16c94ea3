//! 网关配置
//!
//! 重定向关键字、超时策略等进程级配置的显式配置对象，
//! 由启动代码加载后传入 Resolver/Executor，不使用全局状态。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// 监听地址
    pub listen_addr: String,
    /// 是否启用模型重定向
    pub redirect_enabled: bool,
    /// 重定向关键字（客户端请求此模型名时替换为目标模型）
    pub redirect_keyword: String,
    /// 重定向目标模型
    pub redirect_target_model: String,
    /// 上游请求超时（秒）。None 表示不限制——大模型生成非常耗时，
    /// 默认不设置超时，部署方需据此规划 worker 数量。
    pub request_timeout_secs: Option<u64>,
    /// 小时级用量数据保留天数，超过后压缩为天级
    pub usage_retention_days: i64,
    /// 请求体大小上限（字节）
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8899".to_string(),
            redirect_enabled: false,
            redirect_keyword: String::new(),
            redirect_target_model: String::new(),
            request_timeout_secs: None,
            usage_retention_days: 7,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ProxyConfig {
    /// 配置文件路径: ~/.routecast/config.json
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".routecast").join("config.json"))
    }

    /// 从默认路径加载配置，文件不存在或解析失败时回退到默认值
    pub fn load() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!("[CONFIG] 配置文件解析失败，使用默认配置: {}", e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// 保存配置到默认路径
    pub fn save(&self) -> Result<(), String> {
        let path = Self::default_path().ok_or_else(|| "无法获取主目录".to_string())?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| e.to_string())?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|e| e.to_string())?;
        std::fs::write(&path, text).map_err(|e| e.to_string())
    }

    /// 上游请求超时策略
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// 判断原始模型名是否命中重定向关键字
    ///
    /// 支持精确匹配和带冒号后缀的形式（如 `proxy_auto:high`）
    pub fn matches_redirect(&self, model: &str) -> bool {
        if !self.redirect_enabled || self.redirect_keyword.is_empty() {
            return false;
        }
        model == self.redirect_keyword
            || model.starts_with(&format!("{}:", self.redirect_keyword))
    }
}
