//! 协议适配器模块
//!
//! 统一（OpenAI 形）请求与后端原生方言之间的无状态翻译。
//! 适配器集合是编译期已知的封闭枚举，由检测器根据
//! (后端 URL, 模型名) 选择；标准 OpenAI 兼容端点永不翻译。
//!
//! 检测使用词边界精确匹配：命中词的前后必须是非字母数字字符或
//! 字符串边界，避免 "glm" 之类的片段误触发 Gemini 适配器。

pub mod claude;
pub mod deepseek;
pub mod gemini;


use crate::error::ProxyError;
use serde_json::Value;

/// Gemini 流式调用的模型名后缀，查找路由前需剥离
pub const GEMINI_STREAM_SUFFIX: &str = ":streamGenerateContent";

/// Claude 后端要求的协议版本头
pub const ANTHROPIC_VERSION: (&str, &str) = ("anthropic-version", "2023-06-01");

/// 后端方言适配器（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Claude,
    Gemini,
    Deepseek,
}

impl AdapterKind {
    /// 适配器名称（日志用）
    pub fn name(&self) -> &'static str {
        match self {
            AdapterKind::Claude => "claude",
            AdapterKind::Gemini => "gemini",
            AdapterKind::Deepseek => "deepseek",
        }
    }

    /// 将统一请求重塑为后端原生请求
    ///
    /// 翻译失败对本次调用是致命的
    pub fn adapt_request(&self, request: &Value, model: &str) -> Result<Value, ProxyError> {
        match self {
            AdapterKind::Claude => claude::adapt_request(request, model),
            AdapterKind::Gemini => gemini::adapt_request(request, model),
            AdapterKind::Deepseek => deepseek::adapt_request(request, model),
        }
    }

    /// 将后端一元响应映射回统一格式
    ///
    /// 调用方在失败时应回退到原始响应体，而不是中断请求
    pub fn adapt_response(&self, response: &Value) -> Result<Value, ProxyError> {
        match self {
            AdapterKind::Claude => claude::adapt_response(response),
            AdapterKind::Gemini => gemini::adapt_response(response),
            AdapterKind::Deepseek => deepseek::adapt_response(response),
        }
    }

    /// 逐事件映射流式增量
    ///
    /// `Ok(None)` 表示该事件无对应输出（如心跳），应静默跳过；
    /// `Err` 表示翻译失败，调用方记录警告后跳过，流不中断
    pub fn adapt_stream_chunk(&self, chunk: &Value) -> Result<Option<Value>, ProxyError> {
        match self {
            AdapterKind::Claude => claude::adapt_stream_chunk(chunk),
            AdapterKind::Gemini => gemini::adapt_stream_chunk(chunk),
            AdapterKind::Deepseek => deepseek::adapt_stream_chunk(chunk),
        }
    }

    /// 一元调用端点
    pub fn unary_url(&self, base_url: &str, model: &str) -> String {
        match self {
            AdapterKind::Claude => format!("{}/v1/messages", base_url),
            AdapterKind::Gemini => format!(
                "{}/v1beta/models/{}:generateContent",
                base_url,
                strip_stream_suffix(model)
            ),
            AdapterKind::Deepseek => format!("{}/v1/chat/completions", base_url),
        }
    }

    /// 流式调用端点
    pub fn stream_url(&self, base_url: &str, model: &str) -> String {
        match self {
            AdapterKind::Claude => format!("{}/v1/messages", base_url),
            AdapterKind::Gemini => format!(
                "{}/v1beta/models/{}:streamGenerateContent",
                base_url,
                strip_stream_suffix(model)
            ),
            AdapterKind::Deepseek => format!("{}/v1/chat/completions", base_url),
        }
    }
}

/// 剥离模型名中的流式后缀
pub fn strip_stream_suffix(model: &str) -> &str {
    model.strip_suffix(GEMINI_STREAM_SUFFIX).unwrap_or(model)
}

/// 检测目标后端需要的适配器
///
/// 优先级：标准 OpenAI 兼容端点 -> 不翻译；其后按
/// anthropic/claude、gemini、deepseek 关键词做词边界匹配
pub fn detect(api_url: &str, model: &str) -> Option<AdapterKind> {
    let url = api_url.to_lowercase();
    let model = model.to_lowercase();

    // OpenAI 兼容端点即便模型名形似其它方言也不做翻译
    if is_standard_openai_endpoint(&url) {
        return None;
    }

    if contains_exact_word(&url, "anthropic") || contains_exact_word(&model, "claude") {
        return Some(AdapterKind::Claude);
    }
    if contains_exact_word(&url, "gemini") || contains_exact_word(&model, "gemini") {
        return Some(AdapterKind::Gemini);
    }
    if contains_exact_word(&url, "deepseek") || contains_exact_word(&model, "deepseek") {
        return Some(AdapterKind::Deepseek);
    }

    None
}

/// 判断 URL 是否为标准 OpenAI 格式端点
///
/// 显式携带 OpenAI 风格 API 路径的 URL 视为 OpenAI 兼容，
/// 路径本身就是完整标记，这里用普通子串匹配
fn is_standard_openai_endpoint(url: &str) -> bool {
    const OPENAI_PATHS: &[&str] = &[
        "/v1/chat/completions",
        "/v1/completions",
        "/v1/embeddings",
        "/v1/images/generations",
        "/v1/audio/transcriptions",
        "/v1/audio/speech",
    ];
    OPENAI_PATHS.iter().any(|p| url.contains(p))
}

/// 词边界精确匹配
///
/// needle 在 haystack 中出现且前后均为非字母数字字符或字符串边界
pub fn contains_exact_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return haystack == needle;
    }
    let hay = haystack.as_bytes();
    let ned = needle.as_bytes();

    let mut i = 0;
    while i + ned.len() <= hay.len() {
        if &hay[i..i + ned.len()] == ned {
            let prev_boundary = i == 0 || !hay[i - 1].is_ascii_alphanumeric();
            let next_boundary =
                i + ned.len() == hay.len() || !hay[i + ned.len()].is_ascii_alphanumeric();
            if prev_boundary && next_boundary {
                return true;
            }
        }
        i += 1;
    }
    false
}
