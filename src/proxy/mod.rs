//! 代理执行模块
//!
//! 封装完整的请求代理流程：重定向 → 路由解析 → 方言检测与翻译 →
//! 上游调用 → 响应归一化 → 用量记录。一元与流式共用前置步骤，
//! 流式在上游状态确认后才进入传输阶段，便于在建立事件流之前
//! 以普通错误响应返回失败。

use crate::adapter::{self, AdapterKind, ANTHROPIC_VERSION};
use crate::config::ProxyConfig;
use crate::database::dao::UsageDao;
use crate::database::DbConnection;
use crate::error::ProxyError;
use crate::models::UsageEntry;
use crate::router::RouteResolver;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

mod sse;
#[cfg(test)]
mod tests;

pub use sse::RelayOutcome;

/// 代理执行器
///
/// 持有共享的 HTTP 客户端与路由解析器，整个进程复用一份
pub struct ProxyExecutor {
    db: DbConnection,
    resolver: RouteResolver,
    client: reqwest::Client,
}

impl ProxyExecutor {
    /// 创建执行器
    ///
    /// 默认不设置请求超时，长流式会话不会被网关侧打断；
    /// 配置了 `request_timeout_secs` 时按其构建客户端。
    pub fn new(db: DbConnection, config: ProxyConfig) -> Result<Self, ProxyError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| ProxyError::BackendUnavailable(format!("http client init: {}", e)))?;

        let resolver = RouteResolver::new(db.clone(), config);
        Ok(Self {
            db,
            resolver,
            client,
        })
    }

    pub fn resolver(&self) -> &RouteResolver {
        &self.resolver
    }

    /// 执行一元代理请求
    ///
    /// 成功时返回 JSON 响应体的字节（已按方言翻译为统一形状）；
    /// 上游非 2xx 时以 [`ProxyError::BackendError`] 原样透传状态码与响应体。
    /// 用量按重定向后的模型标识记录，每个终态恰好记录一次。
    pub async fn execute_unary(
        &self,
        mut body: Value,
        caller_auth: Option<&str>,
    ) -> Result<Bytes, ProxyError> {
        let prepared = self.prepare(&mut body)?;
        let log_model = prepared.model.clone();

        let (url, payload) = prepared.unary_parts(&body)?;
        tracing::info!(
            "[PROXY] 转发到: {} (路由: {})",
            url,
            prepared.route.display_id()
        );

        let request = self.build_request(&url, &payload, caller_auth, &prepared);
        let started = std::time::Instant::now();
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                record_usage(
                    &self.db,
                    UsageEntry::failure(&log_model, prepared.route.id, e.to_string()),
                );
                return Err(ProxyError::BackendUnavailable(e.to_string()));
            }
        };

        let status = response.status();
        let raw = match response.bytes().await {
            Ok(raw) => raw,
            // 状态行收到后连接中断也是一个终态，同样要进用量
            Err(e) => {
                record_usage(
                    &self.db,
                    UsageEntry::failure(&log_model, prepared.route.id, e.to_string()),
                );
                return Err(ProxyError::BackendUnavailable(e.to_string()));
            }
        };
        tracing::info!(
            "[PROXY] 上游 {} 响应: status={} 耗时={:?}",
            prepared.route.name,
            status.as_u16(),
            started.elapsed()
        );

        if !status.is_success() {
            let text = String::from_utf8_lossy(&raw).into_owned();
            record_usage(
                &self.db,
                UsageEntry::failure(&log_model, prepared.route.id, text.clone()),
            );
            return Err(ProxyError::BackendError {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(finish_unary(
            &self.db,
            raw,
            prepared.adapter,
            &log_model,
            prepared.route.id,
        ))
    }

    /// 发起流式代理请求的前置阶段
    ///
    /// 完成路由、翻译与上游握手。上游状态非 2xx 时在这里返回错误，
    /// 调用方尚未向客户端承诺事件流。成功后通过返回的
    /// [`ActiveStream`] 做实际传输。
    pub async fn begin_stream(
        &self,
        mut body: Value,
        caller_auth: Option<&str>,
    ) -> Result<ActiveStream, ProxyError> {
        let requested = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let prepared = self.prepare(&mut body)?;

        // 流式传输阶段的用量按客户端请求的原始模型名记录
        let log_model = if requested.is_empty() {
            prepared.model.clone()
        } else {
            requested
        };

        if let Some(stream_flag) = body.get_mut("stream") {
            *stream_flag = Value::Bool(true);
        } else if let Some(obj) = body.as_object_mut() {
            obj.insert("stream".to_string(), Value::Bool(true));
        }

        let (url, payload) = prepared.stream_parts(&body)?;
        tracing::info!(
            "[PROXY] 流式转发到: {} (路由: {}, 适配器: {})",
            url,
            prepared.route.display_id(),
            prepared
                .adapter
                .map(|a| a.name())
                .unwrap_or("passthrough")
        );

        let request = self.build_request(&url, &payload, caller_auth, &prepared);
        let response = request
            .send()
            .await
            .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProxyError::BackendError {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(ActiveStream {
            db: self.db.clone(),
            response,
            adapter: prepared.adapter,
            log_model,
            route_id: prepared.route.id,
        })
    }

    /// 拉取上游的 `/v1/models` 模型列表
    pub async fn fetch_remote_models(
        &self,
        api_url: &str,
        api_key: &str,
    ) -> Result<Vec<String>, ProxyError> {
        let url = format!("{}/v1/models", normalize_base(api_url));
        tracing::info!("[PROXY] 拉取模型列表: {}", url);

        let mut request = self.client.get(&url);
        if !api_key.is_empty() {
            request = request.bearer_auth(api_key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;

        let status = response.status();
        let raw = response
            .bytes()
            .await
            .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(ProxyError::BackendError {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&raw).into_owned(),
            });
        }

        let parsed: Value = serde_json::from_slice(&raw)
            .map_err(|e| ProxyError::Adaptation(format!("model list parse: {}", e)))?;
        let models: Vec<String> = parsed
            .get("data")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        tracing::info!("[PROXY] 拉取到 {} 个模型", models.len());
        Ok(models)
    }

    /// 共同的前置步骤：后缀剥离、重定向、路由解析、方言检测
    fn prepare(&self, body: &mut Value) -> Result<PreparedRequest, ProxyError> {
        let raw_model = body
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ProxyError::BadRequest("'model' field is required".to_string()))?
            .to_string();

        let real_model = adapter::strip_stream_suffix(&raw_model).to_string();

        let model = match self.resolver.apply_redirect(&real_model)? {
            Some(target) => {
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("model".to_string(), Value::String(target.clone()));
                }
                target
            }
            None => real_model,
        };

        let route = self.resolver.resolve(&model)?;
        let base_url = route.api_url.trim_end_matches('/').to_string();
        let adapter = adapter::detect(&base_url, &route.model);

        Ok(PreparedRequest {
            model,
            base_url,
            adapter,
            route,
        })
    }

    fn build_request(
        &self,
        url: &str,
        payload: &Value,
        caller_auth: Option<&str>,
        prepared: &PreparedRequest,
    ) -> reqwest::RequestBuilder {
        let mut request = self.client.post(url).json(payload);
        if !prepared.route.api_key.is_empty() {
            request = request.bearer_auth(&prepared.route.api_key);
        } else if let Some(auth) = caller_auth {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }
        if prepared.adapter == Some(AdapterKind::Claude) {
            request = request.header(ANTHROPIC_VERSION.0, ANTHROPIC_VERSION.1);
        }
        request
    }
}

/// 写入用量桶，失败仅告警
fn record_usage(db: &DbConnection, entry: UsageEntry) {
    let conn = db.lock();
    if let Err(e) = UsageDao::record(&conn, &entry) {
        tracing::warn!("[PROXY] 用量记录失败: {}", e);
    }
}

/// 补全基址的协议前缀并去掉末尾斜杠
fn normalize_base(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        base.to_string()
    } else {
        format!("https://{}", base)
    }
}

/// 一元 2xx 响应的收尾：记录用量并按需翻译
///
/// 2xx 一律记成功。响应体不是 JSON 时按零 token 记录并原样透传，
/// 翻译失败同样原样返回上游响应体。
fn finish_unary(
    db: &DbConnection,
    raw: Bytes,
    adapter: Option<AdapterKind>,
    log_model: &str,
    route_id: i64,
) -> Bytes {
    let upstream: Value = match serde_json::from_slice(&raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("[PROXY] 上游响应不是 JSON，原样透传: {}", e);
            record_usage(db, UsageEntry::success(log_model, route_id, 0, 0, 0));
            return raw;
        }
    };

    let (req_tokens, resp_tokens, total) = extract_usage(&upstream);
    record_usage(
        db,
        UsageEntry::success(log_model, route_id, req_tokens, resp_tokens, total),
    );

    match adapter {
        Some(kind) => match kind.adapt_response(&upstream) {
            Ok(adapted) => match serde_json::to_vec(&adapted) {
                Ok(bytes) => Bytes::from(bytes),
                Err(e) => {
                    tracing::error!("[PROXY] 响应序列化失败: {}", e);
                    raw
                }
            },
            Err(e) => {
                tracing::error!("[PROXY] 响应翻译失败: {}", e);
                raw
            }
        },
        None => raw,
    }
}

/// 前置步骤的产物
struct PreparedRequest {
    /// 重定向后的模型标识
    model: String,
    /// 去除末尾斜杠的路由基址
    base_url: String,
    adapter: Option<AdapterKind>,
    route: crate::models::ModelRoute,
}

impl PreparedRequest {
    /// 一元请求的目标 URL 与上游请求体
    fn unary_parts(&self, body: &Value) -> Result<(String, Value), ProxyError> {
        match self.adapter {
            Some(kind) => Ok((
                kind.unary_url(&self.base_url, &self.route.model),
                kind.adapt_request(body, &self.route.model)?,
            )),
            None => Ok((
                format!("{}/v1/chat/completions", self.base_url),
                self.passthrough_body(body),
            )),
        }
    }

    /// 流式请求的目标 URL 与上游请求体
    fn stream_parts(&self, body: &Value) -> Result<(String, Value), ProxyError> {
        match self.adapter {
            Some(kind) => Ok((
                kind.stream_url(&self.base_url, &self.route.model),
                kind.adapt_request(body, &self.route.model)?,
            )),
            None => Ok((
                format!("{}/v1/chat/completions", self.base_url),
                self.passthrough_body(body),
            )),
        }
    }

    /// 直通路径只覆写 model 字段，其余请求字段原样保留
    fn passthrough_body(&self, body: &Value) -> Value {
        let mut out = body.clone();
        if let Some(obj) = out.as_object_mut() {
            obj.insert(
                "model".to_string(),
                Value::String(self.route.model.clone()),
            );
        }
        out
    }
}

/// 握手完成、尚未传输的流式会话
pub struct ActiveStream {
    db: DbConnection,
    response: reqwest::Response,
    adapter: Option<AdapterKind>,
    /// 用量记录使用的模型名（客户端请求的原始标识）
    log_model: String,
    route_id: i64,
}

impl ActiveStream {
    /// 把上游响应流转发到 `sink`
    ///
    /// 直通路径按字节原样复制；适配路径逐行解析 SSE 并翻译。
    /// `sink` 关闭视为客户端挂断：记一次失败并停止，不算错误。
    /// 无论哪种结束方式，恰好记录一次用量。
    pub async fn forward(self, sink: mpsc::Sender<Bytes>) -> Result<(), ProxyError> {
        // bytes_stream() 按值消费 response，先把 self 拆开
        let Self {
            db,
            response,
            adapter,
            log_model,
            route_id,
        } = self;

        let upstream = response.bytes_stream();
        let outcome = match adapter {
            Some(kind) => sse::relay_adapted(upstream, &sink, kind).await,
            None => sse::copy_raw(upstream, &sink).await,
        };
        settle_stream(&db, outcome, &log_model, route_id)
    }
}

/// 流式传输的终态结算，每个终态恰好记录一次用量
fn settle_stream(
    db: &DbConnection,
    outcome: Result<RelayOutcome, ProxyError>,
    log_model: &str,
    route_id: i64,
) -> Result<(), ProxyError> {
    match outcome {
        Ok(RelayOutcome::Completed) => {
            record_usage(db, UsageEntry::success(log_model, route_id, 0, 0, 0));
            Ok(())
        }
        Ok(RelayOutcome::Disconnected) => {
            tracing::debug!("[PROXY] 客户端挂断: model={}", log_model);
            record_usage(
                db,
                UsageEntry::failure(log_model, route_id, "client disconnected"),
            );
            Ok(())
        }
        Err(e) => {
            record_usage(db, UsageEntry::failure(log_model, route_id, e.to_string()));
            Err(e)
        }
    }
}

/// 从上游响应中宽容地提取用量
///
/// 依次尝试统一形状（`usage.prompt_tokens` 等）、Claude 形状
/// （`usage.input_tokens`/`output_tokens`）、Gemini 形状
/// （`usageMetadata.*TokenCount`）。缺失的字段计零，
/// 总量缺失时取两者之和。
pub(crate) fn extract_usage(response: &Value) -> (i64, i64, i64) {
    fn field(v: &Value, pointer: &str) -> Option<i64> {
        v.pointer(pointer).and_then(Value::as_i64)
    }

    let (prompt, completion, total) = if response.pointer("/usage/prompt_tokens").is_some()
        || response.pointer("/usage/completion_tokens").is_some()
    {
        (
            field(response, "/usage/prompt_tokens"),
            field(response, "/usage/completion_tokens"),
            field(response, "/usage/total_tokens"),
        )
    } else if response.pointer("/usage/input_tokens").is_some() {
        (
            field(response, "/usage/input_tokens"),
            field(response, "/usage/output_tokens"),
            None,
        )
    } else if response.get("usageMetadata").is_some() {
        (
            field(response, "/usageMetadata/promptTokenCount"),
            field(response, "/usageMetadata/candidatesTokenCount"),
            field(response, "/usageMetadata/totalTokenCount"),
        )
    } else {
        (None, None, None)
    };

    let prompt = prompt.unwrap_or(0);
    let completion = completion.unwrap_or(0);
    let total = total.unwrap_or(prompt + completion);
    (prompt, completion, total)
}
