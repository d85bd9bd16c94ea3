//! SSE 流转发
//!
//! 两种传输模式：
//! - 直通复制：上游字节原样转发，注释行与心跳一并保留
//! - 适配转发：按行切分 SSE，`data:` 负载经方言翻译后重新成帧
//!
//! 对测试友好：两个函数都以任意字节流为输入，不绑定网络类型。

use crate::adapter::AdapterKind;
use crate::error::ProxyError;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

/// 单行缓冲上限，超出视为损坏的上游流
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// 流结束标记
const DONE_SENTINEL: &str = "[DONE]";

/// 流式传输的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// 上游流正常结束（含 [DONE]）
    Completed,
    /// 接收端关闭，客户端挂断
    Disconnected,
}

/// 字节直通复制
pub(crate) async fn copy_raw<S, E>(
    mut upstream: S,
    sink: &mpsc::Sender<Bytes>,
) -> Result<RelayOutcome, ProxyError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    while let Some(frame) = upstream.next().await {
        let frame = frame.map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
        if sink.send(frame).await.is_err() {
            return Ok(RelayOutcome::Disconnected);
        }
    }
    Ok(RelayOutcome::Completed)
}

/// 逐行适配转发
///
/// 只处理 `data:` 行，其余行（event:、注释、空行）丢弃。
/// 负载解析或翻译失败时告警并跳过该行，流继续；
/// `[DONE]` 原样透传并立即结束。
pub(crate) async fn relay_adapted<S, E>(
    mut upstream: S,
    sink: &mpsc::Sender<Bytes>,
    adapter: AdapterKind,
) -> Result<RelayOutcome, ProxyError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(frame) = upstream.next().await {
        let frame = frame.map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
        buffer.extend_from_slice(&frame);

        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            match handle_line(&line, sink, adapter).await? {
                LineOutcome::Continue => {}
                LineOutcome::Done => return Ok(RelayOutcome::Completed),
                LineOutcome::Disconnected => return Ok(RelayOutcome::Disconnected),
            }
        }

        if buffer.len() > MAX_LINE_BYTES {
            return Err(ProxyError::Adaptation(format!(
                "stream line exceeds {} bytes",
                MAX_LINE_BYTES
            )));
        }
    }

    // 上游未发 [DONE] 直接收尾，残留的不完整行丢弃
    Ok(RelayOutcome::Completed)
}

enum LineOutcome {
    Continue,
    Done,
    Disconnected,
}

async fn handle_line(
    raw: &[u8],
    sink: &mpsc::Sender<Bytes>,
    adapter: AdapterKind,
) -> Result<LineOutcome, ProxyError> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\n', '\r']);
    if line.is_empty() {
        return Ok(LineOutcome::Continue);
    }

    let data = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None => return Ok(LineOutcome::Continue),
    };

    if data == DONE_SENTINEL {
        if send_data(sink, DONE_SENTINEL).await.is_err() {
            return Ok(LineOutcome::Disconnected);
        }
        return Ok(LineOutcome::Done);
    }

    let chunk: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("[PROXY] 流式负载解析失败: {} (data: {})", e, data);
            return Ok(LineOutcome::Continue);
        }
    };

    match adapter.adapt_stream_chunk(&chunk) {
        Ok(Some(adapted)) => {
            let payload = adapted.to_string();
            if send_data(sink, &payload).await.is_err() {
                return Ok(LineOutcome::Disconnected);
            }
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!("[PROXY] 流式负载翻译失败: {}", e);
        }
    }

    Ok(LineOutcome::Continue)
}

async fn send_data(
    sink: &mpsc::Sender<Bytes>,
    payload: &str,
) -> Result<(), mpsc::error::SendError<Bytes>> {
    sink.send(Bytes::from(format!("data: {}\n\n", payload)))
        .await
}
