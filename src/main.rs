use anyhow::Context;
use routecast::config::ProxyConfig;
use routecast::database::{self, dao::UsageDao};
use routecast::server::{build_router, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ProxyConfig::load();
    let db = database::init_database().map_err(|e| anyhow::anyhow!(e))?;

    // 启动时压缩一次保留期之外的小时桶
    {
        let mut conn = db.lock();
        match UsageDao::compact(&mut conn, config.usage_retention_days) {
            Ok(reduced) if reduced > 0 => {
                tracing::info!("[MAIN] 启动压缩完成，减少 {} 行", reduced)
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("[MAIN] 启动压缩失败: {}", e),
        }
    }

    let listen_addr = config.listen_addr.clone();
    let max_body_bytes = config.max_body_bytes;
    let state = AppState::new(db, config)?;
    let app = build_router(state, max_body_bytes);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("无法监听 {}", listen_addr))?;
    tracing::info!("[MAIN] routecast 监听于 {}", listen_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
