use std::sync::Arc;

use crate::config::WsConfig;
use crate::ws::manager::WsManager;

/// Spawn a background task that evicts connections silent for longer than
/// `config.timeout`, then pings everyone still connected.
///
/// Runs until aborted; `main` aborts it during shutdown.
pub fn start_heartbeat(ws_manager: Arc<WsManager>, config: WsConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.heartbeat_interval);

        loop {
            interval.tick().await;
            let evicted = ws_manager.evict_stale(config.timeout).await;
            if !evicted.is_empty() {
                tracing::info!(count = evicted.len(), "Evicted stale WebSocket connections");
            }
            let count = ws_manager.connection_count().await;
            tracing::debug!(count, "WebSocket heartbeat ping");
            ws_manager.ping_all().await;
        }
    })
}
