use std::sync::Arc;

use crackq_db::queue::JobQueue;
use crackq_db::store::Store;
use crackq_db::DbPool;
use crackq_events::EventBus;

use crate::config::AppConfig;
use crate::engine::progress::Propagator;
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// Database pool for health checks. `None` when running on the
    /// in-memory store.
    pub pool: Option<DbPool>,
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    /// WebSocket connection manager (browser clients).
    pub ws_manager: Arc<WsManager>,
    /// Throttled progress persistence and fan-out.
    pub propagator: Arc<Propagator>,
    /// Centralized event bus for publishing platform events.
    pub event_bus: Arc<EventBus>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        pool: Option<DbPool>,
    ) -> Self {
        let ws_manager = Arc::new(WsManager::new());
        let propagator = Arc::new(Propagator::new(
            Arc::clone(&store),
            Arc::clone(&ws_manager),
            config.throttle,
        ));
        Self {
            config: Arc::new(config),
            pool,
            store,
            queue,
            ws_manager,
            propagator,
            event_bus: Arc::new(EventBus::default()),
        }
    }
}
