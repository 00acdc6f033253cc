use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use sqlx::{Pool, Postgres};
use tokio::sync::watch;

use crate::config::AppConfig;
use crate::rank::RankStore;
use crate::ws::HubHandle;

pub(crate) struct PerfCounters {
    pub(crate) updates_received: AtomicU64,
    pub(crate) updates_applied: AtomicU64,
    pub(crate) publish_failures: AtomicU64,
    pub(crate) enqueue_failures: AtomicU64,
    pub(crate) sync_batches: AtomicU64,
    pub(crate) sync_items: AtomicU64,
    pub(crate) sync_failures: AtomicU64,
    pub(crate) ws_broadcasts: AtomicU64,
    pub(crate) ws_evictions: AtomicU64,
}

impl PerfCounters {
    pub(crate) fn new() -> Self {
        Self {
            updates_received: AtomicU64::new(0),
            updates_applied: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            enqueue_failures: AtomicU64::new(0),
            sync_batches: AtomicU64::new(0),
            sync_items: AtomicU64::new(0),
            sync_failures: AtomicU64::new(0),
            ws_broadcasts: AtomicU64::new(0),
            ws_evictions: AtomicU64::new(0),
        }
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) cfg: Arc<AppConfig>,
    pub(crate) db: Pool<Postgres>,
    // Shared command connection; rank store and workers clone it per call.
    pub(crate) redis: MultiplexedConnection,
    // Dedicated client for pub/sub connections (they cannot be multiplexed).
    pub(crate) redis_client: redis::Client,
    pub(crate) rank: RankStore,
    pub(crate) hub: HubHandle,
    pub(crate) perf: Arc<PerfCounters>,
    // Flipped once on SIGINT/SIGTERM; long-lived tasks and sockets watch it.
    pub(crate) shutdown: watch::Receiver<bool>,
}
