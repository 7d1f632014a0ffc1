//! In-memory counters with realtime broadcast and durable snapshots.

use courier_store::Store;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::broadcast;
use tracing::warn;

/// Realtime event pushed to dashboard listeners.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    StatsUpdate {
        active_connections: i64,
        total_users: i64,
    },
    Linked {
        session_id: String,
    },
    Unlinked {
        session_id: String,
    },
}

impl ServerEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StatsUpdate { .. } => "statsUpdate",
            Self::Linked { .. } => "linked",
            Self::Unlinked { .. } => "unlinked",
        }
    }

    /// SSE event payload. Field names follow the dashboard wire
    /// contract.
    pub fn payload(&self) -> Value {
        match self {
            Self::StatsUpdate {
                active_connections,
                total_users,
            } => json!({
                "activeConnections": active_connections,
                "totalUsers": total_users,
            }),
            Self::Linked { session_id } => json!({"sessionId": session_id}),
            Self::Unlinked { session_id } => json!({"sessionId": session_id}),
        }
    }
}

/// Counter owner. Every counter change is pushed to subscribers
/// immediately; a periodic server tick persists snapshots.
pub struct StatsReporter {
    store: Store,
    active: AtomicI64,
    tx: broadcast::Sender<ServerEvent>,
}

impl StatsReporter {
    pub fn new(store: Store) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            store,
            active: AtomicI64::new(0),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    pub fn active_connections(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    async fn total_users(&self) -> i64 {
        match self.store.count_sessions().await {
            Ok(count) => count,
            Err(e) => {
                warn!("session count failed: {e}");
                0
            }
        }
    }

    async fn push_stats(&self, active: i64) {
        let total_users = self.total_users().await;
        let _ = self.tx.send(ServerEvent::StatsUpdate {
            active_connections: active,
            total_users,
        });
    }

    /// A session completed its open handshake.
    pub async fn session_linked(&self, number: &str) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.tx.send(ServerEvent::Linked {
            session_id: number.to_string(),
        });
        self.push_stats(active).await;
    }

    /// A session terminated.
    pub async fn session_unlinked(&self, number: &str) {
        let active = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        let _ = self.tx.send(ServerEvent::Unlinked {
            session_id: number.to_string(),
        });
        self.push_stats(active).await;
    }

    /// Persist the current counters.
    pub async fn snapshot(&self) {
        let active = self.active_connections();
        let total = self.total_users().await;
        if let Err(e) = self.store.save_snapshot(active, total).await {
            warn!("stats snapshot failed: {e}");
        }
    }
}
