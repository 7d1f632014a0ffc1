//! Durable counter snapshots.

use super::{now, Store};
use courier_core::error::CourierError;

impl Store {
    /// Record a counter snapshot.
    pub async fn save_snapshot(
        &self,
        active_connections: i64,
        total_users: i64,
    ) -> Result<(), CourierError> {
        sqlx::query(
            "INSERT INTO stats_snapshots (active_connections, total_users, recorded_at) \
             VALUES (?, ?, ?)",
        )
        .bind(active_connections)
        .bind(total_users)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(|e| CourierError::Store(format!("save snapshot failed: {e}")))?;

        Ok(())
    }

    /// Most recent snapshot: `(active_connections, total_users,
    /// recorded_at)`.
    pub async fn latest_snapshot(&self) -> Result<Option<(i64, i64, i64)>, CourierError> {
        sqlx::query_as(
            "SELECT active_connections, total_users, recorded_at \
             FROM stats_snapshots ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CourierError::Store(format!("query failed: {e}")))
    }
}
