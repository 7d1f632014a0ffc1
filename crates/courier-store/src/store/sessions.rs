//! Session rows: one per phone number, credentials as opaque JSON.

use super::{now, Store, SESSION_TTL_SECS};
use courier_core::error::CourierError;
use courier_core::traits::SessionCredentials;

impl Store {
    /// Create the session row for a number if absent. Returns `true`
    /// when a new row was inserted.
    pub async fn ensure_session(&self, number: &str) -> Result<bool, CourierError> {
        let ts = now();
        let result = sqlx::query(
            "INSERT OR IGNORE INTO sessions (number, created_at, last_active, expires_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(number)
        .bind(ts)
        .bind(ts)
        .bind(ts + SESSION_TTL_SECS)
        .execute(&self.pool)
        .await
        .map_err(|e| CourierError::Store(format!("ensure session failed: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Whether an unexpired session row exists for the number.
    pub async fn session_exists(&self, number: &str) -> Result<bool, CourierError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM sessions WHERE number = ? AND expires_at > ?")
                .bind(number)
                .bind(now())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| CourierError::Store(format!("query failed: {e}")))?;

        Ok(row.is_some())
    }

    /// Persist updated credential material, refreshing the TTL.
    pub async fn save_credentials(
        &self,
        number: &str,
        credentials: &SessionCredentials,
    ) -> Result<(), CourierError> {
        let creds = serde_json::to_string(&credentials.creds)?;
        let keys = serde_json::to_string(&credentials.keys)?;
        let ts = now();
        sqlx::query(
            "INSERT INTO sessions (number, creds, keys, created_at, last_active, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(number) DO UPDATE SET \
                 creds = excluded.creds, \
                 keys = excluded.keys, \
                 last_active = excluded.last_active, \
                 expires_at = excluded.expires_at",
        )
        .bind(number)
        .bind(creds)
        .bind(keys)
        .bind(ts)
        .bind(ts)
        .bind(ts + SESSION_TTL_SECS)
        .execute(&self.pool)
        .await
        .map_err(|e| CourierError::Store(format!("save credentials failed: {e}")))?;

        Ok(())
    }

    /// Load stored credentials for a number, if any and unexpired.
    pub async fn load_credentials(
        &self,
        number: &str,
    ) -> Result<Option<SessionCredentials>, CourierError> {
        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT creds, keys FROM sessions WHERE number = ? AND expires_at > ?",
        )
        .bind(number)
        .bind(now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CourierError::Store(format!("load credentials failed: {e}")))?;

        match row {
            Some((Some(creds), Some(keys))) => Ok(Some(SessionCredentials {
                creds: serde_json::from_str(&creds)?,
                keys: serde_json::from_str(&keys)?,
            })),
            _ => Ok(None),
        }
    }

    /// Flip the active flag, updating `last_active` and refreshing the
    /// TTL on activation.
    pub async fn set_session_active(&self, number: &str, active: bool) -> Result<(), CourierError> {
        let ts = now();
        if active {
            sqlx::query(
                "UPDATE sessions SET is_active = 1, last_active = ?, expires_at = ? \
                 WHERE number = ?",
            )
            .bind(ts)
            .bind(ts + SESSION_TTL_SECS)
            .bind(number)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query("UPDATE sessions SET is_active = 0, last_active = ? WHERE number = ?")
                .bind(ts)
                .bind(number)
                .execute(&self.pool)
                .await
        }
        .map_err(|e| CourierError::Store(format!("set active failed: {e}")))?;

        Ok(())
    }

    /// Whether the session row is flagged active.
    pub async fn session_is_active(&self, number: &str) -> Result<bool, CourierError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT is_active FROM sessions WHERE number = ?")
                .bind(number)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| CourierError::Store(format!("query failed: {e}")))?;

        Ok(row.map(|(a,)| a != 0).unwrap_or(false))
    }

    /// Delete the session row outright.
    pub async fn delete_session(&self, number: &str) -> Result<(), CourierError> {
        sqlx::query("DELETE FROM sessions WHERE number = ?")
            .bind(number)
            .execute(&self.pool)
            .await
            .map_err(|e| CourierError::Store(format!("delete session failed: {e}")))?;

        Ok(())
    }

    /// Numbers flagged active with an unexpired row — the restart
    /// recovery set.
    pub async fn active_session_numbers(&self) -> Result<Vec<String>, CourierError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT number FROM sessions WHERE is_active = 1 AND expires_at > ? ORDER BY number",
        )
        .bind(now())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CourierError::Store(format!("query failed: {e}")))?;

        Ok(rows.into_iter().map(|(n,)| n).collect())
    }

    /// Count of unexpired session rows.
    pub async fn count_sessions(&self) -> Result<i64, CourierError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sessions WHERE expires_at > ?")
                .bind(now())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| CourierError::Store(format!("count failed: {e}")))?;

        Ok(count)
    }

    /// Count of unexpired rows flagged active.
    pub async fn count_active_sessions(&self) -> Result<i64, CourierError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sessions WHERE is_active = 1 AND expires_at > ?",
        )
        .bind(now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CourierError::Store(format!("count failed: {e}")))?;

        Ok(count)
    }

    /// Remove every trace of a number: session, pairing code, and
    /// settings. Used on explicit logout.
    pub async fn remove_account(&self, number: &str) -> Result<(), CourierError> {
        self.delete_session(number).await?;
        self.delete_pairing_code(number).await?;
        self.delete_settings(number).await?;
        Ok(())
    }
}
