//! Ephemeral pairing codes: one unexpired code per number.

use super::{now, Store, PAIRING_CODE_TTL_SECS};
use courier_core::error::CourierError;

impl Store {
    /// Record a freshly issued pairing code. Upserts so a number never
    /// holds more than one code.
    pub async fn put_pairing_code(&self, number: &str, code: &str) -> Result<(), CourierError> {
        let ts = now();
        sqlx::query(
            "INSERT INTO pairing_codes (number, code, created_at, expires_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(number) DO UPDATE SET \
                 code = excluded.code, \
                 created_at = excluded.created_at, \
                 expires_at = excluded.expires_at",
        )
        .bind(number)
        .bind(code)
        .bind(ts)
        .bind(ts + PAIRING_CODE_TTL_SECS)
        .execute(&self.pool)
        .await
        .map_err(|e| CourierError::Store(format!("put pairing code failed: {e}")))?;

        Ok(())
    }

    /// The current unexpired code for a number, if any.
    pub async fn pairing_code(&self, number: &str) -> Result<Option<String>, CourierError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT code FROM pairing_codes WHERE number = ? AND expires_at > ?",
        )
        .bind(number)
        .bind(now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CourierError::Store(format!("query failed: {e}")))?;

        Ok(row.map(|(c,)| c))
    }

    /// Drop the code for a number.
    pub async fn delete_pairing_code(&self, number: &str) -> Result<(), CourierError> {
        sqlx::query("DELETE FROM pairing_codes WHERE number = ?")
            .bind(number)
            .execute(&self.pool)
            .await
            .map_err(|e| CourierError::Store(format!("delete pairing code failed: {e}")))?;

        Ok(())
    }
}
