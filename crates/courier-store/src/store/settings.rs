//! Per-number settings with default fallback.
//!
//! Every read degrades to config defaults when the store errors, and
//! writes are best-effort from the caller's point of view — settings
//! must never block message handling.

use super::{now, Store};
use courier_core::config::Config;
use courier_core::error::CourierError;
use tracing::warn;

/// Per-number configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSettings {
    pub prefix: String,
    pub auto_status_seen: bool,
    pub auto_status_react: bool,
    pub auto_status_reply: bool,
    /// Channel JIDs this session follows.
    pub channels: Vec<String>,
}

impl UserSettings {
    /// Defaults derived from process configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            prefix: config.bot.prefix.clone(),
            auto_status_seen: config.auto_status.seen,
            auto_status_react: config.auto_status.react,
            auto_status_reply: config.auto_status.reply,
            channels: config.bot.channels.clone(),
        }
    }
}

impl Store {
    /// Read stored settings for a number.
    pub async fn get_settings(&self, number: &str) -> Result<Option<UserSettings>, CourierError> {
        let row: Option<(String, i64, i64, i64, String)> = sqlx::query_as(
            "SELECT prefix, auto_status_seen, auto_status_react, auto_status_reply, channels \
             FROM settings WHERE number = ?",
        )
        .bind(number)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CourierError::Store(format!("query failed: {e}")))?;

        Ok(row.map(|(prefix, seen, react, reply, channels)| UserSettings {
            prefix,
            auto_status_seen: seen != 0,
            auto_status_react: react != 0,
            auto_status_reply: reply != 0,
            channels: serde_json::from_str(&channels).unwrap_or_default(),
        }))
    }

    /// Settings for a number, falling back to `defaults` when the row
    /// is absent or the store is unreachable.
    pub async fn settings_or_default(&self, number: &str, defaults: &UserSettings) -> UserSettings {
        match self.get_settings(number).await {
            Ok(Some(settings)) => settings,
            Ok(None) => defaults.clone(),
            Err(e) => {
                warn!("settings read failed for {number}, using defaults: {e}");
                defaults.clone()
            }
        }
    }

    /// Upsert settings for a number.
    pub async fn save_settings(
        &self,
        number: &str,
        settings: &UserSettings,
    ) -> Result<(), CourierError> {
        let channels = serde_json::to_string(&settings.channels)?;
        sqlx::query(
            "INSERT INTO settings \
                 (number, prefix, auto_status_seen, auto_status_react, auto_status_reply, channels, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(number) DO UPDATE SET \
                 prefix = excluded.prefix, \
                 auto_status_seen = excluded.auto_status_seen, \
                 auto_status_react = excluded.auto_status_react, \
                 auto_status_reply = excluded.auto_status_reply, \
                 channels = excluded.channels, \
                 updated_at = excluded.updated_at",
        )
        .bind(number)
        .bind(&settings.prefix)
        .bind(settings.auto_status_seen as i64)
        .bind(settings.auto_status_react as i64)
        .bind(settings.auto_status_reply as i64)
        .bind(channels)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(|e| CourierError::Store(format!("save settings failed: {e}")))?;

        Ok(())
    }

    /// Change only the prefix, creating the row from `defaults` first
    /// when absent.
    pub async fn set_prefix(
        &self,
        number: &str,
        prefix: &str,
        defaults: &UserSettings,
    ) -> Result<(), CourierError> {
        let mut settings = self.settings_or_default(number, defaults).await;
        settings.prefix = prefix.to_string();
        self.save_settings(number, &settings).await
    }

    /// Drop the settings row for a number.
    pub async fn delete_settings(&self, number: &str) -> Result<(), CourierError> {
        sqlx::query("DELETE FROM settings WHERE number = ?")
            .bind(number)
            .execute(&self.pool)
            .await
            .map_err(|e| CourierError::Store(format!("delete settings failed: {e}")))?;

        Ok(())
    }
}
