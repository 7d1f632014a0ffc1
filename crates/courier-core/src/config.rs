//! Daemon configuration.
//!
//! Loaded from a TOML file with serde defaults for every field, then
//! overlaid with environment variables. Everything is read once at
//! startup.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::CourierError;

/// Top-level Courier configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub auto_status: AutoStatusConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Bot identity and chat-facing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Display name used in the menu and welcome notice.
    #[serde(default = "default_bot_name")]
    pub name: String,
    /// Owner display name shown in the menu header.
    #[serde(default = "default_owner_name")]
    pub owner_name: String,
    /// Command prefix used when a number has no per-user override.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Image URL referenced by the menu command.
    #[serde(default)]
    pub menu_image_url: String,
    /// Channel JIDs every fresh session subscribes to on open.
    #[serde(default)]
    pub channels: Vec<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: default_bot_name(),
            owner_name: default_owner_name(),
            prefix: default_prefix(),
            menu_image_url: String::new(),
            channels: Vec::new(),
        }
    }
}

/// Default auto-status behavior for numbers without stored settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoStatusConfig {
    #[serde(default = "default_true")]
    pub seen: bool,
    #[serde(default)]
    pub react: bool,
    #[serde(default)]
    pub reply: bool,
    /// Emoji used when reacting to a status post.
    #[serde(default = "default_react_emoji")]
    pub react_emoji: String,
    /// Text sent to the poster when auto-reply is on.
    #[serde(default = "default_status_reply")]
    pub reply_text: String,
}

impl Default for AutoStatusConfig {
    fn default() -> Self {
        Self {
            seen: true,
            react: false,
            reply: false,
            react_emoji: default_react_emoji(),
            reply_text: default_status_reply(),
        }
    }
}

/// Persistent store config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// HTTP API bind address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

fn default_bot_name() -> String {
    "Courier".to_string()
}

fn default_owner_name() -> String {
    "operator".to_string()
}

fn default_prefix() -> String {
    ".".to_string()
}

fn default_react_emoji() -> String {
    "\u{1f49a}".to_string()
}

fn default_status_reply() -> String {
    "Status seen \u{2713}".to_string()
}

fn default_db_path() -> String {
    "courier.db".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    7860
}

fn default_true() -> bool {
    true
}

/// Load configuration from a TOML file, falling back to defaults when
/// the file does not exist, then apply environment overrides.
pub fn load(path: &str) -> Result<Config, CourierError> {
    let path = Path::new(path);
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CourierError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&content)
            .map_err(|e| CourierError::Config(format!("failed to parse config: {e}")))?
    } else {
        info!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        Config::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Overlay `COURIER_*` environment variables onto a loaded config.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(name) = std::env::var("COURIER_BOT_NAME") {
        config.bot.name = name;
    }
    if let Ok(owner) = std::env::var("COURIER_OWNER_NAME") {
        config.bot.owner_name = owner;
    }
    if let Ok(prefix) = std::env::var("COURIER_PREFIX") {
        if !prefix.is_empty() {
            config.bot.prefix = prefix;
        }
    }
    if let Ok(url) = std::env::var("COURIER_MENU_IMAGE_URL") {
        config.bot.menu_image_url = url;
    }
    if let Ok(db) = std::env::var("COURIER_DB_PATH") {
        config.store.db_path = db;
    }
    if let Ok(port) = std::env::var("COURIER_PORT") {
        if let Ok(port) = port.parse() {
            config.api.port = port;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.bot.prefix, ".");
        assert_eq!(config.bot.name, "Courier");
        assert!(config.auto_status.seen);
        assert!(!config.auto_status.react);
        assert_eq!(config.api.port, 7860);
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [bot]
            name = "TestBot"
            prefix = "!"

            [auto_status]
            react = true
            "#,
        )
        .unwrap();
        assert_eq!(config.bot.name, "TestBot");
        assert_eq!(config.bot.prefix, "!");
        // Unset sections and fields keep their defaults.
        assert!(config.auto_status.react);
        assert!(config.auto_status.seen);
        assert_eq!(config.store.db_path, "courier.db");
    }

    #[test]
    fn parses_channel_list() {
        let config: Config = toml::from_str(
            r#"
            [bot]
            channels = ["123@newsletter", "456@newsletter"]
            "#,
        )
        .unwrap();
        assert_eq!(config.bot.channels.len(), 2);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let config = load("/nonexistent/courier-test.toml").unwrap();
        assert_eq!(config.bot.prefix, ".");
    }
}
