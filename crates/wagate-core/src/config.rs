use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::GatewayError;

/// Top-level gateway configuration.
///
/// Loaded from a TOML file; a handful of environment variables override
/// file values for container deployments (`PORT`, `WHATSAPP_SESSION_ID`,
/// `APP_URL`, `WAGATE_DB`, `IMAGEKIT_PUBLIC_KEY`, `IMAGEKIT_PRIVATE_KEY`,
/// `IMAGEKIT_URL_ENDPOINT`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    pub imagekit: Option<ImageKitConfig>,
}

/// Downstream webhooks for the rate-update workflows.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhooksConfig {
    /// Receives rate-package / bank-rates / interest-rate payloads.
    #[serde(default)]
    pub rate_update_url: Option<String>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public base URL of this deployment, used by the self-ping task.
    #[serde(default)]
    pub app_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            app_url: None,
        }
    }
}

/// General gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_session_id")]
    pub session_id: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            session_id: default_session_id(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Entity store settings.
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

/// Browser-automation sidecar settings.
///
/// The sidecar owns the headless browser and the on-disk session at
/// `{data_dir}/session` and `{data_dir}/chrome-profile`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_url")]
    pub base_url: String,
    /// Long-poll window for the event feed, seconds.
    #[serde(default = "default_event_poll_secs")]
    pub event_poll_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: default_bridge_url(),
            event_poll_secs: default_event_poll_secs(),
        }
    }
}

/// Human-behavior pacing parameters. Defaults mirror production tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    #[serde(default = "default_hourly_cap")]
    pub hourly_cap: u32,
    #[serde(default = "default_daily_cap")]
    pub daily_cap: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_read_delay")]
    pub read_delay_ms: DelayRange,
    #[serde(default = "default_response_delay")]
    pub response_delay_ms: DelayRange,
    #[serde(default = "default_typing_delay")]
    pub typing_ms: DelayRange,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            hourly_cap: default_hourly_cap(),
            daily_cap: default_daily_cap(),
            cooldown_ms: default_cooldown_ms(),
            read_delay_ms: default_read_delay(),
            response_delay_ms: default_response_delay(),
            typing_ms: default_typing_delay(),
        }
    }
}

/// Inclusive millisecond range for a randomized delay.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DelayRange {
    pub min: u64,
    pub max: u64,
}

impl DelayRange {
    pub fn min_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.min)
    }

    pub fn max_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.max)
    }
}

/// ImageKit CDN credentials. Absent ⇒ the upload endpoint returns 503.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageKitConfig {
    pub public_key: String,
    pub private_key: String,
    pub url_endpoint: String,
}

fn default_port() -> u16 {
    3000
}
fn default_session_id() -> String {
    "wagate".to_string()
}
fn default_data_dir() -> String {
    "~/.wagate".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_db_path() -> String {
    "~/.wagate/wagate.db".to_string()
}
fn default_bridge_url() -> String {
    "http://127.0.0.1:3001".to_string()
}
fn default_event_poll_secs() -> u64 {
    25
}
fn default_hourly_cap() -> u32 {
    80
}
fn default_daily_cap() -> u32 {
    500
}
fn default_cooldown_ms() -> u64 {
    250
}
fn default_read_delay() -> DelayRange {
    DelayRange {
        min: 2_000,
        max: 15_000,
    }
}
fn default_response_delay() -> DelayRange {
    DelayRange {
        min: 1_000,
        max: 10_000,
    }
}
fn default_typing_delay() -> DelayRange {
    DelayRange {
        min: 1_000,
        max: 5_000,
    }
}

/// Load configuration from a TOML file, then apply environment overrides.
///
/// A missing file yields the defaults; a malformed file is an error.
pub fn load(path: &str) -> Result<Config, GatewayError> {
    let mut cfg = if Path::new(path).exists() {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("failed to read {path}: {e}")))?;
        toml::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("failed to parse {path}: {e}")))?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(port) = std::env::var("PORT") {
        if let Ok(port) = port.parse() {
            cfg.server.port = port;
        }
    }
    if let Ok(session_id) = std::env::var("WHATSAPP_SESSION_ID") {
        if !session_id.is_empty() {
            cfg.gateway.session_id = session_id;
        }
    }
    if let Ok(url) = std::env::var("APP_URL") {
        if !url.is_empty() {
            cfg.server.app_url = Some(url);
        }
    }
    if let Ok(db) = std::env::var("WAGATE_DB") {
        if !db.is_empty() {
            cfg.store.db_path = db;
        }
    }

    let ik_public = std::env::var("IMAGEKIT_PUBLIC_KEY").ok().filter(|s| !s.is_empty());
    let ik_private = std::env::var("IMAGEKIT_PRIVATE_KEY").ok().filter(|s| !s.is_empty());
    let ik_endpoint = std::env::var("IMAGEKIT_URL_ENDPOINT").ok().filter(|s| !s.is_empty());
    if let (Some(public_key), Some(private_key), Some(url_endpoint)) =
        (ik_public, ik_private, ik_endpoint)
    {
        cfg.imagekit = Some(ImageKitConfig {
            public_key,
            private_key,
            url_endpoint,
        });
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_tuning() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.behavior.hourly_cap, 80);
        assert_eq!(cfg.behavior.daily_cap, 500);
        assert_eq!(cfg.behavior.cooldown_ms, 250);
        assert_eq!(cfg.behavior.read_delay_ms.min, 2_000);
        assert_eq!(cfg.behavior.read_delay_ms.max, 15_000);
        assert!(cfg.imagekit.is_none());
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            port = 8080

            [behavior]
            hourly_cap = 10
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.behavior.hourly_cap, 10);
        // Unspecified sections fall back to defaults.
        assert_eq!(cfg.behavior.daily_cap, 500);
        assert_eq!(cfg.gateway.session_id, "wagate");
    }

    #[test]
    fn shellexpand_home() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(shellexpand("~/x/y"), "/home/tester/x/y");
        assert_eq!(shellexpand("/abs/path"), "/abs/path");
    }
}
