//! Configuration resolution for xraymgr.
//!
//! Resolution order (lowest to highest priority):
//! 1. Built-in defaults matching the stock two-slot deployment
//! 2. Optional TOML file (`--config` / `XRAYMGR_CONFIG`)
//! 3. Environment variables (`XRAY_*`, `SESSIONS_WINDOW_SEC`, `BOT_NOTIFY_URL`)
//! 4. CLI arguments, applied by the binary

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete xraymgr configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub proxy: ProxyConfig,
    pub slots: SlotsConfig,
    pub links: LinkConfig,
    pub sessions: SessionConfig,
    pub traffic: TrafficConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/xraymgr/users.db"),
        }
    }
}

/// The proxy binary and the base configuration template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Path (or PATH-resolvable name) of the xray binary.
    pub bin: PathBuf,
    /// Base configuration every slot config is synthesized from.
    pub template_path: PathBuf,
    /// Tag of the VLESS/Reality inbound carrying the client allow-list.
    pub reality_tag: String,
    /// Tag of the management API inbound.
    pub api_tag: String,
    /// Upper bound for `xray -test -config`.
    pub validate_timeout_secs: u64,
    /// Upper bound for one `xray api stats` invocation.
    pub stats_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("xray"),
            template_path: PathBuf::from("/usr/local/etc/xray/config.json"),
            reality_tag: "vless-in".to_string(),
            api_tag: "api-in".to_string(),
            validate_timeout_secs: 10,
            stats_timeout_secs: 2,
        }
    }
}

/// One deployment slot. All fields are required when a slot is overridden.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotConfig {
    /// Service unit restarted for this slot.
    pub unit: String,
    pub config_path: PathBuf,
    pub access_log: PathBuf,
    pub error_log: PathBuf,
    /// Data-plane listen port (127.0.0.1).
    pub data_port: u16,
    /// Management API listen port (127.0.0.1).
    pub api_port: u16,
}

impl SlotConfig {
    pub fn default_a() -> Self {
        Self {
            unit: "xray-a".to_string(),
            config_path: PathBuf::from("/etc/xray/config-a.json"),
            access_log: PathBuf::from("/var/log/xray/access-a.log"),
            error_log: PathBuf::from("/var/log/xray/error-a.log"),
            data_port: 10000,
            api_port: 10085,
        }
    }

    pub fn default_b() -> Self {
        Self {
            unit: "xray-b".to_string(),
            config_path: PathBuf::from("/etc/xray/config-b.json"),
            access_log: PathBuf::from("/var/log/xray/access-b.log"),
            error_log: PathBuf::from("/var/log/xray/error-b.log"),
            data_port: 10001,
            api_port: 10086,
        }
    }
}

/// Blue/green slot layout and switch timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotsConfig {
    /// Durable pointer holding the active slot letter.
    pub marker_path: PathBuf,
    pub a: SlotConfig,
    pub b: SlotConfig,
    pub readiness_attempts: u32,
    pub readiness_backoff_ms: u64,
    /// Connect timeout of a single readiness probe.
    pub probe_timeout_ms: u64,
    /// Upper bound for one service restart.
    pub restart_timeout_secs: u64,
    /// Command run with the slot letter appended once the idle slot is
    /// healthy, before the marker flips (e.g. `["/usr/local/bin/xray-promote"]`).
    pub promote_hook: Option<Vec<String>>,
}

impl Default for SlotsConfig {
    fn default() -> Self {
        Self {
            marker_path: PathBuf::from("/var/lib/xraymgr/active_slot"),
            a: SlotConfig::default_a(),
            b: SlotConfig::default_b(),
            readiness_attempts: 30,
            readiness_backoff_ms: 200,
            probe_timeout_ms: 1000,
            restart_timeout_secs: 30,
            promote_hook: None,
        }
    }
}

/// Client-facing link parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub domain: String,
    /// Public Reality port advertised in connection links.
    pub public_port: u16,
    /// Port of the HTTPS front serving subscriptions.
    pub sub_port: u16,
    /// Path prefix the front uses for subscription URLs (empty for none).
    pub sub_prefix: String,
    /// Label used when a caller does not provide a usable name.
    pub default_name: String,
    /// Fallbacks when the template lacks Reality parameters.
    pub reality_sni: Option<String>,
    pub reality_sid: Option<String>,
    pub reality_pbk: Option<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            public_port: 443,
            sub_port: 8443,
            sub_prefix: "api".to_string(),
            default_name: "xray".to_string(),
            reality_sni: None,
            reality_sid: None,
            reality_pbk: None,
        }
    }
}

/// Log tailing and multi-session enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Default sliding window (seconds).
    pub window_secs: u64,
    /// Background tail cycle interval (seconds).
    pub interval_secs: u64,
    /// Rotate offenders from the background loop.
    pub auto_kick: bool,
    pub min_sessions: u32,
    pub distinct_ips_min: u32,
    /// Minimum spacing between two kicks of the same secret.
    pub kick_cooldown_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_secs: 45,
            interval_secs: 3,
            auto_kick: false,
            min_sessions: 2,
            distinct_ips_min: 2,
            kick_cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    pub interval_secs: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

/// Outbound webhook towards the bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// `None` disables notifications.
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            url: Some("http://127.0.0.1:8081/notify".to_string()),
            timeout_secs: 5,
        }
    }
}

/// Load configuration: defaults, then the optional TOML file, then the
/// process environment.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) => load_config_file(p)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    Ok(toml::from_str(&content)?)
}

/// Apply environment overrides through `lookup`, so tests can feed a map
/// instead of mutating the process environment.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(v) = get("XRAY_BIN") {
        config.proxy.bin = PathBuf::from(v);
    }
    if let Some(v) = get("XRAY_CONF") {
        config.proxy.template_path = PathBuf::from(v);
    }
    if let Some(v) = get("XRAY_REALITY_TAG") {
        config.proxy.reality_tag = v;
    }
    if let Some(v) = get("XRAY_DB") {
        config.database.path = PathBuf::from(v);
    }
    if let Some(v) = get("XRAY_DOMAIN") {
        config.links.domain = v;
    }
    if let Some(n) = get("XRAY_SUB_PORT").and_then(|v| v.parse().ok()) {
        config.links.sub_port = n;
    }
    if let Some(n) = get("XRAY_REALITY_PORT").and_then(|v| v.parse().ok()) {
        config.links.public_port = n;
    }
    if let Some(v) = lookup("XRAY_SUB_PREFIX") {
        config.links.sub_prefix = v.trim().trim_matches('/').to_string();
    }
    if let Some(v) = get("XRAY_REALITY_PBK") {
        config.links.reality_pbk = Some(v);
    }
    if let Some(v) = get("XRAY_REALITY_SNI") {
        config.links.reality_sni = Some(v);
    }
    if let Some(v) = get("XRAY_REALITY_SID") {
        config.links.reality_sid = Some(v);
    }
    if let Some(n) = get("SESSIONS_WINDOW_SEC").and_then(|v| v.parse().ok()) {
        config.sessions.window_secs = n;
    }
    if let Some(v) = get("BOT_NOTIFY_URL") {
        config.notify.url = Some(v);
    }
}
