//! Konfiguration über Umgebungsvariablen
//!
//! Relay und Client lesen ihre Einstellungen ausschließlich aus der
//! Umgebung. Fehlende Variablen fallen auf Defaults zurück, ungültige
//! Werte sind ein Fehler.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_RELAY_ADDR: &str = "0.0.0.0:8787";
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8787";

/// Öffentliche Google STUN Server
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

// ============================================================================
// RELAY
// ============================================================================

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Zeit bis zum Auth-Frame nach dem WebSocket-Upgrade
    pub auth_timeout: Duration,
    /// Maximale Abweichung des Auth-Timestamps von der Serverzeit
    pub auth_max_skew: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8787)),
            auth_timeout: Duration::from_secs(10),
            auth_max_skew: Duration::from_secs(60),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bind_addr: parse_or("PULSE_RELAY_ADDR", &lookup, defaults.bind_addr)?,
            auth_timeout: secs_or("PULSE_AUTH_TIMEOUT_SECS", &lookup, defaults.auth_timeout)?,
            auth_max_skew: secs_or("PULSE_AUTH_MAX_SKEW_SECS", &lookup, defaults.auth_max_skew)?,
        })
    }
}

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub signaling_url: Url,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    /// `None` = App-Datenverzeichnis
    pub key_path: Option<PathBuf>,
    pub stun_servers: Vec<String>,
    pub heartbeat_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: Url::parse(DEFAULT_SIGNALING_URL)
                .expect("default signaling url is valid"),
            display_name: "anonymous".to_string(),
            avatar_ref: None,
            key_path: None,
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            heartbeat_interval: Duration::from_secs(25),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let signaling_url = match lookup("SIGNALING_URL") {
            Some(raw) => parse_signaling_url(&raw)?,
            None => defaults.signaling_url,
        };

        let stun_servers = match lookup("PULSE_STUN_SERVERS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.stun_servers,
        };

        Ok(Self {
            signaling_url,
            display_name: lookup("PULSE_DISPLAY_NAME").unwrap_or(defaults.display_name),
            avatar_ref: lookup("PULSE_AVATAR_REF").filter(|s| !s.is_empty()),
            key_path: lookup("PULSE_KEY_PATH").map(PathBuf::from),
            stun_servers,
            heartbeat_interval: secs_or(
                "PULSE_HEARTBEAT_SECS",
                &lookup,
                defaults.heartbeat_interval,
            )?,
        })
    }
}

/// Akzeptiert ws(s):// und http(s)://, letzteres wird umgeschrieben
fn parse_signaling_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: "SIGNALING_URL",
        value: raw.to_string(),
        reason,
    };

    let mut url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot change scheme".to_string()))?;
    Ok(url)
}

fn parse_or<T>(
    key: &'static str,
    lookup: &impl Fn(&str) -> Option<String>,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn secs_or(
    key: &'static str,
    lookup: &impl Fn(&str) -> Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or::<u64>(key, lookup, default.as_secs()).map(Duration::from_secs)
}

// ============================================================================
// TESTS
// ============================================================================
