//! Environment-driven configuration for sessions and the relay server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Grace period before an empty session is torn down
pub const DEFAULT_EXPIRY_GRACE: Duration = Duration::from_millis(1000);

/// Client-side session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a session may report zero participants before it expires.
    /// Absorbs transient resubscription flicker.
    pub expiry_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_grace: DEFAULT_EXPIRY_GRACE,
        }
    }
}

impl SessionConfig {
    /// Load config from environment variables
    pub fn from_env() -> Self {
        let expiry_grace = env_parse::<u64>("SESSION_EXPIRY_GRACE_MS")
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_EXPIRY_GRACE);

        Self { expiry_grace }
    }
}

/// Relay server settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Directory with UI assets to serve as fallback (None = API only)
    pub static_dir: Option<PathBuf>,
    /// Whether broadcasts are echoed back to the sender
    pub broadcast_self: bool,
    /// How often dead subscribers are swept
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 4000)),
            static_dir: None,
            broadcast_self: false,
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl RelayConfig {
    /// Load config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_addr = match std::env::var("RELAY_BIND_ADDR") {
            Ok(raw) => raw.trim().parse().unwrap_or_else(|e| {
                tracing::warn!(
                    "Invalid RELAY_BIND_ADDR {:?}: {}, using {}",
                    raw,
                    e,
                    defaults.bind_addr
                );
                defaults.bind_addr
            }),
            Err(_) => defaults.bind_addr,
        };

        let static_dir = std::env::var("RELAY_STATIC_DIR")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let broadcast_self = std::env::var("RELAY_BROADCAST_SELF")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.broadcast_self);

        let sweep_interval = env_parse::<u64>("RELAY_SWEEP_INTERVAL_MS")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.sweep_interval);

        Self {
            bind_addr,
            static_dir,
            broadcast_self,
            sweep_interval,
        }
    }
}

/// Where a file-backed identity is kept, if configured
pub fn identity_path_from_env() -> Option<PathBuf> {
    std::env::var("IDENTITY_PATH")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}
