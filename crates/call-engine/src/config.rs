use std::env;
use std::time::Duration;

use crate::ice::IceServer;

const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
const DEFAULT_DISCONNECT_GRACE_MS: u64 = 2_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 2;
const DEFAULT_STATS_INTERVAL_MS: u64 = 1_000;
const DEFAULT_CREDENTIAL_MAX_AGE_SECS: u64 = 50 * 60;

/// Call-level policy knobs. `Default` carries the documented policy
/// constants; [`CallConfig::from_env`] overlays `CALL_*` overrides.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Servers used when no credential source is configured or the
    /// source fails.
    pub ice_servers: Vec<IceServer>,
    /// How long a `Disconnected` report may stand before a restart.
    pub disconnect_grace: Duration,
    /// Watchdog bound on reaching `Connected` after negotiation starts.
    pub connect_timeout: Duration,
    /// Restart budget per outage; the counter resets once the
    /// connection recovers.
    pub max_restart_attempts: u32,
    /// Transport stats sampling cadence for the quality signal.
    pub stats_interval: Duration,
    /// Relay credentials older than this are refreshed before the next
    /// negotiation.
    pub credential_max_age: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
            disconnect_grace: Duration::from_millis(DEFAULT_DISCONNECT_GRACE_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            max_restart_attempts: DEFAULT_MAX_RESTART_ATTEMPTS,
            stats_interval: Duration::from_millis(DEFAULT_STATS_INTERVAL_MS),
            credential_max_age: Duration::from_secs(DEFAULT_CREDENTIAL_MAX_AGE_SECS),
        }
    }
}

impl CallConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ice_servers: defaults.ice_servers,
            disconnect_grace: env_millis("CALL_DISCONNECT_GRACE_MS")
                .unwrap_or(defaults.disconnect_grace),
            connect_timeout: env_millis("CALL_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout),
            max_restart_attempts: env::var("CALL_MAX_RESTART_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_restart_attempts),
            stats_interval: env_millis("CALL_STATS_INTERVAL_MS")
                .unwrap_or(defaults.stats_interval),
            credential_max_age: env::var("CALL_CREDENTIAL_MAX_AGE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.credential_max_age),
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}
