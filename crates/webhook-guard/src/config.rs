use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default reservation and lock lease length.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default pause before re-reading state after losing the lock race.
pub const DEFAULT_CONTENTION_WAIT: Duration = Duration::from_secs(1);

/// Guard settings.
///
/// Deserializes from whole seconds / milliseconds so it can sit inside an
/// application config file:
///
/// ```toml
/// [webhook_guard]
/// default_timeout_secs = 120
/// contention_wait_ms = 250
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Bounds the reservation window and the lock lease. Not a handler
    /// run-time limit.
    #[serde(rename = "default_timeout_secs", with = "secs")]
    pub default_timeout: Duration,

    /// One wait, then one re-read, after `try_lock` comes back empty.
    #[serde(rename = "contention_wait_ms", with = "millis")]
    pub contention_wait: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            contention_wait: DEFAULT_CONTENTION_WAIT,
        }
    }
}

impl GuardConfig {
    /// The timeout to use for one call. Zero means "use the default".
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => self.default_timeout,
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
