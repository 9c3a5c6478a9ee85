//! Room controller configuration.
//!
//! Configuration is loaded from environment variables with sensible
//! defaults; `from_vars` takes a plain map so tests can exercise the
//! parsing without touching the process environment.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default signaling bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:7700";

/// Default maximum concurrent rooms per controller instance.
pub const DEFAULT_MAX_ROOMS: u32 = 500;

/// Default maximum participants per room when the creator does not say.
pub const DEFAULT_MAX_PARTICIPANTS: u32 = 50;

/// Default participant disconnect grace period in seconds.
pub const DEFAULT_DISCONNECT_GRACE_SECONDS: u64 = 30;

/// Default grace period before an empty room ends, in seconds.
pub const DEFAULT_EMPTY_ROOM_GRACE_SECONDS: u64 = 60;

/// Default idle timeout for signaling connections in seconds.
pub const DEFAULT_CONNECTION_IDLE_SECONDS: u64 = 300;

/// Room controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Signaling server bind address (default: "0.0.0.0:7700").
    pub bind_address: String,

    /// Maximum concurrent rooms this controller can host.
    pub max_rooms: u32,

    /// Cap applied to per-room participant limits chosen at creation.
    pub max_participants: u32,

    /// How long a dropped participant may reconnect before removal.
    pub disconnect_grace: Duration,

    /// How long an empty room lingers before it ends.
    pub empty_room_grace: Duration,

    /// Idle timeout after which a silent connection is closed.
    pub connection_idle_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("QUORUM_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let max_rooms = parse_u64(vars, "QUORUM_MAX_ROOMS", u64::from(DEFAULT_MAX_ROOMS))? as u32;
        let max_participants = parse_u64(
            vars,
            "QUORUM_MAX_PARTICIPANTS",
            u64::from(DEFAULT_MAX_PARTICIPANTS),
        )? as u32;

        let disconnect_grace = Duration::from_secs(parse_u64(
            vars,
            "QUORUM_DISCONNECT_GRACE_SECONDS",
            DEFAULT_DISCONNECT_GRACE_SECONDS,
        )?);
        let empty_room_grace = Duration::from_secs(parse_u64(
            vars,
            "QUORUM_EMPTY_ROOM_GRACE_SECONDS",
            DEFAULT_EMPTY_ROOM_GRACE_SECONDS,
        )?);
        let connection_idle_timeout = Duration::from_secs(parse_u64(
            vars,
            "QUORUM_CONNECTION_IDLE_SECONDS",
            DEFAULT_CONNECTION_IDLE_SECONDS,
        )?);

        Ok(Self {
            bind_address,
            max_rooms,
            max_participants,
            disconnect_grace,
            empty_room_grace,
            connection_idle_timeout,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            max_rooms: DEFAULT_MAX_ROOMS,
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            disconnect_grace: Duration::from_secs(DEFAULT_DISCONNECT_GRACE_SECONDS),
            empty_room_grace: Duration::from_secs(DEFAULT_EMPTY_ROOM_GRACE_SECONDS),
            connection_idle_timeout: Duration::from_secs(DEFAULT_CONNECTION_IDLE_SECONDS),
        }
    }
}

fn parse_u64(
    vars: &HashMap<String, String>,
    key: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.clone(),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.max_rooms, DEFAULT_MAX_ROOMS);
        assert_eq!(
            config.disconnect_grace,
            Duration::from_secs(DEFAULT_DISCONNECT_GRACE_SECONDS)
        );
    }

    #[test]
    fn test_overrides() {
        let mut vars = HashMap::new();
        vars.insert("QUORUM_BIND_ADDRESS".to_string(), "127.0.0.1:9".to_string());
        vars.insert("QUORUM_MAX_ROOMS".to_string(), "3".to_string());
        vars.insert(
            "QUORUM_DISCONNECT_GRACE_SECONDS".to_string(),
            "5".to_string(),
        );

        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:9");
        assert_eq!(config.max_rooms, 3);
        assert_eq!(config.disconnect_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_value_rejected() {
        let mut vars = HashMap::new();
        vars.insert("QUORUM_MAX_ROOMS".to_string(), "many".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
