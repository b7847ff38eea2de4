//! Configuration and settings management
//!
//! Loads settings from config files and environment variables and defines
//! runtime constants.

use crate::matrix::UserId;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

/// Application settings loaded from config files and environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Unix socket the agent process listens on
    #[serde(default = "default_agent_socket_path")]
    pub agent_socket_path: String,

    /// How long a text message waits for a following image/file (ms)
    #[serde(default = "default_aggregation_window_ms")]
    pub aggregation_window_ms: u64,

    /// Maximum size of one IPC frame in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Matrix user ID of the bridge itself; its own messages are ignored
    pub bot_user_id: Option<String>,

    /// Comma-separated list of Matrix user IDs allowed to talk to the agent.
    /// Everyone is allowed when unset.
    #[serde(rename = "allowed_users")]
    pub allowed_users_str: Option<String>,
}

fn default_agent_socket_path() -> String {
    "/tmp/matrix-agent.sock".to_string()
}

const fn default_aggregation_window_ms() -> u64 {
    3000
}

const fn default_max_frame_bytes() -> usize {
    crate::ipc::codec::DEFAULT_MAX_FRAME_BYTES
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agent_socket_path: default_agent_socket_path(),
            aggregation_window_ms: default_aggregation_window_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            bot_user_id: None,
            allowed_users_str: None,
        }
    }
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use matrix_agent_bridge::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Local overrides, not checked into git
            .add_source(File::with_name("config/local").required(false))
            // Eg. `APP__AGGREGATION_WINDOW_MS=1500`
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Plain UPPER_SNAKE_CASE variables; empty values count as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }

    /// Aggregation window as a `Duration`
    #[must_use]
    pub const fn aggregation_window(&self) -> Duration {
        Duration::from_millis(self.aggregation_window_ms)
    }

    /// Returns the set of Matrix users allowed to use the bridge
    ///
    /// `None` when `allowed_users` is unset or blank, meaning no restriction.
    /// A configured list keeps only well-formed `@user:server` IDs; if none
    /// survive, the set is empty and nobody is allowed.
    #[must_use]
    pub fn allowed_users(&self) -> Option<HashSet<UserId>> {
        let raw = self
            .allowed_users_str
            .as_deref()
            .filter(|s| !s.trim().is_empty())?;

        let users: HashSet<UserId> = raw
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .filter(|token| {
                let valid = token.starts_with('@') && token.contains(':');
                if !valid {
                    warn!("Ignoring malformed entry in allowed_users: {:?}", token);
                }
                valid
            })
            .map(UserId::from)
            .collect();

        if users.is_empty() {
            warn!("allowed_users has no valid Matrix user IDs, denying everyone");
        }
        Some(users)
    }

    /// The bridge's own user ID, if configured
    #[must_use]
    pub fn bot_user(&self) -> Option<UserId> {
        self.bot_user_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(UserId::from)
    }
}

/// Initial delay between agent connection attempts
pub const AGENT_CONNECT_INITIAL_BACKOFF_MS: u64 = 100;
/// Upper bound for the delay between agent connection attempts
pub const AGENT_CONNECT_MAX_BACKOFF_MS: u64 = 5_000;
/// Number of agent connection retries before giving up
pub const AGENT_CONNECT_MAX_RETRIES: usize = 10;
/// Buffered agent responses awaiting relay
pub const AGENT_RESPONSE_CHANNEL_CAPACITY: usize = 256;
/// Buffered incoming Matrix events awaiting dispatch
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Cooldown period (seconds) between "Access Denied" notices for same user.
/// Default: 20 minutes.
pub const UNAUTHORIZED_COOLDOWN_SECS: u64 = 1200;
/// Maximum cache capacity (number of entries).
pub const UNAUTHORIZED_CACHE_MAX_SIZE: u64 = 10_000;

/// Get unauthorized cooldown from env or default.
///
/// Environment variable: `UNAUTHORIZED_COOLDOWN_SECS`.
#[must_use]
pub fn get_unauthorized_cooldown() -> u64 {
    std::env::var("UNAUTHORIZED_COOLDOWN_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(UNAUTHORIZED_COOLDOWN_SECS)
}

/// Get unauthorized cache max size from env or default.
///
/// Environment variable: `UNAUTHORIZED_CACHE_MAX_SIZE`.
#[must_use]
pub fn get_unauthorized_cache_max_size() -> u64 {
    std::env::var("UNAUTHORIZED_CACHE_MAX_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(UNAUTHORIZED_CACHE_MAX_SIZE)
}
