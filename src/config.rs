//! # Relay Configuration
//!
//! Tunable parameters for the relay and its WebSocket listener. The rate
//! limit policy lived as constants in earlier iterations of this design; it
//! is deliberately exposed as configuration here, with defaults matching the
//! original deployment.

use std::time::Duration;

use tracing::warn;

use crate::moderation::ModerationPolicy;
use crate::ratelimit::{DEFAULT_RATE_MAX_IN_WINDOW, DEFAULT_RATE_WINDOW};

/// Default listening port when `PORT` is unset.
pub const DEFAULT_PORT: u16 = 3000;

/// Origins allowed to open WebSocket connections.
pub const DEFAULT_ALLOWED_ORIGINS: [&str; 2] = [
    "http://localhost:7788",
    "https://local-organic-worlds.github.io",
];

/// Relay configuration.
///
/// `Default` yields the production values; tests tighten the rate limit or
/// swap the moderation policy as needed.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// TCP port the WebSocket listener binds.
    pub port: u16,
    /// Origin allow-list enforced at the WebSocket handshake. A connection
    /// presenting an Origin header outside this list is refused before the
    /// upgrade completes. Connections without an Origin header (non-browser
    /// clients) are accepted.
    pub allowed_origins: Vec<String>,
    /// Trailing window for per-connection admission control.
    pub rate_window: Duration,
    /// Maximum admitted messages per connection per window.
    pub rate_max_in_window: usize,
    /// What a moderation guard failure resolves to.
    pub moderation_policy: ModerationPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            allowed_origins: DEFAULT_ALLOWED_ORIGINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            rate_window: DEFAULT_RATE_WINDOW,
            rate_max_in_window: DEFAULT_RATE_MAX_IN_WINDOW,
            moderation_policy: ModerationPolicy::default(),
        }
    }
}

impl RelayConfig {
    /// Build the default configuration with the port taken from the `PORT`
    /// environment variable when present. An unparsable value falls back to
    /// [`DEFAULT_PORT`] with a warning rather than failing startup.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("PORT") {
            match raw.parse::<u16>() {
                Ok(port) => config.port = port,
                Err(_) => {
                    warn!(value = %raw, "ignoring unparsable PORT, using default");
                }
            }
        }

        config
    }

    /// True if the given Origin header value may connect.
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == origin)
    }
}
