//! Client configuration.
//!
//! All settings are clamped into their legal ranges at construction,
//! so the rest of the crate never re-validates them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeout bounds, in seconds.
pub const MIN_TIMEOUT: u64 = 1;
pub const MAX_TIMEOUT: u64 = 900;

/// Heartbeat interval bounds, in seconds.
pub const MIN_HEARTBEAT: u64 = 1;
pub const MAX_HEARTBEAT: u64 = 86_400;

/// Default ceiling for cached extended-query text, in characters.
pub const DEFAULT_CACHE_CEILING: usize = 256;

/// Per-database operation timeouts.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Settings {
    /// How long to wait for a new connection to open.
    pub connect_timeout: u64, // seconds
    /// How long to wait for the server to send data.
    pub receive_timeout: u64, // seconds
    /// How long to wait for the socket to accept data.
    pub send_timeout: u64, // seconds
    /// How long to wait for an idle connection to be returned.
    pub wait_timeout: u64, // seconds
    /// Don't cache extended-query text longer than this, in
    /// characters. 0 disables caching.
    pub max_cached_statement_len: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_timeout: 15,
            receive_timeout: 30,
            send_timeout: 30,
            wait_timeout: 30,
            max_cached_statement_len: DEFAULT_CACHE_CEILING,
        }
    }
}

impl Settings {
    /// Clamp every timeout into its legal range.
    pub fn clamped(mut self) -> Self {
        self.connect_timeout = self.connect_timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT);
        self.receive_timeout = self.receive_timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT);
        self.send_timeout = self.send_timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT);
        self.wait_timeout = self.wait_timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout)
    }
}

/// Per-node timeout overrides. Zero means inherit
/// the owning database's setting.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Overrides {
    pub connect_timeout: u64, // seconds
    pub receive_timeout: u64, // seconds
    pub send_timeout: u64,    // seconds
    pub wait_timeout: u64,    // seconds
}

impl Overrides {
    /// Resolve the effective settings for a node: each override wins
    /// when set, otherwise the database's setting applies. The result
    /// is clamped either way.
    pub fn resolve(&self, base: &Settings) -> Settings {
        fn pick(over: u64, base: u64) -> u64 {
            if over == 0 {
                base
            } else {
                over
            }
        }

        Settings {
            connect_timeout: pick(self.connect_timeout, base.connect_timeout),
            receive_timeout: pick(self.receive_timeout, base.receive_timeout),
            send_timeout: pick(self.send_timeout, base.send_timeout),
            wait_timeout: pick(self.wait_timeout, base.wait_timeout),
            max_cached_statement_len: base.max_cached_statement_len,
        }
        .clamped()
    }
}

/// Clamp the server connection quota proportion into (0, 1].
pub fn clamp_proportion(proportion: f64) -> f64 {
    if proportion <= 0.0 || proportion > 1.0 {
        1.0
    } else {
        proportion
    }
}

/// Clamp the heartbeat interval into [1, 86400] seconds.
pub fn clamp_heartbeat(seconds: u64) -> u64 {
    seconds.clamp(MIN_HEARTBEAT, MAX_HEARTBEAT)
}
