//! Configuration system.
//!
//! Loads server configuration from JSON strings/files (file IO left to app).

use serde::{Deserialize, Serialize};

/// Root server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1:40000`.
    pub listen_addr: String,
    /// Fixed simulation tick rate.
    #[serde(default = "default_tick_rate")]
    pub tick_rate: u32,
    /// Lowest per-client snapshot rate the server will grant.
    #[serde(default = "default_min_update_rate")]
    pub min_update_rate: u8,
    /// Highest per-client snapshot rate the server will grant.
    #[serde(default = "default_max_update_rate")]
    pub max_update_rate: u8,
    /// Lowest per-client command rate the server will grant.
    #[serde(default = "default_min_cmd_rate")]
    pub min_cmd_rate: u8,
    /// Highest per-client command rate the server will grant.
    #[serde(default = "default_max_cmd_rate")]
    pub max_cmd_rate: u8,
    /// Connection attempts beyond this count are refused outright.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Shared verification password checked in the hello handshake.
    #[serde(default)]
    pub password: String,
    /// How many sent frames are retained per client as delta baselines.
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,
    /// Seconds of silence after which a verified client is dropped.
    /// `None` disables the timer; liveness is then left to the transport.
    #[serde(default)]
    pub idle_timeout_secs: Option<f64>,
}

fn default_tick_rate() -> u32 {
    60
}

fn default_min_update_rate() -> u8 {
    1
}

fn default_max_update_rate() -> u8 {
    60
}

fn default_min_cmd_rate() -> u8 {
    1
}

fn default_max_cmd_rate() -> u8 {
    60
}

fn default_max_clients() -> usize {
    16
}

fn default_history_depth() -> usize {
    128
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:40000".to_string(),
            tick_rate: default_tick_rate(),
            min_update_rate: default_min_update_rate(),
            max_update_rate: default_max_update_rate(),
            min_cmd_rate: default_min_cmd_rate(),
            max_cmd_rate: default_max_cmd_rate(),
            max_clients: default_max_clients(),
            password: String::new(),
            history_depth: default_history_depth(),
            idle_timeout_secs: None,
        }
    }
}

impl ServerConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Clamps a requested snapshot rate into the permitted range. Zero or
    /// inverted bounds from a config file are repaired, never panicked on.
    pub fn clamp_update_rate(&self, requested: u8) -> u8 {
        clamp_rate(requested, self.min_update_rate, self.max_update_rate)
    }

    /// Clamps a requested command rate into the permitted range.
    pub fn clamp_cmd_rate(&self, requested: u8) -> u8 {
        clamp_rate(requested, self.min_cmd_rate, self.max_cmd_rate)
    }
}

/// A rate of zero is never granted, and `hi` is lifted to `lo` when the
/// configured bounds are inverted so the clamp stays well-formed.
fn clamp_rate(requested: u8, lo: u8, hi: u8) -> u8 {
    let lo = lo.max(1);
    let hi = hi.max(lo);
    requested.clamp(lo, hi)
}
