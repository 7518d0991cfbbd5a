//! Configuration options.
//!
//! This crate is a library component, not a standalone application, but it still needs the
//! toml-backed configuration idiom used elsewhere in this stack: a top-level `RuntimeConfig`
//! loaded once at startup, with per-serde-field defaults so a config file only needs to override
//! what it cares about.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> RuntimeConfig {
    let config_str = fs::read_to_string(path).expect("ERROR: file read failed");
    toml::from_str(&config_str).expect("invalid config file")
}

/// Returns the default configuration.
///
/// ```toml
/// [conntrack]
///     session_chunks = 2048
///     window_chunks = 2048
/// ```
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Top-level runtime configuration.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    /// Connection tracking settings.
    #[serde(default)]
    pub conntrack: ConnTrackConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            conntrack: ConnTrackConfig::default(),
        }
    }
}

/* --------------------------------------------------------------------------------- */

/// Connection tracking options.
///
/// These options tune resource usage vs. accuracy depending on expected traffic volume and
/// attacker behavior (e.g. SYN floods holding open half-open sessions).
///
/// ## Example
/// ```toml
/// [conntrack]
///     session_chunks = 2048
///     window_chunks = 2048
///     timeout_resolution = 1000
///     tcp_inactivity_timeout = 300_000
///     tcp_establish_timeout = 5000
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConnTrackConfig {
    /// Chunks reserved for the session object cache. Defaults to `2048`.
    #[serde(default = "default_session_chunks")]
    pub session_chunks: u32,

    /// Chunks reserved for the per-direction window-state object cache. Defaults to `2048`.
    #[serde(default = "default_window_chunks")]
    pub window_chunks: u32,

    /// Frequency to check for inactive sessions, in logical time units (the packet timestamp's
    /// unit). Defaults to `1000`.
    #[serde(default = "default_timeout_resolution")]
    pub timeout_resolution: u32,

    /// A TCP session can sit inactive for up to this long (logical time units) before it is
    /// force-expired. Defaults to `300_000`.
    #[serde(default = "default_tcp_inactivity_timeout")]
    pub tcp_inactivity_timeout: u32,

    /// Inactivity time between the first and second packet of a TCP session before it is
    /// force-expired. Bounds memory held by half-open sessions from SYN scans and SYN floods.
    /// Defaults to `5000`.
    #[serde(default = "default_tcp_establish_timeout")]
    pub tcp_establish_timeout: u32,
}

impl Default for ConnTrackConfig {
    fn default() -> Self {
        ConnTrackConfig {
            session_chunks: default_session_chunks(),
            window_chunks: default_window_chunks(),
            timeout_resolution: default_timeout_resolution(),
            tcp_inactivity_timeout: default_tcp_inactivity_timeout(),
            tcp_establish_timeout: default_tcp_establish_timeout(),
        }
    }
}

fn default_session_chunks() -> u32 {
    2048
}

fn default_window_chunks() -> u32 {
    2048
}

fn default_timeout_resolution() -> u32 {
    1000
}

fn default_tcp_inactivity_timeout() -> u32 {
    300_000
}

fn default_tcp_establish_timeout() -> u32 {
    5000
}
