//! Runtime configuration, read once from the environment at startup.
//!
//! Production injects env vars directly; dev loads `.env.local` via dotenvy
//! in `main.rs` before this module is consulted.

use std::net::SocketAddr;
use std::time::Duration;

pub const ENV_DAEMON_ADDR: &str = "SOVD_DAEMON_ADDR";
pub const ENV_TOKEN_SECRET: &str = "SOVD_TOKEN_SECRET";
pub const ENV_EXECUTE_TIMEOUT_SECS: &str = "SOVD_EXECUTE_TIMEOUT_SECS";
pub const ENV_WS_SEND_BUFFER: &str = "SOVD_WS_SEND_BUFFER";
pub const ENV_WS_IDLE_TIMEOUT_SECS: &str = "SOVD_WS_IDLE_TIMEOUT_SECS";
pub const ENV_PUBLIC_WS_BASE: &str = "SOVD_PUBLIC_WS_BASE";

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Hard wall-clock budget for one connector run.
    pub execute_timeout: Duration,
    /// Per-socket send buffer bound: sizes each stream channel's broadcast
    /// buffer; a subscriber further behind than this is closed with 1013.
    pub ws_send_buffer: usize,
    /// Idle cutoff for a stream socket with no traffic in either direction.
    pub ws_idle_timeout: Duration,
    /// Externally visible base for `stream_url`, e.g. `wss://diag.example.com`.
    pub public_ws_base: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            execute_timeout: Duration::from_secs(30),
            ws_send_buffer: sovd_bus::DEFAULT_CHANNEL_CAPACITY,
            ws_idle_timeout: Duration::from_secs(300),
            public_ws_base: "ws://127.0.0.1:8899".to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            execute_timeout: secs_from_env(ENV_EXECUTE_TIMEOUT_SECS)
                .unwrap_or(defaults.execute_timeout),
            ws_send_buffer: usize_from_env(ENV_WS_SEND_BUFFER)
                .unwrap_or(defaults.ws_send_buffer),
            ws_idle_timeout: secs_from_env(ENV_WS_IDLE_TIMEOUT_SECS)
                .unwrap_or(defaults.ws_idle_timeout),
            public_ws_base: std::env::var(ENV_PUBLIC_WS_BASE)
                .unwrap_or(defaults.public_ws_base),
        }
    }
}

fn secs_from_env(var: &str) -> Option<Duration> {
    std::env::var(var).ok()?.parse::<u64>().ok().map(Duration::from_secs)
}

fn usize_from_env(var: &str) -> Option<usize> {
    std::env::var(var).ok()?.parse().ok()
}

pub fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var(ENV_DAEMON_ADDR).ok()?.parse().ok()
}
