//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening socket and worker process settings.
    pub listener: ListenerConfig,

    /// Wire-protocol limits.
    pub protocol: ProtocolConfig,

    /// Idle connection reaper.
    pub reaper: ReaperConfig,

    /// Graceful drain on shutdown.
    pub drain: DrainConfig,

    /// Hot reload settings.
    pub reload: ReloadConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Include error detail in 500 responses.
    pub debug: bool,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Listen backlog passed to `listen(2)`.
    pub backlog: i32,

    /// Number of worker processes sharing the socket.
    pub workers: usize,

    /// Maximum concurrent connections per worker (backpressure).
    pub max_connections: usize,

    /// Set SO_REUSEPORT on the shared socket.
    pub reuse_port: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            backlog: 1024,
            workers: 1,
            max_connections: 10_000,
            reuse_port: false,
        }
    }
}

/// Per-connection protocol limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Largest request line + headers accepted, in bytes.
    pub max_head_size: usize,

    /// Largest Content-Length accepted, in bytes.
    pub max_body_size: usize,

    /// Parsed-but-unwritten requests allowed per connection before reading pauses.
    pub pipeline_depth: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_head_size: 8 * 1024,
            max_body_size: 2 * 1024 * 1024, // 2MB
            pipeline_depth: 16,
        }
    }
}

/// Idle connection reaper configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Enable the reaper.
    pub enabled: bool,

    /// Sweep period in seconds.
    pub check_interval_secs: u64,

    /// Idle time after which a connection with an empty pipeline is closed.
    pub idle_timeout_secs: u64,
}

impl ReaperConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 5,
            idle_timeout_secs: 60,
        }
    }
}

/// Graceful drain configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DrainConfig {
    /// Seconds busy connections get before they are forcibly cancelled.
    pub escalation_window_secs: u64,

    /// Extra seconds the supervisor waits past the window before SIGKILL.
    pub worker_kill_grace_secs: u64,
}

impl DrainConfig {
    pub fn escalation_window(&self) -> Duration {
        Duration::from_secs(self.escalation_window_secs)
    }

    /// Upper bound on how long a terminated worker may take to exit.
    pub fn worker_exit_deadline(&self) -> Duration {
        Duration::from_secs(self.escalation_window_secs + self.worker_kill_grace_secs)
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            escalation_window_secs: 5,
            worker_kill_grace_secs: 5,
        }
    }
}

/// Hot reload configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// SIGHUP and file changes start a new worker generation.
    pub enabled: bool,

    /// Extra files to watch (the running executable is always watched).
    pub watch_paths: Vec<String>,

    /// Window used to coalesce bursts of file events, in milliseconds.
    pub debounce_ms: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            watch_paths: Vec::new(),
            debounce_ms: 500,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) used when RUST_LOG is unset.
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}
