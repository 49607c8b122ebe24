//! Configuration structures.
//!
//! Every blocking operation in the crate takes its deadline from one of these
//! structs; the defaults here are floors, never silent infinity. A zero
//! timeout means "poll, do not wait".

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session-level tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Username stamped into outbound headers. Defaults to the effective
    /// OS user (`$USER`/`$USERNAME`), falling back to "kernel".
    pub username: Option<String>,

    /// Bound of the seen-signature FIFO used for shell replay rejection.
    pub digest_history_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            username: None,
            digest_history_size: 1 << 16,
        }
    }
}

/// Client configuration: wire caps, buffering, and per-channel timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Maximum parts accepted in one multipart frame.
    pub max_frame_parts: u32,

    /// Maximum size of a single frame part.
    pub max_part_bytes: u32,

    /// Capacity of the iopub broadcast buffer; slow subscribers lose the
    /// oldest messages past this bound and see a lag count.
    pub iopub_buffer: usize,

    /// Socket connect deadline.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Default deadline for request/reply operations when the caller does
    /// not pass one explicitly.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Deadline for a registered stdin consumer to answer an input_request
    /// before the kernel is told input is unavailable.
    #[serde(with = "humantime_serde")]
    pub stdin_timeout: Duration,

    /// Interval between heartbeat pings.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Deadline for a single heartbeat echo.
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_frame_parts: 64,
            max_part_bytes: 64 * 1024 * 1024,
            iopub_buffer: 1024,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            stdin_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_secs(10),
        }
    }
}

/// Kernel manager configuration: lifecycle timeouts and restart policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Deadline for a launched kernel to report alive and echo a heartbeat.
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,

    /// Deadline for a graceful shutdown_reply before escalating.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Deadline for the graceful phase of a restart.
    #[serde(with = "humantime_serde")]
    pub restart_timeout: Duration,

    /// Restart the kernel automatically when the provisioner reports an
    /// unexpected exit while Running.
    pub autorestart: bool,

    /// Consecutive automatic restarts tolerated within the sliding window
    /// before the manager gives up and goes Dead.
    pub autorestart_limit: u32,

    /// Sliding window over which consecutive restarts are counted.
    #[serde(with = "humantime_serde")]
    pub autorestart_window: Duration,

    /// Interval at which the monitor polls the provisioner for liveness.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            restart_timeout: Duration::from_secs(5),
            autorestart: false,
            autorestart_limit: 5,
            autorestart_window: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
        }
    }
}
