//! Adapter configuration and runtime context.
//!
//! The original daemon kept its settings, metrics handle and warning flags
//! in process-wide globals; here they live in an explicit [`AdapterContext`]
//! owned by whichever backend drives the loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::BusLink;
use crate::core::metrics::Metrics;

/// Size of the raw read buffer. Stream reads are split at this boundary.
pub const READ_BUF_SIZE: usize = 4096;

/// Fixed interval between transport reconnect attempts (no backoff).
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Wall-clock budget for a congested write before it is dropped.
pub const WRITE_BUDGET: Duration = Duration::from_millis(10);

/// Sleep quantum between EAGAIN retries.
pub const RETRY_QUANTUM: Duration = Duration::from_millis(1);

/// Metrics flush/reset period.
pub const METRICS_INTERVAL: Duration = Duration::from_secs(1);

/// CAN maximum data length; longer chunks are truncated, never reassembled.
pub const CAN_MAX_DLEN: usize = 8;

/// Selected transport backend. Exactly one per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointMode {
    /// Bridge stdin/stdout.
    Stdio,
    /// Open a path (regular file, FIFO, or TTY device).
    File(PathBuf),
    /// Listen on a TCP port, serving one connection at a time.
    TcpListen(u16),
    /// Connect to `host:port`, reconnecting forever.
    TcpConnect(String),
    /// Bind a UDP port.
    UdpListen(u16),
    /// Connect a UDP socket to `host:port`.
    UdpConnect(String),
    /// Raw CAN socket on a SocketCAN interface.
    Can {
        /// 11-bit identifier used for transmitted frames.
        id: u16,
        /// Receive filter (defaults to the tx id with an exact-match mask).
        filter: CanFilterSpec,
        /// Interface name, e.g. "can0".
        interface: String,
    },
}

/// An 11-bit CAN id/mask receive filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFilterSpec {
    pub id: u32,
    pub mask: u32,
}

impl CanFilterSpec {
    /// Exact-match filter for a single identifier.
    pub fn exact(id: u32) -> Self {
        Self {
            id,
            mask: 0x7FF,
        }
    }
}

/// Validated adapter configuration, produced by the CLI layer.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Adapter identity used for metrics and log lines.
    pub name: String,

    /// Bus address the adapter publishes external data to.
    pub pub_addr: Option<PathBuf>,

    /// Bus address the adapter receives messages on.
    pub sub_addr: Option<PathBuf>,

    /// Framer applied to data entering the bus (external -> bus).
    pub framer_in: String,

    /// Framer applied to data leaving the bus (bus -> external).
    pub framer_out: String,

    /// Filter paired with `framer_in`.
    pub filter_in: String,

    /// Filter paired with `framer_out`.
    pub filter_out: String,

    /// Config file for `filter_in` (required iff filter_in != "none").
    pub filter_in_config: Option<PathBuf>,

    /// Config file for `filter_out` (required iff filter_out != "none").
    pub filter_out_config: Option<PathBuf>,

    /// Selected transport.
    pub mode: EndpointMode,

    /// Delay before the adapter starts connecting.
    pub startup_delay: Duration,

    /// Open the file transport with O_NONBLOCK.
    pub nonblock: bool,

    /// Verbose logging.
    pub debug: bool,

    /// TTY output-queue byte ceiling; None disables the backpressure guard.
    pub outq_limit: Option<usize>,

    /// Retry the initial bus connection instead of failing fatally.
    pub bus_retry: bool,
}

impl AdapterConfig {
    /// Whether the external -> bus direction is configured.
    pub fn wants_pub(&self) -> bool {
        self.pub_addr.is_some()
    }

    /// Whether the bus -> external direction is configured.
    pub fn wants_sub(&self) -> bool {
        self.sub_addr.is_some()
    }
}

/// Everything a backend needs to run sessions: configuration, the metrics
/// table, and the (already connected) bus endpoints.
pub struct AdapterContext {
    pub cfg: Arc<AdapterConfig>,
    pub metrics: Arc<Metrics>,
    pub bus: BusLink,
}
