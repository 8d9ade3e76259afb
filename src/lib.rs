//! # Endpoint Adapter (epad)
//!
//! A bidirectional bridge between a message bus and a single external
//! transport: serial/file/FIFO, TCP (client or server), UDP, or CAN.
//!
//! Bytes read from the transport pass through a framer and a filter and
//! are published to the bus; bus messages flow the other way through
//! their own framer/filter pair and are written to the transport. The
//! core loop never inspects payloads itself.
//!
//! ## Design points
//!
//! - **One loop thread**: a current-thread tokio runtime drives every
//!   session; only the CAN backend adds worker threads.
//! - **Lossy where it must be**: congested writes are bounded by a small
//!   wall-clock budget and then dropped (and counted) rather than ever
//!   stalling the loop.
//! - **Per-transport lifecycles**: files run once, TCP servers accept one
//!   client at a time, TCP clients and CAN sessions restart forever at a
//!   fixed interval.

pub mod backpressure;
pub mod bus;
pub mod cli;
pub mod core;
pub mod endpoint;
pub mod framing;
pub mod ioloop;
pub mod pipeline;
pub mod retry;

pub use crate::core::error::{AdapterError, Result};
