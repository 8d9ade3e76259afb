//! Transport backends.
//!
//! Exactly one backend is selected at startup. Each owns its fd lifecycle
//! (single-shot, accept-loop, or self-healing reconnect) and feeds raw byte
//! ports into the shared session loop.

pub mod can;
pub mod file;
pub mod tcp;
pub mod udp;

use async_trait::async_trait;

use crate::core::config::{AdapterContext, EndpointMode};
use crate::core::error::Result;

/// A transport backend driving sessions until it is done or dead.
#[async_trait]
pub trait Endpoint {
    async fn run(&mut self, ctx: &mut AdapterContext) -> Result<()>;
}

/// Build the backend for the selected mode.
pub fn create(mode: &EndpointMode) -> Box<dyn Endpoint + Send> {
    match mode {
        EndpointMode::Stdio => Box::new(file::FileEndpoint::stdio()),
        EndpointMode::File(path) => Box::new(file::FileEndpoint::path(path.clone())),
        EndpointMode::TcpListen(port) => Box::new(tcp::TcpListenEndpoint::new(*port)),
        EndpointMode::TcpConnect(addr) => Box::new(tcp::TcpConnectEndpoint::new(addr.clone())),
        EndpointMode::UdpListen(port) => Box::new(udp::UdpEndpoint::listen(*port)),
        EndpointMode::UdpConnect(addr) => Box::new(udp::UdpEndpoint::connect(addr.clone())),
        EndpointMode::Can {
            id,
            filter,
            interface,
        } => Box::new(can::CanEndpoint::new(*id, *filter, interface.clone())),
    }
}
