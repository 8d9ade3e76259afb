//! TCP transports.
//!
//! Two lifecycle models share this file: the listener binds once and serves
//! one connection at a time (a failed session is terminal), while the
//! connector heals itself forever at a fixed interval, reconfiguring
//! keepalive on every fresh connection.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use crate::core::config::{AdapterContext, RECONNECT_INTERVAL};
use crate::core::error::{AdapterError, Result};
use crate::endpoint::Endpoint;
use crate::ioloop::{run_session, RawIo};

const KEEPALIVE_IDLE: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const KEEPALIVE_RETRIES: u32 = 3;
#[cfg(target_os = "linux")]
const USER_TIMEOUT: Duration = Duration::from_secs(30);

fn configure_keepalive(stream: &TcpStream) -> io::Result<()> {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_RETRIES);
    sock.set_tcp_keepalive(&keepalive)?;
    #[cfg(target_os = "linux")]
    sock.set_tcp_user_timeout(Some(USER_TIMEOUT))?;
    Ok(())
}

fn split_io(stream: TcpStream, ctx: &AdapterContext) -> RawIo {
    let (reader, writer) = stream.into_split();
    RawIo {
        reader: ctx
            .cfg
            .wants_pub()
            .then(|| Box::new(reader) as Box<dyn tokio::io::AsyncRead + Unpin + Send>),
        writer: ctx
            .cfg
            .wants_sub()
            .then(|| Box::new(writer) as Box<dyn tokio::io::AsyncWrite + Unpin + Send>),
    }
}

/// Bind once, then accept and serve connections sequentially.
pub struct TcpListenEndpoint {
    port: u16,
}

impl TcpListenEndpoint {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Endpoint for TcpListenEndpoint {
    async fn run(&mut self, ctx: &mut AdapterContext) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| {
                AdapterError::Connection(format!("cannot listen on port {}: {}", self.port, e))
            })?;
        tracing::info!("listening on tcp port {}", self.port);

        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::info!("accepted connection from {}", peer);

            // a hard session failure terminates the process
            run_session(ctx, split_io(stream, ctx)).await?;
            tracing::info!("connection from {} closed", peer);
        }
    }
}

/// Connect to `host:port` and keep reconnecting forever; no backoff, no
/// retry ceiling — the fixed interval is an observable timing contract.
pub struct TcpConnectEndpoint {
    addr: String,
}

impl TcpConnectEndpoint {
    pub fn new(addr: String) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl Endpoint for TcpConnectEndpoint {
    async fn run(&mut self, ctx: &mut AdapterContext) -> Result<()> {
        loop {
            let stream = match TcpStream::connect(&self.addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("connect {} failed: {}, retrying", self.addr, e);
                    sleep(RECONNECT_INTERVAL).await;
                    continue;
                }
            };

            if let Err(e) = configure_keepalive(&stream) {
                tracing::warn!("keepalive setup failed: {}", e);
            }
            tracing::info!("connected to {}", self.addr);

            match run_session(ctx, split_io(stream, ctx)).await {
                Ok(()) => tracing::info!("session with {} ended", self.addr),
                // config/plugin failures must not be retried away
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!("session with {} failed: {}", self.addr, e),
            }
            ctx.metrics.record_restart();
            sleep(RECONNECT_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusLink;
    use crate::core::config::{AdapterConfig, EndpointMode};
    use crate::core::metrics::Metrics;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn pub_cfg(addr: PathBuf) -> AdapterConfig {
        AdapterConfig {
            name: "test".into(),
            pub_addr: Some(addr),
            sub_addr: None,
            framer_in: "none".into(),
            framer_out: "none".into(),
            filter_in: "none".into(),
            filter_out: "none".into(),
            filter_in_config: None,
            filter_out_config: None,
            mode: EndpointMode::TcpConnect("127.0.0.1:1".into()),
            startup_delay: Duration::ZERO,
            nonblock: false,
            debug: false,
            outq_limit: None,
            bus_retry: false,
        }
    }

    fn ctx_for(cfg: AdapterConfig, bus: BusLink) -> AdapterContext {
        AdapterContext {
            cfg: Arc::new(cfg),
            metrics: Arc::new(Metrics::new("test")),
            bus,
        }
    }

    fn ctx_with_pub(addr: PathBuf) -> AdapterContext {
        ctx_for(
            pub_cfg(addr),
            BusLink {
                publisher: None,
                subscriber: None,
            },
        )
    }

    #[tokio::test]
    async fn test_connect_retries_without_exiting() {
        let dir = tempfile::tempdir().unwrap();
        // port 1 on localhost refuses immediately; the endpoint must keep
        // retrying at the fixed interval instead of returning
        let mut ctx = ctx_with_pub(dir.path().join("unused"));
        let mut ep = TcpConnectEndpoint::new("127.0.0.1:1".into());

        let still_running = tokio::time::timeout(
            RECONNECT_INTERVAL + Duration::from_millis(500),
            ep.run(&mut ctx),
        )
        .await;
        assert!(still_running.is_err(), "endpoint must never exit on refusal");
    }

    #[tokio::test]
    async fn test_fatal_filter_error_ends_reconnect_loop() {
        use crate::bus::BusPublisher;
        use tokio::net::UnixDatagram;

        let dir = tempfile::tempdir().unwrap();
        let bus_addr = dir.path().join("bus.pub");
        let _bus_end = UnixDatagram::bind(&bus_addr).unwrap();
        let publisher = BusPublisher::connect(&bus_addr, false).await.unwrap();

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        // the filter config file does not exist; building the session must
        // surface a fatal plugin error, not restart forever
        let mut cfg = pub_cfg(bus_addr);
        cfg.filter_in = "prefix".into();
        cfg.filter_in_config = Some(dir.path().join("missing.conf"));
        let mut ctx = ctx_for(
            cfg,
            BusLink {
                publisher: Some(Arc::new(publisher)),
                subscriber: None,
            },
        );

        let mut ep = TcpConnectEndpoint::new(addr.to_string());
        let res = tokio::time::timeout(Duration::from_secs(3), ep.run(&mut ctx))
            .await
            .expect("fatal session error must end the reconnect loop");
        assert!(matches!(res, Err(AdapterError::Plugin(_))));
    }

    #[tokio::test]
    async fn test_listener_rejects_taken_port() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx_with_pub(dir.path().join("unused"));
        let mut ep = TcpListenEndpoint::new(port);
        // binding 0.0.0.0 on the same port collides with the holder
        let res = ep.run(&mut ctx).await;
        assert!(matches!(res, Err(AdapterError::Connection(_))));
    }
}
