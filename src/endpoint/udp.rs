//! UDP transports.
//!
//! Listen mode binds once and runs a single session for the process
//! lifetime; outbound datagrams go to the most recently seen peer and are
//! dropped (and counted) until one is known. Connect mode pins the peer at
//! startup via `connect(2)`.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;

use crate::core::config::AdapterContext;
use crate::core::error::{AdapterError, Result};
use crate::core::metrics::Metrics;
use crate::endpoint::Endpoint;
use crate::ioloop::{run_session, RawIo};

/// Byte-source face of the socket; remembers the sender of the last
/// datagram so the writer knows where replies go.
struct UdpReader {
    sock: Arc<UdpSocket>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
    track_peer: bool,
}

impl AsyncRead for UdpReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.sock.poll_recv_from(cx, buf) {
            Poll::Ready(Ok(addr)) => {
                if this.track_peer {
                    if let Ok(mut peer) = this.peer.lock() {
                        *peer = Some(addr);
                    }
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Byte-sink face of the socket. One write = one datagram.
struct UdpWriter {
    sock: Arc<UdpSocket>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
    connected: bool,
    metrics: Arc<Metrics>,
}

impl AsyncWrite for UdpWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.connected {
            return this.sock.poll_send(cx, buf);
        }
        let peer = this.peer.lock().ok().and_then(|p| *p);
        match peer {
            Some(addr) => this.sock.poll_send_to(cx, buf, addr),
            None => {
                // nowhere to send yet; congestion-style drop, not an error
                this.metrics.record_dropped(buf.len());
                if this.metrics.claim_congestion_warning() {
                    tracing::warn!("udp sink has no peer yet, dropped {} bytes", buf.len());
                }
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

enum UdpMode {
    Listen(u16),
    Connect(String),
}

/// UDP transport backend.
pub struct UdpEndpoint {
    mode: UdpMode,
}

impl UdpEndpoint {
    pub fn listen(port: u16) -> Self {
        Self {
            mode: UdpMode::Listen(port),
        }
    }

    pub fn connect(addr: String) -> Self {
        Self {
            mode: UdpMode::Connect(addr),
        }
    }
}

#[async_trait]
impl Endpoint for UdpEndpoint {
    async fn run(&mut self, ctx: &mut AdapterContext) -> Result<()> {
        let (sock, connected) = match &self.mode {
            UdpMode::Listen(port) => {
                let sock = UdpSocket::bind(("0.0.0.0", *port)).await.map_err(|e| {
                    AdapterError::Connection(format!("cannot bind udp port {}: {}", port, e))
                })?;
                tracing::info!("listening on udp port {}", port);
                (sock, false)
            }
            UdpMode::Connect(addr) => {
                let sock = UdpSocket::bind(("0.0.0.0", 0)).await.map_err(AdapterError::Io)?;
                sock.connect(addr).await.map_err(|e| {
                    AdapterError::Connection(format!("cannot connect udp to {}: {}", addr, e))
                })?;
                tracing::info!("udp socket connected to {}", addr);
                (sock, true)
            }
        };

        let sock = Arc::new(sock);
        let peer = Arc::new(Mutex::new(None));

        let io = RawIo {
            reader: ctx.cfg.wants_pub().then(|| {
                Box::new(UdpReader {
                    sock: sock.clone(),
                    peer: peer.clone(),
                    track_peer: !connected,
                }) as Box<dyn AsyncRead + Unpin + Send>
            }),
            writer: ctx.cfg.wants_sub().then(|| {
                Box::new(UdpWriter {
                    sock: sock.clone(),
                    peer: peer.clone(),
                    connected,
                    metrics: ctx.metrics.clone(),
                }) as Box<dyn AsyncWrite + Unpin + Send>
            }),
        };

        run_session(ctx, io).await
    }
}
