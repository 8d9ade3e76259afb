//! Message-bus endpoints.
//!
//! The bus side of the adapter exchanges whole, already-framed messages —
//! Unix datagram sockets give exactly that boundary contract. `--pub`
//! names the socket external data is published to; `--sub` names the path
//! the adapter binds to receive messages destined for the transport.
//! The bus fabric itself (topics, distribution) lives outside this daemon.

use std::path::{Path, PathBuf};

use tokio::net::UnixDatagram;

use crate::core::config::{AdapterConfig, RECONNECT_INTERVAL};
use crate::core::error::{AdapterError, Result};

/// Sends whole messages to the bus.
pub struct BusPublisher {
    sock: UnixDatagram,
    addr: PathBuf,
}

impl BusPublisher {
    /// Connect to the publish address. With `retry` the attempt repeats at
    /// the fixed interval until the bus appears; otherwise failure is fatal.
    pub async fn connect(addr: &Path, retry: bool) -> Result<Self> {
        loop {
            match Self::try_connect(addr) {
                Ok(publisher) => return Ok(publisher),
                Err(e) if retry => {
                    tracing::warn!("bus publish socket {}: {}, retrying", addr.display(), e);
                    tokio::time::sleep(RECONNECT_INTERVAL).await;
                }
                Err(e) => {
                    return Err(AdapterError::Bus(format!(
                        "cannot connect publish socket {}: {}",
                        addr.display(),
                        e
                    )))
                }
            }
        }
    }

    fn try_connect(addr: &Path) -> std::io::Result<Self> {
        let sock = UnixDatagram::unbound()?;
        sock.connect(addr)?;
        Ok(Self {
            sock,
            addr: addr.to_path_buf(),
        })
    }

    /// Publish one message.
    pub async fn send(&self, msg: &[u8]) -> std::io::Result<usize> {
        self.sock.send(msg).await
    }

    pub fn addr(&self) -> &Path {
        &self.addr
    }
}

/// Receives whole messages from the bus.
pub struct BusSubscriber {
    sock: UnixDatagram,
    path: PathBuf,
}

impl BusSubscriber {
    /// Bind the subscribe path, unlinking a stale socket file first.
    pub async fn bind(path: &Path, retry: bool) -> Result<Self> {
        loop {
            match Self::try_bind(path) {
                Ok(subscriber) => return Ok(subscriber),
                Err(e) if retry => {
                    tracing::warn!("bus subscribe socket {}: {}, retrying", path.display(), e);
                    tokio::time::sleep(RECONNECT_INTERVAL).await;
                }
                Err(e) => {
                    return Err(AdapterError::Bus(format!(
                        "cannot bind subscribe socket {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
    }

    fn try_bind(path: &Path) -> std::io::Result<Self> {
        // A previous instance may have left its socket file behind.
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let sock = UnixDatagram::bind(path)?;
        Ok(Self {
            sock,
            path: path.to_path_buf(),
        })
    }

    /// Receive one message into `buf`, returning its length.
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let (n, _peer) = self.sock.recv_from(buf).await?;
        Ok(n)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BusSubscriber {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// The adapter's connected bus endpoints; either side may be absent.
///
/// Both ends are shared behind `Arc` because sessions come and go (CAN and
/// TCP-connect restart theirs) while the bus connection lives for the
/// process.
pub struct BusLink {
    pub publisher: Option<std::sync::Arc<BusPublisher>>,
    pub subscriber: Option<std::sync::Arc<BusSubscriber>>,
}

impl BusLink {
    /// Connect/bind whatever the configuration asks for.
    pub async fn connect(cfg: &AdapterConfig) -> Result<Self> {
        let publisher = match &cfg.pub_addr {
            Some(addr) => Some(std::sync::Arc::new(
                BusPublisher::connect(addr, cfg.bus_retry).await?,
            )),
            None => None,
        };
        let subscriber = match &cfg.sub_addr {
            Some(path) => Some(std::sync::Arc::new(
                BusSubscriber::bind(path, cfg.bus_retry).await?,
            )),
            None => None,
        };
        Ok(Self {
            publisher,
            subscriber,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_bound_socket() {
        let dir = tempfile::tempdir().unwrap();
        let addr = dir.path().join("bus.pub");

        let receiver = UnixDatagram::bind(&addr).unwrap();
        let publisher = BusPublisher::connect(&addr, false).await.unwrap();

        publisher.send(b"ABCDEFGH").await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ABCDEFGH");
    }

    #[tokio::test]
    async fn test_subscriber_receives_whole_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.sub");

        let subscriber = BusSubscriber::bind(&path, false).await.unwrap();
        let sender = UnixDatagram::unbound().unwrap();
        sender.send_to(b"one", &path).await.unwrap();
        sender.send_to(b"two", &path).await.unwrap();

        let mut buf = [0u8; 64];
        let n = subscriber.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");
        let n = subscriber.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.sub");

        let first = BusSubscriber::bind(&path, false).await.unwrap();
        drop(first);
        // bind again over whatever was left behind
        std::fs::write(&path, b"").ok();
        let second = BusSubscriber::bind(&path, false).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_missing_bus_is_fatal_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let addr = dir.path().join("nobody-home");
        let res = BusPublisher::connect(&addr, false).await;
        assert!(matches!(res, Err(AdapterError::Bus(_))));
    }
}
