//! File, FIFO, TTY and stdio transport.
//!
//! Opens the path read, write or both depending on the configured
//! directions. FIFOs are detected and opened read-write so the adapter
//! survives its peer closing and reopening. TTY sinks get the output-queue
//! backpressure guard; all raw-fd writes go through the bounded-retry
//! writer, so congestion costs at most the budget. Single-shot: when the
//! session ends, so does the process's useful life.

use std::fs::OpenOptions;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, Interest, ReadBuf};

use crate::backpressure::Backpressure;
use crate::core::config::AdapterContext;
use crate::core::error::{AdapterError, Result};
use crate::core::metrics::Metrics;
use crate::endpoint::Endpoint;
use crate::ioloop::{run_session, RawIo};
use crate::retry::{write_bounded, RetryPolicy};

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // Safety: fd is owned by the caller and stays open across the calls.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn is_tty(fd: RawFd) -> bool {
    // Safety: querying a valid fd.
    unsafe { libc::isatty(fd) == 1 }
}

/// Readiness-driven reader over a non-blocking character device or FIFO.
/// Regular files are not pollable and take the `tokio::fs` path instead.
pub struct NonblockReader {
    fd: AsyncFd<std::fs::File>,
}

impl NonblockReader {
    pub fn new(file: std::fs::File) -> io::Result<Self> {
        set_nonblocking(file.as_raw_fd())?;
        Ok(Self {
            fd: AsyncFd::with_interest(file, Interest::READABLE)?,
        })
    }
}

impl AsyncRead for NonblockReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.fd.poll_read_ready_mut(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_mut().read(unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Sink over a raw fd: backpressure guard first, bounded-retry write next.
///
/// Never returns `Pending` — a congested write blocks the loop for at most
/// the retry budget, then the remainder is dropped and the full length
/// reported, keeping callers from resending split frames.
pub struct FdSinkWriter {
    file: std::fs::File,
    guard: Option<Backpressure>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl FdSinkWriter {
    pub fn new(file: std::fs::File, guard: Option<Backpressure>, metrics: Arc<Metrics>) -> Self {
        Self {
            file,
            guard,
            policy: RetryPolicy::bounded(),
            metrics,
        }
    }
}

impl AsyncWrite for FdSinkWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if let Some(guard) = this.guard.as_mut() {
            match guard.admit(buf.len()) {
                Ok(verdict) => {
                    this.metrics.set_outq_pending(verdict.pending);
                    if !verdict.admit {
                        // queue refused to drain: fake success, count the loss
                        this.metrics.record_dropped(buf.len());
                        if this.metrics.claim_outq_warning() {
                            tracing::warn!(
                                "output queue stuck at {} bytes, dropped {} bytes",
                                verdict.pending,
                                buf.len()
                            );
                        }
                        return Poll::Ready(Ok(buf.len()));
                    }
                }
                Err(e) => return Poll::Ready(Err(e)),
            }
        }

        match write_bounded(&mut this.file, buf, &this.policy) {
            Ok(outcome) => {
                if outcome.congested() {
                    this.metrics.record_dropped(outcome.dropped);
                    if this.metrics.claim_congestion_warning() {
                        tracing::warn!(
                            "sink congested, dropped {} of {} bytes",
                            outcome.dropped,
                            buf.len()
                        );
                    }
                }
                // full length regardless: the dropped tail is gone by policy
                Poll::Ready(Ok(buf.len()))
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

enum Target {
    Stdio,
    Path(PathBuf),
}

/// File-backed transport (regular file, FIFO, TTY device, or stdio).
pub struct FileEndpoint {
    target: Target,
}

impl FileEndpoint {
    pub fn stdio() -> Self {
        Self {
            target: Target::Stdio,
        }
    }

    pub fn path(path: PathBuf) -> Self {
        Self {
            target: Target::Path(path),
        }
    }

    fn open_path(&self, path: &PathBuf, ctx: &AdapterContext) -> Result<RawIo> {
        let cfg = &ctx.cfg;
        let meta = std::fs::metadata(path).map_err(|e| {
            AdapterError::Connection(format!("cannot stat {}: {}", path.display(), e))
        })?;
        let is_fifo = meta.file_type().is_fifo();
        let is_char = meta.file_type().is_char_device();
        let stream_like = is_fifo || is_char;

        let mut opts = OpenOptions::new();
        if is_fifo {
            // read-write so the FIFO never delivers EOF when a writer leaves
            opts.read(true).write(true);
        } else {
            opts.read(cfg.wants_pub()).write(cfg.wants_sub());
        }
        if cfg.nonblock {
            opts.custom_flags(libc::O_NONBLOCK);
        }

        let file = opts
            .open(path)
            .map_err(|e| AdapterError::Connection(format!("cannot open {}: {}", path.display(), e)))?;

        if stream_like {
            set_nonblocking(file.as_raw_fd())?;
        }

        let reader: Option<Box<dyn AsyncRead + Unpin + Send>> = if cfg.wants_pub() {
            let rd = file.try_clone().map_err(AdapterError::Io)?;
            if stream_like {
                Some(Box::new(NonblockReader::new(rd)?))
            } else {
                Some(Box::new(tokio::fs::File::from_std(rd)))
            }
        } else {
            None
        };

        let writer: Option<Box<dyn AsyncWrite + Unpin + Send>> = if cfg.wants_sub() {
            let guard = match (cfg.outq_limit, is_tty(file.as_raw_fd())) {
                (Some(limit), true) => Some(Backpressure::for_tty(file.as_raw_fd(), limit)),
                _ => None,
            };
            Some(Box::new(FdSinkWriter::new(file, guard, ctx.metrics.clone())))
        } else {
            None
        };

        Ok(RawIo { reader, writer })
    }

    fn open_stdio(&self, ctx: &AdapterContext) -> Result<RawIo> {
        let cfg = &ctx.cfg;

        let reader: Option<Box<dyn AsyncRead + Unpin + Send>> = if cfg.wants_pub() {
            Some(Box::new(tokio::io::stdin()))
        } else {
            None
        };

        let writer: Option<Box<dyn AsyncWrite + Unpin + Send>> = if cfg.wants_sub() {
            match (cfg.outq_limit, is_tty(libc::STDOUT_FILENO)) {
                (Some(limit), true) => {
                    // own a duplicate so the guard and writer share one fd
                    let dup = unsafe { libc::dup(libc::STDOUT_FILENO) };
                    if dup < 0 {
                        return Err(AdapterError::Io(io::Error::last_os_error()));
                    }
                    let file = unsafe { std::fs::File::from_raw_fd(dup) };
                    set_nonblocking(dup)?;
                    let guard = Backpressure::for_tty(dup, limit);
                    Some(Box::new(FdSinkWriter::new(
                        file,
                        Some(guard),
                        ctx.metrics.clone(),
                    )))
                }
                _ => Some(Box::new(tokio::io::stdout())),
            }
        } else {
            None
        };

        Ok(RawIo { reader, writer })
    }
}

#[async_trait]
impl Endpoint for FileEndpoint {
    async fn run(&mut self, ctx: &mut AdapterContext) -> Result<()> {
        let io = match &self.target {
            Target::Stdio => self.open_stdio(ctx)?,
            Target::Path(path) => {
                let path = path.clone();
                self.open_path(&path, ctx)?
            }
        };
        run_session(ctx, io).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_fd_sink_writer_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let file = std::fs::File::create(&path).unwrap();

        let metrics = Arc::new(Metrics::new("t"));
        let mut w = FdSinkWriter::new(file, None, metrics);

        use tokio::io::AsyncWriteExt;
        w.write_all(b"ABCDEFGH").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"ABCDEFGH");
    }

    #[tokio::test]
    async fn test_nonblock_reader_on_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe");
        nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o600)).unwrap();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut reader = NonblockReader::new(file.try_clone().unwrap()).unwrap();

        // a separate writer end
        let mut producer = OpenOptions::new().write(true).open(&path).unwrap();
        use std::io::Write;
        producer.write_all(b"hello fifo").unwrap();

        let mut buf = [0u8; 64];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello fifo");
    }
}
