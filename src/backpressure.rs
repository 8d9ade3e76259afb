//! TTY output-queue backpressure.
//!
//! Serial sinks (real UARTs and USB-gadget serial in particular) can stall
//! with a kernel output queue full of stale data. Before each raw write the
//! guard probes the queue; if the new write would push it past the
//! configured ceiling, the queue is flushed (discarded) and re-probed. A
//! queue that still refuses to drain marks the write as drop-and-fake-
//! success: stale data loss is preferred over blocking the loop or
//! corrupting partial frames.

use std::io;
use std::os::fd::{BorrowedFd, RawFd};

use nix::sys::termios::{tcflush, FlushArg};

nix::ioctl_read_bad!(tiocoutq, libc::TIOCOUTQ, libc::c_int);

/// Probe/flush access to a sink's pending output queue.
///
/// A trait so the drop/flush policy can be exercised against simulated
/// queue depths; the production implementation ioctls the TTY fd.
pub trait OutputQueue: Send {
    /// Bytes currently queued but not yet transmitted.
    fn pending(&mut self) -> io::Result<usize>;

    /// Discard everything queued.
    fn flush(&mut self) -> io::Result<()>;
}

/// Kernel-backed queue of a TTY fd (TIOCOUTQ / TCOFLUSH).
///
/// The fd is borrowed; the sink writer owning the file keeps it alive for
/// the guard's lifetime.
pub struct TtyOutputQueue {
    fd: RawFd,
}

impl TtyOutputQueue {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl OutputQueue for TtyOutputQueue {
    fn pending(&mut self) -> io::Result<usize> {
        let mut queued: libc::c_int = 0;
        // Safety: fd is a valid open TTY for the writer's lifetime.
        unsafe { tiocoutq(self.fd, &mut queued) }.map_err(io::Error::from)?;
        Ok(queued.max(0) as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Safety: see pending().
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        tcflush(fd, FlushArg::TCOFLUSH).map_err(io::Error::from)
    }
}

/// Verdict for one pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Write may proceed. When false the caller fakes success and counts
    /// the bytes as dropped; it must not also write.
    pub admit: bool,
    /// Queue depth observed at decision time (gauge material).
    pub pending: usize,
}

/// Drop/flush policy over an [`OutputQueue`] with a byte ceiling.
pub struct Backpressure {
    queue: Box<dyn OutputQueue>,
    limit: usize,
}

impl Backpressure {
    pub fn new(queue: Box<dyn OutputQueue>, limit: usize) -> Self {
        Self { queue, limit }
    }

    /// Production guard over a TTY fd.
    pub fn for_tty(fd: RawFd, limit: usize) -> Self {
        Self::new(Box::new(TtyOutputQueue::new(fd)), limit)
    }

    /// Decide whether a write of `len` bytes may proceed.
    pub fn admit(&mut self, len: usize) -> io::Result<Verdict> {
        let pending = self.queue.pending()?;
        if pending + len <= self.limit {
            return Ok(Verdict {
                admit: true,
                pending,
            });
        }

        // Over the ceiling: discard whatever is queued and look again.
        self.queue.flush()?;
        let pending = self.queue.pending()?;
        Ok(Verdict {
            admit: pending + len <= self.limit,
            pending,
        })
    }
}
