//! Bounded retry under congestion.
//!
//! One parameterized utility covers every spot the adapter talks to a
//! non-blocking fd directly: the TTY/file sink and the CAN write thread.
//! `EINTR` retries immediately and unboundedly; `EAGAIN` sleeps a fixed
//! quantum and retries until a wall-clock budget runs out, after which the
//! operation is abandoned and the caller counts the loss. Liveness over
//! completeness: a congested peer costs at most the budget, never a stall.

use std::io;
use std::time::{Duration, Instant};

use crate::core::config::{RETRY_QUANTUM, WRITE_BUDGET};

/// Retry parameters for one congested operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total wall-clock budget spent sleeping on EAGAIN.
    pub budget: Duration,
    /// Sleep quantum between attempts.
    pub quantum: Duration,
}

impl RetryPolicy {
    /// Default data-path policy (≈10 ms budget, 1 ms quantum).
    pub fn bounded() -> Self {
        Self {
            budget: WRITE_BUDGET,
            quantum: RETRY_QUANTUM,
        }
    }

    /// Zero-budget policy: give up on the first EAGAIN (CAN write thread).
    pub fn immediate() -> Self {
        Self {
            budget: Duration::ZERO,
            quantum: RETRY_QUANTUM,
        }
    }
}

/// Outcome of a bounded write. `delivered + dropped == buf.len()` unless
/// the call returned an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub delivered: usize,
    pub dropped: usize,
}

impl WriteOutcome {
    /// Whether the budget ran out before everything was delivered.
    pub fn congested(&self) -> bool {
        self.dropped > 0
    }
}

/// Run `op` with EINTR/EAGAIN handling. Returns `Ok(None)` when the budget
/// is exhausted; any other error is passed through.
pub fn retry_op<T>(
    policy: &RetryPolicy,
    mut op: impl FnMut() -> io::Result<T>,
) -> io::Result<Option<T>> {
    let deadline = Instant::now() + policy.budget;
    loop {
        match op() {
            Ok(v) => return Ok(Some(v)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let now = Instant::now();
                if policy.budget.is_zero() || now >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(policy.quantum.min(deadline - now));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Write `buf` to `w`, looping over partial writes, bounded by `policy`.
///
/// On success the caller must report the *full* length as written upstream
/// (the dropped tail is accounted in metrics, not surfaced as an error) so
/// a congested sink cannot trigger retry storms or split-frame resends.
pub fn write_bounded<W: io::Write + ?Sized>(
    w: &mut W,
    buf: &[u8],
    policy: &RetryPolicy,
) -> io::Result<WriteOutcome> {
    let deadline = Instant::now() + policy.budget;
    let mut off = 0;
    while off < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = RetryPolicy {
            budget: remaining,
            quantum: policy.quantum,
        };
        match retry_op(&attempt, || w.write(&buf[off..]))? {
            Some(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "sink accepted zero bytes",
                ))
            }
            Some(n) => off += n,
            // budget exhausted; drop the tail
            None => break,
        }
    }
    Ok(WriteOutcome {
        delivered: off,
        dropped: buf.len() - off,
    })
}
