//! Session orchestration.
//!
//! A session wires up to two directions over the shared loop: the
//! pub-direction (external transport -> bus) and the sub-direction
//! (bus -> external transport). Each direction pumps independently; a 1 Hz
//! tick flushes and resets the metrics table. The session ends when either
//! direction finishes (EOF) or fails; what happens next is the backend's
//! business (restart, accept the next connection, or exit).

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::{interval_at, Instant};

use crate::core::config::{AdapterContext, METRICS_INTERVAL, READ_BUF_SIZE};
use crate::core::error::Result;
use crate::framing::{make_filter, make_framer, NoneFilter, NoneFramer};
use crate::pipeline::{
    write_all_via_framer, Handle, SinkHandle, SinkPort, SourceHandle, SourcePort,
};

/// Ceiling on bytes carried between reads waiting for a frame boundary.
/// A source that never completes a frame gets its backlog discarded and
/// counted instead of growing without bound.
const MAX_CARRYOVER: usize = 4 * READ_BUF_SIZE;

/// The raw byte ports a backend hands to a session. `reader` is required
/// when the pub-direction is configured, `writer` when the sub-direction is.
pub struct RawIo {
    pub reader: Option<Box<dyn AsyncRead + Unpin + Send>>,
    pub writer: Option<Box<dyn AsyncWrite + Unpin + Send>>,
}

/// One direction of the bridge.
pub struct Direction {
    pub label: &'static str,
    pub source: SourceHandle,
    pub sink: SinkHandle,
}

/// Pump one direction until EOF or error.
///
/// Reads are capped at [`READ_BUF_SIZE`]; the framer's unconsumed tail is
/// carried over to the next read, so frames may span read boundaries but
/// are never reordered.
async fn pump(dir: &mut Direction, ctx_metrics: &crate::core::metrics::Metrics) -> Result<()> {
    let mut chunk = [0u8; READ_BUF_SIZE];
    let mut acc = BytesMut::with_capacity(READ_BUF_SIZE);

    loop {
        let n = match &mut dir.source.port {
            SourcePort::Bus(subscriber) => {
                let n = subscriber.recv(&mut chunk).await?;
                if n == 0 {
                    // zero-length bus message carries nothing
                    continue;
                }
                n
            }
            SourcePort::Stream(reader) => {
                let n = reader.read(&mut chunk).await?;
                if n == 0 {
                    tracing::debug!("{} direction: source EOF", dir.label);
                    return Ok(());
                }
                n
            }
        };

        ctx_metrics.record_read(n);
        acc.extend_from_slice(&chunk[..n]);

        let consumed = write_all_via_framer(&mut dir.sink, ctx_metrics, &acc).await?;
        acc.advance(consumed);

        if acc.len() > MAX_CARRYOVER {
            let stalled = acc.len();
            ctx_metrics.record_dropped(stalled);
            if ctx_metrics.claim_congestion_warning() {
                tracing::warn!(
                    "{} direction: no frame within {} buffered bytes, discarding",
                    dir.label,
                    stalled
                );
            }
            acc.clear();
        }
    }
}

/// Build the configured directions from the context and the backend's raw
/// ports, then run them against the shared loop until one finishes.
pub async fn run_session(ctx: &mut AdapterContext, io: RawIo) -> Result<()> {
    let cfg = &ctx.cfg;
    let RawIo { reader, writer } = io;

    let mut pub_dir = match (&ctx.bus.publisher, reader) {
        (Some(publisher), Some(reader)) => Some(Direction {
            label: "pub",
            source: Handle::new(
                SourcePort::Stream(reader),
                Box::new(NoneFramer),
                Box::new(NoneFilter),
            ),
            sink: Handle::new(
                SinkPort::Bus(publisher.clone()),
                make_framer(&cfg.framer_in)?,
                make_filter(&cfg.filter_in, cfg.filter_in_config.as_deref())?,
            ),
        }),
        _ => None,
    };

    let mut sub_dir = match (&ctx.bus.subscriber, writer) {
        (Some(subscriber), Some(writer)) => Some(Direction {
            label: "sub",
            source: Handle::new(
                SourcePort::Bus(subscriber.clone()),
                Box::new(NoneFramer),
                Box::new(NoneFilter),
            ),
            sink: Handle::new(
                SinkPort::Stream(writer),
                make_framer(&cfg.framer_out)?,
                make_filter(&cfg.filter_out, cfg.filter_out_config.as_deref())?,
            ),
        }),
        _ => None,
    };

    let metrics = ctx.metrics.clone();
    let mut flush = interval_at(Instant::now() + METRICS_INTERVAL, METRICS_INTERVAL);

    let pub_pump = async {
        match pub_dir.as_mut() {
            Some(dir) => pump(dir, &metrics).await,
            None => std::future::pending().await,
        }
    };
    let sub_pump = async {
        match sub_dir.as_mut() {
            Some(dir) => pump(dir, &metrics).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(pub_pump, sub_pump);

    loop {
        tokio::select! {
            res = &mut pub_pump => return res,
            res = &mut sub_pump => return res,
            _ = flush.tick() => {
                metrics.flush();
            }
        }
    }
}
