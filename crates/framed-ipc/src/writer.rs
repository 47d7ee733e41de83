//! Background send loop
//!
//! One writer task runs per connection and owns the write half of the
//! socket. Callers queue complete frames and wait for the acknowledgement,
//! so a caller that gives up (timeout or cancellation) never leaves half a
//! frame on the stream, and a stalled socket never holds a lock that
//! `disconnect` needs.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, trace};

use crate::listener::Shared;

/// Frames that may wait for the writer before callers are held back
pub(crate) const QUEUE_DEPTH: usize = 32;

/// One complete frame and the channel its caller waits on
pub(crate) struct Outgoing {
    pub(crate) frame: Bytes,
    pub(crate) done: oneshot::Sender<io::Result<()>>,
}

/// Write queued frames until the queue closes, a write fails, or a stop is
/// signalled
///
/// A stop interrupts a write in progress. The connection is being torn down
/// at that point, so a partial frame on the wire does no harm. A failed write
/// closes the pending table and signals the listener to stop.
pub(crate) async fn run(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Outgoing>,
    mut stop: watch::Receiver<bool>,
    stop_tx: Arc<watch::Sender<bool>>,
    shared: Arc<Shared>,
) {
    loop {
        let outgoing = tokio::select! {
            _ = stop.changed() => break,
            next = queue.recv() => match next {
                Some(outgoing) => outgoing,
                None => break,
            },
        };

        // The caller already gave up; nobody would see the response
        if outgoing.done.is_closed() {
            trace!(len = outgoing.frame.len(), "Skipping abandoned frame");
            continue;
        }

        let written = tokio::select! {
            _ = stop.changed() => {
                debug!(len = outgoing.frame.len(), "Stop signalled during write");
                break;
            }
            written = write_frame(&mut writer, &outgoing.frame) => written,
        };

        match written {
            Ok(()) => {
                trace!(len = outgoing.frame.len(), "Wrote frame");
                let _ = outgoing.done.send(Ok(()));
            }
            Err(e) => {
                error!("Socket write failed, marking connection unusable: {}", e);
                shared.pending.close();
                let _ = stop_tx.send(true);
                let _ = outgoing.done.send(Err(e));
                break;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Socket shutdown failed: {}", e);
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
