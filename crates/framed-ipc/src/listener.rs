//! Background receive loop
//!
//! One listener task runs per connection. It owns the read half of the
//! socket wrapped in a [`FramedRead`], and is the only place inbound frames
//! are decoded and dispatched.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use futures::StreamExt;
use tokio::net::unix::OwnedReadHalf;
use tokio::sync::watch;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, trace, warn};

use crate::correlation::PendingTable;
use crate::framing::FrameCodec;
use crate::protocol::Message;

/// Callback for inbound messages that match no pending request
pub type NotificationHandler = Arc<dyn Fn(Message) + Send + Sync + 'static>;

/// State shared between a transport and its listener task
pub(crate) struct Shared {
    pub(crate) pending: PendingTable,
    /// Top-level field that carries the correlation key
    correlation_field: String,
    handler: RwLock<Option<NotificationHandler>>,
}

impl Shared {
    pub(crate) fn new(correlation_field: impl Into<String>) -> Self {
        Self {
            pending: PendingTable::new(),
            correlation_field: correlation_field.into(),
            handler: RwLock::new(None),
        }
    }

    pub(crate) fn set_handler(&self, handler: Option<NotificationHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    fn handler(&self) -> Option<NotificationHandler> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Route one frame payload to its waiter or to the notification handler
    pub(crate) fn dispatch(&self, frame: &[u8]) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(len = frame.len(), "Discarding frame: {}", e);
                return;
            }
        };

        trace!(id = ?message.id, kind = ?message.kind(), "Received message");

        let unmatched = match message.correlation_key(&self.correlation_field) {
            Some(key) => self.pending.complete(&key, message),
            None => Some(message),
        };

        let Some(message) = unmatched else {
            return;
        };

        match self.handler() {
            Some(handler) => {
                let method = message.method.clone();
                if panic::catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                    error!(method = ?method, "Notification handler panicked");
                }
            }
            None => {
                debug!(
                    id = ?message.id,
                    method = ?message.method,
                    "No notification handler registered, dropping message"
                );
            }
        }
    }
}

/// Read until the peer closes, a read fails, or a stop is signalled
///
/// On exit the pending table is closed, so every caller still waiting for a
/// response observes a disconnect instead of running into its timeout.
pub(crate) async fn run(
    mut frames: FramedRead<OwnedReadHalf, FrameCodec>,
    mut stop: watch::Receiver<bool>,
    shared: Arc<Shared>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => {
                debug!("Listener stopping");
                break;
            }
            next = frames.next() => match next {
                Some(Ok(frame)) => {
                    trace!(len = frame.len(), "Read frame");
                    shared.dispatch(&frame);
                }
                Some(Err(e)) => {
                    error!("Socket read failed: {}", e);
                    break;
                }
                None => {
                    info!("Connection closed by peer");
                    break;
                }
            }
        }
    }

    let discarded = frames.decoder().discarded();
    if discarded > 0 {
        debug!(discarded, "Oversize input was discarded on this connection");
    }

    let released = shared.pending.close();
    if released > 0 {
        warn!(released, "Released pending requests after listener exit");
    }
}
