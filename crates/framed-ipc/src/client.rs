//! Framed socket transport
//!
//! Owns one connection to a local endpoint at a time, writes framed
//! requests and notifications through the writer task, and matches
//! responses to requests by correlation key.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::correlation::CorrelationIds;
use crate::error::{Error, Result};
use crate::framing::FrameCodec;
use crate::listener::{self, NotificationHandler, Shared};
use crate::protocol::Message;
use crate::writer::{self, Outgoing};

/// The active connection and its background tasks
struct Connection {
    path: PathBuf,
    outgoing: mpsc::Sender<Outgoing>,
    stop: Arc<watch::Sender<bool>>,
    writer: JoinHandle<()>,
    listener: JoinHandle<()>,
}

/// Request/response transport over a Unix domain socket
///
/// Callers share one instance (typically behind an `Arc`). Frames are
/// written by a single writer task, so concurrent requests never interleave
/// their bytes, and dropping a request future at any point is safe.
pub struct Transport {
    config: TransportConfig,
    ids: CorrelationIds,
    shared: Arc<Shared>,
    connection: Mutex<Option<Connection>>,
}

impl Transport {
    /// Create a disconnected transport
    pub fn new(config: TransportConfig) -> Self {
        Self {
            ids: CorrelationIds::new(config.correlation_ids),
            shared: Arc::new(Shared::new(config.correlation_field.clone())),
            config,
            connection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Connect using the configured connect timeout
    pub async fn connect(&self, path: impl AsRef<Path>) -> Result<()> {
        self.connect_with_timeout(path, self.config.connect_timeout())
            .await
    }

    /// Connect to the socket at `path` and start the listener task
    ///
    /// An existing connection is torn down first; requests still waiting on
    /// it fail with [`Error::Disconnected`].
    pub async fn connect_with_timeout(&self, path: impl AsRef<Path>, timeout: Duration) -> Result<()> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(Error::EndpointNotFound(path.to_path_buf()));
        }

        info!("Connecting to {}", path.display());

        let stream = match tokio::time::timeout(timeout, UnixStream::connect(path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::EndpointNotFound(path.to_path_buf()));
            }
            Ok(Err(e)) => {
                return Err(Error::ConnectError {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
            Err(_) => {
                return Err(Error::ConnectTimeout {
                    path: path.to_path_buf(),
                    timeout,
                });
            }
        };

        let mut slot = self.connection.lock().await;
        if let Some(previous) = slot.take() {
            warn!("Replacing existing connection to {}", previous.path.display());
            self.teardown(previous).await;
        }

        let (reader, write_half) = stream.into_split();
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let (queue_tx, queue_rx) = mpsc::channel(writer::QUEUE_DEPTH);
        let frames = FramedRead::with_capacity(
            reader,
            FrameCodec::new(self.config.framing, self.config.max_frame_len),
            self.config.read_chunk_size,
        );

        self.shared.pending.open();
        let listener = tokio::spawn(listener::run(
            frames,
            stop_rx.clone(),
            Arc::clone(&self.shared),
        ));
        let writer = tokio::spawn(writer::run(
            write_half,
            queue_rx,
            stop_rx,
            Arc::clone(&stop_tx),
            Arc::clone(&self.shared),
        ));

        *slot = Some(Connection {
            path: path.to_path_buf(),
            outgoing: queue_tx,
            stop: stop_tx,
            writer,
            listener,
        });

        info!(framing = ?self.config.framing, "Connected to {}", path.display());
        Ok(())
    }

    /// Whether the connection is still usable
    ///
    /// Turns false as soon as the peer closes, a write fails, or
    /// [`Transport::disconnect`] is called.
    pub fn is_connected(&self) -> bool {
        self.shared.pending.is_open()
    }

    /// Endpoint of the current connection
    pub async fn socket_path(&self) -> Option<PathBuf> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|conn| conn.path.clone())
    }

    /// Number of requests waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Register the callback for inbound messages that match no pending request
    ///
    /// The callback runs on the listener task and must not block; hand work
    /// off to a channel if it is expensive. Replaces any previous handler.
    pub fn set_notification_handler<F>(&self, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let handler: NotificationHandler = Arc::new(handler);
        self.shared.set_handler(Some(handler));
    }

    pub fn clear_notification_handler(&self) {
        self.shared.set_handler(None);
    }

    /// Send a request using the configured request timeout
    pub async fn request<P: Serialize>(&self, method: &str, params: P) -> Result<serde_json::Value> {
        self.request_with_timeout(method, params, self.config.request_timeout())
            .await
    }

    /// Send a request and wait for the matching response
    ///
    /// `timeout` covers both handing the frame to the socket and waiting for
    /// the reply. On timeout or cancellation the request is deregistered, so
    /// a response that turns up later is handed to the notification handler
    /// instead.
    pub async fn request_with_timeout<P: Serialize>(
        &self,
        method: &str,
        params: P,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let id = self.ids.next_id();
        let request = self.prepare(
            Message::request(id.clone(), method, serde_json::to_value(params)?)
                .with_correlation(&self.config.correlation_field, &id),
        );
        let frame = self
            .config
            .framing
            .encode(&request.encode()?, self.config.max_frame_len)?;

        // Register before writing so a fast response cannot beat the waiter
        let mut registration = self.shared.pending.register(&id)?;

        let start = Instant::now();
        debug!(method, id = %id, "Sending request");

        let exchange = async {
            self.send_frame(frame).await?;
            let sent = start.elapsed();
            let response = registration.response().await?;
            Ok::<_, Error>((sent, response))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok((sent, response))) => {
                debug!(
                    method,
                    id = %id,
                    write_ms = sent.as_micros() as f64 / 1000.0,
                    elapsed_ms = start.elapsed().as_micros() as f64 / 1000.0,
                    "Received response"
                );
                response.into_result().map_err(Error::Remote)
            }
            Ok(Err(e)) => {
                debug!(method, id = %id, "Request failed: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!(method, id = %id, ?timeout, "Request timed out");
                Err(Error::RequestTimeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Send a request with no parameters
    pub async fn request_empty(&self, method: &str) -> Result<serde_json::Value> {
        self.request(method, serde_json::json!({})).await
    }

    /// Send a notification; no response is expected
    ///
    /// Waits at most the configured request timeout for the socket to take
    /// the frame.
    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        let notification = self.prepare(Message::notification(method, serde_json::to_value(params)?));
        let frame = self
            .config
            .framing
            .encode(&notification.encode()?, self.config.max_frame_len)?;

        let timeout = self.config.request_timeout();
        tokio::time::timeout(timeout, self.send_frame(frame))
            .await
            .map_err(|_| Error::WriteTimeout { timeout })??;
        debug!(method, "Sent notification");
        Ok(())
    }

    /// Check if the peer answers the configured health method
    pub async fn health_check(&self) -> bool {
        match self.request_empty(&self.config.health_method).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Health check failed: {}", e);
                false
            }
        }
    }

    /// Stop the background tasks, close the socket, and fail every pending
    /// request with [`Error::Disconnected`]
    pub async fn disconnect(&self) {
        let released = self.shared.pending.close();
        if released > 0 {
            debug!(released, "Released pending requests on disconnect");
        }

        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            self.teardown(connection).await;
        }
    }

    /// Attach configured headers and context fields
    fn prepare(&self, message: Message) -> Message {
        message
            .with_headers(&self.config.headers)
            .with_context(&self.config.context)
    }

    /// Queue one complete frame and wait until it is on the socket
    async fn send_frame(&self, frame: Bytes) -> Result<()> {
        let outgoing = {
            let slot = self.connection.lock().await;
            let connection = slot.as_ref().ok_or(Error::NotConnected)?;
            connection.outgoing.clone()
        };

        // The listener or writer may already have seen the peer go away
        if !self.shared.pending.is_open() {
            return Err(Error::NotConnected);
        }

        let (done, written) = oneshot::channel();
        outgoing
            .send(Outgoing { frame, done })
            .await
            .map_err(|_| Error::NotConnected)?;

        match written.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::SendError(e)),
            Err(_) => Err(Error::Disconnected),
        }
    }

    async fn teardown(&self, connection: Connection) {
        let Connection {
            path,
            outgoing,
            stop,
            writer,
            listener,
        } = connection;

        let _ = stop.send(true);
        self.shared.pending.close();
        drop(outgoing);

        let grace = self.config.shutdown_grace();
        join_or_abort("writer", writer, grace).await;
        join_or_abort("listener", listener, grace).await;

        info!("Disconnected from {}", path.display());
    }
}

/// Wait for a background task to finish, aborting it after `grace`
async fn join_or_abort(name: &str, mut task: JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, &mut task).await.is_err() {
        warn!(task = name, "Task did not stop within grace period, aborting");
        task.abort();
        let _ = task.await;
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // Async teardown is not possible here; stop both tasks and let the
        // socket halves drop with them
        if let Some(connection) = self.connection.get_mut().take() {
            let _ = connection.stop.send(true);
            connection.writer.abort();
            connection.listener.abort();
        }
        self.shared.pending.close();
    }
}
