//! Scripted socket peer for integration tests

#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use framed_ipc::{FrameCodec, Framing, Message};
use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Framed;

const MAX_FRAME: usize = 1024 * 1024;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A listening socket inside a temporary directory
pub struct TestServer {
    _dir: TempDir,
    pub path: PathBuf,
    listener: Arc<UnixListener>,
    framing: Framing,
}

impl TestServer {
    pub fn bind() -> Self {
        Self::bind_with(Framing::default())
    }

    pub fn bind_with(framing: Framing) -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.sock");
        let listener = UnixListener::bind(&path).unwrap();
        Self {
            _dir: dir,
            path,
            listener: Arc::new(listener),
            framing,
        }
    }

    /// Accept the next connection; the future does not borrow the server
    pub fn accept(&self) -> impl Future<Output = Peer> + Send + 'static {
        let listener = Arc::clone(&self.listener);
        let framing = self.framing;
        async move {
            let (stream, _) = listener.accept().await.unwrap();
            Peer {
                framed: Framed::new(stream, FrameCodec::new(framing, MAX_FRAME)),
            }
        }
    }
}

/// Server side of one accepted connection
pub struct Peer {
    framed: Framed<UnixStream, FrameCodec>,
}

impl Peer {
    /// Next decoded message, or None once the client closes the socket
    pub async fn recv(&mut self) -> Option<Message> {
        let frame = self.framed.next().await?.ok()?;
        Some(Message::decode(&frame).unwrap())
    }

    pub async fn send(&mut self, message: &Message) {
        let payload = Bytes::from(message.encode().unwrap());
        self.framed.send(payload).await.unwrap();
    }

    /// Write bytes straight to the socket, bypassing the codec
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await.unwrap();
        stream.flush().await.unwrap();
    }
}
