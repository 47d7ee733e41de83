//! Framed request/response transport over Unix domain sockets
//!
//! This crate talks to a local application over a filesystem socket. It
//! frames outgoing messages, reassembles inbound frames on a background
//! listener task, and matches responses to requests by correlation id. It
//! has no knowledge of the methods being called.
//!
//! # Architecture
//!
//! ```text
//!  caller tasks                       Transport
//! ┌──────────────┐  request()   ┌──────────────────────┐   frames   ┌──────────┐
//! │  request A   │────────────>│ queue -> writer task ────────────>│          │
//! │  request B   │             │                      │            │  peer    │
//! │  notify      │             │ pending table        │<───────────│ (socket) │
//! └──────▲───────┘             │  key -> oneshot      │  listener  └──────────┘
//!        │ response            └──────────┬───────────┘   task
//!        └────────────────────────────────┘
//! ```
//!
//! The byte layout is pluggable via [`Framing`]: a length prefix of 2, 4 or
//! 8 bytes in either byte order, or a single-byte delimiter.
//!
//! # Usage
//!
//! ```rust,ignore
//! use framed_ipc::{Transport, TransportConfig};
//!
//! let transport = Transport::new(TransportConfig::default());
//! transport.connect("/path/to/app.sock").await?;
//!
//! transport.set_notification_handler(|msg| {
//!     tracing::info!(method = ?msg.method, "notification");
//! });
//!
//! let result = transport.request("ping", json!({})).await?;
//! transport.disconnect().await;
//! ```

mod client;
pub mod config;
pub mod correlation;
pub mod discovery;
mod error;
pub mod framing;
mod listener;
mod protocol;
mod writer;

pub use client::Transport;
pub use config::TransportConfig;
pub use correlation::IdStrategy;
pub use error::{Error, Result};
pub use framing::{ByteOrder, FrameCodec, Framing, PrefixWidth};
pub use listener::NotificationHandler;
pub use protocol::{Message, MessageKind, RemoteError};
