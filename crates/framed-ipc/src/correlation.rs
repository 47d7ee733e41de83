//! Correlation identifiers and the pending-request table

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::Message;

/// How correlation identifiers are generated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// "1", "2", "3", ... per transport instance
    #[default]
    Sequential,
    /// Random v4 UUIDs
    Uuid,
}

/// Generates identifiers that are unique for the lifetime of one transport
#[derive(Debug)]
pub struct CorrelationIds {
    strategy: IdStrategy,
    counter: AtomicU64,
}

impl CorrelationIds {
    pub fn new(strategy: IdStrategy) -> Self {
        Self {
            strategy,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        match self.strategy {
            IdStrategy::Sequential => {
                let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
                n.to_string()
            }
            IdStrategy::Uuid => Uuid::new_v4().to_string(),
        }
    }
}

/// A waiter registered in a [`PendingTable`]
///
/// Dropping it deregisters the id, so a request future that is cancelled
/// mid-flight leaves nothing behind in the table.
pub struct Registration<'a> {
    table: &'a PendingTable,
    id: String,
    slot: oneshot::Receiver<Message>,
}

impl Registration<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the matching message
    ///
    /// Fails with [`Error::Disconnected`] once the table is closed.
    pub async fn response(&mut self) -> Result<Message> {
        (&mut self.slot).await.map_err(|_| Error::Disconnected)
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

struct Inner {
    open: bool,
    waiters: HashMap<String, oneshot::Sender<Message>>,
}

/// Map from correlation id to the waiter expecting that response
///
/// Checking `open` and inserting a waiter happen under the same lock, so a
/// waiter can never be registered after [`PendingTable::close`] has drained
/// the table.
pub struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    /// Create a closed table; [`PendingTable::open`] is called on connect
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                open: false,
                waiters: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Nothing in the critical sections can panic halfway through an update
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn open(&self) {
        self.lock().open = true;
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Register a waiter for `id`
    pub fn register(&self, id: &str) -> Result<Registration<'_>> {
        let mut inner = self.lock();
        if !inner.open {
            return Err(Error::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(id.to_string(), tx);
        Ok(Registration {
            table: self,
            id: id.to_string(),
            slot: rx,
        })
    }

    /// Hand `message` to the waiter registered for `id`
    ///
    /// Gives the message back when nobody is waiting for it (unknown id, or
    /// the waiter already timed out).
    pub fn complete(&self, id: &str, message: Message) -> Option<Message> {
        let sender = self.lock().waiters.remove(id);
        match sender {
            Some(tx) => tx.send(message).err(),
            None => Some(message),
        }
    }

    /// Deregister a waiter, returning whether it was still present
    pub fn remove(&self, id: &str) -> bool {
        self.lock().waiters.remove(id).is_some()
    }

    /// Refuse new waiters and release every current one
    ///
    /// Dropping the senders makes each waiting receiver observe an error,
    /// which callers report as [`Error::Disconnected`]. Returns how many
    /// waiters were released.
    pub fn close(&self) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.open = false;
            inner.waiters.drain().collect()
        };
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}
