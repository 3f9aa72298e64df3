//! In-process stream bus and request/reply mailboxes.
//!
//! [`Bus`] gives PUB/SUB semantics with topic-prefix subscriptions;
//! [`MailboxRegistry`] gives named request/reply endpoints with oneshot
//! replies. Both are cheap-to-clone handles over shared state, so every
//! actor can hold its own copy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::message::Message;

/// Errors produced by the transport layer.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("payload encode error: {0}")]
    Encode(String),

    #[error("payload decode error: {0}")]
    Decode(String),

    #[error("subscriber queue full on topic '{0}'")]
    Full(String),

    #[error("no mailbox named '{0}'")]
    NoSuchMailbox(String),

    #[error("peer closed while awaiting reply from '{0}'")]
    Closed(String),
}

// ── Stream bus ──────────────────────────────────────────────────────

struct Subscription {
    prefix: String,
    tx: mpsc::Sender<Message>,
}

/// In-process pub/sub bus with topic-prefix matching.
#[derive(Clone, Default)]
pub struct Bus {
    subs: Arc<Mutex<Vec<Subscription>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every topic starting with `prefix` (empty = everything).
    ///
    /// The returned receiver is bounded; a subscriber that stops draining
    /// makes `publish` report back-pressure instead of blocking the stream.
    pub fn subscribe(&self, prefix: impl Into<String>, capacity: usize) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(capacity);
        self.subs.lock().expect("bus lock poisoned").push(Subscription {
            prefix: prefix.into(),
            tx,
        });
        rx
    }

    /// Deliver a message to every matching subscriber.
    ///
    /// Closed subscribers are pruned. A full subscriber queue surfaces as
    /// [`TransportError::Full`]; the message still reaches the others, and
    /// the caller retries on its next tick.
    pub fn publish(&self, message: &Message) -> Result<(), TransportError> {
        let mut full = false;
        let mut subs = self.subs.lock().expect("bus lock poisoned");
        subs.retain(|sub| {
            if !message.topic.starts_with(&sub.prefix) {
                return true;
            }
            match sub.tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    full = true;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(prefix = %sub.prefix, "pruning closed subscriber");
                    false
                }
            }
        });
        if full {
            Err(TransportError::Full(message.topic.clone()))
        } else {
            Ok(())
        }
    }
}

// ── Request/reply mailboxes ─────────────────────────────────────────

/// A request delivered to a mailbox, with the channel its reply goes out on.
pub struct Request {
    pub message: Message,
    pub reply: oneshot::Sender<Message>,
}

/// Named request/reply endpoints.
#[derive(Clone, Default)]
pub struct MailboxRegistry {
    boxes: Arc<Mutex<HashMap<String, mpsc::Sender<Request>>>>,
}

impl MailboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mailbox and return its request receiver.
    ///
    /// Re-registering a name replaces the previous endpoint.
    pub fn register(&self, name: impl Into<String>, capacity: usize) -> mpsc::Receiver<Request> {
        let (tx, rx) = mpsc::channel(capacity);
        self.boxes
            .lock()
            .expect("mailbox lock poisoned")
            .insert(name.into(), tx);
        rx
    }

    /// Send a request to a named mailbox and await its reply.
    pub async fn request(&self, name: &str, message: Message) -> Result<Message, TransportError> {
        let tx = self
            .boxes
            .lock()
            .expect("mailbox lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::NoSuchMailbox(name.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Request {
            message,
            reply: reply_tx,
        })
        .await
        .map_err(|_| TransportError::Closed(name.to_string()))?;

        reply_rx
            .await
            .map_err(|_| TransportError::Closed(name.to_string()))
    }
}
