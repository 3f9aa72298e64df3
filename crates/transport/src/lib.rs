//! Messaging contracts between the alert engine and its collaborators.
//!
//! This crate provides:
//! - The [`Message`](message::Message) envelope (topic, payload, correlation)
//! - Typed event payloads: metrics, assets, licensing, alert records
//! - An in-process [`Bus`](bus::Bus) (stream pub/sub) and
//!   [`MailboxRegistry`](bus::MailboxRegistry) (request/reply)
//!
//! The wire encoding of the framing format is out of scope; actors exchange
//! decoded envelopes over channels.

pub mod bus;
pub mod events;
pub mod message;

pub use bus::{Bus, MailboxRegistry, TransportError};
pub use message::Message;
