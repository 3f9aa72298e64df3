use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::TransportError;

/// Envelope for every message exchanged between actors.
///
/// Payloads are MessagePack-encoded for compact transport. `topic` drives
/// stream routing, `sender` names the mailbox a reply should go back to, and
/// `correlation_id` ties a reply to its request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Routing topic (e.g. "metrics", "assets", "alerts").
    pub topic: String,

    /// Mailbox name of the sender; empty for stream publications.
    pub sender: String,

    /// MessagePack-encoded payload.
    pub payload: Vec<u8>,

    /// When this message was created.
    pub timestamp: DateTime<Utc>,

    /// Correlation id tying replies to requests.
    pub correlation_id: Uuid,
}

impl Message {
    /// Create a stream message, serializing the payload with MessagePack.
    pub fn new<T: Serialize>(topic: impl Into<String>, payload: &T) -> Result<Self, TransportError> {
        Ok(Self {
            topic: topic.into(),
            sender: String::new(),
            payload: rmp_serde::to_vec(payload).map_err(|e| TransportError::Encode(e.to_string()))?,
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4(),
        })
    }

    /// Create a request from a named mailbox.
    pub fn request<T: Serialize>(
        topic: impl Into<String>,
        sender: impl Into<String>,
        payload: &T,
    ) -> Result<Self, TransportError> {
        let mut msg = Self::new(topic, payload)?;
        msg.sender = sender.into();
        Ok(msg)
    }

    /// Create a reply carrying the request's correlation id.
    pub fn reply_to<T: Serialize>(&self, payload: &T) -> Result<Self, TransportError> {
        Ok(Self {
            topic: self.topic.clone(),
            sender: String::new(),
            payload: rmp_serde::to_vec(payload).map_err(|e| TransportError::Encode(e.to_string()))?,
            timestamp: Utc::now(),
            correlation_id: self.correlation_id,
        })
    }

    /// Deserialize the payload into the expected type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, TransportError> {
        rmp_serde::from_slice(&self.payload).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roundtrip() {
        let msg = Message::new("metrics", &("abc@fff".to_string(), 25u64)).unwrap();
        assert_eq!(msg.topic, "metrics");
        assert!(msg.sender.is_empty());
        let (key, value): (String, u64) = msg.decode().unwrap();
        assert_eq!(key, "abc@fff");
        assert_eq!(value, 25);
    }

    #[test]
    fn reply_keeps_correlation_id() {
        let req = Message::request("rules", "operator-1", &"LIST".to_string()).unwrap();
        assert_eq!(req.sender, "operator-1");
        let rep = req.reply_to(&"OK".to_string()).unwrap();
        assert_eq!(rep.correlation_id, req.correlation_id);
        assert_eq!(rep.decode::<String>().unwrap(), "OK");
    }

    #[test]
    fn decode_wrong_type_errors() {
        let msg = Message::new("metrics", &42u64).unwrap();
        assert!(msg.decode::<Vec<String>>().is_err());
    }
}
