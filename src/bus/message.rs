//! Logical and transport-level message representations.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Result;

/// Message headers.
pub type Headers = HashMap<String, String>;

/// Well-known header keys.
pub mod headers {
    /// Unique id of a logical message. Preserved across redeliveries.
    pub const MESSAGE_ID: &str = "msg-id";
    /// Stable type identifier of the message body.
    pub const TYPE: &str = "msg-type";
    /// `p2p` for sent commands, `pub` for published events.
    pub const INTENT: &str = "msg-intent";
    /// RFC 3339 timestamp of when the message was sent.
    pub const SENT_TIME: &str = "msg-senttime";
    /// Input queue of the sender.
    pub const SENDER_ADDRESS: &str = "msg-senderaddress";
    /// Description of the last error for dead-lettered messages.
    pub const ERROR_DETAILS: &str = "msg-error-details";

    pub const INTENT_P2P: &str = "p2p";
    pub const INTENT_PUB: &str = "pub";
}

/// Type identifier used for messages without a type header.
pub const UNKNOWN_MESSAGE_TYPE: &str = "<unknown>";

/// Default identifier for a message body type: `std::any::type_name::<T>()`.
///
/// The exact text is not guaranteed to stay the same across compiler
/// releases. Buses that export it as a metric label should register fixed
/// names instead (see `BusBuilder::with_type_name`).
pub fn message_type_name<T: ?Sized>() -> &'static str {
    std::any::type_name::<T>()
}

/// Logical message: headers plus a structured body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub headers: Headers,
    pub body: serde_json::Value,
}

impl Message {
    /// Build a message from a typed body, stamping its type header.
    pub fn new<T: Serialize>(body: &T) -> Result<Self> {
        let mut headers = Headers::new();
        headers.insert(headers::TYPE.to_string(), message_type_name::<T>().to_string());
        Ok(Self {
            headers,
            body: serde_json::to_value(body)?,
        })
    }

    /// Add or replace a header.
    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_string(), value.into());
        self
    }

    /// Value of the `msg-id` header.
    pub fn id(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_ID).map(String::as_str)
    }

    /// Value of the `msg-type` header, or `"<unknown>"`.
    pub fn message_type(&self) -> &str {
        message_type_of(&self.headers)
    }

    /// Deserialize the body into `T`.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Serialize into the wire representation.
    pub fn to_transport(&self) -> Result<TransportMessage> {
        Ok(TransportMessage {
            headers: self.headers.clone(),
            body: serde_json::to_vec(&self.body)?,
        })
    }
}

/// Wire-level message: headers plus serialized body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl TransportMessage {
    pub fn new(headers: Headers, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    /// Value of the `msg-id` header.
    pub fn id(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_ID).map(String::as_str)
    }

    /// Value of the `msg-type` header, or `"<unknown>"`.
    pub fn message_type(&self) -> &str {
        message_type_of(&self.headers)
    }

    /// Deserialize into the logical representation.
    pub fn to_message(&self) -> Result<Message> {
        Ok(Message {
            headers: self.headers.clone(),
            body: serde_json::from_slice(&self.body)?,
        })
    }
}

fn message_type_of(headers: &Headers) -> &str {
    headers
        .get(headers::TYPE)
        .map(String::as_str)
        .unwrap_or(UNKNOWN_MESSAGE_TYPE)
}
