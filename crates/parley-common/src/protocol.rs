//! Wire messages exchanged between peers.
//!
//! Every call carries exactly one [`Envelope`] serialized as a JSON object
//! tagged by `"type"`. Replies are either an envelope or the bare token
//! [`ACK_TOKEN`].

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Acknowledgment reply for message, file and disconnect deliveries.
pub const ACK_TOKEN: &str = "OK";

/// One structured message unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Ask a peer to open a connection.
    ConnectionRequest {
        username: String,
        #[serde(rename = "ip", alias = "host")]
        host: String,
        port: u16,
    },

    /// The peer agreed to connect.
    ConnectionAccepted {
        username: String,
        #[serde(rename = "ip", alias = "host", default)]
        host: String,
        #[serde(default)]
        port: u16,
    },

    /// The peer declined to connect.
    ConnectionRefused {
        username: String,
        #[serde(default)]
        reason: String,
    },

    /// Carries the sender's PEM encoded public key.
    KeyExchange { username: String, public_key: String },

    /// The receiver already holds the sender's key.
    KeyExchangeAck { username: String },

    /// Chat text.
    Message { username: String, content: String },

    /// A whole file, base64 encoded.
    File {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        filename: String,
        content: String,
    },

    /// Tear down the connection.
    Disconnect { username: String },

    DisconnectAck {},

    /// Failure report in place of the expected reply.
    Error {
        #[serde(rename = "error")]
        detail: String,
    },
}

impl Envelope {
    /// Wire tag of this envelope, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionRequest { .. } => "connection_request",
            Self::ConnectionAccepted { .. } => "connection_accepted",
            Self::ConnectionRefused { .. } => "connection_refused",
            Self::KeyExchange { .. } => "key_exchange",
            Self::KeyExchangeAck { .. } => "key_exchange_ack",
            Self::Message { .. } => "message",
            Self::File { .. } => "file",
            Self::Disconnect { .. } => "disconnect",
            Self::DisconnectAck {} => "disconnect_ack",
            Self::Error { .. } => "error",
        }
    }

    /// Username claimed by the sender, when the envelope carries one.
    pub fn sender(&self) -> Option<&str> {
        match self {
            Self::ConnectionRequest { username, .. }
            | Self::ConnectionAccepted { username, .. }
            | Self::ConnectionRefused { username, .. }
            | Self::KeyExchange { username, .. }
            | Self::KeyExchangeAck { username }
            | Self::Message { username, .. }
            | Self::Disconnect { username } => Some(username),
            Self::File { username, .. } => username.as_deref(),
            Self::DisconnectAck {} | Self::Error { .. } => None,
        }
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the JSON wire form.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::protocol(format!("bad envelope: {e}")))
    }
}

/// An inbound call payload after opening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A well-formed envelope.
    Envelope(Envelope),
    /// Anything that did not parse; treated as plain text.
    Text(String),
}

impl Inbound {
    /// Classify an opened payload.
    pub fn classify(text: String) -> Self {
        match Envelope::decode(&text) {
            Ok(envelope) => Self::Envelope(envelope),
            Err(_) => Self::Text(text),
        }
    }
}

/// Reply to one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The bare [`ACK_TOKEN`].
    Ack,
    Envelope(Envelope),
}

impl Reply {
    pub fn encode(&self) -> Result<String> {
        match self {
            Self::Ack => Ok(ACK_TOKEN.to_string()),
            Self::Envelope(envelope) => envelope.encode(),
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        if text == ACK_TOKEN {
            return Ok(Self::Ack);
        }
        Envelope::decode(text).map(Self::Envelope)
    }
}

impl From<Envelope> for Reply {
    fn from(envelope: Envelope) -> Self {
        Self::Envelope(envelope)
    }
}
