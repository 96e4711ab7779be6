//! Wire packet types.
//!
//! Defines the JSON packets exchanged with clients and the reserved
//! procedure, receiver and push names of the protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorPayload;

/// Sub-protocol name offered in `Sec-WebSocket-Protocol`.
pub const PROTOCOL_NAME: &str = "switchyard";

/// Built-in procedures (client → server invokes).
pub mod procedures {
    /// Authenticate with a signed token.
    pub const AUTHENTICATE: &str = "#authenticate";
    /// Subscribe to a channel.
    pub const SUBSCRIBE: &str = "#subscribe";
    /// Publish to a channel and wait for the ack.
    pub const PUBLISH: &str = "#publish";
}

/// Built-in receivers (client → server transmits).
pub mod receivers {
    /// Drop the current auth token.
    pub const DEAUTHENTICATE: &str = "#deauthenticate";
    /// Unsubscribe from a channel.
    pub const UNSUBSCRIBE: &str = "#unsubscribe";
    /// Publish to a channel without an ack.
    pub const PUBLISH: &str = "#publish";
}

/// Server pushes (server → client transmits).
pub mod pushes {
    /// Connection admitted.
    pub const READY: &str = "#ready";
    /// New auth token issued by the server.
    pub const SET_AUTH_TOKEN: &str = "#setAuthToken";
    /// Auth token removed by the server.
    pub const REMOVE_AUTH_TOKEN: &str = "#removeAuthToken";
    /// Socket was forcibly unsubscribed from a channel.
    pub const KICK_OUT: &str = "#kickOut";
    /// Channel publish delivery.
    pub const PUBLISH: &str = "#publish";
}

/// Returns true for names reserved by the protocol.
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    name.starts_with('#')
}

/// Encoding of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Text frame carrying plain JSON.
    Json,
    /// Binary frame, which may carry data needing complex-type handling.
    Binary,
}

impl DataType {
    /// Returns true if payloads of this type need complex-type handling.
    #[must_use]
    pub fn is_complex(self) -> bool {
        matches!(self, Self::Binary)
    }
}

/// A protocol packet. The same shape is used in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Packet {
    /// Fire-and-forget message.
    Transmit {
        /// Receiver name.
        receiver: String,
        /// Payload.
        #[serde(default)]
        data: Value,
    },

    /// Request expecting a response or reject with the same id.
    Invoke {
        /// Call id.
        id: u64,
        /// Procedure name.
        procedure: String,
        /// Payload.
        #[serde(default)]
        data: Value,
    },

    /// Successful answer to an invoke.
    Response {
        /// Call id.
        id: u64,
        /// Result.
        #[serde(default)]
        data: Value,
    },

    /// Failed answer to an invoke.
    Reject {
        /// Call id.
        id: u64,
        /// Error.
        error: ErrorPayload,
    },

    /// Several packets coalesced into one frame.
    Batch {
        /// Packets in send order.
        packets: Vec<Packet>,
    },
}

impl Packet {
    /// Creates a transmit packet.
    #[must_use]
    pub fn transmit(receiver: impl Into<String>, data: Value) -> Self {
        Self::Transmit {
            receiver: receiver.into(),
            data,
        }
    }

    /// Creates an invoke packet.
    #[must_use]
    pub fn invoke(id: u64, procedure: impl Into<String>, data: Value) -> Self {
        Self::Invoke {
            id,
            procedure: procedure.into(),
            data,
        }
    }

    /// Creates a response packet.
    #[must_use]
    pub fn response(id: u64, data: Value) -> Self {
        Self::Response { id, data }
    }

    /// Creates a reject packet.
    #[must_use]
    pub fn reject(id: u64, error: ErrorPayload) -> Self {
        Self::Reject { id, error }
    }

    /// Wraps packets in a batch. A single packet is returned unwrapped.
    #[must_use]
    pub fn batch(mut packets: Vec<Packet>) -> Self {
        if packets.len() == 1 {
            if let Some(packet) = packets.pop() {
                return packet;
            }
        }
        Self::Batch { packets }
    }
}

/// Payload of the ready signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyPayload {
    /// Socket id.
    pub id: String,
    /// Server ping interval in milliseconds.
    pub ping_interval: u64,
    /// Maximum inbound message size, if limited.
    pub max_payload: Option<usize>,
    /// Outcome of the handshake token: 0 ok, 1 failure, 2 bad token.
    pub auth_token_state: u8,
    /// Data returned by the connection handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_data: Option<Value>,
}

/// Handshake token processing outcome reported in [`ReadyPayload`].
pub mod auth_token_state {
    /// No token, or the token was accepted.
    pub const OK: u8 = 0;
    /// Processing failed for a reason unrelated to the token itself.
    pub const FAILED: u8 = 1;
    /// The token failed verification.
    pub const BAD_TOKEN: u8 = 2;
}
