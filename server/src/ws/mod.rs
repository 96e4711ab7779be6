//! WebSocket layer.
//!
//! Wire packets, the per-socket transport, topic membership, the socket
//! state machine and the HTTP upgrade handler.
//!
//! # Packets
//!
//! - `transmit`: fire-and-forget message to a named receiver
//! - `invoke` / `response` / `reject`: request-response by numeric id
//! - `batch`: several packets in one frame

pub mod handler;
pub mod messages;
pub mod socket;
pub mod topics;
pub mod transport;

pub use handler::UpgradeRequest;
pub use messages::{DataType, Packet, ReadyPayload};
pub use socket::{Socket, SocketEvent};
pub use topics::{TopicMember, Topics};
pub use transport::{Frame, FrameQueue, FrameSink, PreparedPackage, Transport};
