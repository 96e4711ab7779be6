//! External broker client interface.
//!
//! Bridges channel interest and publishes to other server nodes. Calls are
//! non-blocking: implementations queue work for their own background tasks
//! and report inbound publishes through an [`ExternalInbound`] handle, which
//! marshals them back onto the broker's inbound pump.

use std::fmt;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::ws::messages::DataType;

/// A publish received from another node.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalMessage {
    /// Channel name.
    pub channel: String,
    /// Payload.
    pub data: Value,
    /// Encoding the payload arrived with.
    pub data_type: DataType,
}

/// Handle external clients use to deliver inbound publishes.
#[derive(Debug, Clone)]
pub struct ExternalInbound {
    tx: mpsc::UnboundedSender<ExternalMessage>,
}

impl ExternalInbound {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ExternalMessage>) -> Self {
        Self { tx }
    }

    /// Reports a publish received from the cluster. Returns false once the
    /// broker has shut down.
    pub fn publish(&self, channel: impl Into<String>, data: Value, data_type: DataType) -> bool {
        self.tx
            .send(ExternalMessage {
                channel: channel.into(),
                data,
                data_type,
            })
            .is_ok()
    }
}

/// Pluggable bridge to a multi-node broker cluster.
pub trait ExternalBrokerClient: Send + Sync + fmt::Debug {
    /// Receives the handle for reporting inbound publishes.
    fn bind(&self, inbound: ExternalInbound);

    /// Starts receiving publishes for a channel.
    fn subscribe(&self, channel: &str);

    /// Stops receiving publishes for a channel.
    fn unsubscribe(&self, channel: &str);

    /// Forwards a local publish to the cluster.
    fn publish(&self, channel: &str, data: &Value, complex_types: bool);

    /// Tears down the connection to the cluster.
    fn terminate(&self);
}

/// Single-node client that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBrokerClient;

impl ExternalBrokerClient for NoopBrokerClient {
    fn bind(&self, _inbound: ExternalInbound) {}

    fn subscribe(&self, _channel: &str) {}

    fn unsubscribe(&self, _channel: &str) {}

    fn publish(&self, _channel: &str, _data: &Value, _complex_types: bool) {}

    fn terminate(&self) {}
}
