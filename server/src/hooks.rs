//! Application hooks.
//!
//! Traits application code implements to handle custom procedures and
//! receivers, react to new connections, and report health.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ServerError;
use crate::ws::socket::Socket;

/// Handles an invoke sent by a client under a registered name.
#[async_trait]
pub trait Procedure: Send + Sync {
    /// Handles the invoke. `Ok` resolves it, `Err` rejects it.
    async fn call(&self, socket: Arc<Socket>, data: Value) -> Result<Value, ServerError>;
}

/// Handles a fire-and-forget transmit sent by a client under a registered name.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Handles the transmit.
    async fn receive(&self, socket: Arc<Socket>, data: Value);
}

/// Called once per admitted connection, before the ready signal.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Returns optional data appended to the ready payload.
    async fn on_connection(&self, socket: &Arc<Socket>) -> anyhow::Result<Option<Value>>;
}

/// Health probe behind the `<path>/health` endpoint.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Returns true when the node is healthy.
    async fn check(&self) -> anyhow::Result<bool>;
}

/// Health check that always reports healthy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysHealthy;

#[async_trait]
impl HealthCheck for AlwaysHealthy {
    async fn check(&self) -> anyhow::Result<bool> {
        Ok(true)
    }
}
