//! Middleware hooks.
//!
//! Each hook returns a [`Verdict`]: allow the action, block it with a
//! caller-visible code and message, or report a fault. Faults are surfaced
//! to operators through the server error event; the remote peer only ever
//! sees a generic block.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::Claims;
use crate::error::close_codes;
use crate::ws::handler::UpgradeRequest;
use crate::ws::socket::Socket;

/// Default block name.
pub const BLOCK_NAME: &str = "MiddlewareBlock";

/// A deliberate rejection raised by a middleware hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Caller-visible code.
    pub code: u16,
    /// Error name.
    pub name: String,
    /// Caller-visible message.
    pub message: Option<String>,
}

impl Default for Block {
    fn default() -> Self {
        Self {
            code: close_codes::BLOCKED,
            name: BLOCK_NAME.to_string(),
            message: None,
        }
    }
}

impl Block {
    /// Creates a block with a code and message.
    #[must_use]
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Sets the error name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns the message, or a generic one when none was given.
    #[must_use]
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or("Blocked by middleware")
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name, self.code, self.message())
    }
}

/// Outcome of a middleware hook.
#[derive(Debug)]
pub enum Verdict {
    /// Let the action proceed.
    Allow,
    /// Reject the action with the given block.
    Block(Block),
    /// The hook itself failed.
    Fault(anyhow::Error),
}

impl Verdict {
    /// Shorthand for a block with a code and message.
    #[must_use]
    pub fn block(code: u16, message: impl Into<String>) -> Self {
        Self::Block(Block::new(code, message))
    }

    /// Returns true for [`Verdict::Allow`].
    #[must_use]
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

impl From<anyhow::Result<()>> for Verdict {
    fn from(result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => Self::Allow,
            Err(e) => Self::Fault(e),
        }
    }
}

/// Runs before an HTTP request is upgraded to a socket.
#[async_trait]
pub trait UpgradeMiddleware: Send + Sync {
    /// Inspects the upgrade request.
    async fn on_upgrade(&self, request: &UpgradeRequest) -> Verdict;
}

/// Runs once a socket has been constructed, before it is marked ready.
#[async_trait]
pub trait SocketMiddleware: Send + Sync {
    /// Inspects the new socket.
    async fn on_socket(&self, socket: &Arc<Socket>) -> Verdict;
}

/// Runs after a token verified, before it is assigned to the socket.
#[async_trait]
pub trait AuthenticateMiddleware: Send + Sync {
    /// Inspects the verified claims.
    async fn on_authenticate(
        &self,
        socket: &Arc<Socket>,
        claims: &Claims,
        signed_token: &str,
    ) -> Verdict;
}

/// Runs before a socket subscribes to a channel.
#[async_trait]
pub trait SubscribeMiddleware: Send + Sync {
    /// Inspects the subscription.
    async fn on_subscribe(&self, socket: &Arc<Socket>, channel: &str) -> Verdict;
}

/// Runs before a client publish reaches the broker.
#[async_trait]
pub trait PublishInMiddleware: Send + Sync {
    /// Inspects the inbound publish.
    async fn on_publish_in(&self, socket: &Arc<Socket>, channel: &str, data: &Value) -> Verdict;
}

/// Runs once per recipient before a channel publish is delivered.
#[async_trait]
pub trait PublishOutMiddleware: Send + Sync {
    /// Inspects the outbound delivery.
    async fn on_publish_out(&self, socket: &Arc<Socket>, channel: &str, data: &Value)
        -> Verdict;
}

/// The middleware slots of a server.
#[derive(Clone, Default)]
pub struct Middlewares {
    /// Upgrade hook.
    pub upgrade: Option<Arc<dyn UpgradeMiddleware>>,
    /// Socket hook.
    pub socket: Option<Arc<dyn SocketMiddleware>>,
    /// Authenticate hook.
    pub authenticate: Option<Arc<dyn AuthenticateMiddleware>>,
    /// Subscribe hook.
    pub subscribe: Option<Arc<dyn SubscribeMiddleware>>,
    /// Inbound publish hook.
    pub publish_in: Option<Arc<dyn PublishInMiddleware>>,
    /// Outbound publish hook.
    pub publish_out: Option<Arc<dyn PublishOutMiddleware>>,
}

impl fmt::Debug for Middlewares {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middlewares")
            .field("upgrade", &self.upgrade.is_some())
            .field("socket", &self.socket.is_some())
            .field("authenticate", &self.authenticate.is_some())
            .field("subscribe", &self.subscribe.is_some())
            .field("publish_in", &self.publish_in.is_some())
            .field("publish_out", &self.publish_out.is_some())
            .finish()
    }
}
