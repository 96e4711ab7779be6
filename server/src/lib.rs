//! Switchyard - real-time WebSocket server.
//!
//! Authenticated socket connections with RPC-style invokes and transmits,
//! publish/subscribe channels, server-local groups and optional fan-out to
//! other nodes through an external broker.
//!
//! # Components
//!
//! - [`Server`]: listener, client registry, admission and background sweeps
//! - [`Socket`]: one connection: auth state, subscriptions, transport
//! - [`InternalBroker`] / [`ChannelExchange`]: channel interest and fan-out
//! - [`ExternalBrokerClient`]: cluster bridge, with a Redis implementation
//! - [`AuthEngine`]: JWT signing and verification
//! - [`OriginsChecker`]: handshake origin filter
//!
//! # Example
//!
//! ```rust,no_run
//! use switchyard_server::{Server, ServerOptions};
//!
//! # async fn run() -> Result<(), switchyard_server::ServerError> {
//! let server = Server::new(ServerOptions::with_port(8000))?;
//! server.exchange().subscribe("news");
//! server.listen().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod broker;
pub mod config;
pub mod emitter;
pub mod error;
pub mod group;
pub mod hooks;
pub mod metrics;
pub mod middleware;
pub mod origins;
pub mod server;
pub mod ws;

pub use auth::{AuthEngine, Claims, SignOptions};
pub use broker::{
    ChannelExchange, ExchangePublish, ExternalBrokerClient, ExternalInbound, InternalBroker,
    NoopBrokerClient, RedisBrokerClient, RedisBrokerOptions,
};
pub use config::{AuthOptions, ConfigError, ServerOptions};
pub use emitter::{EventEmitter, ListenerId};
pub use error::{close_codes, ErrorPayload, ServerError};
pub use group::{GroupTransmitOptions, Groups};
pub use hooks::{ConnectionHandler, HealthCheck, Procedure, Receiver};
pub use metrics::{CountersSnapshot, ServerCounters};
pub use middleware::{Block, Middlewares, Verdict};
pub use origins::OriginsChecker;
pub use server::{Server, ServerEvent};
pub use ws::{Socket, SocketEvent, UpgradeRequest};
