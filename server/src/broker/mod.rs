//! Channel brokering.
//!
//! The [`InternalBroker`] tracks channel interest and fans publishes out to
//! local sockets; the [`ChannelExchange`] is its server-side facade; an
//! [`ExternalBrokerClient`] bridges publishes between server nodes.

pub mod exchange;
pub mod external;
pub mod internal;
pub mod redis_broker;

pub use exchange::{ChannelExchange, ExchangePublish};
pub use external::{ExternalBrokerClient, ExternalInbound, ExternalMessage, NoopBrokerClient};
pub use internal::InternalBroker;
pub use redis_broker::{HashShardSelector, RedisBrokerClient, RedisBrokerOptions, ShardSelector};
