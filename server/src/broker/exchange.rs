//! Channel exchange.
//!
//! Lets server-side code subscribe to, publish on and observe channels
//! without going through a socket.

use std::sync::Arc;

use serde_json::Value;

use super::internal::InternalBroker;
use crate::emitter::ListenerId;
use crate::error::ServerError;

/// A publish observed by exchange listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangePublish {
    /// Channel name.
    pub channel: String,
    /// Payload.
    pub data: Value,
    /// True if the publish came from another node.
    pub external: bool,
    /// True if the payload needs complex-type handling.
    pub complex_types: bool,
}

/// Server-side facade over the broker.
#[derive(Debug, Clone)]
pub struct ChannelExchange {
    broker: Arc<InternalBroker>,
}

impl ChannelExchange {
    /// Creates an exchange over a broker.
    #[must_use]
    pub fn new(broker: Arc<InternalBroker>) -> Self {
        Self { broker }
    }

    /// Registers exchange interest in a channel.
    pub fn subscribe(&self, channel: &str) {
        self.broker.exchange_subscribe(channel);
    }

    /// Removes exchange interest in a channel.
    pub fn unsubscribe(&self, channel: &str) {
        self.broker.exchange_unsubscribe(channel);
    }

    /// Returns true if the exchange is subscribed to the channel.
    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.broker.is_exchange_subscribed(channel)
    }

    /// Returns the channels the exchange is subscribed to.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.broker.exchange_channels()
    }

    /// Publishes to a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery packet cannot be serialized.
    pub fn publish(&self, channel: &str, data: Value) -> Result<(), ServerError> {
        self.broker.publish(channel, data, false, None)
    }

    /// Calls `listener` for every publish on `channel` while subscribed.
    pub fn on_publish<F>(&self, channel: &str, listener: F) -> ListenerId
    where
        F: Fn(&ExchangePublish) + Send + Sync + 'static,
    {
        let channel = channel.to_string();
        self.broker.exchange_events().on(move |event| {
            if event.channel == channel {
                listener(event);
            }
        })
    }

    /// Calls `listener` for every publish on any subscribed channel.
    pub fn on_any_publish<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ExchangePublish) + Send + Sync + 'static,
    {
        self.broker.exchange_events().on(listener)
    }

    /// Calls `listener` for the next publish on any subscribed channel.
    pub fn once_publish<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ExchangePublish) + Send + Sync + 'static,
    {
        self.broker.exchange_events().once(listener)
    }

    /// Removes a publish listener.
    pub fn off_publish(&self, id: ListenerId) -> bool {
        self.broker.exchange_events().off(id)
    }
}
