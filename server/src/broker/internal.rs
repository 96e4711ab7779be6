//! Internal channel broker.
//!
//! Single source of truth for who is interested in a channel. Interest has
//! two independent sources: sockets (tracked through topic membership) and
//! in-process exchange listeners. A channel is registered with the external
//! broker client exactly while at least one source holds interest.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::exchange::ExchangePublish;
use super::external::{ExternalBrokerClient, ExternalInbound, ExternalMessage, NoopBrokerClient};
use crate::emitter::EventEmitter;
use crate::error::ServerError;
use crate::middleware::{Middlewares, Verdict};
use crate::server::ServerEvent;
use crate::ws::messages::{pushes, Packet};
use crate::ws::socket::Socket;
use crate::ws::topics::{channel_topic, TopicMember, Topics};
use crate::ws::transport::PreparedPackage;

#[derive(Debug, Default)]
struct Interest {
    socket_channels: HashSet<String>,
    exchange_channels: HashSet<String>,
}

/// Process-wide channel registry and fan-out engine.
pub struct InternalBroker {
    topics: Arc<Topics>,
    interest: Mutex<Interest>,
    external: RwLock<Arc<dyn ExternalBrokerClient>>,
    exchange_events: EventEmitter<ExchangePublish>,
    publish_to_publisher: bool,
    middlewares: Arc<RwLock<Middlewares>>,
    events: Arc<EventEmitter<ServerEvent>>,
    inbound_tx: mpsc::UnboundedSender<ExternalMessage>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<ExternalMessage>>>,
    terminated: AtomicBool,
}

impl std::fmt::Debug for InternalBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalBroker")
            .field("interest", &*self.interest.lock())
            .field("external", &*self.external.read())
            .field("publish_to_publisher", &self.publish_to_publisher)
            .finish_non_exhaustive()
    }
}

impl InternalBroker {
    /// Creates a broker delivering through `topics`, with no external client.
    #[must_use]
    pub fn new(
        topics: Arc<Topics>,
        publish_to_publisher: bool,
        middlewares: Arc<RwLock<Middlewares>>,
        events: Arc<EventEmitter<ServerEvent>>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            topics,
            interest: Mutex::new(Interest::default()),
            external: RwLock::new(Arc::new(NoopBrokerClient)),
            exchange_events: EventEmitter::new(),
            publish_to_publisher,
            middlewares,
            events,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            terminated: AtomicBool::new(false),
        }
    }

    /// Installs an external broker client and registers every channel that
    /// currently has interest with it.
    pub fn set_external_client(&self, client: Arc<dyn ExternalBrokerClient>) {
        client.bind(ExternalInbound::new(self.inbound_tx.clone()));
        let interest = self.interest.lock();
        for channel in interest
            .socket_channels
            .union(&interest.exchange_channels)
        {
            client.subscribe(channel);
        }
        *self.external.write() = client;
    }

    /// Registers a socket's interest in a channel.
    pub fn socket_subscribe(&self, socket: &Arc<Socket>, channel: &str) {
        self.subscribe_member(socket.id(), TopicMember::new(socket), channel);
    }

    pub(crate) fn subscribe_member(&self, member_id: &str, member: TopicMember, channel: &str) {
        let mut interest = self.interest.lock();
        self.topics.subscribe(&channel_topic(channel), member_id, member);
        if interest.socket_channels.insert(channel.to_string())
            && !interest.exchange_channels.contains(channel)
        {
            debug!("External subscribe to channel {}", channel);
            self.external().subscribe(channel);
        }
    }

    /// Removes a socket's interest in a channel.
    ///
    /// The channel leaves the socket interest set once its topic has no
    /// members left.
    pub fn socket_unsubscribe(&self, member_id: &str, channel: &str) {
        let topic = channel_topic(channel);
        let mut interest = self.interest.lock();
        self.topics.unsubscribe(&topic, member_id);
        if self.topics.num_subscribers(&topic) == 0
            && interest.socket_channels.remove(channel)
            && !interest.exchange_channels.contains(channel)
        {
            debug!("External unsubscribe from channel {}", channel);
            self.external().unsubscribe(channel);
        }
    }

    /// Registers exchange interest in a channel.
    pub fn exchange_subscribe(&self, channel: &str) {
        let mut interest = self.interest.lock();
        if interest.exchange_channels.insert(channel.to_string())
            && !interest.socket_channels.contains(channel)
        {
            self.external().subscribe(channel);
        }
    }

    /// Removes exchange interest in a channel.
    pub fn exchange_unsubscribe(&self, channel: &str) {
        let mut interest = self.interest.lock();
        if interest.exchange_channels.remove(channel)
            && !interest.socket_channels.contains(channel)
        {
            self.external().unsubscribe(channel);
        }
    }

    /// Returns true if the exchange holds interest in the channel.
    #[must_use]
    pub fn is_exchange_subscribed(&self, channel: &str) -> bool {
        self.interest.lock().exchange_channels.contains(channel)
    }

    /// Returns the exchange interest set, sorted.
    #[must_use]
    pub fn exchange_channels(&self) -> Vec<String> {
        let interest = self.interest.lock();
        let sorted: BTreeSet<&String> = interest.exchange_channels.iter().collect();
        sorted.into_iter().cloned().collect()
    }

    /// Publishes to a channel: forwards to the cluster first, then delivers
    /// locally. With `publish_to_publisher` off, `publisher` is skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery packet cannot be serialized.
    pub fn publish(
        &self,
        channel: &str,
        data: Value,
        complex_types: bool,
        publisher: Option<&Socket>,
    ) -> Result<(), ServerError> {
        self.external().publish(channel, &data, complex_types);
        let skip = if self.publish_to_publisher {
            None
        } else {
            publisher.map(Socket::id)
        };
        self.deliver(channel, data, complex_types, false, skip)
    }

    /// Delivers a publish received from another node. Never forwarded back
    /// to the cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery packet cannot be serialized.
    pub fn process_external_publish(
        &self,
        channel: &str,
        data: Value,
        complex_types: bool,
    ) -> Result<(), ServerError> {
        self.deliver(channel, data, complex_types, true, None)
    }

    /// Returns the union of exchange and socket interest, sorted.
    #[must_use]
    pub fn get_subscriptions(&self) -> Vec<String> {
        let interest = self.interest.lock();
        let union: BTreeSet<&String> = interest
            .exchange_channels
            .iter()
            .chain(interest.socket_channels.iter())
            .collect();
        union.into_iter().cloned().collect()
    }

    /// Tears down the external client. Only the first call has an effect.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Terminating broker");
        self.external().terminate();
    }

    /// Returns true once [`terminate`](Self::terminate) has run.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Delivers inbound cluster publishes until the broker is dropped.
    ///
    /// Only the first caller receives messages; later calls return at once.
    pub async fn run_external_inbound(self: Arc<Self>) {
        let Some(mut rx) = self.inbound_rx.lock().take() else {
            return;
        };
        while let Some(message) = rx.recv().await {
            if self.is_terminated() {
                break;
            }
            if let Err(e) = self.process_external_publish(
                &message.channel,
                message.data,
                message.data_type.is_complex(),
            ) {
                self.events.emit(&ServerEvent::Error(e));
            }
        }
    }

    pub(crate) fn exchange_events(&self) -> &EventEmitter<ExchangePublish> {
        &self.exchange_events
    }

    fn external(&self) -> Arc<dyn ExternalBrokerClient> {
        Arc::clone(&self.external.read())
    }

    fn deliver(
        &self,
        channel: &str,
        data: Value,
        complex_types: bool,
        external: bool,
        skip: Option<&str>,
    ) -> Result<(), ServerError> {
        let (exchange_interest, socket_interest) = {
            let interest = self.interest.lock();
            (
                interest.exchange_channels.contains(channel),
                interest.socket_channels.contains(channel),
            )
        };

        if exchange_interest {
            self.exchange_events.emit(&ExchangePublish {
                channel: channel.to_string(),
                data: data.clone(),
                external,
                complex_types,
            });
        }

        if !socket_interest {
            return Ok(());
        }

        let topic = channel_topic(channel);
        let package =
            PreparedPackage::prepare(&Packet::transmit(pushes::PUBLISH, json!([channel, data])))?;

        let publish_out = self.middlewares.read().publish_out.clone();
        let Some(middleware) = publish_out else {
            self.topics.publish(&topic, &package.frame(), skip);
            return Ok(());
        };

        let recipients: Vec<Arc<Socket>> = self
            .topics
            .members(&topic)
            .into_iter()
            .filter(|socket| Some(socket.id()) != skip)
            .collect();
        let events = Arc::clone(&self.events);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let deliveries = recipients.iter().map(|socket| {
                let middleware = Arc::clone(&middleware);
                let events = Arc::clone(&events);
                let package = package.clone();
                let channel = channel.as_str();
                let data = &data;
                async move {
                    match middleware.on_publish_out(socket, channel, data).await {
                        Verdict::Allow => {
                            if socket.is_open() {
                                let _ = socket.send_prepared(&package);
                            }
                        }
                        Verdict::Block(block) => {
                            debug!("Publish to socket {} blocked: {}", socket.id(), block);
                        }
                        Verdict::Fault(e) => events.emit(&ServerEvent::Error(e.into())),
                    }
                }
            });
            join_all(deliveries).await;
        });
        Ok(())
    }
}
