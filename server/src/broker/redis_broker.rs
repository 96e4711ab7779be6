//! Redis-backed external broker client.
//!
//! Each shard URL gets one background task owning a multiplexed publish
//! connection and a pub/sub connection pattern-subscribed to
//! `<prefix>*`. Publishes are routed to a shard by a [`ShardSelector`] and
//! wrapped in an envelope carrying the origin node id, so a node drops its
//! own publishes when Redis echoes them back. Inbound messages are filtered
//! by the channel interest the broker registered, which survives
//! reconnects.
//!
//! Each shard queue is bounded. Publishes are dropped, and counted, while a
//! shard is disconnected or its queue is full.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::external::{ExternalBrokerClient, ExternalInbound};
use crate::config::ConfigError;
use crate::ws::messages::DataType;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Default number of publishes a shard may have queued.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Options of the Redis broker client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisBrokerOptions {
    /// One Redis URL per shard.
    pub urls: Vec<String>,
    /// Prefix of the Redis channels used for publishes.
    pub key_prefix: String,
    /// Identifier of this node, stamped on every outgoing envelope.
    pub node_id: String,
    /// Publishes each shard may have queued before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for RedisBrokerOptions {
    fn default() -> Self {
        Self {
            urls: vec!["redis://127.0.0.1:6379".to_string()],
            key_prefix: "switchyard:".to_string(),
            node_id: uuid::Uuid::new_v4().to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl RedisBrokerOptions {
    /// Sets the shard URLs.
    #[must_use]
    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.urls = urls;
        self
    }

    /// Sets the channel prefix.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the node id. Use the server id so every node is distinct.
    #[must_use]
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Sets the per-shard queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBroker` if no shard is configured, the prefix is
    /// empty or the queue capacity is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.urls.is_empty() {
            return Err(ConfigError::InvalidBroker(
                "at least one Redis URL is required".to_string(),
            ));
        }
        if self.key_prefix.is_empty() {
            return Err(ConfigError::InvalidBroker(
                "key_prefix must not be empty".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidBroker(
                "queue_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Chooses the shard a channel's publishes go to.
pub trait ShardSelector: Send + Sync + fmt::Debug {
    /// Returns an index in `0..shard_count`.
    fn select(&self, channel: &str, shard_count: usize) -> usize;
}

/// SHA-256 of the channel name modulo the shard count.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashShardSelector;

impl ShardSelector for HashShardSelector {
    fn select(&self, channel: &str, shard_count: usize) -> usize {
        if shard_count <= 1 {
            return 0;
        }
        let digest = Sha256::digest(channel.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(head) % shard_count as u64) as usize
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    origin: String,
    data: Value,
    complex: bool,
}

enum ShardCommand {
    Publish { channel: String, payload: String },
    Shutdown,
}

struct Shard {
    commands: mpsc::Sender<ShardCommand>,
    connected: Arc<AtomicBool>,
}

struct ShardContext {
    index: usize,
    connected: Arc<AtomicBool>,
    client: redis::Client,
    key_prefix: String,
    node_id: String,
    interest: Arc<RwLock<HashSet<String>>>,
    inbound: Arc<RwLock<Option<ExternalInbound>>>,
}

impl ShardContext {
    fn dispatch(&self, message: &redis::Msg) {
        let Some(channel) = message.get_channel_name().strip_prefix(&self.key_prefix) else {
            return;
        };
        if !self.interest.read().contains(channel) {
            return;
        }
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                debug!("Unreadable payload on shard {}: {}", self.index, e);
                return;
            }
        };
        let Some((data, data_type)) = accept_envelope(&payload, &self.node_id) else {
            return;
        };
        let inbound = self.inbound.read().clone();
        if let Some(inbound) = inbound {
            inbound.publish(channel, data, data_type);
        }
    }
}

/// Decodes an envelope, dropping the ones this node sent.
fn accept_envelope(payload: &str, node_id: &str) -> Option<(Value, DataType)> {
    let envelope: Envelope = match serde_json::from_str(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Dropped malformed broker envelope: {}", e);
            return None;
        }
    };
    if envelope.origin == node_id {
        return None;
    }
    let data_type = if envelope.complex {
        DataType::Binary
    } else {
        DataType::Json
    };
    Some((envelope.data, data_type))
}

/// External broker client fanning publishes out through Redis pub/sub.
pub struct RedisBrokerClient {
    options: RedisBrokerOptions,
    selector: Arc<dyn ShardSelector>,
    shards: Vec<Shard>,
    dropped: AtomicU64,
    interest: Arc<RwLock<HashSet<String>>>,
    inbound: Arc<RwLock<Option<ExternalInbound>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for RedisBrokerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBrokerClient")
            .field("urls", &self.options.urls)
            .field("key_prefix", &self.options.key_prefix)
            .field("node_id", &self.options.node_id)
            .field("selector", &self.selector)
            .field("interest", &self.interest.read().len())
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl RedisBrokerClient {
    /// Starts one background task per shard using [`HashShardSelector`].
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBroker` if the options are invalid or a URL cannot
    /// be parsed.
    pub fn start(options: RedisBrokerOptions) -> Result<Self, ConfigError> {
        Self::start_with_selector(options, Arc::new(HashShardSelector))
    }

    /// Starts the client with a custom shard selector.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBroker` if the options are invalid or a URL cannot
    /// be parsed.
    pub fn start_with_selector(
        options: RedisBrokerOptions,
        selector: Arc<dyn ShardSelector>,
    ) -> Result<Self, ConfigError> {
        options.validate()?;

        let interest = Arc::new(RwLock::new(HashSet::new()));
        let inbound = Arc::new(RwLock::new(None));
        let mut shards = Vec::with_capacity(options.urls.len());
        let mut tasks = Vec::with_capacity(options.urls.len());

        for (index, url) in options.urls.iter().enumerate() {
            let client = redis::Client::open(url.as_str())
                .map_err(|e| ConfigError::InvalidBroker(format!("{url}: {e}")))?;
            let (tx, rx) = mpsc::channel(options.queue_capacity);
            let connected = Arc::new(AtomicBool::new(false));
            let context = ShardContext {
                index,
                connected: Arc::clone(&connected),
                client,
                key_prefix: options.key_prefix.clone(),
                node_id: options.node_id.clone(),
                interest: Arc::clone(&interest),
                inbound: Arc::clone(&inbound),
            };
            shards.push(Shard {
                commands: tx,
                connected,
            });
            tasks.push(tokio::spawn(run_shard(context, rx)));
        }

        info!("Redis broker started with {} shard(s)", shards.len());
        Ok(Self {
            options,
            selector,
            shards,
            dropped: AtomicU64::new(0),
            interest,
            inbound,
            tasks: Mutex::new(tasks),
        })
    }

    /// Returns the shard index a channel publishes to.
    #[must_use]
    pub fn shard_for(&self, channel: &str) -> usize {
        self.selector
            .select(channel, self.shards.len())
            .min(self.shards.len().saturating_sub(1))
    }

    /// Returns the channels currently registered, sorted.
    #[must_use]
    pub fn interest(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.interest.read().iter().cloned().collect();
        channels.sort();
        channels
    }

    /// Returns the number of publishes dropped because a shard was
    /// disconnected or its queue was full.
    #[must_use]
    pub fn dropped_publishes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns the number of commands waiting in a shard's queue.
    #[must_use]
    pub fn queued_commands(&self, shard: usize) -> usize {
        self.shards.get(shard).map_or(0, |shard| {
            shard.commands.max_capacity() - shard.commands.capacity()
        })
    }

    /// Returns whether a shard currently holds a live connection.
    #[must_use]
    pub fn is_connected(&self, shard: usize) -> bool {
        self.shards
            .get(shard)
            .is_some_and(|shard| shard.connected.load(Ordering::Acquire))
    }

    fn drop_publish(&self, channel: &str, reason: &str) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped.is_power_of_two() {
            warn!(
                "Dropped Redis publish on {} ({}); {} dropped so far",
                channel, reason, dropped
            );
        }
    }

    /// Returns the options the client was started with.
    #[must_use]
    pub fn options(&self) -> &RedisBrokerOptions {
        &self.options
    }
}

impl ExternalBrokerClient for RedisBrokerClient {
    fn bind(&self, inbound: ExternalInbound) {
        *self.inbound.write() = Some(inbound);
    }

    fn subscribe(&self, channel: &str) {
        self.interest.write().insert(channel.to_string());
    }

    fn unsubscribe(&self, channel: &str) {
        self.interest.write().remove(channel);
    }

    fn publish(&self, channel: &str, data: &Value, complex_types: bool) {
        let envelope = Envelope {
            origin: self.options.node_id.clone(),
            data: data.clone(),
            complex: complex_types,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not encode publish on {}: {}", channel, e);
                return;
            }
        };
        let Some(shard) = self.shards.get(self.shard_for(channel)) else {
            return;
        };
        if !shard.connected.load(Ordering::Acquire) {
            self.drop_publish(channel, "shard disconnected");
            return;
        }
        let command = ShardCommand::Publish {
            channel: format!("{}{}", self.options.key_prefix, channel),
            payload,
        };
        match shard.commands.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.drop_publish(channel, "shard queue full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Redis shard for {} is gone", channel);
            }
        }
    }

    fn terminate(&self) {
        for shard in &self.shards {
            shard.connected.store(false, Ordering::Release);
            let _ = shard.commands.try_send(ShardCommand::Shutdown);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.inbound.write().take();
        info!("Redis broker terminated");
    }
}

async fn run_shard(context: ShardContext, mut commands: mpsc::Receiver<ShardCommand>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let result = connect_and_run(&context, &mut commands, &mut backoff).await;
        context.connected.store(false, Ordering::Release);
        match result {
            Ok(()) => {
                debug!("Redis shard {} stopped", context.index);
                return;
            }
            Err(e) => {
                // Queued publishes do not survive a reconnect.
                let mut stale = 0usize;
                while let Ok(command) = commands.try_recv() {
                    match command {
                        ShardCommand::Publish { .. } => stale += 1,
                        ShardCommand::Shutdown => return,
                    }
                }
                if stale > 0 {
                    warn!(
                        "Redis shard {} discarded {} queued publish(es)",
                        context.index, stale
                    );
                }
                warn!(
                    "Redis shard {} disconnected: {}; retrying in {:?}",
                    context.index, e, backoff
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn connect_and_run(
    context: &ShardContext,
    commands: &mut mpsc::Receiver<ShardCommand>,
    backoff: &mut Duration,
) -> anyhow::Result<()> {
    let mut publisher = context.client.get_multiplexed_async_connection().await?;
    let mut pubsub = context.client.get_async_pubsub().await?;
    pubsub.psubscribe(format!("{}*", context.key_prefix)).await?;

    *backoff = INITIAL_BACKOFF;
    context.connected.store(true, Ordering::Release);
    info!(
        "Redis shard {} listening on {}*",
        context.index, context.key_prefix
    );

    let mut messages = pubsub.into_on_message();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ShardCommand::Publish { channel, payload }) => {
                    if let Err(e) = redis::cmd("PUBLISH")
                        .arg(&channel)
                        .arg(&payload)
                        .query_async::<()>(&mut publisher)
                        .await
                    {
                        warn!(
                            "Redis shard {} lost publish on {}: {}",
                            context.index, channel, e
                        );
                        return Err(e.into());
                    }
                }
                Some(ShardCommand::Shutdown) | None => return Ok(()),
            },
            message = messages.next() => match message {
                Some(message) => context.dispatch(&message),
                None => anyhow::bail!("pub/sub stream ended"),
            },
        }
    }
}
