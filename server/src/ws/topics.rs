//! Topic membership.
//!
//! The native group-membership primitive sockets join to receive channel
//! publishes, group transmits and pings. Publishing to a topic dispatches
//! one shared frame to every member's outbound queue.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use super::socket::Socket;
use super::transport::{Frame, FrameSink};
use crate::metrics::ServerCounters;

/// Prefix of channel topics.
pub const CHANNEL_PREFIX: &str = "C";

/// Prefix of group topics.
pub const GROUP_PREFIX: &str = "G";

/// Topic every socket joins to receive server pings.
pub const PING_TOPIC: &str = "P#ping";

/// Returns the topic backing a channel.
#[must_use]
pub fn channel_topic(channel: &str) -> String {
    format!("{CHANNEL_PREFIX}{channel}")
}

/// Returns the topic backing a group.
#[must_use]
pub fn group_topic(group: &str) -> String {
    format!("{GROUP_PREFIX}{group}")
}

/// A socket's membership in a topic.
#[derive(Debug, Clone)]
pub struct TopicMember {
    sink: FrameSink,
    socket: Weak<Socket>,
}

impl TopicMember {
    /// Creates a membership record for a socket.
    #[must_use]
    pub fn new(socket: &Arc<Socket>) -> Self {
        Self {
            sink: socket.transport().sink().clone(),
            socket: Arc::downgrade(socket),
        }
    }

    /// Creates a membership record from a bare sink.
    #[must_use]
    pub fn detached(sink: FrameSink) -> Self {
        Self {
            sink,
            socket: Weak::new(),
        }
    }
}

/// Topic name → member id → membership.
#[derive(Debug)]
pub struct Topics {
    topics: Mutex<HashMap<String, HashMap<String, TopicMember>>>,
    max_backpressure: usize,
    counters: Arc<ServerCounters>,
}

impl Topics {
    /// Creates an empty registry. Publishes skip members with more than
    /// `max_backpressure` bytes already buffered.
    #[must_use]
    pub fn new(max_backpressure: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            max_backpressure,
            counters: Arc::new(ServerCounters::new()),
        }
    }

    /// Records skipped deliveries in the given counters.
    #[must_use]
    pub fn with_counters(mut self, counters: Arc<ServerCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Adds a member. Returns false if it was already a member.
    pub fn subscribe(&self, topic: &str, member_id: &str, member: TopicMember) -> bool {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .insert(member_id.to_string(), member)
            .is_none()
    }

    /// Removes a member. Returns false if it was not a member.
    pub fn unsubscribe(&self, topic: &str, member_id: &str) -> bool {
        let mut topics = self.topics.lock();
        let Some(members) = topics.get_mut(topic) else {
            return false;
        };
        let removed = members.remove(member_id).is_some();
        if members.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    /// Returns the number of members of a topic.
    #[must_use]
    pub fn num_subscribers(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, HashMap::len)
    }

    /// Returns true if the member belongs to the topic.
    #[must_use]
    pub fn is_subscribed(&self, topic: &str, member_id: &str) -> bool {
        self.topics
            .lock()
            .get(topic)
            .is_some_and(|members| members.contains_key(member_id))
    }

    /// Sends a frame to every member except `skip`. Returns the number of
    /// members the frame was queued for.
    pub fn publish(&self, topic: &str, frame: &Frame, skip: Option<&str>) -> usize {
        let topics = self.topics.lock();
        let Some(members) = topics.get(topic) else {
            return 0;
        };

        let mut delivered = 0;
        for (id, member) in members {
            if skip == Some(id.as_str()) {
                continue;
            }
            if member.sink.send_bounded(frame.clone(), self.max_backpressure) {
                delivered += 1;
            } else {
                let skipped = self.counters.record_skipped_delivery();
                if skipped.is_power_of_two() {
                    warn!(
                        "Skipped backpressured member {} of topic {} ({} skipped so far)",
                        id, topic, skipped
                    );
                }
            }
        }
        delivered
    }

    /// Returns the live sockets of a topic.
    #[must_use]
    pub fn members(&self, topic: &str) -> Vec<Arc<Socket>> {
        self.topics
            .lock()
            .get(topic)
            .map(|members| {
                members
                    .values()
                    .filter_map(|member| member.socket.upgrade())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the number of topics with at least one member.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }
}
