//! Group transmit.
//!
//! Groups are server-local topics sockets join with [`Socket::join`]. A
//! group transmit sends one receiver/data pair to every member, either
//! immediately or coalesced with the other transmits of the same tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use crate::error::ServerError;
use crate::ws::messages::Packet;
use crate::ws::socket::Socket;
use crate::ws::topics::{group_topic, Topics};
use crate::ws::transport::PreparedPackage;

/// Options of a group transmit.
#[derive(Debug, Clone)]
pub struct GroupTransmitOptions {
    /// Member excluded from delivery. Skipping always sends immediately.
    pub skip_member: Option<String>,
    /// Whether to coalesce with the other transmits of the same tick.
    pub batch: bool,
}

impl Default for GroupTransmitOptions {
    fn default() -> Self {
        Self {
            skip_member: None,
            batch: true,
        }
    }
}

impl GroupTransmitOptions {
    /// Excludes a member.
    #[must_use]
    pub fn with_skip_member(mut self, member_id: impl Into<String>) -> Self {
        self.skip_member = Some(member_id.into());
        self
    }

    /// Enables or disables batching.
    #[must_use]
    pub fn with_batch(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }
}

/// Group transport.
#[derive(Debug)]
pub struct Groups {
    topics: Arc<Topics>,
    pending: Mutex<HashMap<String, Vec<Packet>>>,
    flush_scheduled: AtomicBool,
}

impl Groups {
    /// Creates a group transport over a topic registry.
    #[must_use]
    pub fn new(topics: Arc<Topics>) -> Self {
        Self {
            topics,
            pending: Mutex::new(HashMap::new()),
            flush_scheduled: AtomicBool::new(false),
        }
    }

    /// Sends a transmit to every member of a group.
    ///
    /// # Errors
    ///
    /// Returns an error if the packet cannot be serialized.
    pub fn transmit(
        self: &Arc<Self>,
        group: &str,
        receiver: &str,
        data: Value,
        options: &GroupTransmitOptions,
    ) -> Result<(), ServerError> {
        let topic = group_topic(group);
        let packet = Packet::transmit(receiver, data);

        if options.skip_member.is_some() || !options.batch {
            self.flush_topic(&topic);
            let package = PreparedPackage::prepare(&packet)?;
            self.topics
                .publish(&topic, &package.frame(), options.skip_member.as_deref());
            return Ok(());
        }

        self.pending.lock().entry(topic).or_default().push(packet);
        if !self.flush_scheduled.swap(true, Ordering::AcqRel) {
            let groups = Arc::clone(self);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                groups.flush();
            });
        }
        Ok(())
    }

    /// Sends every pending batch.
    pub fn flush(&self) {
        self.flush_scheduled.store(false, Ordering::Release);
        let pending = std::mem::take(&mut *self.pending.lock());
        for (topic, packets) in pending {
            self.send_batch(&topic, packets);
        }
    }

    /// Returns the number of members of a group.
    #[must_use]
    pub fn member_count(&self, group: &str) -> usize {
        self.topics.num_subscribers(&group_topic(group))
    }

    /// Returns the live member sockets of a group.
    #[must_use]
    pub fn members(&self, group: &str) -> Vec<Arc<Socket>> {
        self.topics.members(&group_topic(group))
    }

    fn flush_topic(&self, topic: &str) {
        let packets = self.pending.lock().remove(topic);
        if let Some(packets) = packets {
            self.send_batch(topic, packets);
        }
    }

    fn send_batch(&self, topic: &str, packets: Vec<Packet>) {
        match PreparedPackage::prepare(&Packet::batch(packets)) {
            Ok(package) => {
                self.topics.publish(topic, &package.frame(), None);
            }
            Err(e) => warn!("Dropped group batch for {}: {}", topic, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerOptions;
    use crate::ws::socket::tests::{connect, next_packet, server};
    use serde_json::json;

    #[tokio::test]
    async fn test_skip_member_sends_immediately() {
        let server = server(ServerOptions::default());
        let (a, mut qa) = connect(&server);
        let (b, mut qb) = connect(&server);
        a.join("team").expect("join");
        b.join("team").expect("join");

        server
            .transmit_to_group(
                "team",
                "note",
                json!(1),
                &GroupTransmitOptions::default().with_skip_member(a.id()),
            )
            .expect("transmit");

        assert!(next_packet(&mut qa).is_none());
        assert_eq!(next_packet(&mut qb), Some(Packet::transmit("note", json!(1))));
    }

    #[tokio::test]
    async fn test_unbatched_transmit() {
        let server = server(ServerOptions::default());
        let (a, mut qa) = connect(&server);
        a.join("team").expect("join");

        server
            .transmit_to_group(
                "team",
                "note",
                json!("now"),
                &GroupTransmitOptions::default().with_batch(false),
            )
            .expect("transmit");
        assert_eq!(next_packet(&mut qa), Some(Packet::transmit("note", json!("now"))));
    }

    #[tokio::test]
    async fn test_same_tick_transmits_are_batched() {
        let server = server(ServerOptions::default());
        let (a, mut qa) = connect(&server);
        let (_outsider, mut q_outsider) = connect(&server);
        a.join("team").expect("join");

        let options = GroupTransmitOptions::default();
        server
            .transmit_to_group("team", "note", json!(1), &options)
            .expect("transmit");
        server
            .transmit_to_group("team", "note", json!(2), &options)
            .expect("transmit");
        assert!(next_packet(&mut qa).is_none());

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        server.groups().flush();

        assert_eq!(
            next_packet(&mut qa),
            Some(Packet::Batch {
                packets: vec![
                    Packet::transmit("note", json!(1)),
                    Packet::transmit("note", json!(2)),
                ]
            })
        );
        assert!(next_packet(&mut qa).is_none());
        assert!(next_packet(&mut q_outsider).is_none());
    }

    #[tokio::test]
    async fn test_leave_and_disconnect_remove_membership() {
        let server = server(ServerOptions::default());
        let (a, _qa) = connect(&server);
        let (b, _qb) = connect(&server);
        a.join("team").expect("join");
        b.join("team").expect("join");
        assert_eq!(server.groups().member_count("team"), 2);

        assert!(a.leave("team"));
        assert!(!a.leave("team"));
        b.disconnect(1000, None);
        assert_eq!(server.groups().member_count("team"), 0);
        assert!(server.groups().members("team").is_empty());
    }
}
