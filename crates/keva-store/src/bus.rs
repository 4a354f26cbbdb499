//! Message bus for advisory migration coordination.
//!
//! Coordination messages are best-effort broadcast: publishing never
//! fails, delivery is not guaranteed, and subscribers that arrive after a
//! message was sent never see it. The [`MigrationTopic`] trait abstracts
//! the transport; [`LocalBus`] is the in-process implementation used for
//! same-process coordination and for tests.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// A coordination message on a database's migration topic.
///
/// `from` is the sender's transient identity; receivers use it to ignore
/// their own broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockMessage {
    /// Probe for an existing lock holder.
    Ping { from: String },
    /// The sender holds (or just claimed) the migration lock.
    LockAcquired { from: String },
    /// The sender released the migration lock.
    LockReleased { from: String },
    /// The sender is about to run migrations.
    MigrationStarted { from: String },
    /// The sender finished its migration run.
    MigrationCompleted { from: String },
    /// The sender's migration run failed.
    MigrationFailed { from: String, message: String },
}

impl LockMessage {
    /// The identity of whoever sent this message.
    pub fn sender(&self) -> &str {
        match self {
            Self::Ping { from }
            | Self::LockAcquired { from }
            | Self::LockReleased { from }
            | Self::MigrationStarted { from }
            | Self::MigrationCompleted { from }
            | Self::MigrationFailed { from, .. } => from,
        }
    }
}

/// A subscription to one database's migration topic.
///
/// Publishing is fire-and-forget: the protocol is advisory, so transport
/// failures degrade to "no coordination" rather than surfacing as errors.
pub trait MigrationTopic {
    /// Broadcast a message to every other subscriber on the topic.
    fn publish(&self, msg: &LockMessage);

    /// Take the next queued message, if any. Never blocks.
    fn try_recv(&mut self) -> Option<LockMessage>;
}

struct Peer {
    id: u64,
    tx: Sender<LockMessage>,
}

/// In-process broadcast bus, keyed by database name.
///
/// Every subscriber on a topic receives every published message, including
/// the publisher itself; coordinators filter their own identity. Messages
/// queue per subscriber until drained.
#[derive(Default)]
pub struct LocalBus {
    topics: Mutex<HashMap<String, Vec<Peer>>>,
    next_peer: Mutex<u64>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to the migration topic for `db_name`.
    pub fn subscribe(self: &Arc<Self>, db_name: &str) -> TopicSubscription {
        let (tx, rx) = channel();
        let id = {
            let mut next = self.next_peer.lock().unwrap_or_else(|e| e.into_inner());
            *next += 1;
            *next
        };
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(db_name.to_string())
            .or_default()
            .push(Peer { id, tx });
        TopicSubscription {
            bus: Arc::clone(self),
            topic: db_name.to_string(),
            peer_id: id,
            rx,
        }
    }

    fn publish(&self, topic: &str, msg: &LockMessage) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(peers) = topics.get_mut(topic) {
            // Drop peers whose receiver is gone.
            peers.retain(|peer| peer.tx.send(msg.clone()).is_ok());
        }
    }

    fn unsubscribe(&self, topic: &str, peer_id: u64) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(peers) = topics.get_mut(topic) {
            peers.retain(|peer| peer.id != peer_id);
            if peers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, db_name: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(db_name)
            .map(|p| p.len())
            .unwrap_or(0)
    }
}

/// A handle on a [`LocalBus`] topic. Dropping it unsubscribes.
pub struct TopicSubscription {
    bus: Arc<LocalBus>,
    topic: String,
    peer_id: u64,
    rx: Receiver<LockMessage>,
}

impl MigrationTopic for TopicSubscription {
    fn publish(&self, msg: &LockMessage) {
        self.bus.publish(&self.topic, msg);
    }

    fn try_recv(&mut self) -> Option<LockMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.topic, self.peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_all_subscribers_including_self() {
        let bus = LocalBus::new();
        let a = bus.subscribe("app");
        let mut b = bus.subscribe("app");

        a.publish(&LockMessage::Ping { from: "a".into() });

        assert_eq!(b.try_recv(), Some(LockMessage::Ping { from: "a".into() }));
        assert_eq!(b.try_recv(), None);
    }

    #[test]
    fn topics_are_isolated_by_db_name() {
        let bus = LocalBus::new();
        let a = bus.subscribe("app");
        let mut other = bus.subscribe("other");

        a.publish(&LockMessage::Ping { from: "a".into() });
        assert_eq!(other.try_recv(), None);
    }

    #[test]
    fn late_subscriber_misses_earlier_messages() {
        let bus = LocalBus::new();
        let a = bus.subscribe("app");
        a.publish(&LockMessage::LockAcquired { from: "a".into() });

        let mut late = bus.subscribe("app");
        assert_eq!(late.try_recv(), None);
    }

    #[test]
    fn drop_unsubscribes() {
        let bus = LocalBus::new();
        let a = bus.subscribe("app");
        {
            let _b = bus.subscribe("app");
            assert_eq!(bus.subscriber_count("app"), 2);
        }
        assert_eq!(bus.subscriber_count("app"), 1);
        drop(a);
        assert_eq!(bus.subscriber_count("app"), 0);
    }

    #[test]
    fn messages_survive_json_round_trip() {
        let msg = LockMessage::MigrationFailed {
            from: "abc-0001".into(),
            message: "validation failed".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("migration_failed"));
        let back: LockMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
