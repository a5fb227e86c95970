//! Best-effort fan-out of placement events to live viewers.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each viewer gets an independent receiver that buffers up to `capacity`
//! events; a viewer that falls further behind loses the oldest ones and
//! recovers by fetching a fresh board.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{BroadcastEvent, ProtocolError};

/// Encoded event shared by every receiver.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub events_dropped: u64,
    pub active_subscribers: usize,
}

struct AtomicBroadcastStats {
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            events_sent: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }
}

/// A connected viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub id: Uuid,
    pub remote: Option<SocketAddr>,
    pub joined_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn new(remote: Option<SocketAddr>) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote,
            joined_at: Utc::now(),
        }
    }
}

/// Subscribers of a single namespace sharing one channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many events a receiver may fall behind before it
    /// starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    pub async fn subscribe(&self, subscriber: Subscriber) -> broadcast::Receiver<Frame> {
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(subscriber.id, subscriber);
        self.sender.subscribe()
    }

    pub async fn unsubscribe(&self, id: &Uuid) -> Option<Subscriber> {
        self.subscribers.write().await.remove(id)
    }

    /// Encode once and send to every receiver. Returns how many receivers
    /// were reached; zero subscribers is not an error.
    pub fn broadcast(&self, event: &BroadcastEvent) -> Result<usize, ProtocolError> {
        let frame: Frame = Arc::from(event.encode()?);
        Ok(self.broadcast_raw(frame))
    }

    /// Send a pre-encoded frame. Lock-free.
    pub fn broadcast_raw(&self, frame: Frame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.events_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for events a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.events_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Live receivers on the channel, including ones not yet registered.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub async fn subscribers(&self) -> Vec<Subscriber> {
        self.subscribers.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.atomic_stats.events_sent.load(Ordering::Relaxed),
            events_dropped: self.atomic_stats.events_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Namespace registry: maps namespace names to broadcast groups.
pub struct BroadcastBus {
    groups: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl BroadcastBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Join `namespace`, creating its group if needed. Lookup and
    /// subscription happen under the registry write lock, so a concurrent
    /// `remove_if_empty` cannot drop the group out from under the new
    /// viewer.
    pub async fn subscribe(
        &self,
        namespace: &str,
        subscriber: Subscriber,
    ) -> (Arc<BroadcastGroup>, broadcast::Receiver<Frame>) {
        let mut groups = self.groups.write().await;
        let group = groups
            .entry(namespace.to_string())
            .or_insert_with(|| {
                log::debug!("created broadcast namespace {namespace}");
                Arc::new(BroadcastGroup::new(self.default_capacity))
            })
            .clone();
        let rx = group.subscribe(subscriber).await;
        (group, rx)
    }

    /// Get or create the group for `namespace`. Viewers should join
    /// through [`BroadcastBus::subscribe`]; a group handle held across
    /// `remove_if_empty` may already be detached from the registry.
    pub async fn group(&self, namespace: &str) -> Arc<BroadcastGroup> {
        {
            let groups = self.groups.read().await;
            if let Some(group) = groups.get(namespace) {
                return group.clone();
            }
        }

        let mut groups = self.groups.write().await;
        // Double-check after acquiring write lock
        if let Some(group) = groups.get(namespace) {
            return group.clone();
        }

        let group = Arc::new(BroadcastGroup::new(self.default_capacity));
        groups.insert(namespace.to_string(), group.clone());
        log::debug!("created broadcast namespace {namespace}");
        group
    }

    /// Fan `event` out to `namespace`. A namespace nobody has joined yet
    /// reaches zero receivers.
    pub async fn publish(
        &self,
        namespace: &str,
        event: &BroadcastEvent,
    ) -> Result<usize, ProtocolError> {
        let group = self.groups.read().await.get(namespace).cloned();
        match group {
            Some(group) => {
                let reached = group.broadcast(event)?;
                log::trace!("{} event to {reached} viewers of {namespace}", event.event_type());
                Ok(reached)
            }
            None => Ok(0),
        }
    }

    pub async fn subscriber_count(&self, namespace: &str) -> usize {
        let group = self.groups.read().await.get(namespace).cloned();
        match group {
            Some(group) => group.subscriber_count().await,
            None => 0,
        }
    }

    pub async fn remove_if_empty(&self, namespace: &str) -> bool {
        let mut groups = self.groups.write().await;
        if let Some(group) = groups.get(namespace) {
            if group.subscriber_count().await == 0 && group.receiver_count() == 0 {
                groups.remove(namespace);
                return true;
            }
        }
        false
    }

    pub async fn namespace_count(&self) -> usize {
        self.groups.read().await.len()
    }

    pub async fn namespaces(&self) -> Vec<String> {
        self.groups.read().await.keys().cloned().collect()
    }
}
