use std::collections::HashMap;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub of committed events, one channel per gate or runway.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, resource_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&resource_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a channel (resource deleted). Receivers see `Closed`.
    pub fn remove(&self, resource_id: &Ulid) {
        self.channels.remove(resource_id);
    }
}

/// Item delivered to one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    Event(Event),
    /// The subscriber fell behind and `missed` events on `resource_id` were lost.
    Lagged { resource_id: Ulid, missed: u64 },
}

/// All subscriptions of one client, merged into a single channel.
///
/// A resource is pumped at most once however often it is subscribed. Once its
/// channel closes (the resource was deleted) it may be attached again.
/// Dropping the set stops every pump.
pub struct FeedSet {
    tx: mpsc::Sender<Feed>,
    pumps: HashMap<Ulid, JoinHandle<()>>,
}

impl FeedSet {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Feed>) {
        let (tx, rx) = mpsc::channel(capacity);
        let set = Self {
            tx,
            pumps: HashMap::new(),
        };
        (set, rx)
    }

    pub fn is_attached(&self, resource_id: &Ulid) -> bool {
        self.pumps
            .get(resource_id)
            .is_some_and(|pump| !pump.is_finished())
    }

    /// Start forwarding `rx`. Returns `false`, dropping `rx`, when the resource
    /// is already being forwarded.
    pub fn attach(&mut self, resource_id: Ulid, rx: broadcast::Receiver<Event>) -> bool {
        if self.is_attached(&resource_id) {
            return false;
        }
        let pump = tokio::spawn(pump(resource_id, rx, self.tx.clone()));
        self.pumps.insert(resource_id, pump);
        true
    }

    pub fn attached(&self) -> usize {
        self.pumps.values().filter(|pump| !pump.is_finished()).count()
    }
}

impl Drop for FeedSet {
    fn drop(&mut self) {
        for pump in self.pumps.values() {
            pump.abort();
        }
    }
}

async fn pump(resource_id: Ulid, mut rx: broadcast::Receiver<Event>, tx: mpsc::Sender<Feed>) {
    loop {
        let item = match rx.recv().await {
            Ok(event) => Feed::Event(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => Feed::Lagged { resource_id, missed },
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if tx.send(item).await.is_err() {
            break;
        }
    }
}
