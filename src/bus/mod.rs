//! In-process publish/subscribe for committed diffs.
//!
//! Publishing never waits on subscribers. Each subscriber reads from a bounded window of
//! recent events; one that falls behind loses the oldest events and receives a
//! [`BusMessage::Gap`] instead, after which it should re-fetch full state.

use crate::dispatch::DiffEvent;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{Level, event, trace};

pub type SubscriptionId = u64;

type Predicate = Arc<dyn Fn(&DiffEvent) -> bool + Send + Sync>;

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    Diff(Arc<DiffEvent>),
    /// `missed` events were dropped before this subscriber could read them.
    Gap { missed: u64 },
}

struct BusInner {
    tx: broadcast::Sender<Arc<DiffEvent>>,
    capacity: usize,
    next_id: AtomicU64,
    published: AtomicU64,
    active: Mutex<HashSet<SubscriptionId>>,
}

impl BusInner {
    fn active(&self) -> MutexGuard<'_, HashSet<SubscriptionId>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.inner.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    /// `capacity` is the per-subscriber backlog before the oldest events are dropped.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                tx,
                capacity,
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
                active: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Fans the event out to every subscriber, returning how many received it.
    pub fn publish(&self, diff: DiffEvent) -> usize {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        match self.inner.tx.send(Arc::new(diff)) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!("no bus subscribers for diff");
                0
            }
        }
    }

    /// Subscribes to events matching `predicate`.
    pub fn subscribe<F>(&self, predicate: F) -> BusSubscription
    where
        F: Fn(&DiffEvent) -> bool + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.active().insert(id);
        event!(Level::DEBUG, subscription = id, "bus subscription opened");
        BusSubscription {
            id,
            rx: self.inner.tx.subscribe(),
            predicate: Arc::new(predicate),
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscribe_all(&self) -> BusSubscription {
        self.subscribe(|_| true)
    }

    /// Releases a subscription. Dropping the handle has the same effect.
    pub fn unsubscribe(&self, subscription: BusSubscription) -> bool {
        let id = subscription.id;
        drop(subscription);
        !self.inner.active().contains(&id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.active().len()
    }

    pub fn published_total(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// A live subscription handle.
pub struct BusSubscription {
    id: SubscriptionId,
    rx: broadcast::Receiver<Arc<DiffEvent>>,
    predicate: Predicate,
    bus: std::sync::Weak<BusInner>,
}

impl BusSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next matching event or gap marker; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(diff) if (self.predicate)(&diff) => return Some(BusMessage::Diff(diff)),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    event!(Level::DEBUG, subscription = self.id, missed, "bus subscriber lagged");
                    return Some(BusMessage::Gap { missed });
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(diff) if (self.predicate)(&diff) => return Some(BusMessage::Diff(diff)),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(missed)) => return Some(BusMessage::Gap { missed }),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.active().remove(&self.id);
        }
    }
}
