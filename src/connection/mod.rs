pub mod config;
pub mod frame;
pub mod heartbeat;

pub use config::ConnectionConfig;
pub use frame::{OutboundFrame, SseEvent};
pub use heartbeat::{HeartbeatWorker, spawn_heartbeat_worker};

use crate::bus::{BusMessage, BusSubscription, EventBus};
use crate::core::{Result, StateError, StateKey};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{Level, event, info, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Lifecycle of one client connection.
///
/// `Connecting -> Open -> (Active | Idle)* -> Closing -> Closed`. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Active,
    Idle,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnect,
    WriteFailed,
    IdleTimeout,
    MissedHeartbeats,
    Shutdown,
}

/// Per-connection state shared with its pump task.
struct ConnectionShared {
    id: ConnectionId,
    keys: RwLock<HashSet<StateKey>>,
    state: Mutex<ConnectionState>,
}

impl ConnectionShared {
    fn keys(&self) -> Vec<StateKey> {
        let keys = self.keys.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut keys: Vec<StateKey> = keys.iter().cloned().collect();
        keys.sort_by_key(ToString::to_string);
        keys
    }

    fn is_subscribed(&self, key: &StateKey) -> bool {
        self.keys
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(key)
    }

    fn insert_key(&self, key: StateKey) -> bool {
        self.keys
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key)
    }

    fn remove_key(&self, key: &StateKey) -> bool {
        self.keys
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key)
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves to `next` unless the connection is already closing.
    fn transition(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let terminal = matches!(*state, ConnectionState::Closing | ConnectionState::Closed);
        if !terminal || next == ConnectionState::Closed {
            *state = next;
        }
    }
}

struct ConnectionEntry {
    shared: Arc<ConnectionShared>,
    tx: mpsc::Sender<OutboundFrame>,
    pump: JoinHandle<()>,
    last_ack: Instant,
    missed_acks: u32,
    heartbeat_seq: u64,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    by_key: HashMap<StateKey, HashSet<ConnectionId>>,
}

impl Registry {
    fn subscriber_count(&self, key: &StateKey) -> usize {
        self.by_key.get(key).map_or(0, HashSet::len)
    }

    fn unindex(&mut self, id: ConnectionId, key: &StateKey) {
        if let Some(ids) = self.by_key.get_mut(key) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_key.remove(key);
            }
        }
    }
}

struct ManagerInner {
    config: ConnectionConfig,
    bus: EventBus,
    registry: Mutex<Registry>,
}

/// Connection and subscription statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub connections: usize,
    pub subscriptions: usize,
    pub subscribed_keys: usize,
}

/// Tracks open connections and routes bus events to the ones subscribed to each key.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, bus: EventBus) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                bus,
                registry: Mutex::new(Registry::default()),
            }),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens a connection subscribed to `keys`. The first frame it yields is the handshake.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open_connection(&self, keys: Vec<StateKey>) -> Result<Connection> {
        let config = &self.inner.config;
        let keys: HashSet<StateKey> = keys.into_iter().collect();

        let mut registry = self.registry();
        if registry.connections.len() >= config.max_connections {
            return Err(StateError::SubscriptionLimit(format!(
                "connection limit of {} reached",
                config.max_connections
            )));
        }
        if keys.len() > config.max_subscriptions_per_connection {
            return Err(StateError::SubscriptionLimit(format!(
                "{} keys requested, at most {} per connection",
                keys.len(),
                config.max_subscriptions_per_connection
            )));
        }
        if let Some(full) = keys
            .iter()
            .find(|key| registry.subscriber_count(key) >= config.max_subscribers_per_key)
        {
            return Err(StateError::SubscriptionLimit(format!(
                "key '{full}' has {} subscribers",
                config.max_subscribers_per_key
            )));
        }

        let id = Uuid::new_v4();
        let shared = Arc::new(ConnectionShared {
            id,
            keys: RwLock::new(keys.clone()),
            state: Mutex::new(ConnectionState::Connecting),
        });

        let (tx, rx) = mpsc::channel(config.outbound_queue);
        tx.try_send(OutboundFrame::Connected { connection_id: id })
            .map_err(|_| StateError::ConnectionClosed(id))?;
        shared.transition(ConnectionState::Open);

        let routed = shared.clone();
        let subscription = self
            .inner
            .bus
            .subscribe(move |diff| routed.is_subscribed(&diff.key));
        let pump = tokio::spawn(pump_events(
            Arc::downgrade(&self.inner),
            shared.clone(),
            subscription,
            tx.clone(),
        ));

        for key in &keys {
            registry.by_key.entry(key.clone()).or_default().insert(id);
        }
        registry.connections.insert(
            id,
            ConnectionEntry {
                shared: shared.clone(),
                tx,
                pump,
                last_ack: Instant::now(),
                missed_acks: 0,
                heartbeat_seq: 0,
            },
        );
        drop(registry);

        info!(connection = %id, keys = keys.len(), "connection opened");
        Ok(Connection {
            id,
            rx,
            shared,
            manager: self.clone(),
        })
    }

    /// Returns `false` when the connection already held the subscription.
    pub fn add_subscription(&self, id: ConnectionId, key: StateKey) -> Result<bool> {
        let config = &self.inner.config;
        let mut registry = self.registry();
        let subscribers = registry.subscriber_count(&key);

        let entry = registry
            .connections
            .get(&id)
            .ok_or(StateError::ConnectionClosed(id))?;
        if entry.shared.is_subscribed(&key) {
            return Ok(false);
        }
        if entry.shared.keys().len() >= config.max_subscriptions_per_connection {
            return Err(StateError::SubscriptionLimit(format!(
                "connection {id} already holds {} subscriptions",
                config.max_subscriptions_per_connection
            )));
        }
        if subscribers >= config.max_subscribers_per_key {
            return Err(StateError::SubscriptionLimit(format!(
                "key '{key}' has {} subscribers",
                config.max_subscribers_per_key
            )));
        }

        entry.shared.insert_key(key.clone());
        registry.by_key.entry(key).or_default().insert(id);
        Ok(true)
    }

    /// Returns `false` when the connection did not hold the subscription.
    pub fn remove_subscription(&self, id: ConnectionId, key: &StateKey) -> Result<bool> {
        let mut registry = self.registry();
        let removed = registry
            .connections
            .get(&id)
            .ok_or(StateError::ConnectionClosed(id))?
            .shared
            .remove_key(key);
        if removed {
            registry.unindex(id, key);
        }
        Ok(removed)
    }

    /// Records a heartbeat acknowledgement from the client.
    pub fn acknowledge(&self, id: ConnectionId) -> Result<()> {
        let mut registry = self.registry();
        let entry = registry
            .connections
            .get_mut(&id)
            .ok_or(StateError::ConnectionClosed(id))?;
        entry.missed_acks = 0;
        entry.last_ack = Instant::now();
        Ok(())
    }

    /// Closes a connection and drops all its subscriptions. Returns `false` if it was not open.
    pub fn close(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let entry = {
            let mut registry = self.registry();
            let Some(entry) = registry.connections.remove(&id) else {
                return false;
            };
            for key in entry.shared.keys() {
                registry.unindex(id, &key);
            }
            entry
        };

        entry.shared.transition(ConnectionState::Closing);
        entry.pump.abort();
        drop(entry.tx);
        entry.shared.transition(ConnectionState::Closed);

        match reason {
            CloseReason::ClientDisconnect | CloseReason::Shutdown => {
                info!(connection = %id, ?reason, "connection closed");
            }
            _ => warn!(connection = %id, ?reason, "connection closed"),
        }
        true
    }

    /// One heartbeat round: reaps idle or unresponsive connections and sends a keep-alive
    /// frame to the rest. Returns how many connections were closed.
    pub fn heartbeat_tick(&self) -> usize {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut doomed = Vec::new();

        {
            let mut registry = self.registry();
            for (id, entry) in registry.connections.iter_mut() {
                if now.duration_since(entry.last_ack) >= config.idle_timeout {
                    doomed.push((*id, CloseReason::IdleTimeout));
                    continue;
                }
                if entry.missed_acks >= config.max_missed_acks {
                    doomed.push((*id, CloseReason::MissedHeartbeats));
                    continue;
                }

                entry.heartbeat_seq += 1;
                let frame = OutboundFrame::Heartbeat {
                    seq: entry.heartbeat_seq,
                };
                match entry.tx.try_send(frame) {
                    Ok(()) => entry.missed_acks += 1,
                    Err(TrySendError::Full(_)) => doomed.push((*id, CloseReason::WriteFailed)),
                    Err(TrySendError::Closed(_)) => doomed.push((*id, CloseReason::ClientDisconnect)),
                }
            }
        }

        doomed
            .into_iter()
            .filter(|(id, reason)| self.close(*id, *reason))
            .count()
    }

    pub fn subscribers(&self, key: &StateKey) -> Vec<ConnectionId> {
        self.registry()
            .by_key
            .get(key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn subscriptions(&self, id: ConnectionId) -> Option<Vec<StateKey>> {
        self.registry()
            .connections
            .get(&id)
            .map(|entry| entry.shared.keys())
    }

    /// `None` once the connection has been closed and forgotten.
    pub fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.registry()
            .connections
            .get(&id)
            .map(|entry| entry.shared.state())
    }

    pub fn connection_count(&self) -> usize {
        self.registry().connections.len()
    }

    pub fn stats(&self) -> ConnectionStats {
        let registry = self.registry();
        ConnectionStats {
            connections: registry.connections.len(),
            subscriptions: registry.by_key.values().map(HashSet::len).sum(),
            subscribed_keys: registry.by_key.len(),
        }
    }

    pub fn close_all(&self, reason: CloseReason) -> usize {
        let ids: Vec<ConnectionId> = self.registry().connections.keys().copied().collect();
        ids.into_iter().filter(|id| self.close(*id, reason)).count()
    }
}

/// Forwards bus events to one connection's outbound queue.
async fn pump_events(
    manager: Weak<ManagerInner>,
    shared: Arc<ConnectionShared>,
    mut subscription: BusSubscription,
    tx: mpsc::Sender<OutboundFrame>,
) {
    let (forward_empty, write_timeout) = match manager.upgrade() {
        Some(inner) => (
            inner.config.forward_empty_diffs,
            inner.config.heartbeat_interval,
        ),
        None => return,
    };

    while let Some(message) = subscription.recv().await {
        let frame = match message {
            BusMessage::Diff(diff) if diff.is_empty() && !forward_empty => continue,
            BusMessage::Diff(diff) => OutboundFrame::Diff(diff),
            BusMessage::Gap { missed } => {
                warn!(connection = %shared.id, missed, "connection lagged, requesting resync");
                OutboundFrame::Resync {
                    keys: shared.keys(),
                    missed,
                }
            }
        };

        shared.transition(ConnectionState::Active);
        if let Err(reason) = write(&tx, frame, write_timeout).await {
            if let Some(inner) = manager.upgrade() {
                ConnectionManager { inner }.close(shared.id, reason);
            }
            return;
        }
        shared.transition(ConnectionState::Idle);
    }

    event!(Level::DEBUG, connection = %shared.id, "event bus closed");
}

async fn write(
    tx: &mpsc::Sender<OutboundFrame>,
    frame: OutboundFrame,
    timeout: Duration,
) -> std::result::Result<(), CloseReason> {
    match tx.try_send(frame) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(frame)) => tx
            .send_timeout(frame, timeout)
            .await
            .map_err(|_| CloseReason::WriteFailed),
        Err(TrySendError::Closed(_)) => Err(CloseReason::ClientDisconnect),
    }
}

/// Client side of a connection: the ordered stream of outbound frames.
///
/// Dropping the handle closes the connection.
pub struct Connection {
    id: ConnectionId,
    rx: mpsc::Receiver<OutboundFrame>,
    shared: Arc<ConnectionShared>,
    manager: ConnectionManager,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Next frame, or `None` after the connection closed and its queue drained.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.rx.try_recv().ok()
    }

    pub fn close(self) {
        self.manager.close(self.id, CloseReason::ClientDisconnect);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.manager.close(self.id, CloseReason::ClientDisconnect);
    }
}
