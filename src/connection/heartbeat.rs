use super::ConnectionManager;
use crate::core::{Result, StateError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};

/// Handle to the background heartbeat task.
pub struct HeartbeatWorker {
    ticks: Arc<AtomicU64>,
    closed: Arc<AtomicU64>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl HeartbeatWorker {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Connections reaped for missed acknowledgements, idleness or write failure.
    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| StateError::InvalidConfig(format!("heartbeat worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for HeartbeatWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Runs [`ConnectionManager::heartbeat_tick`] on the configured interval.
pub fn spawn_heartbeat_worker(manager: ConnectionManager) -> Result<HeartbeatWorker> {
    let interval: Duration = manager.config().heartbeat_interval;
    if interval.is_zero() {
        return Err(StateError::InvalidConfig(
            "heartbeat interval must be > 0".to_string(),
        ));
    }

    let ticks = Arc::new(AtomicU64::new(0));
    let closed = Arc::new(AtomicU64::new(0));
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let worker_ticks = ticks.clone();
    let worker_closed = closed.clone();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    let reaped = manager.heartbeat_tick();
                    worker_ticks.fetch_add(1, Ordering::Relaxed);
                    if reaped > 0 {
                        worker_closed.fetch_add(reaped as u64, Ordering::Relaxed);
                        event!(Level::DEBUG, reaped, "heartbeat reaped connections");
                    }
                }
            }
        }
    });

    Ok(HeartbeatWorker {
        ticks,
        closed,
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::connection::{ConnectionConfig, OutboundFrame};
    use crate::core::StateKey;

    #[tokio::test]
    async fn worker_sends_heartbeats_then_reaps() {
        let config = ConnectionConfig::new()
            .heartbeat_interval(Duration::from_millis(10))
            .idle_timeout(Duration::from_secs(5))
            .max_missed_acks(2);
        let manager = ConnectionManager::new(config, EventBus::new(8)).unwrap();
        let mut conn = manager.open_connection(vec![StateKey::global("Counter")]).unwrap();

        let worker = spawn_heartbeat_worker(manager.clone()).unwrap();

        let mut heartbeats = 0;
        while let Some(frame) = tokio::time::timeout(Duration::from_secs(2), conn.recv())
            .await
            .ok()
            .flatten()
        {
            if matches!(frame, OutboundFrame::Heartbeat { .. }) {
                heartbeats += 1;
            }
        }

        assert_eq!(heartbeats, 2);
        assert_eq!(manager.connection_count(), 0);
        assert!(worker.closed() >= 1);
        worker.stop().await.unwrap();
    }
}
