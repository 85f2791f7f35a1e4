//! Background expiry sweep shared by the state cache and the persistence adapters.

use crate::core::{Result, StateError};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event, warn};

/// Anything holding entries with a time-to-live.
#[async_trait]
pub trait ExpirySweep: Send + Sync {
    fn name(&self) -> &'static str;

    /// Removes expired entries, returning how many were removed.
    async fn sweep_expired(&self) -> Result<usize>;
}

/// Counters shared between a running worker and its handle.
#[derive(Debug, Default)]
pub struct SweepCounters {
    pub ticks: AtomicU64,
    pub removed: AtomicU64,
    pub errors: AtomicU64,
}

/// Handle to the background sweep task.
pub struct SweepWorker {
    counters: Arc<SweepCounters>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl SweepWorker {
    pub fn counters(&self) -> &SweepCounters {
        &self.counters
    }

    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| StateError::InvalidConfig(format!("sweep worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for SweepWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Runs one pass over every target. A failing target is logged and does not stop the others.
pub async fn sweep_once(targets: &[Arc<dyn ExpirySweep>], counters: &SweepCounters) -> usize {
    let mut removed = 0;
    for target in targets {
        match target.sweep_expired().await {
            Ok(count) => removed += count,
            Err(err) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(sweep = target.name(), error = %err, "expiry sweep failed");
            }
        }
    }
    counters.ticks.fetch_add(1, Ordering::Relaxed);
    counters.removed.fetch_add(removed as u64, Ordering::Relaxed);
    removed
}

/// Spawns the sweep loop on a fixed interval, independent of request traffic.
pub fn spawn_sweep_worker(targets: Vec<Arc<dyn ExpirySweep>>, interval: Duration) -> Result<SweepWorker> {
    if interval.is_zero() {
        return Err(StateError::InvalidConfig(
            "sweep interval must be > 0".to_string(),
        ));
    }

    let counters = Arc::new(SweepCounters::default());
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let worker_counters = counters.clone();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    let removed = sweep_once(&targets, &worker_counters).await;
                    if removed > 0 {
                        event!(Level::DEBUG, removed, "expiry sweep tick");
                    }
                }
            }
        }
    });

    Ok(SweepWorker {
        counters,
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Flaky {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExpirySweep for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn sweep_expired(&self) -> Result<usize> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                Err(StateError::Persistence("disk unavailable".to_string()))
            } else {
                Ok(3)
            }
        }
    }

    #[tokio::test]
    async fn failing_target_does_not_stop_the_pass() {
        let flaky: Arc<dyn ExpirySweep> = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
        });
        let steady: Arc<dyn ExpirySweep> = Arc::new(Flaky {
            calls: AtomicUsize::new(1),
        });
        let counters = SweepCounters::default();

        let removed = sweep_once(&[flaky, steady], &counters).await;
        assert_eq!(removed, 3);
        assert_eq!(counters.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn worker_ticks_until_stopped() {
        let target: Arc<dyn ExpirySweep> = Arc::new(Flaky {
            calls: AtomicUsize::new(1),
        });
        let worker = spawn_sweep_worker(vec![target], Duration::from_millis(10)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(worker.counters().ticks.load(Ordering::SeqCst) >= 2);
        worker.stop().await.unwrap();

        assert!(spawn_sweep_worker(Vec::new(), Duration::ZERO).is_err());
    }
}
