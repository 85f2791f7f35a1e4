use super::{PersistencePort, record_id};
use crate::core::{Result, StateKey};
use crate::entity::EntityInstance;
use crate::worker::ExpirySweep;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct StoredRecord {
    instance: EntityInstance,
    saved_at: DateTime<Utc>,
    expires_at: Option<Instant>,
}

impl StoredRecord {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-process backend: a map plus TTL bookkeeping.
///
/// Expired records are invisible to reads immediately and physically removed by the sweep.
#[derive(Default)]
pub struct MemoryPersistence {
    records: RwLock<HashMap<StateKey, StoredRecord>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.records
            .read()
            .await
            .values()
            .filter(|record| !record.is_expired(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// When the record for `key` was last saved.
    pub async fn saved_at(&self, key: &StateKey) -> Option<DateTime<Utc>> {
        let now = Instant::now();
        self.records
            .read()
            .await
            .get(key)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.saved_at)
    }

    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        before - records.len()
    }
}

#[async_trait]
impl PersistencePort for MemoryPersistence {
    async fn save(
        &self,
        key: &StateKey,
        instance: &EntityInstance,
        ttl: Option<Duration>,
    ) -> Result<String> {
        let id = record_id(key);
        let record = StoredRecord {
            instance: instance.clone(),
            saved_at: Utc::now(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.records.write().await.insert(key.clone(), record);
        Ok(id)
    }

    async fn load(&self, key: &StateKey) -> Result<Option<EntityInstance>> {
        let now = Instant::now();
        let records = self.records.read().await;
        Ok(records
            .get(key)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.instance.clone()))
    }

    async fn delete(&self, key: &StateKey) -> Result<bool> {
        let now = Instant::now();
        let removed = self.records.write().await.remove(key);
        Ok(removed.is_some_and(|record| !record.is_expired(now)))
    }

    async fn exists(&self, key: &StateKey) -> Result<bool> {
        let now = Instant::now();
        let records = self.records.read().await;
        Ok(records
            .get(key)
            .is_some_and(|record| !record.is_expired(now)))
    }
}

#[async_trait]
impl ExpirySweep for MemoryPersistence {
    fn name(&self) -> &'static str {
        "memory-persistence"
    }

    async fn sweep_expired(&self) -> Result<usize> {
        Ok(self.purge_expired().await)
    }
}
