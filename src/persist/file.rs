//! JSON-file backend: one document per state key, written atomically.

use super::{PersistencePort, record_id};
use crate::core::{Result, StateError, StateKey};
use crate::entity::EntityInstance;
use crate::worker::ExpirySweep;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
    key: StateKey,
    instance: EntityInstance,
    saved_at_unix_ms: i64,
    #[serde(default)]
    expires_at_unix_ms: Option<i64>,
}

impl FileRecord {
    fn is_expired_at(&self, now_unix_ms: i64) -> bool {
        self.expires_at_unix_ms
            .map(|expires_at| now_unix_ms >= expires_at)
            .unwrap_or(false)
    }
}

pub struct JsonFilePersistence {
    root: PathBuf,
}

impl JsonFilePersistence {
    /// Opens (creating if needed) a backend rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &StateKey) -> PathBuf {
        self.root.join(format!("{}.json", record_id(key)))
    }

    async fn read_record(path: &Path) -> Result<Option<FileRecord>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let record = serde_json::from_slice::<FileRecord>(&bytes).map_err(|err| {
            StateError::Persistence(format!("parse record {}: {}", path.display(), err))
        })?;
        Ok(Some(record))
    }

    async fn live_record(&self, key: &StateKey) -> Result<Option<FileRecord>> {
        let path = self.path_for(key);
        match Self::read_record(&path).await? {
            Some(record) if record.is_expired_at(Utc::now().timestamp_millis()) => Ok(None),
            other => Ok(other),
        }
    }
}

fn write_atomically(dir: &Path, target: &Path, record: &FileRecord) -> Result<()> {
    let temp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        serde_json::to_writer(&mut writer, record)?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(target)
        .map_err(|err| StateError::Persistence(format!("persist {}: {}", target.display(), err)))?;
    Ok(())
}

#[async_trait]
impl PersistencePort for JsonFilePersistence {
    async fn save(
        &self,
        key: &StateKey,
        instance: &EntityInstance,
        ttl: Option<Duration>,
    ) -> Result<String> {
        let now_ms = Utc::now().timestamp_millis();
        let record = FileRecord {
            key: key.clone(),
            instance: instance.clone(),
            saved_at_unix_ms: now_ms,
            expires_at_unix_ms: ttl.map(|ttl| now_ms + ttl.as_millis() as i64),
        };
        let dir = self.root.clone();
        let target = self.path_for(key);

        tokio::task::spawn_blocking(move || write_atomically(&dir, &target, &record))
            .await
            .map_err(|err| StateError::Persistence(format!("write task: {}", err)))??;

        Ok(record_id(key))
    }

    async fn load(&self, key: &StateKey) -> Result<Option<EntityInstance>> {
        Ok(self.live_record(key).await?.map(|record| record.instance))
    }

    async fn delete(&self, key: &StateKey) -> Result<bool> {
        let existed = self.live_record(key).await?.is_some();
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(existed),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, key: &StateKey) -> Result<bool> {
        Ok(self.live_record(key).await?.is_some())
    }
}

#[async_trait]
impl ExpirySweep for JsonFilePersistence {
    fn name(&self) -> &'static str {
        "json-file-persistence"
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let now_ms = Utc::now().timestamp_millis();
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(record)) if record.is_expired_at(now_ms) => {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => removed += 1,
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable record"),
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FieldMap, ScopeKind};
    use serde_json::json;
    use tempfile::tempdir;

    fn instance(key: &StateKey) -> EntityInstance {
        let mut fields = FieldMap::new();
        fields.insert("items".to_string(), json!(["apple"]));
        let mut instance = EntityInstance::new(key.clone(), fields);
        instance.version = 2;
        instance
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let store = JsonFilePersistence::open(dir.path()).await.unwrap();
        let key = StateKey::scoped(ScopeKind::Session, "Cart", "s:1");

        store.save(&key, &instance(&key), None).await.unwrap();
        assert!(store.exists(&key).await.unwrap());

        let reopened = JsonFilePersistence::open(dir.path()).await.unwrap();
        let loaded = reopened.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded.key, key);
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.fields.get("items"), Some(&json!(["apple"])));

        assert!(reopened.delete(&key).await.unwrap());
        assert!(!reopened.delete(&key).await.unwrap());
    }

    #[tokio::test]
    async fn expired_documents_are_swept() {
        let dir = tempdir().unwrap();
        let store = JsonFilePersistence::open(dir.path()).await.unwrap();
        let short = StateKey::global("Flash");
        let long = StateKey::global("Banner");

        store
            .save(&short, &instance(&short), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        store.save(&long, &instance(&long), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.exists(&short).await.unwrap());
        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert!(store.exists(&long).await.unwrap());
    }
}
