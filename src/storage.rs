//! Durable keyed storage for typed record collections
//!
//! # Collections
//!
//! - `cached-events` - Queued attribution events (key: createdAt)
//! - `grovs-payment-events-cache` - Queued purchase records (key: record_id)
//! - `grovs-handled-transactions` - Transaction ids already reported
//! - `grovs-local-state` - Scalar counters, timestamps, device identifier
//!
//! Every mutation is a read-modify-write of the whole collection followed by
//! an atomic file replace. All access for a given store instance funnels
//! through one `tokio::sync::Mutex` lane, so two concurrent `add` calls can
//! never lose an entry. A missing file reads as the empty collection.

use crate::error::{Error, Result};
use crate::types::{Event, TransactionRecord};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Collection file names
pub const COLLECTION_EVENTS: &str = "cached-events";
/// Purchase record queue
pub const COLLECTION_PAYMENTS: &str = "grovs-payment-events-cache";
/// Handled transaction id set
pub const COLLECTION_HANDLED: &str = "grovs-handled-transactions";
/// Scalar local state
pub const COLLECTION_STATE: &str = "grovs-local-state";

/// A record that can live in a durable collection
pub trait StoredRecord: Clone + Serialize + DeserializeOwned + Send + Sync {
    /// Identity key within the collection; collisions overwrite
    fn store_key(&self) -> String;
}

impl StoredRecord for Event {
    fn store_key(&self) -> String {
        self.created_at.timestamp_millis().to_string()
    }
}

impl StoredRecord for TransactionRecord {
    fn store_key(&self) -> String {
        self.record_id.to_string()
    }
}

/// File-backed durable collection of typed records
pub struct DurableStore<T: StoredRecord> {
    path: PathBuf,
    // Ordered access lane: one reader/writer section at a time
    lane: Mutex<()>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: StoredRecord> DurableStore<T> {
    /// Open (or lazily create) the collection file under `data_dir`
    pub fn open(data_dir: &Path, collection: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(format!("{collection}.json"));

        tracing::debug!(collection, path = %path.display(), "Opened durable store");

        Ok(Self {
            path,
            lane: Mutex::new(()),
            _marker: std::marker::PhantomData,
        })
    }

    /// All records in insertion order; empty on first use
    pub async fn get_all(&self) -> Result<Vec<T>> {
        let _lane = self.lane.lock().await;
        self.read_collection().await
    }

    /// Append one record, overwriting any record with the same key
    pub async fn add(&self, record: T) -> Result<()> {
        self.add_or_replace(vec![record]).await
    }

    /// Append records, overwriting existing records with matching keys
    pub async fn add_or_replace(&self, records: Vec<T>) -> Result<()> {
        let _lane = self.lane.lock().await;
        let mut all = self.read_collection().await?;
        for record in records {
            let key = record.store_key();
            match all.iter_mut().find(|r| r.store_key() == key) {
                Some(existing) => *existing = record,
                None => all.push(record),
            }
        }
        self.write_collection(&all).await
    }

    /// Remove the record with the same key, if present
    pub async fn remove(&self, record: &T) -> Result<()> {
        let _lane = self.lane.lock().await;
        let mut all = self.read_collection().await?;
        let key = record.store_key();
        all.retain(|r| r.store_key() != key);
        self.write_collection(&all).await
    }

    /// Read-modify-write the whole collection inside the access lane
    ///
    /// Used where the new contents depend on the old ones (lifecycle dedup,
    /// engagement backfill), which would race as separate get/put calls.
    pub async fn transform<F>(&self, f: F) -> Result<Vec<T>>
    where
        F: FnOnce(Vec<T>) -> Vec<T> + Send,
    {
        let _lane = self.lane.lock().await;
        let all = self.read_collection().await?;
        let next = f(all);
        self.write_collection(&next).await?;
        Ok(next)
    }

    async fn read_collection(&self) -> Result<Vec<T>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let records: Vec<T> = serde_json::from_slice(&bytes)?;
                Ok(records)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn write_collection(&self, records: &[T]) -> Result<()> {
        let bytes = serde_json::to_vec(records)?;

        // Whole-file replace via temp + rename, so a crash mid-write never
        // leaves a truncated collection behind.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        Ok(())
    }
}

/// Scalar local state persisted alongside the collections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LocalState {
    /// Number of app opens recorded on this device
    #[serde(default)]
    open_count: u64,

    /// Timestamp of the most recent app start
    #[serde(default)]
    last_start: Option<DateTime<Utc>>,

    /// Timestamp of the most recent background transition
    #[serde(default)]
    last_resign: Option<DateTime<Utc>>,

    /// Locally generated device identifier
    #[serde(default)]
    device_id: Option<String>,
}

/// Store for scalar counters, timestamps and the device identifier
pub struct StateStore {
    path: PathBuf,
    lane: Mutex<()>,
}

impl StateStore {
    /// Open (or lazily create) the state file under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(format!("{COLLECTION_STATE}.json"));
        Ok(Self {
            path,
            lane: Mutex::new(()),
        })
    }

    /// Number of recorded app opens
    pub async fn open_count(&self) -> Result<u64> {
        let _lane = self.lane.lock().await;
        Ok(self.read_state().await?.open_count)
    }

    /// Increment the app open counter
    pub async fn increment_open_count(&self) -> Result<u64> {
        let _lane = self.lane.lock().await;
        let mut state = self.read_state().await?;
        state.open_count += 1;
        let count = state.open_count;
        self.write_state(&state).await?;
        Ok(count)
    }

    /// Most recent app start timestamp
    pub async fn last_start(&self) -> Result<Option<DateTime<Utc>>> {
        let _lane = self.lane.lock().await;
        Ok(self.read_state().await?.last_start)
    }

    /// Record the app start timestamp
    pub async fn set_last_start(&self, at: DateTime<Utc>) -> Result<()> {
        let _lane = self.lane.lock().await;
        let mut state = self.read_state().await?;
        state.last_start = Some(at);
        self.write_state(&state).await
    }

    /// Most recent background transition timestamp
    pub async fn last_resign(&self) -> Result<Option<DateTime<Utc>>> {
        let _lane = self.lane.lock().await;
        Ok(self.read_state().await?.last_resign)
    }

    /// Record the background transition timestamp
    pub async fn set_last_resign(&self, at: DateTime<Utc>) -> Result<()> {
        let _lane = self.lane.lock().await;
        let mut state = self.read_state().await?;
        state.last_resign = Some(at);
        self.write_state(&state).await
    }

    /// Device identifier, if one was ever generated
    pub async fn device_id(&self) -> Result<Option<String>> {
        let _lane = self.lane.lock().await;
        Ok(self.read_state().await?.device_id)
    }

    /// Device identifier, generated and persisted on first use
    pub async fn ensure_device_id(&self) -> Result<String> {
        let _lane = self.lane.lock().await;
        let mut state = self.read_state().await?;
        if let Some(id) = state.device_id.clone() {
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        state.device_id = Some(id.clone());
        self.write_state(&state).await?;

        tracing::info!(device_id = %id, "Generated device identifier");
        Ok(id)
    }

    async fn read_state(&self) -> Result<LocalState> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LocalState::default()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn write_state(&self, state: &LocalState) -> Result<()> {
        let bytes = serde_json::to_vec(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Persisted set of transaction ids already reported to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandledTransaction {
    /// Platform transaction identifier
    pub transaction_id: u64,
}

impl StoredRecord for HandledTransaction {
    fn store_key(&self) -> String {
        self.transaction_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventType;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn event_at(secs: i64) -> Event {
        Event::at(
            EventType::AppOpen,
            Utc.timestamp_opt(secs, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_first_read_is_empty() {
        let temp = TempDir::new().unwrap();
        let store: DurableStore<Event> =
            DurableStore::open(temp.path(), COLLECTION_EVENTS).unwrap();

        let all = store.get_all().await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let temp = TempDir::new().unwrap();
        let store: DurableStore<Event> =
            DurableStore::open(temp.path(), COLLECTION_EVENTS).unwrap();

        store.add(event_at(100)).await.unwrap();
        store.add(event_at(200)).await.unwrap();

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_same_key_overwrites() {
        let temp = TempDir::new().unwrap();
        let store: DurableStore<Event> =
            DurableStore::open(temp.path(), COLLECTION_EVENTS).unwrap();

        let mut event = event_at(100);
        store.add(event.clone()).await.unwrap();

        event.link = Some("https://grovs.io/abc".to_string());
        store.add(event).await.unwrap();

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].link.as_deref(), Some("https://grovs.io/abc"));
    }

    #[tokio::test]
    async fn test_rapidly_created_events_all_survive() {
        let temp = TempDir::new().unwrap();
        let store: DurableStore<Event> =
            DurableStore::open(temp.path(), COLLECTION_EVENTS).unwrap();

        // Minted back-to-back, well inside one millisecond of wall time
        let first = Event::new(EventType::AppOpen);
        let second = Event::new(EventType::TimeSpent);
        store.add(first.clone()).await.unwrap();
        store.add(second).await.unwrap();
        assert_eq!(store.get_all().await.unwrap().len(), 2);

        // Acking one never takes its sibling with it
        store.remove(&first).await.unwrap();
        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].event_type, EventType::TimeSpent);
    }

    #[tokio::test]
    async fn test_identity_stable_across_persistence() {
        let temp = TempDir::new().unwrap();
        let store: DurableStore<Event> =
            DurableStore::open(temp.path(), COLLECTION_EVENTS).unwrap();

        let event = Event::new(EventType::AppOpen);
        store.add(event.clone()).await.unwrap();

        // The deserialized copy carries the exact same identity, so the
        // original handle still addresses it
        let stored = store.get_all().await.unwrap();
        assert_eq!(stored[0].store_key(), event.store_key());
        store.remove(&event).await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove() {
        let temp = TempDir::new().unwrap();
        let store: DurableStore<Event> =
            DurableStore::open(temp.path(), COLLECTION_EVENTS).unwrap();

        let event = event_at(100);
        store.add(event.clone()).await.unwrap();
        store.remove(&event).await.unwrap();

        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_adds_both_survive() {
        let temp = TempDir::new().unwrap();
        let store: Arc<DurableStore<Event>> =
            Arc::new(DurableStore::open(temp.path(), COLLECTION_EVENTS).unwrap());

        let a = store.clone();
        let b = store.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.add(event_at(100)).await }),
            tokio::spawn(async move { b.add(event_at(200)).await }),
        );
        ra.unwrap().unwrap();
        rb.unwrap().unwrap();

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let store: DurableStore<Event> =
                DurableStore::open(temp.path(), COLLECTION_EVENTS).unwrap();
            store.add(event_at(100)).await.unwrap();
        }

        let store: DurableStore<Event> =
            DurableStore::open(temp.path(), COLLECTION_EVENTS).unwrap();
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_state_store_counters() {
        let temp = TempDir::new().unwrap();
        let state = StateStore::open(temp.path()).unwrap();

        assert_eq!(state.open_count().await.unwrap(), 0);
        assert_eq!(state.increment_open_count().await.unwrap(), 1);
        assert_eq!(state.increment_open_count().await.unwrap(), 2);

        let now = Utc::now();
        state.set_last_resign(now).await.unwrap();
        let resign = state.last_resign().await.unwrap().unwrap();
        assert_eq!(resign.timestamp_millis(), now.timestamp_millis());
    }

    #[tokio::test]
    async fn test_device_id_stable_across_reads() {
        let temp = TempDir::new().unwrap();
        let state = StateStore::open(temp.path()).unwrap();

        assert!(state.device_id().await.unwrap().is_none());
        let id = state.ensure_device_id().await.unwrap();
        assert_eq!(state.ensure_device_id().await.unwrap(), id);
        assert_eq!(state.device_id().await.unwrap(), Some(id));
    }
}
