//! Messenger-unit persistence: monitors, scheduled batches, and unsent
//! crank records.
//!
//! Document keys are prefixed (`monitor-`, `batch-`, `unsent-`) so no
//! identifier can start with an underscore. Monitors mutate in place
//! (their cursor advances); batches are write-once.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use ao_core::{BlockInfo, OutboundMessage, SortKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clients::ScheduledMessage;
use crate::error::{io_error, MuError, MuResult};

/// A process whose scheduled feed the MU polls. One monitor per
/// process; `last_from_sort_key` advances monotonically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: String,
    pub authorized: bool,
    #[serde(
        default,
        rename = "lastFromSortKey",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_from_sort_key: Option<SortKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockInfo>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// Scheduled messages persisted under one generated batch id before they
/// are cranked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledBatch {
    #[serde(rename = "fromTxId")]
    pub from_tx_id: String,
    #[serde(rename = "processId")]
    pub process_id: String,
    pub messages: Vec<ScheduledMessage>,
}

/// A dispatch that failed; kept so a later crank can retry it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsentMessage {
    #[serde(rename = "processId")]
    pub process_id: String,
    pub message: OutboundMessage,
    pub reason: String,
    #[serde(rename = "recordedAt")]
    pub recorded_at: i64,
}

#[async_trait]
pub trait MuStore: Send + Sync {
    async fn monitors(&self) -> MuResult<Vec<Monitor>>;
    async fn find_monitor(&self, process_id: &str) -> MuResult<Option<Monitor>>;
    async fn save_monitor(&self, monitor: &Monitor) -> MuResult<()>;
    async fn delete_monitor(&self, process_id: &str) -> MuResult<()>;

    async fn save_batch(&self, batch: &ScheduledBatch) -> MuResult<()>;
    async fn find_batch(&self, from_tx_id: &str) -> MuResult<Option<ScheduledBatch>>;

    async fn record_unsent(&self, unsent: &UnsentMessage) -> MuResult<()>;
    /// Drain up to `limit` unsent records for retry.
    async fn take_unsent(&self, limit: usize) -> MuResult<Vec<UnsentMessage>>;
}

// ---------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------

#[derive(Default)]
struct MemInner {
    monitors: HashMap<String, Monitor>,
    batches: HashMap<String, ScheduledBatch>,
    unsent: Vec<UnsentMessage>,
}

#[derive(Default)]
pub struct MemMuStore {
    inner: Mutex<MemInner>,
}

impl MemMuStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MuStore for MemMuStore {
    async fn monitors(&self) -> MuResult<Vec<Monitor>> {
        let inner = self.inner.lock().expect("store lock");
        let mut monitors: Vec<_> = inner.monitors.values().cloned().collect();
        monitors.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(monitors)
    }

    async fn find_monitor(&self, process_id: &str) -> MuResult<Option<Monitor>> {
        Ok(self
            .inner
            .lock()
            .expect("store lock")
            .monitors
            .get(process_id)
            .cloned())
    }

    async fn save_monitor(&self, monitor: &Monitor) -> MuResult<()> {
        self.inner
            .lock()
            .expect("store lock")
            .monitors
            .insert(monitor.id.clone(), monitor.clone());
        Ok(())
    }

    async fn delete_monitor(&self, process_id: &str) -> MuResult<()> {
        self.inner
            .lock()
            .expect("store lock")
            .monitors
            .remove(process_id);
        Ok(())
    }

    async fn save_batch(&self, batch: &ScheduledBatch) -> MuResult<()> {
        self.inner
            .lock()
            .expect("store lock")
            .batches
            .entry(batch.from_tx_id.clone())
            .or_insert_with(|| batch.clone());
        Ok(())
    }

    async fn find_batch(&self, from_tx_id: &str) -> MuResult<Option<ScheduledBatch>> {
        Ok(self
            .inner
            .lock()
            .expect("store lock")
            .batches
            .get(from_tx_id)
            .cloned())
    }

    async fn record_unsent(&self, unsent: &UnsentMessage) -> MuResult<()> {
        self.inner
            .lock()
            .expect("store lock")
            .unsent
            .push(unsent.clone());
        Ok(())
    }

    async fn take_unsent(&self, limit: usize) -> MuResult<Vec<UnsentMessage>> {
        let mut inner = self.inner.lock().expect("store lock");
        let take = limit.min(inner.unsent.len());
        Ok(inner.unsent.drain(..take).collect())
    }
}

// ---------------------------------------------------------------------
// Filesystem backend
// ---------------------------------------------------------------------

#[derive(Debug)]
pub struct FsMuStore {
    docs_dir: PathBuf,
    unsent_seq: AtomicU64,
}

impl FsMuStore {
    pub fn open(root: impl AsRef<Path>) -> MuResult<Self> {
        let docs_dir = root.as_ref().join("docs");
        fs::create_dir_all(&docs_dir).map_err(|e| io_error(&docs_dir, e))?;
        Ok(Self {
            docs_dir,
            unsent_seq: AtomicU64::new(0),
        })
    }

    fn doc_path(&self, key: &str) -> PathBuf {
        self.docs_dir.join(key)
    }

    fn write_doc<T: Serialize>(&self, key: &str, value: &T) -> MuResult<()> {
        let path = self.doc_path(key);
        let bytes =
            serde_json::to_vec(value).map_err(|e| MuError::schema("persisted document", e))?;
        fs::write(&path, bytes).map_err(|e| io_error(&path, e))
    }

    fn read_doc<T: serde::de::DeserializeOwned>(&self, key: &str) -> MuResult<Option<T>> {
        let path = self.doc_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&path, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| MuError::schema("persisted document", format!("{key}: {e}")))
    }

    fn keys_with_prefix(&self, prefix: &str) -> MuResult<Vec<String>> {
        let mut keys = Vec::new();
        let entries = fs::read_dir(&self.docs_dir).map_err(|e| io_error(&self.docs_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.docs_dir, e))?;
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl MuStore for FsMuStore {
    async fn monitors(&self) -> MuResult<Vec<Monitor>> {
        let mut monitors = Vec::new();
        for key in self.keys_with_prefix("monitor-")? {
            if let Some(monitor) = self.read_doc::<Monitor>(&key)? {
                monitors.push(monitor);
            }
        }
        Ok(monitors)
    }

    async fn find_monitor(&self, process_id: &str) -> MuResult<Option<Monitor>> {
        self.read_doc(&format!("monitor-{process_id}"))
    }

    async fn save_monitor(&self, monitor: &Monitor) -> MuResult<()> {
        self.write_doc(&format!("monitor-{}", monitor.id), monitor)
    }

    async fn delete_monitor(&self, process_id: &str) -> MuResult<()> {
        let path = self.doc_path(&format!("monitor-{process_id}"));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&path, err)),
        }
    }

    async fn save_batch(&self, batch: &ScheduledBatch) -> MuResult<()> {
        let key = format!("batch-{}", batch.from_tx_id);
        if self.doc_path(&key).exists() {
            return Ok(());
        }
        self.write_doc(&key, batch)
    }

    async fn find_batch(&self, from_tx_id: &str) -> MuResult<Option<ScheduledBatch>> {
        self.read_doc(&format!("batch-{from_tx_id}"))
    }

    async fn record_unsent(&self, unsent: &UnsentMessage) -> MuResult<()> {
        let seq = self.unsent_seq.fetch_add(1, Ordering::SeqCst);
        self.write_doc(
            &format!("unsent-{:020}-{seq:06}", unsent.recorded_at),
            unsent,
        )
    }

    async fn take_unsent(&self, limit: usize) -> MuResult<Vec<UnsentMessage>> {
        let mut drained = Vec::new();
        for key in self.keys_with_prefix("unsent-")?.into_iter().take(limit) {
            if let Some(unsent) = self.read_doc::<UnsentMessage>(&key)? {
                drained.push(unsent);
            }
            let path = self.doc_path(&key);
            fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
        }
        Ok(drained)
    }
}
