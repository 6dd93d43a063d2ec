//! The result store: one document per evaluation, one per process.
//!
//! Documents are keyed `proc-{processId}:{sortKey}` (evaluations) and
//! `proc-{processId}` (processes). The prefix also keeps identifiers
//! from starting with an underscore, which the document store rejects.
//! Records are append-only and keyed by immutable sort key, so every
//! operation is atomic at the single-record grain.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ao_core::{Evaluation, Process, SortKey};
use async_trait::async_trait;

use crate::error::{io_error, CuError, CuResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// The record already existed. Idempotent callers treat this as
    /// success and use the stored record.
    AlreadyExists,
}

/// Bounds for `find_evaluations`; both ends inclusive.
#[derive(Debug, Clone, Default)]
pub struct EvalRange {
    pub from: Option<SortKey>,
    pub to: Option<SortKey>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait EvaluationStore: Send + Sync {
    async fn save_evaluation(&self, eval: &Evaluation) -> CuResult<SaveOutcome>;

    /// The evaluation with the maximum sort key `<= to` (no bound when
    /// `to` is `None`).
    async fn find_latest_evaluation(
        &self,
        process_id: &str,
        to: Option<&SortKey>,
    ) -> CuResult<Option<Evaluation>>;

    /// Ascending range of evaluations for a process.
    async fn find_evaluations(
        &self,
        process_id: &str,
        range: &EvalRange,
    ) -> CuResult<Vec<Evaluation>>;

    /// Presence probe by message id.
    async fn find_message_id(&self, message_id: &str) -> CuResult<bool>;

    /// Dedup probe for forwarded messages.
    async fn find_by_deep_hash(
        &self,
        process_id: &str,
        deep_hash: &str,
    ) -> CuResult<Option<Evaluation>>;

    async fn save_process(&self, process: &Process) -> CuResult<()>;

    async fn find_process(&self, process_id: &str) -> CuResult<Option<Process>>;
}

fn eval_doc_key(process_id: &str, sort_key: &SortKey) -> String {
    format!("proc-{process_id}:{sort_key}")
}

fn process_doc_key(process_id: &str) -> String {
    format!("proc-{process_id}")
}

// ---------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------

#[derive(Default)]
struct MemInner {
    evals: BTreeMap<(String, SortKey), Evaluation>,
    deep_hashes: HashMap<(String, String), SortKey>,
    message_ids: HashSet<String>,
    processes: HashMap<String, Process>,
}

/// BTreeMap-backed store for tests and development mode.
#[derive(Default)]
pub struct MemEvalStore {
    inner: Mutex<MemInner>,
}

impl MemEvalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EvaluationStore for MemEvalStore {
    async fn save_evaluation(&self, eval: &Evaluation) -> CuResult<SaveOutcome> {
        let mut inner = self.inner.lock().expect("store lock");
        let key = (eval.process_id.clone(), eval.sort_key.clone());
        if inner.evals.contains_key(&key) {
            return Ok(SaveOutcome::AlreadyExists);
        }
        if let Some(deep_hash) = &eval.deep_hash {
            inner.deep_hashes.insert(
                (eval.process_id.clone(), deep_hash.clone()),
                eval.sort_key.clone(),
            );
        }
        if let Some(message_id) = &eval.message_id {
            inner.message_ids.insert(message_id.clone());
        }
        inner.evals.insert(key, eval.clone());
        Ok(SaveOutcome::Saved)
    }

    async fn find_latest_evaluation(
        &self,
        process_id: &str,
        to: Option<&SortKey>,
    ) -> CuResult<Option<Evaluation>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .evals
            .range(
                (process_id.to_string(), SortKey::min())..,
            )
            .take_while(|((pid, _), _)| pid == process_id)
            .filter(|((_, key), _)| to.map_or(true, |bound| key <= bound))
            .map(|(_, eval)| eval.clone())
            .last())
    }

    async fn find_evaluations(
        &self,
        process_id: &str,
        range: &EvalRange,
    ) -> CuResult<Vec<Evaluation>> {
        let inner = self.inner.lock().expect("store lock");
        let results = inner
            .evals
            .range(
                (process_id.to_string(), SortKey::min())..,
            )
            .take_while(|((pid, _), _)| pid == process_id)
            .filter(|((_, key), _)| range.from.as_ref().map_or(true, |from| key >= from))
            .filter(|((_, key), _)| range.to.as_ref().map_or(true, |to| key <= to))
            .map(|(_, eval)| eval.clone());
        Ok(match range.limit {
            Some(limit) => results.take(limit).collect(),
            None => results.collect(),
        })
    }

    async fn find_message_id(&self, message_id: &str) -> CuResult<bool> {
        Ok(self
            .inner
            .lock()
            .expect("store lock")
            .message_ids
            .contains(message_id))
    }

    async fn find_by_deep_hash(
        &self,
        process_id: &str,
        deep_hash: &str,
    ) -> CuResult<Option<Evaluation>> {
        let inner = self.inner.lock().expect("store lock");
        let key = (process_id.to_string(), deep_hash.to_string());
        Ok(inner.deep_hashes.get(&key).and_then(|sort_key| {
            inner
                .evals
                .get(&(process_id.to_string(), sort_key.clone()))
                .cloned()
        }))
    }

    async fn save_process(&self, process: &Process) -> CuResult<()> {
        self.inner
            .lock()
            .expect("store lock")
            .processes
            .entry(process.id.clone())
            .or_insert_with(|| process.clone());
        Ok(())
    }

    async fn find_process(&self, process_id: &str) -> CuResult<Option<Process>> {
        Ok(self
            .inner
            .lock()
            .expect("store lock")
            .processes
            .get(process_id)
            .cloned())
    }
}

// ---------------------------------------------------------------------
// Filesystem backend
// ---------------------------------------------------------------------

/// One JSON document per key under `<root>/docs`, written create-new so
/// a duplicate insert surfaces as `AlreadyExists` instead of clobbering
/// the stored record.
#[derive(Debug, Clone)]
pub struct FsEvalStore {
    docs_dir: PathBuf,
}

impl FsEvalStore {
    pub fn open(root: impl AsRef<Path>) -> CuResult<Self> {
        let docs_dir = root.as_ref().join("docs");
        fs::create_dir_all(&docs_dir).map_err(|e| io_error(&docs_dir, e))?;
        Ok(Self { docs_dir })
    }

    fn doc_path(&self, key: &str) -> PathBuf {
        self.docs_dir.join(key)
    }

    fn write_once(path: &Path, bytes: &[u8]) -> CuResult<SaveOutcome> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(bytes).map_err(|e| io_error(path, e))?;
                file.sync_all().map_err(|e| io_error(path, e))?;
                Ok(SaveOutcome::Saved)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(SaveOutcome::AlreadyExists),
            Err(err) => Err(io_error(path, err)),
        }
    }

    fn read_doc<T: serde::de::DeserializeOwned>(&self, key: &str) -> CuResult<Option<T>> {
        let path = self.doc_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&path, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CuError::schema("persisted document", format!("{key}: {e}")))
    }

    /// Sort keys of every evaluation doc for a process, ascending.
    /// Canonical keys compare as strings, so no numeric parsing is
    /// needed here.
    fn eval_keys(&self, process_id: &str) -> CuResult<Vec<SortKey>> {
        let prefix = format!("{}:", process_doc_key(process_id));
        let mut keys = Vec::new();
        let entries = fs::read_dir(&self.docs_dir).map_err(|e| io_error(&self.docs_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.docs_dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(raw_key) = name.strip_prefix(&prefix) {
                keys.push(SortKey::parse(raw_key).map_err(CuError::from)?);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl EvaluationStore for FsEvalStore {
    async fn save_evaluation(&self, eval: &Evaluation) -> CuResult<SaveOutcome> {
        let key = eval_doc_key(&eval.process_id, &eval.sort_key);
        let bytes = serde_json::to_vec(eval)
            .map_err(|e| CuError::schema("evaluation document", e))?;
        let outcome = Self::write_once(&self.doc_path(&key), &bytes)?;
        if outcome == SaveOutcome::AlreadyExists {
            return Ok(outcome);
        }

        if let Some(deep_hash) = &eval.deep_hash {
            let marker = format!("deephash-{}:{deep_hash}", eval.process_id);
            Self::write_once(&self.doc_path(&marker), eval.sort_key.as_str().as_bytes())?;
        }
        if let Some(message_id) = &eval.message_id {
            let marker = format!("msgid-{message_id}");
            Self::write_once(&self.doc_path(&marker), b"1")?;
        }
        Ok(outcome)
    }

    async fn find_latest_evaluation(
        &self,
        process_id: &str,
        to: Option<&SortKey>,
    ) -> CuResult<Option<Evaluation>> {
        let latest = self
            .eval_keys(process_id)?
            .into_iter()
            .filter(|key| to.map_or(true, |bound| key <= bound))
            .last();
        let Some(key) = latest else { return Ok(None) };
        self.read_doc(&eval_doc_key(process_id, &key))
    }

    async fn find_evaluations(
        &self,
        process_id: &str,
        range: &EvalRange,
    ) -> CuResult<Vec<Evaluation>> {
        let keys = self
            .eval_keys(process_id)?
            .into_iter()
            .filter(|key| range.from.as_ref().map_or(true, |from| key >= from))
            .filter(|key| range.to.as_ref().map_or(true, |to| key <= to));
        let keys: Vec<_> = match range.limit {
            Some(limit) => keys.take(limit).collect(),
            None => keys.collect(),
        };
        let mut evals = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(eval) = self.read_doc(&eval_doc_key(process_id, &key))? {
                evals.push(eval);
            }
        }
        Ok(evals)
    }

    async fn find_message_id(&self, message_id: &str) -> CuResult<bool> {
        Ok(self.doc_path(&format!("msgid-{message_id}")).exists())
    }

    async fn find_by_deep_hash(
        &self,
        process_id: &str,
        deep_hash: &str,
    ) -> CuResult<Option<Evaluation>> {
        let marker = format!("deephash-{process_id}:{deep_hash}");
        let path = self.doc_path(&marker);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&path, err)),
        };
        let sort_key = SortKey::parse(&raw).map_err(CuError::from)?;
        self.read_doc(&eval_doc_key(process_id, &sort_key))
    }

    async fn save_process(&self, process: &Process) -> CuResult<()> {
        let bytes = serde_json::to_vec(process)
            .map_err(|e| CuError::schema("process document", e))?;
        // Processes are immutable; a duplicate save is a no-op.
        Self::write_once(&self.doc_path(&process_doc_key(&process.id)), &bytes)?;
        Ok(())
    }

    async fn find_process(&self, process_id: &str) -> CuResult<Option<Process>> {
        self.read_doc(&process_doc_key(process_id))
    }
}
