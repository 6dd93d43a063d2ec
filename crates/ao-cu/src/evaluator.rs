//! The evaluator: fold ordered, hydrated messages into process memory.
//!
//! Evaluations for the same process serialize behind a keyed async
//! lock; different processes evaluate in parallel. The fold pulls one
//! hydrated message at a time, so backpressure reaches all the way to
//! the SU paging.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ao_core::{Evaluation, EvalPosition, Message, Ordinate, OutboundMessage, Process, SortKey};
use futures::{pin_mut, TryStreamExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, EvictionHook, ProcessMemoryCache};
use crate::checkpoint::{CheckpointStore, DiscoveryTarget, PublishMemory};
use crate::compress::gzip;
use crate::error::CuResult;
use crate::hydrate::Hydrator;
use crate::source::MessageSource;
use crate::store::EvaluationStore;
use crate::wasm::ProcessModule;

/// The final state of an evaluation run plus the outbound work it
/// produced.
#[derive(Debug, Default)]
pub struct EvalResult {
    pub memory: Option<Vec<u8>>,
    /// Latest evaluation in the chain after this run.
    pub last: Option<Evaluation>,
    pub messages: Vec<OutboundMessage>,
    pub spawns: Vec<OutboundMessage>,
    pub output: serde_json::Value,
    pub error: Option<serde_json::Value>,
}

struct StartPoint {
    sort_key: Option<SortKey>,
    memory: Option<Vec<u8>>,
    evaluation: Option<Evaluation>,
}

impl StartPoint {
    fn cold() -> Self {
        StartPoint {
            sort_key: None,
            memory: None,
            evaluation: None,
        }
    }

    fn position(&self) -> EvalPosition {
        self.evaluation
            .as_ref()
            .map(Evaluation::position)
            .unwrap_or_else(|| EvalPosition::new(i64::MIN, Ordinate::min(), None))
    }
}

pub struct Evaluator {
    store: Arc<dyn EvaluationStore>,
    cache: Arc<ProcessMemoryCache>,
    checkpoints: Arc<CheckpointStore>,
    source: MessageSource,
    hydrator: Hydrator,
    module: Arc<dyn ProcessModule>,
    /// Evaluations between periodic checkpoint publishes; 0 disables.
    checkpoint_interval: u64,
    locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Evaluator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn EvaluationStore>,
        cache: Arc<ProcessMemoryCache>,
        checkpoints: Arc<CheckpointStore>,
        source: MessageSource,
        hydrator: Hydrator,
        module: Arc<dyn ProcessModule>,
        checkpoint_interval: u64,
    ) -> Self {
        Self {
            store,
            cache,
            checkpoints,
            source,
            hydrator,
            module,
            checkpoint_interval,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate `process` up to `to` (inclusive of its terminal block
    /// when `to` is height-only; the head of the feed when absent).
    pub async fn evaluate(&self, process: &Process, to: Option<&SortKey>) -> CuResult<EvalResult> {
        let lock = self.process_lock(&process.id);
        let _guard = lock.lock().await;

        self.store.save_process(process).await?;

        let start = self.locate_start(process, to).await?;
        let from = start.sort_key.clone().unwrap_or_else(SortKey::min);
        info!(
            process_id = %process.id,
            from = %from,
            cold = start.memory.is_none(),
            "starting evaluation"
        );

        let mut memory = start.memory;
        let mut result = EvalResult {
            last: start.evaluation,
            ..EvalResult::default()
        };
        let mut folded: u64 = 0;

        let stream = self
            .hydrator
            .hydrate(self.source.stream(process, &from, to));
        pin_mut!(stream);

        while let Some(message) = stream.try_next().await? {
            if let Some(start_key) = &start.sort_key {
                if message.sort_key <= *start_key {
                    continue;
                }
            }
            if self.already_evaluated(&message).await? {
                continue;
            }

            let output = self
                .module
                .eval(memory.take(), &message, &message.ao_global)
                .await?;
            let (next_memory, record) = output.into_record();
            // A deterministic error is part of the record; the chain
            // keeps folding with whatever memory came back.
            if record.error.is_some() {
                debug!(
                    process_id = %process.id,
                    sort_key = %message.sort_key,
                    "process reported an error for this message"
                );
            }
            memory = next_memory;

            let evaluation = Evaluation {
                process_id: process.id.clone(),
                sort_key: message.sort_key.clone(),
                message_id: message.message.id.clone(),
                timestamp: message.ao_global.block.timestamp,
                is_cron: message.is_cron,
                cron: message.cron_interval().map(str::to_owned),
                evaluated_at: now_millis(),
                deep_hash: message.deep_hash.clone(),
                output: record.clone(),
            };
            self.store.save_evaluation(&evaluation).await?;

            if let Some(memory) = &memory {
                self.cache.set(&process.id, evaluation.clone(), memory)?;
            }

            result.messages.extend(record.messages);
            result.spawns.extend(record.spawns);
            result.output = record.output;
            result.error = record.error;
            result.last = Some(evaluation);
            folded += 1;

            if self.checkpoint_interval > 0 && folded % self.checkpoint_interval == 0 {
                self.maybe_checkpoint(process, result.last.as_ref(), memory.as_deref())
                    .await;
            }
        }

        info!(process_id = %process.id, folded, "evaluation finished");
        result.memory = memory;
        Ok(result)
    }

    /// Locate the starting memory: the cache when fresh, otherwise the
    /// best of cache and discovered checkpoint, otherwise cold start. A
    /// checkpoint wins only when it is strictly later than the cached
    /// evaluation (and, by discovery's contract, admitted by the
    /// request bound).
    async fn locate_start(&self, process: &Process, to: Option<&SortKey>) -> CuResult<StartPoint> {
        let cached = self.cache.get(&process.id)?;
        let consult_checkpoints = cached.as_ref().map_or(true, |c| c.stale);

        let mut start = match cached {
            Some(cached) => StartPoint {
                sort_key: Some(cached.evaluation.sort_key.clone()),
                memory: Some(cached.memory),
                evaluation: Some(cached.evaluation),
            },
            None => StartPoint::cold(),
        };
        if !consult_checkpoints {
            return Ok(start);
        }

        let target = discovery_target(to);
        let Some(found) = self.checkpoints.discover(&process.id, &target).await? else {
            return Ok(start);
        };
        let position = found.spec.position();
        if start.memory.is_some() && !position.is_later_than(&start.position()) {
            return Ok(start);
        }

        // The Nonce tag carries the checkpointed evaluation's sort key;
        // a foreign value means we cannot place the checkpoint in the
        // chain, so it is unusable.
        match SortKey::parse(found.spec.nonce.as_str()) {
            Ok(sort_key) => {
                debug!(
                    process_id = %process.id,
                    tx_id = %found.tx_id,
                    sort_key = %sort_key,
                    "starting from discovered checkpoint"
                );
                start = StartPoint {
                    sort_key: Some(sort_key.clone()),
                    memory: Some(found.memory),
                    evaluation: None,
                };
            }
            Err(err) => {
                warn!(
                    process_id = %process.id,
                    tx_id = %found.tx_id,
                    error = %err,
                    "checkpoint nonce is not a sort key, ignoring checkpoint"
                );
            }
        }
        Ok(start)
    }

    /// Replay and dedup guards: an exact `(processId, sortKey)` record
    /// makes the step idempotent; a `(processId, deepHash)` record means
    /// a forwarded message was already folded under another id.
    async fn already_evaluated(&self, message: &Message) -> CuResult<bool> {
        let process_id = &message.ao_global.process;
        if let Some(deep_hash) = &message.deep_hash {
            if let Some(prior) = self.store.find_by_deep_hash(process_id, deep_hash).await? {
                debug!(
                    process_id,
                    sort_key = %message.sort_key,
                    prior = %prior.sort_key,
                    "skipping duplicate forwarded message"
                );
                return Ok(true);
            }
        }
        let range = crate::store::EvalRange {
            from: Some(message.sort_key.clone()),
            to: Some(message.sort_key.clone()),
            limit: Some(1),
        };
        Ok(!self
            .store
            .find_evaluations(process_id, &range)
            .await?
            .is_empty())
    }

    /// Periodic checkpoint publish. Failures are logged and never fail
    /// the evaluation.
    async fn maybe_checkpoint(
        &self,
        process: &Process,
        evaluation: Option<&Evaluation>,
        memory: Option<&[u8]>,
    ) {
        let (Some(evaluation), Some(memory)) = (evaluation, memory) else {
            return;
        };
        let Some(module) = process.module_id() else {
            warn!(process_id = %process.id, "process has no Module tag, skipping checkpoint");
            return;
        };
        let memory_gz = match gzip(memory) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(process_id = %process.id, error = %err, "checkpoint compression failed");
                return;
            }
        };
        let args = publish_memory(&process.id, module, evaluation, memory_gz);
        if let Err(err) = self.checkpoints.publish(&args).await {
            warn!(process_id = %process.id, error = %err, "periodic checkpoint publish failed");
        }
    }

    fn process_lock(&self, process_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("lock map");
        locks
            .entry(process_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// Cache eviction hook that publishes a checkpoint for the evicted
/// memory. Publish failures are logged and dropped; eviction must never
/// fail the evaluator that triggered it.
pub fn checkpoint_eviction_hook(
    checkpoints: Arc<CheckpointStore>,
    store: Arc<dyn EvaluationStore>,
) -> EvictionHook {
    Box::new(move |entry: CacheEntry| {
        let checkpoints = checkpoints.clone();
        let store = store.clone();
        tokio::spawn(async move {
            let process_id = entry.evaluation.process_id.clone();
            let module = match store.find_process(&process_id).await {
                Ok(Some(process)) => process.module_id().map(str::to_owned),
                Ok(None) => None,
                Err(err) => {
                    warn!(process_id, error = %err, "eviction checkpoint: process lookup failed");
                    return;
                }
            };
            let Some(module) = module else {
                warn!(process_id, "eviction checkpoint: no module recorded, skipping");
                return;
            };
            let args = publish_memory(&process_id, &module, &entry.evaluation, entry.memory_gz);
            if let Err(err) = checkpoints.publish(&args).await {
                warn!(process_id, error = %err, "eviction checkpoint publish failed");
            }
        });
    })
}

fn publish_memory(
    process_id: &str,
    module: &str,
    evaluation: &Evaluation,
    memory_gz: Vec<u8>,
) -> PublishMemory {
    PublishMemory {
        process_id: process_id.to_string(),
        module: module.to_string(),
        epoch: 0,
        nonce: evaluation.sort_key.as_str().to_string(),
        timestamp: evaluation.timestamp,
        block_height: evaluation.sort_key.height(),
        cron: evaluation.cron.clone(),
        memory_gz,
    }
}

/// The discovery bound for a request. A height-only `to` has no
/// timestamp to bound a position with, so it bounds on the block height
/// itself; falling back to an unbounded target there would let
/// discovery resume past the caller's bound and silently skip the
/// messages in between.
fn discovery_target(to: Option<&SortKey>) -> DiscoveryTarget {
    match to {
        None => DiscoveryTarget::Unbounded,
        Some(to) => match to.timestamp() {
            Some(timestamp) => DiscoveryTarget::Position(EvalPosition::new(
                timestamp,
                Ordinate::from_sort_key(to),
                None,
            )),
            None => DiscoveryTarget::BlockHeight(to.height()),
        },
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
