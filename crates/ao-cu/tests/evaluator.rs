//! End-to-end evaluator pipeline tests over in-memory fakes: SU feed,
//! gateway, module, store, and cache.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ao_core::checkpoint::ENCODING_GZIP;
use ao_core::{
    BlockInfo, CheckpointSpec, CoreError, DataItemSigner, Process, SignedDataItem, SortKey, Tag,
    UnsignedDataItem,
};
use ao_cu::{
    gunzip, gzip, CheckpointQuery, CheckpointStore, CuResult, EvalRange, EvaluationStore,
    Evaluator, Gateway, GatewayTransaction, Hydrator, MemEvalStore, MessageSource,
    ProcessMemoryCache, ProcessModule, SequencerClient, WasmOutput,
};
use ao_cu::su::{SuBlock, SuInteraction, SuInteractionEdge, SuPage, SuPaging};
use async_trait::async_trait;
use base64::prelude::*;
use serde_json::json;
use sha2::{Digest, Sha256};

const LOAD_CUTOFF: u64 = 1_000_000;

fn init_logs() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn proc_id() -> String {
    BASE64_URL_SAFE_NO_PAD.encode([9u8; 32])
}

fn process() -> Process {
    Process {
        id: proc_id(),
        owner: "proc-owner".into(),
        signature: None,
        data: None,
        anchor: None,
        tags: vec![Tag::new("Module", "module-1")],
        block: BlockInfo {
            height: 1,
            timestamp: 1,
        },
    }
}

fn interaction(height: u64, timestamp: i64) -> SuInteraction {
    SuInteraction {
        sort_key: format!("{height},{timestamp},hash{height}"),
        id: Some(format!("msg-{height}")),
        owner: Some("owner-1".into()),
        signature: None,
        target: None,
        anchor: None,
        data: Some(format!("data-{height}")),
        tags: vec![Tag::new("Action", "Eval")],
        block: SuBlock {
            id: None,
            height,
            timestamp,
        },
    }
}

fn forwarded(height: u64, timestamp: i64, payload: &str) -> SuInteraction {
    let mut raw = interaction(height, timestamp);
    raw.data = Some(payload.to_string());
    raw.tags.push(Tag::new("Forwarded-By", "mu-wallet"));
    raw.tags.push(Tag::new("Forwarded-For", "proc-origin"));
    raw
}

/// Serves every seeded interaction as one descending page.
struct FakeSu {
    interactions: Mutex<Vec<SuInteraction>>,
}

impl FakeSu {
    fn new(mut interactions: Vec<SuInteraction>) -> Self {
        interactions.sort_by(|a, b| b.sort_key.cmp(&a.sort_key));
        Self {
            interactions: Mutex::new(interactions),
        }
    }

    fn push(&self, interaction: SuInteraction) {
        let mut interactions = self.interactions.lock().unwrap();
        interactions.push(interaction);
        interactions.sort_by(|a, b| b.sort_key.cmp(&a.sort_key));
    }
}

#[async_trait]
impl SequencerClient for FakeSu {
    async fn interactions(
        &self,
        _process_id: &str,
        from: &SortKey,
        to: Option<&SortKey>,
        page: u64,
    ) -> CuResult<SuPage> {
        // Range semantics as the source sends them: `from` inclusive,
        // `to` (already incremented for height-only bounds) exclusive.
        let interactions = self.interactions.lock().unwrap();
        let in_range: Vec<SuInteraction> = interactions
            .iter()
            .filter(|i| {
                let key = SortKey::parse(&i.sort_key).unwrap();
                key >= *from && to.map_or(true, |to| key < *to)
            })
            .cloned()
            .collect();
        let edges = if page == 1 {
            in_range
                .iter()
                .cloned()
                .map(|interaction| SuInteractionEdge { interaction })
                .collect()
        } else {
            vec![]
        };
        Ok(SuPage {
            paging: SuPaging {
                total: in_range.len() as u64,
                limit: in_range.len().max(1) as u64,
            },
            interactions: edges,
        })
    }
}

#[derive(Default)]
struct FakeGateway {
    checkpoints: Mutex<Vec<(CheckpointSpec, Vec<u8>)>>,
    uploads: Mutex<Vec<SignedDataItem>>,
}

impl FakeGateway {
    fn seed_checkpoint(&self, spec: CheckpointSpec, memory_gz: Vec<u8>) {
        self.checkpoints.lock().unwrap().push((spec, memory_gz));
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn query_checkpoints(
        &self,
        query: &CheckpointQuery,
    ) -> CuResult<Vec<GatewayTransaction>> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, (spec, _))| {
                spec.process_id == query.process_id
                    && query.nonce.as_ref().map_or(true, |n| *n == spec.nonce)
                    && query.timestamp.map_or(true, |t| t == spec.timestamp)
            })
            .map(|(at, (spec, _))| GatewayTransaction {
                id: format!("tx-{at}"),
                tags: spec.to_tags(),
                block: None,
                owner: None,
                signature: None,
                anchor: None,
            })
            .collect())
    }

    async fn transaction(&self, tx_id: &str) -> CuResult<GatewayTransaction> {
        Ok(GatewayTransaction {
            id: tx_id.to_string(),
            tags: vec![],
            block: None,
            owner: None,
            signature: None,
            anchor: None,
        })
    }

    async fn download(&self, tx_id: &str) -> CuResult<Vec<u8>> {
        let at: usize = tx_id.trim_start_matches("tx-").parse().unwrap();
        Ok(self.checkpoints.lock().unwrap()[at].1.clone())
    }

    async fn upload(&self, item: &SignedDataItem) -> CuResult<String> {
        self.uploads.lock().unwrap().push(item.clone());
        Ok("uploaded-tx".into())
    }
}

struct FakeSigner;

#[async_trait]
impl DataItemSigner for FakeSigner {
    fn address(&self) -> &str {
        "cu-wallet"
    }

    async fn sign(&self, item: UnsignedDataItem) -> Result<SignedDataItem, CoreError> {
        Ok(SignedDataItem {
            id: "signed".into(),
            bytes: item.data,
        })
    }
}

/// Deterministic fold: appends `|<message id>` to memory; errors on an
/// `Err` action tag; emits one outbound message per `Emit` action tag.
struct RecordingModule;

#[async_trait]
impl ProcessModule for RecordingModule {
    async fn eval(
        &self,
        memory: Option<Vec<u8>>,
        message: &ao_core::Message,
        _env: &ao_core::AoGlobal,
    ) -> CuResult<WasmOutput> {
        let mut next = memory.unwrap_or_default();
        next.extend_from_slice(b"|");
        next.extend_from_slice(
            message
                .message
                .id
                .as_deref()
                .unwrap_or("cron")
                .as_bytes(),
        );
        let action = ao_core::tags::tag_value(&message.message.tags, "Action");
        let (messages, error) = match action {
            Some("Emit") => (
                vec![ao_core::OutboundMessage {
                    target: "proc-next".into(),
                    anchor: None,
                    tags: vec![Tag::new("Action", "Cranked")],
                    data: None,
                }],
                None,
            ),
            Some("Err") => (vec![], Some(json!("deterministic failure"))),
            _ => (vec![], None),
        };
        Ok(WasmOutput {
            memory: Some(next),
            messages,
            spawns: vec![],
            output: json!({ "folded": message.message.id }),
            error,
        })
    }
}

struct Universe {
    store: Arc<MemEvalStore>,
    cache: Arc<ProcessMemoryCache>,
    gateway: Arc<FakeGateway>,
    su: Arc<FakeSu>,
    evaluator: Evaluator,
}

fn universe(interactions: Vec<SuInteraction>, ttl: Duration, checkpoint_interval: u64) -> Universe {
    let store = Arc::new(MemEvalStore::new());
    let cache = Arc::new(ProcessMemoryCache::new(1 << 24, ttl));
    let gateway = Arc::new(FakeGateway::default());
    let su = Arc::new(FakeSu::new(interactions));
    let checkpoints = Arc::new(CheckpointStore::new(gateway.clone(), Arc::new(FakeSigner)));
    let evaluator = Evaluator::new(
        store.clone(),
        cache.clone(),
        checkpoints,
        MessageSource::new(su.clone()),
        Hydrator::new(gateway.clone(), LOAD_CUTOFF),
        Arc::new(RecordingModule),
        checkpoint_interval,
    );
    Universe {
        store,
        cache,
        gateway,
        su,
        evaluator,
    }
}

fn fresh_ttl() -> Duration {
    Duration::from_secs(3600)
}

#[tokio::test]
async fn cold_start_folds_every_message_in_order() {
    init_logs();
    let universe = universe(
        vec![interaction(1, 10), interaction(2, 20), interaction(3, 30)],
        fresh_ttl(),
        0,
    );
    let result = universe
        .evaluator
        .evaluate(&process(), None)
        .await
        .unwrap();

    assert_eq!(result.memory.as_deref(), Some(b"|msg-1|msg-2|msg-3".as_ref()));
    assert_eq!(result.last.as_ref().unwrap().sort_key.height(), 3);

    let evals = universe
        .store
        .find_evaluations(&proc_id(), &EvalRange::default())
        .await
        .unwrap();
    let heights: Vec<_> = evals.iter().map(|e| e.sort_key.height()).collect();
    assert_eq!(heights, vec![1, 2, 3]);

    // The cache now serves the latest memory.
    let cached = universe.cache.get(&proc_id()).unwrap().unwrap();
    assert_eq!(cached.memory, b"|msg-1|msg-2|msg-3");
    assert_eq!(cached.evaluation.sort_key.height(), 3);
}

#[tokio::test]
async fn evaluation_is_deterministic() {
    let seed = || {
        vec![
            interaction(1, 10),
            {
                let mut i = interaction(2, 20);
                i.tags = vec![Tag::new("Action", "Emit")];
                i
            },
            interaction(3, 30),
        ]
    };
    let a = universe(seed(), fresh_ttl(), 0)
        .evaluator
        .evaluate(&process(), None)
        .await
        .unwrap();
    let b = universe(seed(), fresh_ttl(), 0)
        .evaluator
        .evaluate(&process(), None)
        .await
        .unwrap();

    assert_eq!(a.memory, b.memory);
    assert_eq!(a.messages, b.messages);
    assert_eq!(a.spawns, b.spawns);
}

#[tokio::test]
async fn second_run_resumes_from_cache_without_refolding() {
    let universe = universe(
        vec![interaction(1, 10), interaction(2, 20)],
        fresh_ttl(),
        0,
    );
    let process = process();
    universe.evaluator.evaluate(&process, None).await.unwrap();

    // New message arrives.
    universe.su.push(interaction(3, 30));

    let result = universe.evaluator.evaluate(&process, None).await.unwrap();
    assert_eq!(result.memory.as_deref(), Some(b"|msg-1|msg-2|msg-3".as_ref()));

    let evals = universe
        .store
        .find_evaluations(&proc_id(), &EvalRange::default())
        .await
        .unwrap();
    assert_eq!(evals.len(), 3);
}

#[tokio::test]
async fn forwarded_duplicates_fold_once() {
    // Same forwarded payload delivered twice under different sort keys:
    // identical deep hash, exactly one persisted evaluation.
    let universe = universe(
        vec![forwarded(1, 10, "the payload"), forwarded(2, 20, "the payload")],
        fresh_ttl(),
        0,
    );
    let result = universe
        .evaluator
        .evaluate(&process(), None)
        .await
        .unwrap();

    assert_eq!(result.memory.as_deref(), Some(b"|msg-1".as_ref()));
    let evals = universe
        .store
        .find_evaluations(&proc_id(), &EvalRange::default())
        .await
        .unwrap();
    assert_eq!(evals.len(), 1);
    assert!(evals[0].deep_hash.is_some());
}

#[tokio::test]
async fn deterministic_error_records_and_continues() {
    let mut failing = interaction(2, 20);
    failing.tags = vec![Tag::new("Action", "Err")];
    let universe = universe(
        vec![interaction(1, 10), failing, interaction(3, 30)],
        fresh_ttl(),
        0,
    );
    let result = universe
        .evaluator
        .evaluate(&process(), None)
        .await
        .unwrap();

    // The chain kept folding past the error.
    assert_eq!(result.memory.as_deref(), Some(b"|msg-1|msg-2|msg-3".as_ref()));

    let evals = universe
        .store
        .find_evaluations(&proc_id(), &EvalRange::default())
        .await
        .unwrap();
    assert_eq!(evals.len(), 3);
    assert!(evals[0].output.error.is_none());
    assert_eq!(evals[1].output.error, Some(json!("deterministic failure")));
}

#[tokio::test]
async fn stale_cache_defers_to_later_checkpoint() {
    // Scenario: cached evaluation at height 1, checkpoint at height 2,
    // request up to height 3. The checkpoint wins because it is later
    // than the (stale) cache and not later than the request.
    let universe = universe(
        vec![interaction(1, 10), interaction(2, 20), interaction(3, 30)],
        Duration::ZERO,
        0,
    );
    let process = process();

    let k1 = ao_core::Evaluation {
        process_id: proc_id(),
        sort_key: SortKey::parse("1,10,hash1").unwrap(),
        message_id: Some("msg-1".into()),
        timestamp: 10,
        is_cron: false,
        cron: None,
        evaluated_at: 10,
        deep_hash: None,
        output: Default::default(),
    };
    universe.cache.set(&proc_id(), k1, b"|msg-1").unwrap();

    let ckpt_memory = b"|ckpt-through-2".to_vec();
    universe.gateway.seed_checkpoint(
        CheckpointSpec {
            process_id: proc_id(),
            module: "module-1".into(),
            epoch: 0,
            nonce: SortKey::parse("2,20,hash2").unwrap().as_str().to_string(),
            timestamp: 20,
            block_height: 2,
            sha256: BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(&ckpt_memory)),
            cron: None,
            encoding: Some(ENCODING_GZIP.into()),
        },
        gzip(&ckpt_memory).unwrap(),
    );

    // A height-only bound: inclusive of block 3 per the increment rule.
    let to = SortKey::parse("3").unwrap();
    let result = universe
        .evaluator
        .evaluate(&process, Some(&to))
        .await
        .unwrap();

    // Started from the checkpoint memory, folded only message 3.
    assert_eq!(
        result.memory.as_deref(),
        Some(b"|ckpt-through-2|msg-3".as_ref())
    );
}

#[tokio::test]
async fn height_bound_rejects_checkpoints_beyond_it() {
    // A checkpoint exists at block 5, but the caller only asked for the
    // state through block 3: discovery must not resume from it, or the
    // messages between the bound and the checkpoint would be skipped.
    let universe = universe(
        vec![
            interaction(1, 10),
            interaction(2, 20),
            interaction(3, 30),
            interaction(5, 50),
        ],
        fresh_ttl(),
        0,
    );
    let ckpt_memory = b"|ckpt-through-5".to_vec();
    universe.gateway.seed_checkpoint(
        CheckpointSpec {
            process_id: proc_id(),
            module: "module-1".into(),
            epoch: 0,
            nonce: SortKey::parse("5,50,hash5").unwrap().as_str().to_string(),
            timestamp: 50,
            block_height: 5,
            sha256: BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(&ckpt_memory)),
            cron: None,
            encoding: Some(ENCODING_GZIP.into()),
        },
        gzip(&ckpt_memory).unwrap(),
    );

    let to = SortKey::parse("3").unwrap();
    let result = universe
        .evaluator
        .evaluate(&process(), Some(&to))
        .await
        .unwrap();

    // Cold start, folding exactly the messages up to the bound.
    assert_eq!(result.memory.as_deref(), Some(b"|msg-1|msg-2|msg-3".as_ref()));
    assert_eq!(result.last.as_ref().unwrap().sort_key.height(), 3);
}

#[tokio::test]
async fn eviction_publishes_a_checkpoint_for_the_evicted_memory() {
    let store: Arc<MemEvalStore> = Arc::new(MemEvalStore::new());
    let gateway = Arc::new(FakeGateway::default());
    let checkpoints = Arc::new(CheckpointStore::new(gateway.clone(), Arc::new(FakeSigner)));
    let eval_store: Arc<dyn EvaluationStore> = store.clone();
    store.save_process(&process()).await.unwrap();

    // A one-byte budget: the newest entry is always protected, so each
    // insert evicts whatever else is resident.
    let cache = ProcessMemoryCache::new(1, fresh_ttl()).with_eviction_hook(
        ao_cu::checkpoint_eviction_hook(checkpoints, eval_store),
    );

    let eval_at = |height: u64, timestamp: i64| ao_core::Evaluation {
        process_id: proc_id(),
        sort_key: SortKey::parse(&format!("{height},{timestamp},h{height}")).unwrap(),
        message_id: Some(format!("msg-{height}")),
        timestamp,
        is_cron: false,
        cron: None,
        evaluated_at: timestamp,
        deep_hash: None,
        output: Default::default(),
    };
    cache.set(&proc_id(), eval_at(1, 10), &[1u8; 64]).unwrap();
    cache.set("other-process", eval_at(2, 20), &[2u8; 64]).unwrap();

    // The hook publishes on a spawned task; wait for the upload.
    let mut uploaded = 0;
    for _ in 0..100 {
        uploaded = gateway.uploads.lock().unwrap().len();
        if uploaded > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(uploaded, 1);
    let body = gateway.uploads.lock().unwrap()[0].bytes.clone();
    assert_eq!(gunzip(&body).unwrap(), vec![1u8; 64]);
}

#[tokio::test]
async fn periodic_checkpoints_publish_during_the_fold() {
    let universe = universe(
        vec![interaction(1, 10), interaction(2, 20)],
        fresh_ttl(),
        1,
    );
    universe
        .evaluator
        .evaluate(&process(), None)
        .await
        .unwrap();

    let uploads = universe.gateway.uploads.lock().unwrap();
    assert_eq!(uploads.len(), 2);
    // Uploaded bodies are the gzipped memory images.
    assert_eq!(gunzip(&uploads[0].bytes).unwrap(), b"|msg-1");
    assert_eq!(gunzip(&uploads[1].bytes).unwrap(), b"|msg-1|msg-2");
}
