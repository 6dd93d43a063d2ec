//! Publish and discover process memory checkpoints on the gateway.
//!
//! Publish is idempotent: an existing checkpoint for the same
//! `(owner, process, nonce, timestamp, cron)` tuple makes the call a
//! no-op. Discovery degrades: any transient or not-found failure reports
//! "no checkpoint" so the evaluator falls back to a cold start.

use std::sync::Arc;

use ao_core::checkpoint::ENCODING_GZIP;
use ao_core::{CheckpointSpec, DataItemSigner, EvalPosition, UnsignedDataItem};
use base64::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::compress::gunzip;
use crate::error::{CuError, CuResult};
use crate::gateway::{CheckpointQuery, Gateway};

/// Bounded fan-out when reducing recent checkpoints to a starting point.
const DISCOVERY_FANOUT: usize = 50;

/// What to set as the data item anchor on published checkpoints.
/// `FromEvaluation` is reserved until the anchor question settles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CheckpointAnchor {
    #[default]
    Empty,
}

/// The bound discovery reduces under: the latest admitted checkpoint
/// wins. A height-only request carries no timestamp, so it bounds on
/// the block height directly rather than widening to "accept anything".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryTarget {
    /// Unbounded request; any checkpoint of the process is admissible.
    Unbounded,
    /// Admit checkpoints not later than this position.
    Position(EvalPosition),
    /// Admit checkpoints at or below this block height (inclusive of
    /// the terminal block, matching the height-only bound rule).
    BlockHeight(u64),
}

impl DiscoveryTarget {
    pub fn admits(&self, spec: &CheckpointSpec) -> bool {
        match self {
            DiscoveryTarget::Unbounded => true,
            DiscoveryTarget::Position(position) => !spec.position().is_later_than(position),
            DiscoveryTarget::BlockHeight(height) => spec.block_height <= *height,
        }
    }
}

/// A checkpoint to publish: tag material plus the gzipped memory.
#[derive(Debug, Clone)]
pub struct PublishMemory {
    pub process_id: String,
    pub module: String,
    pub epoch: u64,
    pub nonce: String,
    pub timestamp: i64,
    pub block_height: u64,
    pub cron: Option<String>,
    pub memory_gz: Vec<u8>,
}

/// A discovered checkpoint, memory already decoded.
#[derive(Debug, Clone)]
pub struct FoundCheckpoint {
    pub spec: CheckpointSpec,
    pub tx_id: String,
    pub memory: Vec<u8>,
}

pub struct CheckpointStore {
    gateway: Arc<dyn Gateway>,
    signer: Arc<dyn DataItemSigner>,
    anchor: CheckpointAnchor,
}

impl CheckpointStore {
    pub fn new(gateway: Arc<dyn Gateway>, signer: Arc<dyn DataItemSigner>) -> Self {
        Self {
            gateway,
            signer,
            anchor: CheckpointAnchor::default(),
        }
    }

    pub fn with_anchor(mut self, anchor: CheckpointAnchor) -> Self {
        self.anchor = anchor;
        self
    }

    /// Publish a checkpoint unless one already exists for this exact
    /// position. Returns the transaction id of a fresh publication.
    pub async fn publish(&self, args: &PublishMemory) -> CuResult<Option<String>> {
        let probe = CheckpointQuery {
            process_id: args.process_id.clone(),
            owner: Some(self.signer.address().to_string()),
            nonce: Some(args.nonce.clone()),
            timestamp: Some(args.timestamp),
            cron: args.cron.clone(),
            limit: 1,
        };
        if !self.gateway.query_checkpoints(&probe).await?.is_empty() {
            debug!(
                process_id = %args.process_id,
                nonce = %args.nonce,
                "checkpoint already published, skipping"
            );
            return Ok(None);
        }

        // The SHA-256 tag commits to the uncompressed memory even though
        // the data item body ships gzipped.
        let memory = gunzip(&args.memory_gz)?;
        let spec = CheckpointSpec {
            process_id: args.process_id.clone(),
            module: args.module.clone(),
            epoch: args.epoch,
            nonce: args.nonce.clone(),
            timestamp: args.timestamp,
            block_height: args.block_height,
            sha256: BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(&memory)),
            cron: args.cron.clone(),
            encoding: Some(ENCODING_GZIP.into()),
        };

        let item = UnsignedDataItem {
            data: args.memory_gz.clone(),
            tags: spec.to_tags(),
            target: None,
            anchor: match self.anchor {
                CheckpointAnchor::Empty => None,
            },
        };
        let signed = self.signer.sign(item).await.map_err(CuError::from)?;
        let tx_id = self.gateway.upload(&signed).await?;
        info!(
            process_id = %args.process_id,
            nonce = %args.nonce,
            tx_id = %tx_id,
            "published checkpoint"
        );
        Ok(Some(tx_id))
    }

    /// Find the latest checkpoint of `process_id` admitted by `target`,
    /// download and decode its memory. `Ok(None)` means cold start;
    /// transient gateway trouble degrades to that rather than failing
    /// the evaluation.
    pub async fn discover(
        &self,
        process_id: &str,
        target: &DiscoveryTarget,
    ) -> CuResult<Option<FoundCheckpoint>> {
        let query = CheckpointQuery {
            process_id: process_id.to_string(),
            limit: DISCOVERY_FANOUT,
            ..CheckpointQuery::default()
        };
        let nodes = match self.gateway.query_checkpoints(&query).await {
            Ok(nodes) => nodes,
            Err(err) if err.is_degradable() => {
                warn!(process_id, error = %err, "checkpoint query failed, cold starting");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let mut best: Option<(CheckpointSpec, String)> = None;
        for node in nodes {
            let spec = match CheckpointSpec::from_tags(process_id, &node.tags) {
                Ok(spec) => spec,
                Err(err) => {
                    debug!(process_id, tx_id = %node.id, error = %err, "skipping malformed checkpoint");
                    continue;
                }
            };
            if !target.admits(&spec) {
                continue;
            }
            let position = spec.position();
            let better = best
                .as_ref()
                .map(|(b, _)| position.is_later_than(&b.position()))
                .unwrap_or(true);
            if better {
                best = Some((spec, node.id));
            }
        }
        let Some((spec, tx_id)) = best else {
            return Ok(None);
        };

        let data = match self.gateway.download(&tx_id).await {
            Ok(data) => data,
            Err(err) if err.is_degradable() => {
                warn!(process_id, tx_id = %tx_id, error = %err, "checkpoint download failed, cold starting");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let memory = if spec.encoding.as_deref() == Some(ENCODING_GZIP) {
            gunzip(&data)?
        } else {
            data
        };

        let digest = BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(&memory));
        if digest != spec.sha256 {
            warn!(process_id, tx_id = %tx_id, "checkpoint memory does not match its SHA-256 tag, cold starting");
            return Ok(None);
        }

        Ok(Some(FoundCheckpoint {
            spec,
            tx_id,
            memory,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::gzip;
    use crate::gateway::GatewayTransaction;
    use ao_core::{CoreError, Ordinate, SignedDataItem};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeSigner;

    #[async_trait]
    impl DataItemSigner for FakeSigner {
        fn address(&self) -> &str {
            "wallet-address"
        }

        async fn sign(&self, item: UnsignedDataItem) -> Result<SignedDataItem, CoreError> {
            Ok(SignedDataItem {
                id: "signed-item".into(),
                bytes: item.data,
            })
        }
    }

    #[derive(Default)]
    struct FakeGateway {
        checkpoints: Mutex<Vec<(CheckpointSpec, Vec<u8>)>>,
        uploads: Mutex<Vec<SignedDataItem>>,
        fail_downloads: bool,
    }

    impl FakeGateway {
        fn with_checkpoint(self, spec: CheckpointSpec, memory_gz: Vec<u8>) -> Self {
            self.checkpoints.lock().unwrap().push((spec, memory_gz));
            self
        }
    }

    #[async_trait]
    impl Gateway for FakeGateway {
        async fn query_checkpoints(
            &self,
            query: &CheckpointQuery,
        ) -> CuResult<Vec<GatewayTransaction>> {
            let checkpoints = self.checkpoints.lock().unwrap();
            Ok(checkpoints
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
            Err(CuError::not_found(format!("transaction {tx_id}")))
        }

        async fn download(&self, tx_id: &str) -> CuResult<Vec<u8>> {
            if self.fail_downloads {
                return Err(CuError::transient("gateway download", "down"));
            }
            let at: usize = tx_id.trim_start_matches("tx-").parse().unwrap();
            Ok(self.checkpoints.lock().unwrap()[at].1.clone())
        }

        async fn upload(&self, item: &SignedDataItem) -> CuResult<String> {
            self.uploads.lock().unwrap().push(item.clone());
            Ok("uploaded-tx".into())
        }
    }

    fn spec_at(timestamp: i64, nonce: &str, memory: &[u8]) -> CheckpointSpec {
        CheckpointSpec {
            process_id: "proc-1".into(),
            module: "module-1".into(),
            epoch: 0,
            nonce: nonce.into(),
            timestamp,
            block_height: 100,
            sha256: BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(memory)),
            cron: None,
            encoding: Some(ENCODING_GZIP.into()),
        }
    }

    fn publish_args(memory_gz: Vec<u8>) -> PublishMemory {
        PublishMemory {
            process_id: "proc-1".into(),
            module: "module-1".into(),
            epoch: 0,
            nonce: "000000000100".into(),
            timestamp: 50,
            block_height: 100,
            cron: None,
            memory_gz,
        }
    }

    fn target(timestamp: i64) -> DiscoveryTarget {
        DiscoveryTarget::Position(EvalPosition::new(
            timestamp,
            Ordinate::new("999999999999"),
            Some("~".into()),
        ))
    }

    #[tokio::test]
    async fn publish_uploads_fresh_checkpoints() {
        let gateway = Arc::new(FakeGateway::default());
        let store = CheckpointStore::new(gateway.clone(), Arc::new(FakeSigner));

        let memory_gz = gzip(b"process memory").unwrap();
        let tx = store.publish(&publish_args(memory_gz)).await.unwrap();
        assert_eq!(tx.as_deref(), Some("uploaded-tx"));
        assert_eq!(gateway.uploads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn publish_is_idempotent() {
        let memory = b"process memory";
        let memory_gz = gzip(memory).unwrap();
        let gateway = Arc::new(
            FakeGateway::default().with_checkpoint(
                spec_at(50, "000000000100", memory),
                memory_gz.clone(),
            ),
        );
        let store = CheckpointStore::new(gateway.clone(), Arc::new(FakeSigner));

        let tx = store.publish(&publish_args(memory_gz)).await.unwrap();
        assert_eq!(tx, None);
        assert!(gateway.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn discover_picks_latest_not_later_than_target() {
        let old = b"old memory";
        let new = b"new memory";
        let future = b"future memory";
        let gateway = FakeGateway::default()
            .with_checkpoint(spec_at(10, "000000000010", old), gzip(old).unwrap())
            .with_checkpoint(spec_at(20, "000000000020", new), gzip(new).unwrap())
            .with_checkpoint(spec_at(99, "000000000099", future), gzip(future).unwrap());
        let store = CheckpointStore::new(Arc::new(gateway), Arc::new(FakeSigner));

        let found = store.discover("proc-1", &target(30)).await.unwrap().unwrap();
        assert_eq!(found.spec.timestamp, 20);
        assert_eq!(found.memory, new);
    }

    #[tokio::test]
    async fn discover_degrades_to_cold_start() {
        let memory = b"memory";
        let mut gateway = FakeGateway::default()
            .with_checkpoint(spec_at(10, "000000000010", memory), gzip(memory).unwrap());
        gateway.fail_downloads = true;
        let store = CheckpointStore::new(Arc::new(gateway), Arc::new(FakeSigner));

        let found = store.discover("proc-1", &target(30)).await.unwrap();
        assert!(found.is_none());

        let empty = CheckpointStore::new(Arc::new(FakeGateway::default()), Arc::new(FakeSigner));
        assert!(empty.discover("proc-1", &target(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn discover_honors_a_block_height_bound() {
        // spec_at pins checkpoints at block height 100.
        let memory = b"memory";
        let gateway = FakeGateway::default()
            .with_checkpoint(spec_at(10, "000000000010", memory), gzip(memory).unwrap());
        let store = CheckpointStore::new(Arc::new(gateway), Arc::new(FakeSigner));

        let below = store
            .discover("proc-1", &DiscoveryTarget::BlockHeight(99))
            .await
            .unwrap();
        assert!(below.is_none());

        let at = store
            .discover("proc-1", &DiscoveryTarget::BlockHeight(100))
            .await
            .unwrap();
        assert_eq!(at.unwrap().memory, memory);
    }

    #[tokio::test]
    async fn discover_rejects_mismatched_digest() {
        let memory = b"memory";
        let mut spec = spec_at(10, "000000000010", memory);
        spec.sha256 = "tampered".into();
        let gateway = FakeGateway::default().with_checkpoint(spec, gzip(memory).unwrap());
        let store = CheckpointStore::new(Arc::new(gateway), Arc::new(FakeSigner));

        assert!(store.discover("proc-1", &target(30)).await.unwrap().is_none());
    }
}
