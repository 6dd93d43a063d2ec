//! The crank loop: dispatch evaluator-produced messages back through
//! the SU, then recursively crank whatever their evaluations produce.
//!
//! Traversal is an explicit worklist carrying a depth counter, with a
//! visited set over `(processId, messageId)` so cyclic message graphs
//! terminate. A failed dispatch is logged and recorded as unsent; it
//! never aborts its siblings.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ao_core::{DataItemSigner, OutboundMessage, UnsignedDataItem};
use tracing::{debug, info, warn};

use crate::clients::{ComputeClient, CrankResult, SequencerSubmit};
use crate::error::MuResult;
use crate::store::{MuStore, UnsentMessage};

/// Outcome counters for one crank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrankReport {
    pub dispatched: usize,
    pub failed: usize,
    /// Messages dropped by the visited set (cycle guard).
    pub revisits: usize,
    /// Messages dropped by the depth bound.
    pub depth_capped: usize,
}

struct WorkItem {
    depth: u32,
    message: OutboundMessage,
}

pub struct Cranker {
    su: Arc<dyn SequencerSubmit>,
    cu: Arc<dyn ComputeClient>,
    signer: Arc<dyn DataItemSigner>,
    store: Arc<dyn MuStore>,
    depth_limit: u32,
}

impl Cranker {
    pub fn new(
        su: Arc<dyn SequencerSubmit>,
        cu: Arc<dyn ComputeClient>,
        signer: Arc<dyn DataItemSigner>,
        store: Arc<dyn MuStore>,
        depth_limit: u32,
    ) -> Self {
        Self {
            su,
            cu,
            signer,
            store,
            depth_limit,
        }
    }

    /// Crank a batch of outbound messages and spawns. Returns counters;
    /// the only hard failures are store-level ones.
    pub async fn crank(
        &self,
        messages: Vec<OutboundMessage>,
        spawns: Vec<OutboundMessage>,
    ) -> MuResult<CrankReport> {
        let mut report = CrankReport::default();
        let mut visited: HashSet<(String, String)> = HashSet::new();
        let mut queue: VecDeque<WorkItem> = messages
            .into_iter()
            .chain(spawns)
            .map(|message| WorkItem { depth: 0, message })
            .collect();

        while let Some(item) = queue.pop_front() {
            if item.depth >= self.depth_limit {
                warn!(
                    target_process = %item.message.target,
                    depth = item.depth,
                    "crank depth bound reached, dropping message"
                );
                report.depth_capped += 1;
                continue;
            }

            let signed = match self.sign(&item.message).await {
                Ok(signed) => signed,
                Err(err) => {
                    self.record_failure(&item.message, &err.to_string()).await;
                    report.failed += 1;
                    continue;
                }
            };

            let key = (item.message.target.clone(), signed.id.clone());
            if !visited.insert(key) {
                debug!(
                    target_process = %item.message.target,
                    message_id = %signed.id,
                    "already cranked this message for this process, stopping branch"
                );
                report.revisits += 1;
                continue;
            }

            match self.dispatch(&item.message, &signed).await {
                Ok((message_id, result)) => {
                    report.dispatched += 1;
                    debug!(
                        target_process = %item.message.target,
                        message_id = %message_id,
                        produced = result.messages.len() + result.spawns.len(),
                        "cranked message"
                    );
                    for produced in result.messages.into_iter().chain(result.spawns) {
                        queue.push_back(WorkItem {
                            depth: item.depth + 1,
                            message: produced,
                        });
                    }
                }
                Err(err) => {
                    warn!(
                        target_process = %item.message.target,
                        error = %err,
                        "crank dispatch failed, recording as unsent"
                    );
                    self.record_failure(&item.message, &err.to_string()).await;
                    report.failed += 1;
                }
            }
        }

        info!(
            dispatched = report.dispatched,
            failed = report.failed,
            revisits = report.revisits,
            "crank finished"
        );
        Ok(report)
    }

    /// Retry previously failed dispatches.
    pub async fn crank_unsent(&self, limit: usize) -> MuResult<CrankReport> {
        let unsent = self.store.take_unsent(limit).await?;
        if unsent.is_empty() {
            return Ok(CrankReport::default());
        }
        info!(count = unsent.len(), "retrying unsent messages");
        self.crank(unsent.into_iter().map(|u| u.message).collect(), vec![])
            .await
    }

    async fn sign(&self, message: &OutboundMessage) -> MuResult<ao_core::SignedDataItem> {
        let item = UnsignedDataItem {
            data: message
                .data
                .as_deref()
                .map(|d| d.as_bytes().to_vec())
                .unwrap_or_default(),
            tags: message.tags.clone(),
            target: Some(message.target.clone()),
            anchor: message.anchor.clone(),
        };
        Ok(self.signer.sign(item).await?)
    }

    async fn dispatch(
        &self,
        message: &OutboundMessage,
        signed: &ao_core::SignedDataItem,
    ) -> MuResult<(String, CrankResult)> {
        let ack = self.su.submit(signed).await?;
        let result = self.cu.result(&ack.id, &message.target).await?;
        Ok((ack.id, result))
    }

    async fn record_failure(&self, message: &OutboundMessage, reason: &str) {
        let unsent = UnsentMessage {
            process_id: message.target.clone(),
            message: message.clone(),
            reason: reason.to_string(),
            recorded_at: now_millis(),
        };
        if let Err(err) = self.store.record_unsent(&unsent).await {
            warn!(error = %err, "failed to record unsent message");
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
