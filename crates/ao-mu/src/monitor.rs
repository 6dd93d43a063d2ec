//! The monitor loop: poll the CU's scheduled feed for every monitored
//! process and crank what it returns.
//!
//! One periodic tick loads all monitors; each monitor processes on its
//! own task. The in-flight set enforces at most one running pass per
//! monitor, so a slow crank never overlaps with the next tick's.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::prelude::*;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clients::{ComputeClient, ScheduledMessage};
use crate::cranker::Cranker;
use crate::error::MuResult;
use crate::store::{Monitor, MuStore, ScheduledBatch};

pub struct MonitorLoop {
    store: Arc<dyn MuStore>,
    cu: Arc<dyn ComputeClient>,
    cranker: Arc<Cranker>,
    interval: Duration,
    in_flight: Mutex<HashSet<String>>,
}

/// Handle to a spawned loop; dropping it does not stop the loop, `stop`
/// does.
pub struct MonitorHandle {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl MonitorHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

impl MonitorLoop {
    pub fn new(
        store: Arc<dyn MuStore>,
        cu: Arc<dyn ComputeClient>,
        cranker: Arc<Cranker>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            cu,
            cranker,
            interval,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn spawn(self: Arc<Self>) -> MonitorHandle {
        let (shutdown, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            info!("monitor loop started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.clone().tick(),
                    _ = rx.changed() => break,
                }
            }
            info!("monitor loop stopped");
        });
        MonitorHandle { handle, shutdown }
    }

    /// One pass: spawn a task per idle, authorized monitor.
    pub fn tick(self: Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let monitors = match this.store.monitors().await {
                Ok(monitors) => monitors,
                Err(err) => {
                    warn!(error = %err, "monitor load failed, skipping tick");
                    return;
                }
            };
            for monitor in monitors {
                if !monitor.authorized {
                    continue;
                }
                if !this
                    .in_flight
                    .lock()
                    .expect("in-flight set")
                    .insert(monitor.id.clone())
                {
                    debug!(process_id = %monitor.id, "monitor already in flight");
                    continue;
                }
                let runner = this.clone();
                tokio::spawn(async move {
                    let process_id = monitor.id.clone();
                    if let Err(err) = runner.process_monitor(monitor).await {
                        warn!(process_id = %process_id, error = %err, "monitor pass failed");
                    }
                    runner
                        .in_flight
                        .lock()
                        .expect("in-flight set")
                        .remove(&process_id);
                });
            }
        });
    }

    /// Fetch the scheduled feed, persist it as a batch, crank it, and
    /// advance the monitor's cursor. The cursor only moves on success.
    pub async fn process_monitor(&self, mut monitor: Monitor) -> MuResult<()> {
        let scheduled = self
            .cu
            .scheduled(&monitor.id, monitor.last_from_sort_key.as_ref())
            .await?;
        if scheduled.is_empty() {
            return Ok(());
        }

        let from_tx_id = batch_id(&monitor.id, &scheduled);
        let batch = ScheduledBatch {
            from_tx_id: from_tx_id.clone(),
            process_id: monitor.id.clone(),
            messages: scheduled.clone(),
        };
        self.store.save_batch(&batch).await?;
        info!(
            process_id = %monitor.id,
            from_tx_id = %from_tx_id,
            count = scheduled.len(),
            "cranking scheduled batch"
        );

        let newest = scheduled
            .iter()
            .map(|s| s.scheduled_sort_key.clone())
            .max();
        let messages = scheduled.into_iter().map(|s| s.message).collect();
        self.cranker.crank(messages, vec![]).await?;

        // Monotonic advance; a stale feed cannot move the cursor back.
        if let Some(newest) = newest {
            let advanced = match &monitor.last_from_sort_key {
                Some(current) => newest > *current,
                None => true,
            };
            if advanced {
                monitor.last_from_sort_key = Some(newest);
                self.store.save_monitor(&monitor).await?;
            }
        }
        Ok(())
    }
}

/// Fresh batch id for a scheduled fetch: content-derived, so distinct
/// batches get distinct ids as the feed advances.
fn batch_id(process_id: &str, scheduled: &[ScheduledMessage]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(process_id.as_bytes());
    hasher.update(scheduled.len().to_le_bytes());
    for entry in scheduled {
        hasher.update(entry.scheduled_sort_key.as_str().as_bytes());
    }
    hasher.update(now_millis().to_le_bytes());
    BASE64_URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
