//! HTTP clients toward the SU (message submission) and the CU
//! (evaluation results, scheduled feeds).

use std::time::Duration;

use ao_core::{OutboundMessage, SignedDataItem, SortKey};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MuError, MuResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Acknowledgement from the SU for a posted message.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitAck {
    pub id: String,
}

/// A CU evaluation result as the MU consumes it; empty on miss.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrankResult {
    #[serde(default)]
    pub messages: Vec<OutboundMessage>,
    #[serde(default)]
    pub spawns: Vec<OutboundMessage>,
    #[serde(default)]
    pub output: serde_json::Value,
}

/// One entry of the CU's scheduled feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessage {
    #[serde(rename = "scheduledSortKey")]
    pub scheduled_sort_key: SortKey,
    pub message: OutboundMessage,
}

#[async_trait]
pub trait SequencerSubmit: Send + Sync {
    /// POST a signed data item to the SU.
    async fn submit(&self, item: &SignedDataItem) -> MuResult<SubmitAck>;
}

/// Picks the CU serving a process. One static node in the common
/// deployment; a real router can shard by process id.
pub trait CuRouter: Send + Sync {
    fn select_node(&self, process_id: &str) -> Url;
}

pub struct StaticRouter {
    url: Url,
}

impl StaticRouter {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

impl CuRouter for StaticRouter {
    fn select_node(&self, _process_id: &str) -> Url {
        self.url.clone()
    }
}

#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// Scheduled messages for a monitored process, optionally after a
    /// sort key.
    async fn scheduled(
        &self,
        process_id: &str,
        from: Option<&SortKey>,
    ) -> MuResult<Vec<ScheduledMessage>>;

    /// The evaluation result for a cranked message.
    async fn result(&self, tx_id: &str, process_id: &str) -> MuResult<CrankResult>;
}

pub struct HttpSequencer {
    client: Client,
    base: Url,
}

impl HttpSequencer {
    pub fn new(base: Url) -> MuResult<Self> {
        Ok(Self {
            client: build_client()?,
            base,
        })
    }
}

#[async_trait]
impl SequencerSubmit for HttpSequencer {
    async fn submit(&self, item: &SignedDataItem) -> MuResult<SubmitAck> {
        let url = join(&self.base, "message")?;
        with_retry("sequencer submit", || async {
            let resp = self
                .client
                .post(url.clone())
                .header("Content-Type", "application/octet-stream")
                .body(item.bytes.clone())
                .send()
                .await
                .map_err(request_error)?;
            let status = resp.status();
            if !status.is_success() {
                // The error body is the SU's diagnostic.
                let body = resp.text().await.unwrap_or_default();
                return Err(status_error("sequencer submit", status, &body));
            }
            resp.json::<SubmitAck>()
                .await
                .map_err(|e| MuError::schema("sequencer submit ack", e))
        })
        .await
    }
}

pub struct HttpComputeUnit {
    client: Client,
    router: Box<dyn CuRouter>,
}

impl HttpComputeUnit {
    pub fn new(router: Box<dyn CuRouter>) -> MuResult<Self> {
        Ok(Self {
            client: build_client()?,
            router,
        })
    }
}

#[async_trait]
impl ComputeClient for HttpComputeUnit {
    async fn scheduled(
        &self,
        process_id: &str,
        from: Option<&SortKey>,
    ) -> MuResult<Vec<ScheduledMessage>> {
        let base = self.router.select_node(process_id);
        let mut url = join(&base, &format!("scheduled/{process_id}"))?;
        if let Some(from) = from {
            url.query_pairs_mut().append_pair("from", from.as_str());
        }
        with_retry("cu scheduled", || async {
            let resp = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(request_error)?;
            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(vec![]);
            }
            if !status.is_success() {
                return Err(status_error("cu scheduled", status, ""));
            }
            resp.json::<Vec<ScheduledMessage>>()
                .await
                .map_err(|e| MuError::schema("cu scheduled feed", e))
        })
        .await
    }

    async fn result(&self, tx_id: &str, process_id: &str) -> MuResult<CrankResult> {
        let base = self.router.select_node(process_id);
        let url = join(&base, &format!("result/{tx_id}"))?;
        with_retry("cu result", || async {
            let resp = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(request_error)?;
            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(CrankResult::default());
            }
            if !status.is_success() {
                return Err(status_error("cu result", status, ""));
            }
            resp.json::<CrankResult>()
                .await
                .map_err(|e| MuError::schema("cu result", e))
        })
        .await
    }
}

fn build_client() -> MuResult<Client> {
    Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .map_err(|e| MuError::Fatal(format!("build http client: {e}")))
}

fn join(base: &Url, path: &str) -> MuResult<Url> {
    base.join(path)
        .map_err(|e| MuError::Fatal(format!("url join '{path}': {e}")))
}

fn request_error(err: reqwest::Error) -> MuError {
    MuError::transient("http request", err.to_string())
}

fn status_error(op: &'static str, status: StatusCode, body: &str) -> MuError {
    if status.is_server_error() {
        MuError::transient(op, format!("upstream status {status}: {body}"))
    } else {
        MuError::Fatal(format!("{op}: upstream status {status}: {body}"))
    }
}

pub(crate) async fn with_retry<T, F, Fut>(op: &'static str, mut f: F) -> MuResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = MuResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.kind() == ao_core::ErrorKind::Transient && attempt < RETRY_ATTEMPTS => {
                warn!(op, attempt, error = %err, "transient failure, retrying");
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(err) => return Err(err),
        }
    }
}
