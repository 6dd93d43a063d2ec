//! Arweave gateway client: GraphQL queries over checkpoint tags, raw
//! transaction downloads, and data item uploads.

use std::time::Duration;

use ao_core::{checkpoint, SignedDataItem, Tag};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::error::{CuError, CuResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// A transaction as reported by the gateway's GraphQL schema.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayTransaction {
    pub id: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub block: Option<GatewayBlock>,
    #[serde(default)]
    pub owner: Option<GatewayOwner>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub anchor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct GatewayBlock {
    #[serde(with = "ao_core::message::string_or_number")]
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayOwner {
    pub address: String,
}

/// Tag filters for a checkpoint lookup. `owner` narrows to our own
/// publications (the publish-side idempotence probe); `nonce`,
/// `timestamp`, and `cron` pin one exact evaluation.
#[derive(Debug, Clone, Default)]
pub struct CheckpointQuery {
    pub process_id: String,
    pub owner: Option<String>,
    pub nonce: Option<String>,
    pub timestamp: Option<i64>,
    pub cron: Option<String>,
    pub limit: usize,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Checkpoints matching the query, most recent block first.
    async fn query_checkpoints(&self, query: &CheckpointQuery) -> CuResult<Vec<GatewayTransaction>>;

    /// Metadata for a single transaction.
    async fn transaction(&self, tx_id: &str) -> CuResult<GatewayTransaction>;

    /// Raw transaction data.
    async fn download(&self, tx_id: &str) -> CuResult<Vec<u8>>;

    /// Post a signed data item; returns the assigned transaction id.
    async fn upload(&self, item: &SignedDataItem) -> CuResult<String>;
}

pub struct ArweaveGateway {
    client: Client,
    base: Url,
}

impl ArweaveGateway {
    pub fn new(base: Url) -> CuResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| CuError::Fatal(format!("build gateway client: {e}")))?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, path: &str) -> CuResult<Url> {
        self.base
            .join(path)
            .map_err(|e| CuError::Fatal(format!("gateway url join '{path}': {e}")))
    }

    async fn graphql(&self, query: &str, variables: serde_json::Value) -> CuResult<Vec<GatewayTransaction>> {
        let url = self.endpoint("graphql")?;
        let body = json!({ "query": query, "variables": variables });
        let response = with_retry("gateway graphql", RETRY_ATTEMPTS, || async {
            let resp = self
                .client
                .post(url.clone())
                .json(&body)
                .send()
                .await
                .map_err(request_error)?;
            status_check("gateway graphql", resp.status())?;
            resp.json::<GraphqlResponse>()
                .await
                .map_err(|e| CuError::schema("gateway graphql response", e))
        })
        .await?;

        if let Some(errors) = response.errors {
            return Err(CuError::transient(
                "gateway graphql",
                format!("graphql errors: {errors:?}"),
            ));
        }
        let data = response
            .data
            .ok_or_else(|| CuError::schema("gateway graphql response", "missing data"))?;
        Ok(data
            .transactions
            .edges
            .into_iter()
            .map(|edge| edge.node)
            .collect())
    }
}

#[async_trait]
impl Gateway for ArweaveGateway {
    async fn query_checkpoints(&self, query: &CheckpointQuery) -> CuResult<Vec<GatewayTransaction>> {
        let mut tag_filters = vec![
            json!({ "name": checkpoint::TAG_DATA_PROTOCOL, "values": [checkpoint::DATA_PROTOCOL_AO] }),
            json!({ "name": checkpoint::TAG_TYPE, "values": [checkpoint::TYPE_CHECKPOINT] }),
            json!({ "name": checkpoint::TAG_PROCESS, "values": [query.process_id] }),
        ];
        if let Some(nonce) = &query.nonce {
            tag_filters.push(json!({ "name": checkpoint::TAG_NONCE, "values": [nonce] }));
        }
        if let Some(timestamp) = &query.timestamp {
            tag_filters
                .push(json!({ "name": checkpoint::TAG_TIMESTAMP, "values": [timestamp.to_string()] }));
        }
        if let Some(cron) = &query.cron {
            tag_filters.push(json!({ "name": checkpoint::TAG_CRON_INTERVAL, "values": [cron] }));
        }

        let mut variables = json!({
            "tags": tag_filters,
            "first": query.limit.max(1),
        });
        if let Some(owner) = &query.owner {
            variables["owners"] = json!([owner]);
        }

        self.graphql(CHECKPOINT_QUERY, variables).await
    }

    async fn transaction(&self, tx_id: &str) -> CuResult<GatewayTransaction> {
        let nodes = self
            .graphql(TRANSACTION_QUERY, json!({ "ids": [tx_id] }))
            .await?;
        nodes
            .into_iter()
            .next()
            .ok_or_else(|| CuError::not_found(format!("transaction {tx_id}")))
    }

    async fn download(&self, tx_id: &str) -> CuResult<Vec<u8>> {
        let url = self.endpoint(&format!("raw/{tx_id}"))?;
        with_retry("gateway download", RETRY_ATTEMPTS, || async {
            let resp = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(request_error)?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Err(CuError::not_found(format!("transaction data {tx_id}")));
            }
            status_check("gateway download", resp.status())?;
            let bytes = resp.bytes().await.map_err(request_error)?;
            Ok(bytes.to_vec())
        })
        .await
    }

    async fn upload(&self, item: &SignedDataItem) -> CuResult<String> {
        #[derive(Deserialize)]
        struct UploadAck {
            id: String,
        }

        let url = self.endpoint("tx")?;
        let ack = with_retry("gateway upload", RETRY_ATTEMPTS, || async {
            let resp = self
                .client
                .post(url.clone())
                .header("Content-Type", checkpoint::CONTENT_TYPE_OCTET_STREAM)
                .body(item.bytes.clone())
                .send()
                .await
                .map_err(request_error)?;
            status_check("gateway upload", resp.status())?;
            resp.json::<UploadAck>()
                .await
                .map_err(|e| CuError::schema("gateway upload ack", e))
        })
        .await?;
        Ok(ack.id)
    }
}

const CHECKPOINT_QUERY: &str = r#"
query ($tags: [TagFilter!]!, $owners: [String!], $first: Int!) {
  transactions(tags: $tags, owners: $owners, first: $first, sort: HEIGHT_DESC) {
    edges {
      node {
        id
        tags { name value }
        block { height }
        owner { address }
      }
    }
  }
}"#;

const TRANSACTION_QUERY: &str = r#"
query ($ids: [ID!]!) {
  transactions(ids: $ids, first: 1) {
    edges {
      node {
        id
        tags { name value }
        block { height }
        owner { address }
        signature
        anchor
      }
    }
  }
}"#;

#[derive(Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<GraphqlData>,
    #[serde(default)]
    errors: Option<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct GraphqlData {
    transactions: GraphqlConnection,
}

#[derive(Deserialize)]
struct GraphqlConnection {
    #[serde(default)]
    edges: Vec<GraphqlEdge>,
}

#[derive(Deserialize)]
struct GraphqlEdge {
    node: GatewayTransaction,
}

pub(crate) fn request_error(err: reqwest::Error) -> CuError {
    CuError::transient("http request", err.to_string())
}

pub(crate) fn status_check(op: &'static str, status: StatusCode) -> CuResult<()> {
    if status.is_success() {
        return Ok(());
    }
    if status.is_server_error() {
        return Err(CuError::transient(op, format!("upstream status {status}")));
    }
    Err(CuError::Fatal(format!("{op}: upstream status {status}")))
}

/// Retry transient failures with linear backoff; everything else
/// propagates immediately.
pub(crate) async fn with_retry<T, F, Fut>(op: &'static str, attempts: u32, mut f: F) -> CuResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = CuResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.kind() == ao_core::ErrorKind::Transient && attempt < attempts => {
                warn!(op, attempt, error = %err, "transient failure, retrying");
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(err) => return Err(err),
        }
    }
}
