//! Sequencer unit client: the paged interactions feed.

use ao_core::{SortKey, Tag};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{CuError, CuResult};
use crate::gateway::{request_error, status_check, with_retry};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_ATTEMPTS: u32 = 3;

/// One page of the SU's interactions feed, sorted descending by block
/// height.
#[derive(Debug, Clone, Deserialize)]
pub struct SuPage {
    pub paging: SuPaging,
    #[serde(default)]
    pub interactions: Vec<SuInteractionEdge>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SuPaging {
    #[serde(with = "ao_core::message::string_or_number")]
    pub total: u64,
    #[serde(with = "ao_core::message::string_or_number")]
    pub limit: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuInteractionEdge {
    pub interaction: SuInteraction,
}

/// A raw interaction as the SU reports it. Block fields may arrive as
/// strings; sort keys arrive unpadded.
#[derive(Debug, Clone, Deserialize)]
pub struct SuInteraction {
    #[serde(rename = "sortKey")]
    pub sort_key: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub anchor: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub block: SuBlock,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuBlock {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(with = "ao_core::message::string_or_number")]
    pub height: u64,
    #[serde(with = "ao_core::message::string_or_number")]
    pub timestamp: i64,
}

#[async_trait]
pub trait SequencerClient: Send + Sync {
    /// One page of interactions for `(process_id, from, to)`. Pages are
    /// 1-based; bounds are already canonical; an absent `to` means the
    /// head of the feed.
    async fn interactions(
        &self,
        process_id: &str,
        from: &SortKey,
        to: Option<&SortKey>,
        page: u64,
    ) -> CuResult<SuPage>;
}

pub struct HttpSequencerClient {
    client: Client,
    base: Url,
}

impl HttpSequencerClient {
    pub fn new(base: Url) -> CuResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| CuError::Fatal(format!("build sequencer client: {e}")))?;
        Ok(Self { client, base })
    }
}

#[async_trait]
impl SequencerClient for HttpSequencerClient {
    async fn interactions(
        &self,
        process_id: &str,
        from: &SortKey,
        to: Option<&SortKey>,
        page: u64,
    ) -> CuResult<SuPage> {
        let mut url = self
            .base
            .join("gateway/v2/interactions-sort-key")
            .map_err(|e| CuError::Fatal(format!("sequencer url join: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("contractId", process_id)
                .append_pair("from", from.as_str())
                .append_pair("page", &page.to_string());
            if let Some(to) = to {
                pairs.append_pair("to", to.as_str());
            }
        }

        with_retry("sequencer interactions", RETRY_ATTEMPTS, || async {
            let resp = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(request_error)?;
            status_check("sequencer interactions", resp.status())?;
            resp.json::<SuPage>()
                .await
                .map_err(|e| CuError::schema("sequencer interactions page", e))
        })
        .await
    }
}
