//! Hydration: the streaming transforms between the message source and
//! the evaluator.
//!
//! Three passes run in order, each passing through messages it does not
//! apply to: deep-hash attachment for forwarded messages, the sunset
//! legacy `Load` transform, and the assignment overlay. A terminal
//! validator re-parses every output so a transform bug cannot leak a
//! malformed message into the fold.

use std::sync::Arc;

use ao_core::data_item::data_item_deep_hash;
use ao_core::tags::tag_value;
use ao_core::{Message, Tag};
use base64::prelude::*;
use futures::stream::{Stream, TryStreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{CuError, CuResult};
use crate::gateway::Gateway;

/// What to do when a message fails the terminal schema check. Halting is
/// the default: skipping would silently desynchronize state across
/// units, so opting into `SkipIllFormed` is a deployment decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HydrationPolicy {
    #[default]
    HaltOnIllFormed,
    SkipIllFormed,
}

pub struct Hydrator {
    gateway: Arc<dyn Gateway>,
    ao_load_max_block: u64,
    policy: HydrationPolicy,
    legacy_load: bool,
}

impl Hydrator {
    pub fn new(gateway: Arc<dyn Gateway>, ao_load_max_block: u64) -> Self {
        Self {
            gateway,
            ao_load_max_block,
            policy: HydrationPolicy::default(),
            legacy_load: true,
        }
    }

    pub fn with_policy(mut self, policy: HydrationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Turn the sunset `Load` transform off entirely; messages that
    /// carry a `Load` tag are then dropped like above-cutoff ones.
    pub fn without_legacy_load(mut self) -> Self {
        self.legacy_load = false;
        self
    }

    /// Order-preserving, one output per input (the documented legacy
    /// drop excepted). Pull-based end to end: nothing buffers the
    /// stream.
    pub fn hydrate<'a, S>(&'a self, messages: S) -> impl Stream<Item = CuResult<Message>> + 'a
    where
        S: Stream<Item = CuResult<Message>> + 'a,
    {
        messages
            .and_then(move |message| self.maybe_deep_hash(message))
            .try_filter_map(move |message| self.maybe_load(message))
            .and_then(move |message| self.maybe_assignment(message))
            .try_filter_map(move |message| self.finalize(message))
    }

    /// Attach the dedup digest to forwarded messages. A digest failure
    /// fails the stream: these messages exist to be deduped, and folding
    /// one without its key would break the dedup invariant.
    async fn maybe_deep_hash(&self, mut message: Message) -> CuResult<Message> {
        if message.message.forwarded_by.is_none() {
            return Ok(message);
        }
        let data = message
            .message
            .data
            .as_deref()
            .map(str::as_bytes)
            .unwrap_or_default();
        let digest = data_item_deep_hash(
            data,
            &message.message.tags,
            Some(&message.message.target),
            message.message.anchor.as_deref(),
        )?;
        message.deep_hash = Some(digest);
        Ok(message)
    }

    /// Legacy data loading, sunset at `ao_load_max_block`: below the
    /// cutoff the referenced transaction's data and metadata are
    /// installed as the message's data; at or above it the message is
    /// dropped.
    async fn maybe_load(&self, mut message: Message) -> CuResult<Option<Message>> {
        let Some(load_tx) = tag_value(&message.message.tags, "Load").map(str::to_owned) else {
            return Ok(Some(message));
        };
        if message.is_cron {
            return Ok(Some(message));
        }
        if !self.legacy_load || message.ao_global.block.height >= self.ao_load_max_block {
            debug!(
                sort_key = %message.sort_key,
                load_tx,
                "dropping Load message past the sunset block"
            );
            return Ok(None);
        }

        let meta = self.gateway.transaction(&load_tx).await?;
        let data = self.gateway.download(&load_tx).await?;
        let loaded = LoadedData {
            id: meta.id,
            owner: meta.owner.map(|o| o.address),
            anchor: meta.anchor,
            tags: meta.tags,
            data: BASE64_STANDARD.encode(data),
        };
        message.message.data = Some(
            serde_json::to_string(&loaded)
                .map_err(|e| CuError::schema("loaded transaction data", e))?,
        );
        Ok(Some(message))
    }

    /// Overlay the assigned chain transaction onto the message. Owner
    /// and From both take the transaction's owner, matching upstream
    /// behavior.
    async fn maybe_assignment(&self, mut message: Message) -> CuResult<Message> {
        if !message.is_assignment {
            return Ok(message);
        }
        let tx_id = message
            .message
            .id
            .clone()
            .ok_or_else(|| CuError::schema("assignment", "assignment without a transaction id"))?;

        let tx = self.gateway.transaction(&tx_id).await?;
        let data = self.gateway.download(&tx_id).await?;

        let meta = &mut message.message;
        meta.id = Some(tx.id);
        if let Some(owner) = tx.owner {
            meta.owner = owner.address.clone();
            meta.from = owner.address;
        }
        meta.signature = tx.signature;
        meta.tags = tx.tags;
        meta.anchor = tx.anchor;
        meta.data = Some(String::from_utf8_lossy(&data).into_owned());
        Ok(message)
    }

    async fn finalize(&self, message: Message) -> CuResult<Option<Message>> {
        match message.validate_hydrated() {
            Ok(()) => Ok(Some(message)),
            Err(err) => match self.policy {
                HydrationPolicy::HaltOnIllFormed => Err(err.into()),
                HydrationPolicy::SkipIllFormed => {
                    warn!(
                        sort_key = %message.sort_key,
                        error = %err,
                        "skipping ill-formed message by policy"
                    );
                    Ok(None)
                }
            },
        }
    }
}

#[derive(Serialize)]
struct LoadedData {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    anchor: Option<String>,
    tags: Vec<Tag>,
    /// Base64 of the raw transaction data.
    data: String,
}
