//! Ordered message source over the SU's interactions feed.
//!
//! The SU pages descending by block height; the source drains the pages
//! for the bounded range, reverses into ascending sort-key order, and
//! yields one validated `Message` at a time. Any malformed page or
//! element terminates the stream with the error.

use std::sync::Arc;

use ao_core::message::{AoGlobal, BlockInfo, MessageMeta};
use ao_core::tags::{has_tag, tag_value};
use ao_core::{Message, Process, SortKey};
use futures::stream::{self, Stream};

use crate::error::{CuError, CuResult};
use crate::su::{SequencerClient, SuInteraction};

pub struct MessageSource {
    su: Arc<dyn SequencerClient>,
}

enum SourceState {
    Fetch { page: u64, acc: Vec<Message> },
    Drain(std::vec::IntoIter<Message>),
}

impl MessageSource {
    pub fn new(su: Arc<dyn SequencerClient>) -> Self {
        Self { su }
    }

    /// Stream messages for `process` over `[from, to)`. `from` is
    /// inclusive; `to` is exclusive unless it is a height-only key, in
    /// which case it is widened so interactions in the terminal block
    /// are included. No `to` means the head of the feed.
    pub fn stream(
        &self,
        process: &Process,
        from: &SortKey,
        to: Option<&SortKey>,
    ) -> impl Stream<Item = CuResult<Message>> {
        let su = self.su.clone();
        let process = process.clone();
        let from = from.clone();
        let to = to.map(SortKey::increment_bound);

        stream::try_unfold(
            SourceState::Fetch {
                page: 1,
                acc: Vec::new(),
            },
            move |mut state| {
                let su = su.clone();
                let process = process.clone();
                let from = from.clone();
                let to = to.clone();
                async move {
                    loop {
                        match state {
                            SourceState::Fetch { page, mut acc } => {
                                let fetched = su
                                    .interactions(&process.id, &from, to.as_ref(), page)
                                    .await?;
                                let count = fetched.interactions.len() as u64;
                                for edge in fetched.interactions {
                                    let message =
                                        message_from_interaction(&process, edge.interaction)?;
                                    message.validate()?;
                                    acc.push(message);
                                }
                                let exhausted = count == 0
                                    || (fetched.paging.limit > 0
                                        && count < fetched.paging.limit)
                                    || acc.len() as u64 >= fetched.paging.total;
                                state = if exhausted {
                                    // Descending pages, ascending consumer.
                                    acc.reverse();
                                    SourceState::Drain(acc.into_iter())
                                } else {
                                    SourceState::Fetch {
                                        page: page + 1,
                                        acc,
                                    }
                                };
                            }
                            SourceState::Drain(mut rest) => {
                                return Ok(rest
                                    .next()
                                    .map(|message| (message, SourceState::Drain(rest))));
                            }
                        }
                    }
                }
            },
        )
    }
}

/// Shape an SU interaction into the Message the pipeline folds.
///
/// Forwarding fields ride in as tags; a message is an assignment when it
/// carries an `Assignment` tag naming the chain transaction to overlay,
/// and a cron message when it carries a `Cron-Interval` tag.
pub fn message_from_interaction(process: &Process, raw: SuInteraction) -> CuResult<Message> {
    let sort_key = SortKey::parse(&raw.sort_key).map_err(CuError::from)?;
    let forwarded_by = tag_value(&raw.tags, "Forwarded-By").map(str::to_owned);
    let forwarded_for = tag_value(&raw.tags, "Forwarded-For").map(str::to_owned);
    let assignment = tag_value(&raw.tags, "Assignment").map(str::to_owned);
    let is_cron = has_tag(&raw.tags, "Cron-Interval");

    let owner = raw
        .owner
        .unwrap_or_else(|| process.owner.clone());
    let from = forwarded_for.clone().unwrap_or_else(|| owner.clone());
    let id = assignment.clone().or(raw.id);

    Ok(Message {
        sort_key,
        deep_hash: None,
        is_assignment: assignment.is_some(),
        is_cron,
        message: MessageMeta {
            id,
            data: raw.data,
            owner,
            signature: raw.signature,
            target: raw.target.unwrap_or_else(|| process.id.clone()),
            anchor: raw.anchor,
            from,
            forwarded_by,
            forwarded_for,
            tags: raw.tags,
        },
        ao_global: AoGlobal {
            process: process.id.clone(),
            block: BlockInfo {
                height: raw.block.height,
                timestamp: raw.block.timestamp,
            },
        },
    })
}
