//! Shared algebra and data model for the ao compute/messenger units.
//!
//! Everything here is pure: sort-key ordering, the deep-hash/data-item
//! codec, the message and evaluation shapes, and the error taxonomy the
//! units use to drive propagation policy. No I/O happens in this crate.

pub mod checkpoint;
pub mod data_item;
pub mod deep_hash;
mod error;
pub mod message;
pub mod sort_key;
pub mod tags;

pub use checkpoint::CheckpointSpec;
pub use data_item::{DataItemSigner, SignedDataItem, UnsignedDataItem};
pub use error::{CoreError, ErrorKind};
pub use message::{
    AoGlobal, BlockInfo, EvalOutputRecord, Evaluation, Message, MessageMeta, OutboundMessage,
    Process,
};
pub use sort_key::{EvalPosition, Ordinate, SortKey};
pub use tags::Tag;
