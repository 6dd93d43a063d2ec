//! Checkpoint tag codec.
//!
//! A checkpoint is the on-chain publication of a process memory snapshot.
//! Its data item tags uniquely identify the evaluation it captures, and
//! the `SHA-256` tag commits to the *uncompressed* memory regardless of
//! the transport encoding.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::sort_key::{EvalPosition, Ordinate, BLOCK_HEIGHT_DIGITS};
use crate::tags::{tag_value, Tag};

pub const TAG_DATA_PROTOCOL: &str = "Data-Protocol";
pub const TAG_VARIANT: &str = "Variant";
pub const TAG_TYPE: &str = "Type";
pub const TAG_MODULE: &str = "Module";
pub const TAG_PROCESS: &str = "Process";
pub const TAG_EPOCH: &str = "Epoch";
pub const TAG_NONCE: &str = "Nonce";
pub const TAG_TIMESTAMP: &str = "Timestamp";
pub const TAG_BLOCK_HEIGHT: &str = "Block-Height";
pub const TAG_CONTENT_TYPE: &str = "Content-Type";
pub const TAG_SHA256: &str = "SHA-256";
pub const TAG_CRON_INTERVAL: &str = "Cron-Interval";
pub const TAG_CONTENT_ENCODING: &str = "Content-Encoding";

pub const DATA_PROTOCOL_AO: &str = "ao";
pub const VARIANT_AO_TN1: &str = "ao.TN.1";
pub const TYPE_CHECKPOINT: &str = "Checkpoint";
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";
pub const ENCODING_GZIP: &str = "gzip";

/// Everything a checkpoint's tags carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSpec {
    pub process_id: String,
    pub module: String,
    pub epoch: u64,
    pub nonce: String,
    pub timestamp: i64,
    pub block_height: u64,
    /// Base64url SHA-256 of the uncompressed memory.
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl CheckpointSpec {
    /// The full, bit-exact tag set for the checkpoint data item.
    pub fn to_tags(&self) -> Vec<Tag> {
        let mut tags = vec![
            Tag::new(TAG_DATA_PROTOCOL, DATA_PROTOCOL_AO),
            Tag::new(TAG_VARIANT, VARIANT_AO_TN1),
            Tag::new(TAG_TYPE, TYPE_CHECKPOINT),
            Tag::new(TAG_MODULE, &self.module),
            Tag::new(TAG_PROCESS, &self.process_id),
            Tag::new(TAG_EPOCH, self.epoch.to_string()),
            Tag::new(TAG_NONCE, &self.nonce),
            Tag::new(TAG_TIMESTAMP, self.timestamp.to_string()),
            Tag::new(
                TAG_BLOCK_HEIGHT,
                format!("{:0>width$}", self.block_height, width = BLOCK_HEIGHT_DIGITS),
            ),
            Tag::new(TAG_CONTENT_TYPE, CONTENT_TYPE_OCTET_STREAM),
            Tag::new(TAG_SHA256, &self.sha256),
        ];
        if let Some(cron) = &self.cron {
            tags.push(Tag::new(TAG_CRON_INTERVAL, cron));
        }
        if let Some(encoding) = &self.encoding {
            tags.push(Tag::new(TAG_CONTENT_ENCODING, encoding));
        }
        tags
    }

    /// Parse a gateway-reported tag set back into a spec. Tags a gateway
    /// returns for non-ao transactions fail here, which is how discovery
    /// filters junk.
    pub fn from_tags(process_id: &str, tags: &[Tag]) -> Result<Self, CoreError> {
        if tag_value(tags, TAG_TYPE) != Some(TYPE_CHECKPOINT) {
            return Err(CoreError::IllFormed("not a Checkpoint data item".into()));
        }
        let require = |name: &str| {
            tag_value(tags, name)
                .map(str::to_owned)
                .ok_or_else(|| CoreError::IllFormed(format!("checkpoint missing {name} tag")))
        };
        let numeric = |name: &str| -> Result<u64, CoreError> {
            require(name)?
                .parse()
                .map_err(|_| CoreError::IllFormed(format!("checkpoint {name} tag is not numeric")))
        };
        Ok(CheckpointSpec {
            process_id: process_id.to_string(),
            module: require(TAG_MODULE)?,
            epoch: numeric(TAG_EPOCH)?,
            nonce: require(TAG_NONCE)?,
            timestamp: require(TAG_TIMESTAMP)?
                .parse()
                .map_err(|_| CoreError::IllFormed("checkpoint Timestamp tag is not numeric".into()))?,
            block_height: numeric(TAG_BLOCK_HEIGHT)?,
            sha256: require(TAG_SHA256)?,
            cron: tag_value(tags, TAG_CRON_INTERVAL).map(str::to_owned),
            encoding: tag_value(tags, TAG_CONTENT_ENCODING).map(str::to_owned),
        })
    }

    pub fn position(&self) -> EvalPosition {
        EvalPosition::new(self.timestamp, Ordinate::new(self.nonce.clone()), self.cron.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> CheckpointSpec {
        CheckpointSpec {
            process_id: "proc-1".into(),
            module: "module-1".into(),
            epoch: 0,
            nonce: "000001257294".into(),
            timestamp: 1694181441598,
            block_height: 1257294,
            sha256: "abc123".into(),
            cron: Some("10-minutes".into()),
            encoding: Some(ENCODING_GZIP.into()),
        }
    }

    #[test]
    fn tags_round_trip() {
        let spec = spec();
        let tags = spec.to_tags();
        let back = CheckpointSpec::from_tags("proc-1", &tags).unwrap();
        assert_eq!(spec, back);
    }

    #[test]
    fn tag_set_is_bit_exact() {
        let tags = spec().to_tags();
        let find = |name: &str| tag_value(&tags, name).unwrap();
        assert_eq!(find(TAG_DATA_PROTOCOL), "ao");
        assert_eq!(find(TAG_VARIANT), "ao.TN.1");
        assert_eq!(find(TAG_TYPE), "Checkpoint");
        assert_eq!(find(TAG_BLOCK_HEIGHT), "000001257294");
        assert_eq!(find(TAG_CONTENT_TYPE), "application/octet-stream");
        assert_eq!(find(TAG_CONTENT_ENCODING), "gzip");
    }

    #[test]
    fn non_checkpoint_tags_are_rejected() {
        let tags = vec![Tag::new(TAG_TYPE, "Message")];
        assert!(CheckpointSpec::from_tags("proc-1", &tags).is_err());
    }
}
