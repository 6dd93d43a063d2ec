//! Message, process, and evaluation shapes shared by the units.
//!
//! Boundary payloads (SU pages, gateway responses, persisted documents)
//! deserialize into these types; `Message::validate` is the terminal
//! schema check the hydration pipeline re-runs on every output.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::sort_key::{EvalPosition, Ordinate, SortKey};
use crate::tags::Tag;

/// Block fields arrive from some upstreams as strings and from others as
/// numbers; both decode. See the SU interaction schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    #[serde(with = "string_or_number")]
    pub height: u64,
    #[serde(with = "string_or_number")]
    pub timestamp: i64,
}

/// An immutable process record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub id: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub block: BlockInfo,
}

impl Process {
    /// Module id the process was spawned from, per its `Module` tag.
    pub fn module_id(&self) -> Option<&str> {
        crate::tags::tag_value(&self.tags, "Module")
    }
}

/// The inner message material addressed to a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
    /// Absent on scheduled/cron messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
    pub from: String,
    #[serde(
        default,
        rename = "Forwarded-By",
        skip_serializing_if = "Option::is_none"
    )]
    pub forwarded_by: Option<String>,
    #[serde(
        default,
        rename = "Forwarded-For",
        skip_serializing_if = "Option::is_none"
    )]
    pub forwarded_for: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

/// The environment handed to the process alongside each message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AoGlobal {
    pub process: String,
    pub block: BlockInfo,
}

/// One ordered unit of input to a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "sortKey")]
    pub sort_key: SortKey,
    #[serde(
        default,
        rename = "deepHash",
        skip_serializing_if = "Option::is_none"
    )]
    pub deep_hash: Option<String>,
    #[serde(default, rename = "isAssignment")]
    pub is_assignment: bool,
    #[serde(default, rename = "isCron")]
    pub is_cron: bool,
    pub message: MessageMeta,
    #[serde(rename = "AoGlobal")]
    pub ao_global: AoGlobal,
}

const ANCHOR_MAX_BYTES: usize = 32;

impl Message {
    /// Terminal schema check. The hydration transforms re-run this on
    /// every output to catch transform bugs before the evaluator sees
    /// the message.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.message.owner.is_empty() {
            return Err(CoreError::IllFormed("message owner is empty".into()));
        }
        if self.message.target.is_empty() {
            return Err(CoreError::IllFormed("message target is empty".into()));
        }
        if let Some(anchor) = &self.message.anchor {
            if anchor.len() > ANCHOR_MAX_BYTES {
                return Err(CoreError::IllFormed(format!(
                    "anchor exceeds {ANCHOR_MAX_BYTES} bytes"
                )));
            }
        }
        Ok(())
    }

    /// The terminal pipeline check: the base schema plus the invariants
    /// hydration is responsible for establishing.
    pub fn validate_hydrated(&self) -> Result<(), CoreError> {
        self.validate()?;
        if self.message.forwarded_by.is_some() && self.deep_hash.is_none() {
            return Err(CoreError::IllFormed(
                "forwarded message is missing its deep hash".into(),
            ));
        }
        Ok(())
    }

    /// Cron-interval tag, set on cron messages only.
    pub fn cron_interval(&self) -> Option<&str> {
        self.is_cron
            .then(|| crate::tags::tag_value(&self.message.tags, "Cron-Interval"))
            .flatten()
    }
}

/// An outbound message or spawn produced by an evaluation, to be cranked
/// back through the sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(rename = "Target")]
    pub target: String,
    #[serde(default, rename = "Anchor", skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
    #[serde(default, rename = "Tags")]
    pub tags: Vec<Tag>,
    #[serde(default, rename = "Data", skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// The recorded output of one evaluation. Memory is intentionally not
/// part of the record; it lives in the memory cache and in checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalOutputRecord {
    #[serde(default, rename = "Messages")]
    pub messages: Vec<OutboundMessage>,
    #[serde(default, rename = "Spawns")]
    pub spawns: Vec<OutboundMessage>,
    #[serde(
        default,
        rename = "Output",
        skip_serializing_if = "serde_json::Value::is_null"
    )]
    pub output: serde_json::Value,
    #[serde(default, rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

/// One link in a process's evaluation chain. Primary key is
/// `(processId, sortKey)`; `(processId, deepHash)` is the dedup index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    #[serde(rename = "processId")]
    pub process_id: String,
    #[serde(rename = "sortKey")]
    pub sort_key: SortKey,
    #[serde(
        default,
        rename = "messageId",
        skip_serializing_if = "Option::is_none"
    )]
    pub message_id: Option<String>,
    pub timestamp: i64,
    #[serde(default, rename = "isCron")]
    pub is_cron: bool,
    #[serde(default, rename = "cron", skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(rename = "evaluatedAt")]
    pub evaluated_at: i64,
    #[serde(
        default,
        rename = "deepHash",
        skip_serializing_if = "Option::is_none"
    )]
    pub deep_hash: Option<String>,
    pub output: EvalOutputRecord,
}

impl Evaluation {
    pub fn position(&self) -> EvalPosition {
        EvalPosition::new(
            self.timestamp,
            Ordinate::from_sort_key(&self.sort_key),
            self.cron.clone(),
        )
    }
}

/// Serde helper tolerating upstreams that encode numeric block fields as
/// JSON strings.
pub mod string_or_number {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::fmt::Display;
    use std::str::FromStr;

    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        value.serialize(serializer)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr + Deserialize<'de>,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw<T> {
            Number(T),
            Text(String),
        }

        match Raw::<T>::deserialize(deserializer)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
