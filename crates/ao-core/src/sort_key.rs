//! Sort-key and ordinate algebra.
//!
//! A sort key is a composite lexicographic key of up to three
//! comma-separated fields: `blockHeight,timestamp,hash`. The block-height
//! field is left-padded to twelve decimal digits so that lexicographic
//! order over the canonical form equals numeric order over
//! (height, timestamp, hash).

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Width the block-height field is padded to in canonical form.
pub const BLOCK_HEIGHT_DIGITS: usize = 12;

/// Smallest permissible collation character. A cold-started process uses
/// this as its ordinate so any real ordinate compares greater.
pub const COLLATION_MIN_CHAR: char = '!';

/// A canonical sort key. Construction always canonicalizes, so two equal
/// positions are string-equal and `Ord` is plain string comparison.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SortKey(String);

impl SortKey {
    /// Parse a sort key, accepting partial forms (height only, or height
    /// plus trailing fields) and padding the height field.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let mut fields = raw.splitn(3, ',');
        let height = fields
            .next()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| CoreError::IllFormed(format!("empty sort key '{raw}'")))?;
        if height.len() > BLOCK_HEIGHT_DIGITS || !height.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CoreError::IllFormed(format!(
                "sort key '{raw}' has a non-numeric block height field"
            )));
        }
        let mut canonical = format!("{:0>width$}", height, width = BLOCK_HEIGHT_DIGITS);
        for field in fields {
            canonical.push(',');
            canonical.push_str(field);
        }
        Ok(SortKey(canonical))
    }

    /// The smallest canonical key; every real key compares `>=` to it.
    pub fn min() -> Self {
        SortKey("0".repeat(BLOCK_HEIGHT_DIGITS))
    }

    /// Height-only bounds are exclusive-on-block; callers widening a `to`
    /// bound add one so interactions in the terminal block are included.
    /// Keys that already carry a timestamp are left intact.
    pub fn increment_bound(&self) -> SortKey {
        if self.0.contains(',') {
            return self.clone();
        }
        let next = self.height() + 1;
        SortKey(format!("{next:0>width$}", width = BLOCK_HEIGHT_DIGITS))
    }

    pub fn height(&self) -> u64 {
        // Canonical form guarantees an all-digit first field.
        self.0
            .split(',')
            .next()
            .and_then(|f| f.parse().ok())
            .unwrap_or(0)
    }

    /// Millisecond timestamp field, when present.
    pub fn timestamp(&self) -> Option<i64> {
        self.0.split(',').nth(1).and_then(|f| f.parse().ok())
    }

    pub fn hash(&self) -> Option<&str> {
        self.0.split(',').nth(2)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SortKey {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SortKey::parse(&value)
    }
}

impl From<SortKey> for String {
    fn from(key: SortKey) -> String {
        key.0
    }
}

/// Lexicographically sortable monotonic position derived from a sort
/// key's nonce; the tiebreak when timestamps collide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ordinate(String);

impl Ordinate {
    /// Cold-start sentinel; compares lower than any real ordinate.
    pub const MIN: &'static str = "!";

    pub fn min() -> Self {
        Ordinate(Self::MIN.to_string())
    }

    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            Ordinate(format!("{raw:0>width$}", width = BLOCK_HEIGHT_DIGITS))
        } else {
            Ordinate(raw)
        }
    }

    /// The canonical sort key is itself the lexicographically sortable
    /// monotonic position, so it doubles as the ordinate (and as the
    /// `Nonce` tag on published checkpoints, which is what lets a
    /// restored evaluator resume exactly after the checkpointed
    /// message).
    pub fn from_sort_key(key: &SortKey) -> Self {
        Ordinate(key.as_str().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The position an evaluation (or checkpoint) occupies in a process's
/// history. Ordered by timestamp, then ordinate, then cron-interval tag;
/// an absent cron interval compares as the empty string, and the empty
/// string compares below any interval, so two cron schedules firing at
/// the same instant order deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalPosition {
    pub timestamp: i64,
    pub ordinate: Ordinate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
}

impl EvalPosition {
    pub fn new(timestamp: i64, ordinate: Ordinate, cron: Option<String>) -> Self {
        Self {
            timestamp,
            ordinate,
            cron,
        }
    }

    /// Whether `self` occupies a strictly later position than `than`.
    pub fn is_later_than(&self, than: &EvalPosition) -> bool {
        self > than
    }

    fn cron_str(&self) -> &str {
        self.cron.as_deref().unwrap_or("")
    }
}

impl PartialOrd for EvalPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvalPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.ordinate.cmp(&other.ordinate))
            .then_with(|| self.cron_str().cmp(other.cron_str()))
    }
}
