//! Session identifiers, sequence keys and replay ranges.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a logical protocol session.
pub type SessionId = u64;

/// Identifier of the stream whose messages a log belongs to.
pub type StreamId = u32;

/// End sequence number meaning "up to the latest indexed message".
pub const MOST_RECENT_MESSAGE: u32 = u32::MAX;

/// Total-order key of a message within a session.
///
/// Field order matters: the derived `Ord` compares `sequence_index` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceKey {
    /// Epoch counter, bumped on every sequence number reset.
    pub sequence_index: u32,
    /// Message sequence number within the epoch.
    pub sequence_number: u32,
}

impl SequenceKey {
    #[must_use]
    pub const fn new(sequence_index: u32, sequence_number: u32) -> Self {
        Self {
            sequence_index,
            sequence_number,
        }
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sequence_index, self.sequence_number)
    }
}

impl FromStr for SequenceKey {
    type Err = String;

    /// Parses `index:number`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (index, number) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <sequence index>:<sequence number>, got {s:?}"))?;
        let sequence_index = index
            .trim()
            .parse()
            .map_err(|err| format!("invalid sequence index {index:?}: {err}"))?;
        let sequence_number = number
            .trim()
            .parse()
            .map_err(|err| format!("invalid sequence number {number:?}: {err}"))?;
        Ok(Self::new(sequence_index, sequence_number))
    }
}

/// Upper bound of a replay range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpperBound {
    /// Inclusive end key.
    Inclusive(SequenceKey),
    /// Whatever the latest indexed entry is when the query starts.
    MostRecent,
}

/// Inclusive range of sequence keys to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRange {
    pub begin: SequenceKey,
    pub end: UpperBound,
}

impl ReplayRange {
    #[must_use]
    pub const fn new(begin: SequenceKey, end: UpperBound) -> Self {
        Self { begin, end }
    }

    /// Range from `begin` through `end`, both inclusive.
    #[must_use]
    pub const fn inclusive(begin: SequenceKey, end: SequenceKey) -> Self {
        Self::new(begin, UpperBound::Inclusive(end))
    }

    /// Range from `begin` through the latest indexed entry.
    #[must_use]
    pub const fn to_most_recent(begin: SequenceKey) -> Self {
        Self::new(begin, UpperBound::MostRecent)
    }

    /// Build a range from the gateway's query arguments.
    ///
    /// `end_seq_num == MOST_RECENT_MESSAGE` opens the upper bound and
    /// `end_seq_idx` is then ignored.
    #[must_use]
    pub const fn from_query(
        begin_seq_num: u32,
        begin_seq_idx: u32,
        end_seq_num: u32,
        end_seq_idx: u32,
    ) -> Self {
        let begin = SequenceKey::new(begin_seq_idx, begin_seq_num);
        if end_seq_num == MOST_RECENT_MESSAGE {
            Self::to_most_recent(begin)
        } else {
            Self::inclusive(begin, SequenceKey::new(end_seq_idx, end_seq_num))
        }
    }

    /// True when `begin` sorts after an inclusive `end`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self.end {
            UpperBound::Inclusive(end) => self.begin > end,
            UpperBound::MostRecent => false,
        }
    }

    #[must_use]
    pub fn contains(&self, key: SequenceKey) -> bool {
        key >= self.begin && !self.is_past_end(key)
    }

    /// True when `key` sorts after the range's upper bound.
    #[must_use]
    pub fn is_past_end(&self, key: SequenceKey) -> bool {
        match self.end {
            UpperBound::Inclusive(end) => key > end,
            UpperBound::MostRecent => false,
        }
    }
}

impl fmt::Display for ReplayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            UpperBound::Inclusive(end) => write!(f, "[{}, {}]", self.begin, end),
            UpperBound::MostRecent => write!(f, "[{}, latest]", self.begin),
        }
    }
}
