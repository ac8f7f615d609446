//! Writer path: archive a message, then index it.

use std::sync::Arc;

use serde::Serialize;

use crate::archive::{AppendedRecord, ArchiveWriter};
use crate::config::ReplayConfig;
use crate::error::{ErrorSink, Result};
use crate::frame::encode_frame;
use crate::mapped_cache::MappedFileCache;
use crate::replay_index::{IndexOutcome, ReplayIndex};
use crate::types::{SequenceKey, SessionId};

/// What happened to one recorded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedMessage {
    pub appended: AppendedRecord,
    pub outcome: IndexOutcome,
}

impl RecordedMessage {
    /// True when the message is both archived and replayable.
    #[must_use]
    pub const fn is_indexed(&self) -> bool {
        matches!(self.outcome, IndexOutcome::Indexed(_))
    }
}

/// Serializable view for operator output.
#[derive(Debug, Serialize)]
pub struct RecordSummary {
    #[serde(flatten)]
    pub appended: AppendedRecord,
    pub indexed: bool,
    pub index_outcome: String,
}

impl From<&RecordedMessage> for RecordSummary {
    fn from(message: &RecordedMessage) -> Self {
        Self {
            appended: message.appended,
            indexed: message.is_indexed(),
            index_outcome: match message.outcome {
                IndexOutcome::Indexed(_) => "indexed",
                IndexOutcome::Full => "full",
                IndexOutcome::OutOfOrder => "out_of_order",
                IndexOutcome::Malformed => "malformed",
                IndexOutcome::StreamMismatch => "stream_mismatch",
                IndexOutcome::Unavailable => "unavailable",
            }
            .to_string(),
        }
    }
}

/// Feeds the archive and the index for one stream.
#[derive(Debug)]
pub struct Recorder {
    archive: ArchiveWriter,
    index: ReplayIndex,
}

impl Recorder {
    pub fn new(
        config: &ReplayConfig,
        cache: Arc<MappedFileCache>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            archive: ArchiveWriter::new(config, Arc::clone(&cache)),
            index: ReplayIndex::new(config, cache, errors),
        }
    }

    /// Archive `body` for `session_id` under `key` and index the frame.
    ///
    /// Archive failures are returned. An index refusal leaves the frame
    /// archived but not replayable and is reported in the outcome.
    pub fn record(
        &self,
        session_id: SessionId,
        key: SequenceKey,
        body: &[u8],
    ) -> Result<RecordedMessage> {
        let frame = encode_frame(session_id, key, body)?;
        let appended = self.archive.append_frame(&frame)?;
        let outcome = self.index.index_record(
            &frame,
            0,
            frame.len(),
            self.index.stream_id(),
            session_id,
            appended.end_position,
        );
        if !matches!(outcome, IndexOutcome::Indexed(_)) {
            tracing::warn!(
                session_id,
                key = %key,
                position = appended.position,
                ?outcome,
                "archived message was not indexed"
            );
        }
        Ok(RecordedMessage { appended, outcome })
    }
}
