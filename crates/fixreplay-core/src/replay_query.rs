//! Range queries over the replay index.
//!
//! A query scans the session's index for entries inside an inclusive key
//! range, then replays each matching frame from the archive through the
//! caller's handler. Replay stops at the first read that does not deliver.

use std::sync::Arc;

use crate::archive::{ArchiveReader, ArchiveSource, FrameHandler, ReadOutcome, SessionReader};
use crate::config::ReplayConfig;
use crate::error::ErrorSink;
use crate::mapped_cache::MappedFileCache;
use crate::replay_index::IndexReader;
use crate::types::{ReplayRange, SessionId};

/// Answers replay requests for one stream.
#[derive(Debug, Clone)]
pub struct ReplayQuery<A: ArchiveSource = ArchiveReader> {
    index: IndexReader,
    archive: A,
}

impl ReplayQuery<ArchiveReader> {
    /// Query engine reading index and archive files through `cache`.
    pub fn new(
        config: &ReplayConfig,
        cache: Arc<MappedFileCache>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        let index = IndexReader::new(config, Arc::clone(&cache), Arc::clone(&errors));
        Self::with_archive(index, ArchiveReader::new(config, cache, errors))
    }
}

impl<A: ArchiveSource> ReplayQuery<A> {
    /// Query engine over a custom archive source.
    pub fn with_archive(index: IndexReader, archive: A) -> Self {
        Self { index, archive }
    }

    #[must_use]
    pub fn index(&self) -> &IndexReader {
        &self.index
    }

    /// Replay messages of `session_id` from `(begin_seq_idx, begin_seq_num)`
    /// through `(end_seq_idx, end_seq_num)` inclusive, returning how many the
    /// handler consumed.
    ///
    /// `end_seq_num == MOST_RECENT_MESSAGE` replays through the latest entry
    /// indexed when the query starts; `end_seq_idx` is then ignored.
    pub fn query(
        &self,
        handler: &mut dyn FrameHandler,
        session_id: SessionId,
        begin_seq_num: u32,
        begin_seq_idx: u32,
        end_seq_num: u32,
        end_seq_idx: u32,
    ) -> usize {
        let range = ReplayRange::from_query(begin_seq_num, begin_seq_idx, end_seq_num, end_seq_idx);
        self.query_range(handler, session_id, range)
    }

    /// Replay every indexed message of `session_id` inside `range`.
    pub fn query_range(
        &self,
        handler: &mut dyn FrameHandler,
        session_id: SessionId,
        range: ReplayRange,
    ) -> usize {
        let span = crate::replay_span!(
            "replay_query",
            session_id = session_id,
            range = tracing::field::display(range)
        );
        let _guard = span.enter();

        if range.is_empty() {
            tracing::debug!("empty range");
            return 0;
        }
        // The index lease is released inside scan, before any archive read.
        let entries = self.index.scan(session_id, &range);
        if entries.is_empty() {
            return 0;
        }

        let mut reader = self.archive.session(session_id);
        let mut delivered = 0;
        for entry in &entries {
            match reader.read(entry.position, handler) {
                ReadOutcome::NextPosition(_) => delivered += 1,
                outcome => {
                    tracing::debug!(
                        ?outcome,
                        key = %entry.key,
                        position = entry.position,
                        "replay stopped"
                    );
                    break;
                }
            }
        }
        tracing::debug!(delivered, matched = entries.len(), "replay finished");
        delivered
    }
}
