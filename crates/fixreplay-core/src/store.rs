//! One-call wiring of recorder and query engine around a shared cache.

use std::sync::Arc;

use crate::archive::FrameHandler;
use crate::config::ReplayConfig;
use crate::error::{ErrorSink, Result};
use crate::mapped_cache::{CacheStats, MappedFileCache};
use crate::recorder::{RecordedMessage, Recorder};
use crate::replay_index::IndexEntry;
use crate::replay_query::ReplayQuery;
use crate::types::{ReplayRange, SequenceKey, SessionId};

/// Replay store for one stream in one directory.
#[derive(Debug)]
pub struct ReplayStore {
    config: ReplayConfig,
    cache: Arc<MappedFileCache>,
    recorder: Recorder,
    query: ReplayQuery,
}

impl ReplayStore {
    /// Validate `config`, create its log directory and wire the components.
    pub fn open(config: ReplayConfig, errors: Arc<dyn ErrorSink>) -> Result<Self> {
        config.validate()?;
        config.ensure_log_dir()?;
        let cache = Arc::new(MappedFileCache::new(
            config.cache_num_sets,
            config.cache_set_size,
            Arc::clone(&errors),
        ));
        let recorder = Recorder::new(&config, Arc::clone(&cache), Arc::clone(&errors));
        let query = ReplayQuery::new(&config, Arc::clone(&cache), errors);
        tracing::info!(
            log_dir = %config.log_dir.display(),
            stream_id = config.stream_id,
            cache_num_sets = config.cache_num_sets,
            cache_set_size = config.cache_set_size,
            "replay store opened"
        );
        Ok(Self {
            config,
            cache,
            recorder,
            query,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<MappedFileCache> {
        &self.cache
    }

    pub fn record(
        &self,
        session_id: SessionId,
        key: SequenceKey,
        body: &[u8],
    ) -> Result<RecordedMessage> {
        self.recorder.record(session_id, key, body)
    }

    pub fn query(
        &self,
        handler: &mut dyn FrameHandler,
        session_id: SessionId,
        begin_seq_num: u32,
        begin_seq_idx: u32,
        end_seq_num: u32,
        end_seq_idx: u32,
    ) -> usize {
        self.query.query(
            handler,
            session_id,
            begin_seq_num,
            begin_seq_idx,
            end_seq_num,
            end_seq_idx,
        )
    }

    pub fn query_range(
        &self,
        handler: &mut dyn FrameHandler,
        session_id: SessionId,
        range: ReplayRange,
    ) -> usize {
        self.query.query_range(handler, session_id, range)
    }

    /// Every published index entry of a session.
    pub fn entries(&self, session_id: SessionId) -> Vec<IndexEntry> {
        self.query.index().entries(session_id)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Flush every mapped file to disk.
    pub fn flush(&self) {
        self.cache.flush_all();
    }
}
