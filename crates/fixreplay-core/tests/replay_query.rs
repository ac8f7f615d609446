//! Query engine scenarios against a real index and a scripted archive.
//!
//! The archive side is replaced by `ScriptedArchive`, which records every
//! reader it hands out and every positioned read, so the tests can assert
//! exactly which reads a query performed.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use memmap2::MmapMut;

use fixreplay_core::frame::{align_frame, encode_frame};
use fixreplay_core::{
    ArchiveSource, CollectingErrorSink, ControlAction, ErrorClass, ErrorSink, FileRegionFactory,
    FrameHandler, IndexEntry, IndexReader, MOST_RECENT_MESSAGE, MappedFileCache, OpenMode,
    ReadOutcome, RegionFactory, ReplayConfig, ReplayIndex, ReplayQuery, SequenceKey, SessionId,
    SessionReader,
};

const SESSION_A: SessionId = 1;
const SESSION_B: SessionId = 2;

// =============================================================================
// Test doubles
// =============================================================================

#[derive(Default)]
struct ReaderLog {
    sessions: Vec<SessionId>,
    reads: Vec<(SessionId, u64)>,
}

/// Archive source whose readers follow a script of outcomes. Unscripted reads
/// deliver an 8-byte frame holding the position.
#[derive(Clone, Default)]
struct ScriptedArchive {
    log: Arc<Mutex<ReaderLog>>,
    script: Arc<Mutex<VecDeque<ReadOutcome>>>,
}

impl ScriptedArchive {
    fn script(&self, outcomes: impl IntoIterator<Item = ReadOutcome>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    fn sessions(&self) -> Vec<SessionId> {
        self.log.lock().unwrap().sessions.clone()
    }

    fn reads(&self) -> Vec<(SessionId, u64)> {
        self.log.lock().unwrap().reads.clone()
    }
}

struct ScriptedReader {
    session_id: SessionId,
    archive: ScriptedArchive,
}

impl ArchiveSource for ScriptedArchive {
    type Reader = ScriptedReader;

    fn session(&self, session_id: SessionId) -> ScriptedReader {
        self.log.lock().unwrap().sessions.push(session_id);
        ScriptedReader {
            session_id,
            archive: self.clone(),
        }
    }
}

impl SessionReader for ScriptedReader {
    fn read(&mut self, position: u64, handler: &mut dyn FrameHandler) -> ReadOutcome {
        self.archive
            .log
            .lock()
            .unwrap()
            .reads
            .push((self.session_id, position));
        if let Some(outcome) = self.archive.script.lock().unwrap().pop_front() {
            return outcome;
        }
        match handler.on_frame(&position.to_le_bytes()) {
            ControlAction::Continue => ReadOutcome::NextPosition(position + 64),
            ControlAction::Abort => ReadOutcome::Aborted,
        }
    }
}

/// Counts successful mappings per path.
#[derive(Clone, Default)]
struct CountingFactory {
    maps: Arc<Mutex<HashMap<PathBuf, usize>>>,
}

impl CountingFactory {
    fn count(&self, path: &Path) -> usize {
        self.maps.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

impl RegionFactory for CountingFactory {
    fn map(&self, path: &Path, mode: OpenMode) -> io::Result<Option<MmapMut>> {
        let map = FileRegionFactory.map(path, mode)?;
        if map.is_some() {
            *self.maps.lock().unwrap().entry(path.to_path_buf()).or_default() += 1;
        }
        Ok(map)
    }
}

/// Refuses every path `refuses` selects; maps the rest as files.
struct RefusingFactory {
    refuses: fn(&Path) -> bool,
}

impl RegionFactory for RefusingFactory {
    fn map(&self, path: &Path, mode: OpenMode) -> io::Result<Option<MmapMut>> {
        if (self.refuses)(path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "mapping refused"));
        }
        FileRegionFactory.map(path, mode)
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    _tmp: tempfile::TempDir,
    config: ReplayConfig,
    sink: Arc<CollectingErrorSink>,
    factory: CountingFactory,
    index: ReplayIndex,
    archive: ScriptedArchive,
    query: ReplayQuery<ScriptedArchive>,
    next_position: HashMap<SessionId, u64>,
}

impl Harness {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let config = ReplayConfig {
            index_file_size: 16 * 1024,
            ..ReplayConfig::for_dir(tmp.path())
        };
        let sink = Arc::new(CollectingErrorSink::new());
        let factory = CountingFactory::default();
        let archive = ScriptedArchive::default();
        let (index, query) = components(&config, &sink, &factory, &archive);
        Self {
            _tmp: tmp,
            config,
            sink,
            factory,
            index,
            archive,
            query,
            next_position: HashMap::new(),
        }
    }

    /// Fresh cache, index and query engine over the same directory, as after
    /// a process restart.
    fn rebuild(&mut self) {
        (self.index, self.query) = components(&self.config, &self.sink, &self.factory, &self.archive);
    }

    fn index_record(&mut self, session_id: SessionId, idx: u32, num: u32) -> IndexEntry {
        let frame = encode_frame(session_id, SequenceKey::new(idx, num), b"8=FIX.4.4\x0135=0\x01")
            .unwrap();
        let start = self.next_position.get(&session_id).copied().unwrap_or(32);
        let end = start + align_frame(frame.len()) as u64;
        let outcome = self.index.index_record(
            &frame,
            0,
            frame.len(),
            self.config.stream_id,
            session_id,
            end,
        );
        let entry = *outcome.entry().unwrap();
        self.next_position.insert(session_id, end);
        entry
    }

    fn query(
        &self,
        session_id: SessionId,
        begin_seq_num: u32,
        begin_seq_idx: u32,
        end_seq_num: u32,
        end_seq_idx: u32,
    ) -> usize {
        let mut handler = |_: &[u8]| ControlAction::Continue;
        self.query.query(
            &mut handler,
            session_id,
            begin_seq_num,
            begin_seq_idx,
            end_seq_num,
            end_seq_idx,
        )
    }

    fn index_maps(&self, session_id: SessionId) -> usize {
        self.factory.count(&self.config.index_path(session_id))
    }
}

fn components(
    config: &ReplayConfig,
    sink: &Arc<CollectingErrorSink>,
    factory: &CountingFactory,
    archive: &ScriptedArchive,
) -> (ReplayIndex, ReplayQuery<ScriptedArchive>) {
    let errors = Arc::clone(sink) as Arc<dyn ErrorSink>;
    let cache = Arc::new(MappedFileCache::with_factory(
        4,
        2,
        factory.clone(),
        Arc::clone(&errors),
    ));
    let index = ReplayIndex::new(config, Arc::clone(&cache), Arc::clone(&errors));
    let query = ReplayQuery::with_archive(IndexReader::new(config, cache, errors), archive.clone());
    (index, query)
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn exact_range_delivers_single_record_and_maps_index_once() {
    let mut h = Harness::new();
    let entry = h.index_record(SESSION_A, 1, 1);

    assert_eq!(h.query(SESSION_A, 1, 1, 1, 1), 1);
    assert_eq!(h.archive.reads(), vec![(SESSION_A, entry.position)]);
    assert_eq!(h.index_maps(SESSION_A), 1);
    assert!(h.sink.is_empty());
}

#[test]
fn unknown_session_delivers_nothing_and_creates_no_reader() {
    let mut h = Harness::new();
    h.index_record(SESSION_A, 1, 1);

    assert_eq!(h.query(SESSION_B, 1, 1, 1, 1), 0);
    assert!(h.archive.sessions().is_empty());
    assert!(h.archive.reads().is_empty());
    assert!(!h.config.index_path(SESSION_B).exists());
    assert!(h.sink.is_empty());
}

#[test]
fn range_after_indexed_entries_delivers_nothing() {
    let mut h = Harness::new();
    h.index_record(SESSION_A, 1, 1);

    assert_eq!(h.query(SESSION_A, 1001, 1, 1002, 1), 0);
    assert!(h.archive.sessions().is_empty());
    assert!(h.archive.reads().is_empty());
}

#[test]
fn range_before_indexed_entries_delivers_nothing() {
    let mut h = Harness::new();
    h.index_record(SESSION_A, 2, 5);

    assert_eq!(h.query(SESSION_A, 1, 1, 100, 1), 0);
    assert!(h.archive.reads().is_empty());
}

#[test]
fn terminal_outcome_stops_further_reads() {
    let mut h = Harness::new();
    let first = h.index_record(SESSION_A, 1, 1);
    let second = h.index_record(SESSION_A, 1, 2);
    h.index_record(SESSION_A, 1, 3);
    h.archive.script([
        ReadOutcome::NextPosition(100),
        ReadOutcome::SessionMismatch,
    ]);

    assert_eq!(h.query(SESSION_A, 1, 1, 3, 1), 1);
    assert_eq!(
        h.archive.reads(),
        vec![(SESSION_A, first.position), (SESSION_A, second.position)]
    );
}

#[test]
fn end_of_data_mid_scan_keeps_earlier_deliveries() {
    let mut h = Harness::new();
    for num in 1..=4 {
        h.index_record(SESSION_A, 1, num);
    }
    h.archive.script([
        ReadOutcome::NextPosition(0),
        ReadOutcome::NextPosition(0),
        ReadOutcome::EndOfData,
    ]);

    assert_eq!(h.query(SESSION_A, 1, 1, 4, 1), 2);
    assert_eq!(h.archive.reads().len(), 3);
}

#[test]
fn scan_crossing_sequence_index_boundary_includes_both_epochs() {
    let mut h = Harness::new();
    h.index_record(SESSION_A, 1, 1);
    h.index_record(SESSION_A, 2, 1);

    assert_eq!(h.query(SESSION_A, 1, 1, 1, 2), 2);
}

#[test]
fn sequence_number_reset_orders_by_index_first() {
    let mut h = Harness::new();
    for num in [7, 8, 9] {
        h.index_record(SESSION_A, 1, num);
    }
    for num in [1, 2] {
        h.index_record(SESSION_A, 2, num);
    }

    // (1,8) through (2,1): 8, 9 from the first epoch, 1 from the second.
    assert_eq!(h.query(SESSION_A, 8, 1, 1, 2), 3);
}

#[test]
fn most_recent_sentinel_replays_through_latest() {
    let mut h = Harness::new();
    for num in 1..=5 {
        h.index_record(SESSION_A, 1, num);
    }
    h.index_record(SESSION_A, 2, 1);

    assert_eq!(h.query(SESSION_A, 3, 1, MOST_RECENT_MESSAGE, 0), 4);
    // The end sequence index is ignored with the sentinel.
    assert_eq!(h.query(SESSION_A, 3, 1, MOST_RECENT_MESSAGE, 1), 4);
}

#[test]
fn inverted_range_touches_nothing() {
    let mut h = Harness::new();
    h.index_record(SESSION_A, 1, 1);
    let maps_before = h.index_maps(SESSION_A);

    assert_eq!(h.query(SESSION_A, 5, 2, 1, 1), 0);
    assert!(h.archive.sessions().is_empty());
    assert_eq!(h.index_maps(SESSION_A), maps_before);
}

#[test]
fn aborted_read_is_not_counted() {
    let mut h = Harness::new();
    for num in 1..=3 {
        h.index_record(SESSION_A, 1, num);
    }
    let mut calls = 0;
    let mut handler = |_: &[u8]| {
        calls += 1;
        if calls == 2 {
            ControlAction::Abort
        } else {
            ControlAction::Continue
        }
    };
    let delivered = h.query.query(&mut handler, SESSION_A, 1, 1, 3, 1);
    assert_eq!(delivered, 1);
    assert_eq!(h.archive.reads().len(), 2);
}

#[test]
fn sessions_do_not_see_each_other() {
    let mut h = Harness::new();
    h.index_record(SESSION_A, 1, 1);
    h.index_record(SESSION_B, 1, 1);
    h.index_record(SESSION_B, 1, 2);

    assert_eq!(h.query(SESSION_A, 1, 1, MOST_RECENT_MESSAGE, 0), 1);
    assert_eq!(h.query(SESSION_B, 1, 1, MOST_RECENT_MESSAGE, 0), 2);
    assert_eq!(h.archive.sessions(), vec![SESSION_A, SESSION_B]);
}

// =============================================================================
// Restart recovery
// =============================================================================

#[test]
fn restart_over_empty_index_file_keeps_first_record() {
    let mut h = Harness::new();
    std::fs::File::create(h.config.index_path(SESSION_A)).unwrap();

    let first = h.index_record(SESSION_A, 1, 1);
    h.rebuild();
    let second = h.index_record(SESSION_A, 1, 2);

    assert_eq!(h.query(SESSION_A, 1, 1, 1, 1), 1);
    assert_eq!(h.archive.reads(), vec![(SESSION_A, first.position)]);

    assert_eq!(h.query(SESSION_A, 1, 1, 2, 1), 2);
    assert_eq!(
        h.query.index().entries(SESSION_A),
        vec![first, second],
        "entries neither lost nor duplicated"
    );
}

#[test]
fn restart_without_new_records_still_answers() {
    let mut h = Harness::new();
    h.index_record(SESSION_A, 1, 1);
    h.index_record(SESSION_A, 1, 2);
    h.rebuild();

    assert_eq!(h.query(SESSION_A, 1, 1, MOST_RECENT_MESSAGE, 0), 2);
    assert_eq!(h.index_maps(SESSION_A), 2, "one mapping per process lifetime");
}

/// Query engine over the real archive reader whose cache maps through
/// `factory`.
fn file_backed_query(
    config: &ReplayConfig,
    factory: RefusingFactory,
) -> (ReplayQuery, Arc<CollectingErrorSink>) {
    let sink = Arc::new(CollectingErrorSink::new());
    let errors = Arc::clone(&sink) as Arc<dyn ErrorSink>;
    let cache = Arc::new(MappedFileCache::with_factory(4, 2, factory, Arc::clone(&errors)));
    (ReplayQuery::new(config, cache, errors), sink)
}

#[test]
fn unmappable_index_delivers_nothing_and_reports_io() {
    let mut h = Harness::new();
    h.index_record(SESSION_A, 1, 1);
    h.index_record(SESSION_A, 1, 2);

    let (query, sink) = file_backed_query(&h.config, RefusingFactory { refuses: |_| true });
    let mut delivered_frames = 0;
    let mut handler = |_: &[u8]| {
        delivered_frames += 1;
        ControlAction::Continue
    };
    assert_eq!(
        query.query(&mut handler, SESSION_A, 1, 1, MOST_RECENT_MESSAGE, 0),
        0
    );
    assert_eq!(delivered_frames, 0);
    assert_eq!(sink.classes(), vec![ErrorClass::Io]);
}

#[test]
fn unmappable_archive_delivers_nothing_and_reports_io() {
    let mut h = Harness::new();
    h.index_record(SESSION_A, 1, 1);
    h.index_record(SESSION_A, 1, 2);

    let (query, sink) = file_backed_query(
        &h.config,
        RefusingFactory {
            refuses: |path| path.extension().is_some_and(|ext| ext == "log"),
        },
    );
    assert_eq!(query.index().entries(SESSION_A).len(), 2);

    let mut handler = |_: &[u8]| ControlAction::Continue;
    assert_eq!(query.query(&mut handler, SESSION_A, 1, 1, 2, 1), 0);
    assert_eq!(sink.classes(), vec![ErrorClass::Io]);
}
