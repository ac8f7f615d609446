//! Per-session replay index.
//!
//! The index maps `(sequence index, sequence number)` to the archive position
//! of the frame carrying that message. It is fed once per archived frame by
//! the writer path and is append-only: entries are fixed-size records laid
//! out after the file header in write order, which keeps them sorted by key.
//!
//! Entry layout (32 bytes, little-endian):
//!
//! ```text
//! 0            8           16        20        24             28      32
//! ├────────────┼───────────┼─────────┼─────────┼──────────────┼───────┤
//! │ session id │ position  │ seq idx │ seq num │ frame length │ crc32 │
//! ```
//!
//! The checksum covers the first 28 bytes, so a zero-filled slot never
//! decodes as an entry.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::config::ReplayConfig;
use crate::error::{ErrorSink, ReplayError};
use crate::frame::{FrameHeader, get_u32, get_u64, put_u32, put_u64};
use crate::header::{
    FILE_HEADER_LENGTH, HeaderState, INDEX_MAGIC, init_header, publish_end, read_header,
};
use crate::mapped_cache::{FileIdentity, MappedFileCache, OpenMode};
use crate::types::{ReplayRange, SequenceKey, SessionId, StreamId, UpperBound};

/// Size of one index entry on disk.
pub const INDEX_ENTRY_LENGTH: usize = 32;

const CHECKED_LENGTH: usize = 28;

/// One indexed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub session_id: SessionId,
    pub key: SequenceKey,
    /// Archive offset of the frame header.
    pub position: u64,
    pub frame_length: u32,
}

impl IndexEntry {
    #[must_use]
    pub fn encode(&self) -> [u8; INDEX_ENTRY_LENGTH] {
        let mut out = [0u8; INDEX_ENTRY_LENGTH];
        put_u64(&mut out, 0, self.session_id);
        put_u64(&mut out, 8, self.position);
        put_u32(&mut out, 16, self.key.sequence_index);
        put_u32(&mut out, 20, self.key.sequence_number);
        put_u32(&mut out, 24, self.frame_length);
        let crc = crc32fast::hash(&out[..CHECKED_LENGTH]);
        put_u32(&mut out, CHECKED_LENGTH, crc);
        out
    }

    /// Decode an entry, or `None` when the bytes are short or fail their
    /// checksum.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..INDEX_ENTRY_LENGTH)?;
        if crc32fast::hash(&bytes[..CHECKED_LENGTH]) != get_u32(bytes, CHECKED_LENGTH) {
            return None;
        }
        Some(Self {
            session_id: get_u64(bytes, 0),
            position: get_u64(bytes, 8),
            key: SequenceKey::new(get_u32(bytes, 16), get_u32(bytes, 20)),
            frame_length: get_u32(bytes, 24),
        })
    }
}

/// Result of offering a record to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed(IndexEntry),
    /// The index file has no room for another entry.
    Full,
    /// The key sorts before the session's last indexed key.
    OutOfOrder,
    /// The record bytes could not be interpreted.
    Malformed,
    /// The record belongs to a stream this index does not cover.
    StreamMismatch,
    /// The index file could not be mapped or is unusable.
    Unavailable,
}

impl IndexOutcome {
    #[must_use]
    pub const fn entry(&self) -> Option<&IndexEntry> {
        match self {
            Self::Indexed(entry) => Some(entry),
            _ => None,
        }
    }
}

fn on_entry_boundary(committed_end: usize) -> bool {
    (committed_end - FILE_HEADER_LENGTH) % INDEX_ENTRY_LENGTH == 0
}

// =============================================================================
// Writer
// =============================================================================

/// Builds the per-session index as frames are archived.
pub struct ReplayIndex {
    dir: PathBuf,
    stream_id: StreamId,
    file_size: u64,
    cache: Arc<MappedFileCache>,
    errors: Arc<dyn ErrorSink>,
    full_reported: Mutex<HashSet<SessionId>>,
    corrupt_reported: Mutex<HashSet<SessionId>>,
}

impl fmt::Debug for ReplayIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayIndex")
            .field("dir", &self.dir)
            .field("stream_id", &self.stream_id)
            .field("file_size", &self.file_size)
            .finish_non_exhaustive()
    }
}

/// Where the next entry goes and the key it must not sort below.
struct Cursor {
    end: usize,
    last_key: Option<SequenceKey>,
}

impl ReplayIndex {
    pub fn new(
        config: &ReplayConfig,
        cache: Arc<MappedFileCache>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            dir: config.log_dir.clone(),
            stream_id: config.stream_id,
            file_size: config.index_file_size,
            cache,
            errors,
            full_reported: Mutex::new(HashSet::new()),
            corrupt_reported: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Index the frame at `buffer[offset..offset + length]`, which the
    /// archive placed so that it ends at `end_position`.
    pub fn index_record(
        &self,
        buffer: &[u8],
        offset: usize,
        length: usize,
        stream_id: StreamId,
        session_id: SessionId,
        end_position: u64,
    ) -> IndexOutcome {
        if stream_id != self.stream_id {
            tracing::trace!(stream_id, expected = self.stream_id, "ignoring foreign stream");
            return IndexOutcome::StreamMismatch;
        }
        let Some(entry) = Self::entry_for(buffer, offset, length, session_id, end_position) else {
            tracing::debug!(session_id, offset, length, end_position, "malformed record");
            return IndexOutcome::Malformed;
        };

        let identity = FileIdentity::index(&self.dir, session_id, self.stream_id);
        let Some(lease) = self
            .cache
            .acquire(&identity, OpenMode::CreateWithSize(self.file_size))
        else {
            return IndexOutcome::Unavailable;
        };
        let mut map = lease.write();
        let cursor = match read_header(&map, INDEX_MAGIC, session_id) {
            HeaderState::Empty => {
                init_header(&mut map, INDEX_MAGIC, session_id);
                Ok(Cursor {
                    end: FILE_HEADER_LENGTH,
                    last_key: None,
                })
            }
            HeaderState::Valid { committed_end } if on_entry_boundary(committed_end) => {
                recover_cursor(&map, committed_end, session_id)
                    .ok_or_else(|| "last committed entry fails checksum".to_string())
            }
            HeaderState::Valid { committed_end } => Err(format!(
                "committed end {committed_end} is not on an entry boundary"
            )),
            HeaderState::OtherSession(owner) => Err(format!("header belongs to session {owner}")),
            HeaderState::Corrupt(reason) => Err(reason),
        };
        let cursor = match cursor {
            Ok(cursor) => cursor,
            Err(reason) => {
                drop(map);
                drop(lease);
                self.report_corrupt_once(&identity, reason);
                return IndexOutcome::Unavailable;
            }
        };

        if let Some(last) = cursor.last_key {
            if entry.key < last {
                tracing::debug!(session_id, key = %entry.key, last = %last, "out of order record");
                return IndexOutcome::OutOfOrder;
            }
        }
        let next = cursor.end + INDEX_ENTRY_LENGTH;
        if next > map.len() {
            let capacity = map.len() as u64;
            drop(map);
            drop(lease);
            self.report_full(session_id, capacity);
            return IndexOutcome::Full;
        }
        map[cursor.end..next].copy_from_slice(&entry.encode());
        publish_end(&mut map, next);
        drop(map);

        tracing::trace!(
            session_id,
            key = %entry.key,
            position = entry.position,
            "indexed record"
        );
        IndexOutcome::Indexed(entry)
    }

    fn entry_for(
        buffer: &[u8],
        offset: usize,
        length: usize,
        session_id: SessionId,
        end_position: u64,
    ) -> Option<IndexEntry> {
        let frame = buffer.get(offset..offset.checked_add(length)?)?;
        let header = FrameHeader::decode(frame).ok()?;
        if header.session_id != session_id || header.frame_length() > length {
            return None;
        }
        let position = end_position.checked_sub(header.aligned_length() as u64)?;
        Some(IndexEntry {
            session_id,
            key: header.key,
            position,
            frame_length: header.frame_length,
        })
    }

    fn report_full(&self, session_id: SessionId, capacity: u64) {
        if first_report(&self.full_reported, session_id) {
            tracing::warn!(session_id, capacity, "replay index full, refusing records");
            self.errors.on_error(&ReplayError::IndexFull {
                session_id,
                capacity,
            });
        }
    }

    fn report_corrupt_once(&self, identity: &FileIdentity, reason: String) {
        if first_report(&self.corrupt_reported, identity.session_id) {
            tracing::warn!(
                session_id = identity.session_id,
                path = %identity.path.display(),
                %reason,
                "replay index unusable, refusing records"
            );
            self.errors.on_error(&ReplayError::CorruptFile {
                path: identity.path.clone(),
                reason,
            });
        }
    }
}

/// True the first time `session_id` is recorded in `reported`.
fn first_report(reported: &Mutex<HashSet<SessionId>>, session_id: SessionId) -> bool {
    reported
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(session_id)
}

/// Cursor from the published end plus any complete entries written past it
/// before a crash could publish them.
fn recover_cursor(map: &[u8], committed_end: usize, session_id: SessionId) -> Option<Cursor> {
    let mut last_key = if committed_end > FILE_HEADER_LENGTH {
        Some(IndexEntry::decode(&map[committed_end - INDEX_ENTRY_LENGTH..])?.key)
    } else {
        None
    };
    let mut end = committed_end;
    while let Some(entry) = map.get(end..).and_then(IndexEntry::decode) {
        let sorted = last_key.is_none_or(|last| entry.key >= last);
        if entry.session_id != session_id || !sorted {
            break;
        }
        last_key = Some(entry.key);
        end += INDEX_ENTRY_LENGTH;
    }
    if end != committed_end {
        tracing::info!(
            session_id,
            committed_end,
            recovered_end = end,
            "recovered unpublished index entries"
        );
    }
    Some(Cursor { end, last_key })
}

// =============================================================================
// Reader
// =============================================================================

/// Read side of the replay index.
#[derive(Clone)]
pub struct IndexReader {
    dir: PathBuf,
    stream_id: StreamId,
    cache: Arc<MappedFileCache>,
    errors: Arc<dyn ErrorSink>,
}

impl fmt::Debug for IndexReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexReader")
            .field("dir", &self.dir)
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

impl IndexReader {
    pub fn new(
        config: &ReplayConfig,
        cache: Arc<MappedFileCache>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            dir: config.log_dir.clone(),
            stream_id: config.stream_id,
            cache,
            errors,
        }
    }

    /// Published entries whose key lies in `range`, in stored order.
    ///
    /// The committed end is read once, so entries published while the scan
    /// runs are not included. The index lease is released before returning.
    pub fn scan(&self, session_id: SessionId, range: &ReplayRange) -> Vec<IndexEntry> {
        let identity = FileIdentity::index(&self.dir, session_id, self.stream_id);
        let (matched, fault) = self.scan_mapped(&identity, range);
        if let Some(reason) = fault {
            self.report_corrupt(&identity, reason);
        }
        matched
    }

    /// Scan under the mapping lock; a fault is returned for reporting after
    /// the lock is released.
    fn scan_mapped(
        &self,
        identity: &FileIdentity,
        range: &ReplayRange,
    ) -> (Vec<IndexEntry>, Option<String>) {
        let mut matched = Vec::new();
        let Some(lease) = self.cache.acquire(identity, OpenMode::ExistingOnly) else {
            return (matched, None);
        };
        let map = lease.read();
        let committed_end = match committed_end(&map, identity.session_id) {
            Ok(Some(committed_end)) => committed_end,
            Ok(None) => return (matched, None),
            Err(reason) => return (matched, Some(reason)),
        };

        let mut at = FILE_HEADER_LENGTH;
        while at + INDEX_ENTRY_LENGTH <= committed_end {
            let Some(entry) = IndexEntry::decode(&map[at..]) else {
                return (matched, Some(format!("entry at offset {at} fails checksum")));
            };
            if entry.session_id != identity.session_id {
                let reason = format!("entry at offset {at} names session {}", entry.session_id);
                return (matched, Some(reason));
            }
            if range.is_past_end(entry.key) {
                break;
            }
            if entry.key >= range.begin {
                matched.push(entry);
            }
            at += INDEX_ENTRY_LENGTH;
        }
        (matched, None)
    }

    /// Every published entry of the session.
    pub fn entries(&self, session_id: SessionId) -> Vec<IndexEntry> {
        self.scan(
            session_id,
            &ReplayRange::new(SequenceKey::new(0, 0), UpperBound::MostRecent),
        )
    }

    /// The most recently published entry.
    pub fn latest(&self, session_id: SessionId) -> Option<IndexEntry> {
        let identity = FileIdentity::index(&self.dir, session_id, self.stream_id);
        let lease = self.cache.acquire(&identity, OpenMode::ExistingOnly)?;
        let map = lease.read();
        let committed_end = match committed_end(&map, session_id) {
            Ok(committed_end) => committed_end?,
            Err(reason) => {
                drop(map);
                drop(lease);
                self.report_corrupt(&identity, reason);
                return None;
            }
        };
        if committed_end == FILE_HEADER_LENGTH {
            return None;
        }
        IndexEntry::decode(&map[committed_end - INDEX_ENTRY_LENGTH..])
    }

    fn report_corrupt(&self, identity: &FileIdentity, reason: String) {
        self.errors.on_error(&ReplayError::CorruptFile {
            path: identity.path.clone(),
            reason,
        });
    }
}

/// Published end of a readable index; `Ok(None)` for a file never written.
fn committed_end(map: &[u8], session_id: SessionId) -> Result<Option<usize>, String> {
    match read_header(map, INDEX_MAGIC, session_id) {
        HeaderState::Empty => Ok(None),
        HeaderState::Valid { committed_end } if on_entry_boundary(committed_end) => {
            Ok(Some(committed_end))
        }
        HeaderState::Valid { committed_end } => Err(format!(
            "committed end {committed_end} is not on an entry boundary"
        )),
        HeaderState::OtherSession(owner) => Err(format!("header belongs to session {owner}")),
        HeaderState::Corrupt(reason) => Err(reason),
    }
}
