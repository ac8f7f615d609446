//! Append-only per-session archive and positioned readers.
//!
//! Each `(session, stream)` pair owns one preallocated archive file mapped
//! through the shared [`MappedFileCache`]. The writer appends whole frames at
//! the committed end and then publishes the new end in the file header; a
//! reader positioned on a frame boundary replays one frame per call and
//! reports where the next one starts.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ReplayConfig;
use crate::error::{ErrorSink, ReplayError, Result};
use crate::frame::{FRAME_ALIGNMENT, FRAME_HEADER_LENGTH, FrameHeader, FrameView, encode_frame};
use crate::header::{
    ARCHIVE_MAGIC, FILE_HEADER_LENGTH, HeaderState, init_header, publish_end, read_header,
};
use crate::mapped_cache::{FileIdentity, MappedFileCache, OpenMode};
use crate::types::{SequenceKey, SessionId, StreamId};

// =============================================================================
// Handler contract
// =============================================================================

/// What a frame handler wants the reader to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Continue,
    Abort,
}

/// Consumer of replayed frames.
///
/// Receives the complete frame (header and body) exactly as it was archived.
pub trait FrameHandler {
    fn on_frame(&mut self, frame: &[u8]) -> ControlAction;
}

impl<F> FrameHandler for F
where
    F: FnMut(&[u8]) -> ControlAction,
{
    fn on_frame(&mut self, frame: &[u8]) -> ControlAction {
        self(frame)
    }
}

/// Result of one positioned read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The handler consumed the frame; the next frame starts here.
    NextPosition(u64),
    /// No archive for this session, or the data belongs to another session.
    SessionMismatch,
    /// Nothing readable at this position.
    EndOfData,
    /// The handler returned [`ControlAction::Abort`].
    Aborted,
}

impl ReadOutcome {
    /// True only when the handler successfully consumed a frame.
    #[must_use]
    pub const fn is_delivered(self) -> bool {
        matches!(self, Self::NextPosition(_))
    }
}

/// Reader bound to one session's archive.
pub trait SessionReader {
    fn read(&mut self, position: u64, handler: &mut dyn FrameHandler) -> ReadOutcome;
}

/// Hands out session readers.
pub trait ArchiveSource {
    type Reader: SessionReader;

    fn session(&self, session_id: SessionId) -> Self::Reader;
}

// =============================================================================
// Writer
// =============================================================================

/// Location of a frame written by [`ArchiveWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendedRecord {
    pub session_id: SessionId,
    pub key: SequenceKey,
    /// Offset of the frame header.
    pub position: u64,
    /// Offset just past the aligned frame; where the next frame goes.
    pub end_position: u64,
    /// Unaligned frame length, header included.
    pub frame_length: u32,
}

/// Appends frames to per-session archive files.
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    dir: PathBuf,
    stream_id: StreamId,
    file_size: u64,
    cache: Arc<MappedFileCache>,
}

impl ArchiveWriter {
    pub fn new(config: &ReplayConfig, cache: Arc<MappedFileCache>) -> Self {
        Self {
            dir: config.log_dir.clone(),
            stream_id: config.stream_id,
            file_size: config.archive_file_size,
            cache,
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Encode `body` as a frame and append it to the session's archive.
    pub fn append(
        &self,
        session_id: SessionId,
        key: SequenceKey,
        body: &[u8],
    ) -> Result<AppendedRecord> {
        let frame = encode_frame(session_id, key, body)?;
        self.append_frame(&frame)
    }

    /// Append an already encoded frame. The session comes from the frame
    /// header.
    pub fn append_frame(&self, frame: &[u8]) -> Result<AppendedRecord> {
        let view = FrameView::parse(frame)?;
        if frame.len() != view.header.frame_length() {
            return Err(ReplayError::malformed(format!(
                "{} trailing bytes after frame",
                frame.len() - view.header.frame_length()
            )));
        }
        let session_id = view.header.session_id;
        let identity = FileIdentity::archive(&self.dir, session_id, self.stream_id);
        let lease = self
            .cache
            .acquire(&identity, OpenMode::CreateWithSize(self.file_size))
            .ok_or_else(|| ReplayError::Unavailable {
                session_id,
                path: identity.path.clone(),
            })?;

        let mut map = lease.write();
        let start = match read_header(&map, ARCHIVE_MAGIC, session_id) {
            HeaderState::Empty => {
                init_header(&mut map, ARCHIVE_MAGIC, session_id);
                FILE_HEADER_LENGTH
            }
            HeaderState::Valid { committed_end } => {
                recover_end(&map, committed_end, session_id)
            }
            HeaderState::OtherSession(owner) => {
                return Err(ReplayError::CorruptFile {
                    path: identity.path,
                    reason: format!("header belongs to session {owner}"),
                });
            }
            HeaderState::Corrupt(reason) => {
                return Err(ReplayError::CorruptFile {
                    path: identity.path,
                    reason,
                });
            }
        };

        let aligned = view.header.aligned_length();
        let end = start + aligned;
        if end > map.len() {
            return Err(ReplayError::ArchiveFull {
                session_id,
                needed: aligned as u64,
                capacity: map.len() as u64,
            });
        }
        map[start..start + frame.len()].copy_from_slice(frame);
        map[start + frame.len()..end].fill(0);
        publish_end(&mut map, end);
        drop(map);

        tracing::trace!(
            session_id,
            stream_id = self.stream_id,
            position = start,
            key = %view.header.key,
            "archived frame"
        );
        Ok(AppendedRecord {
            session_id,
            key: view.header.key,
            position: start as u64,
            end_position: end as u64,
            frame_length: view.header.frame_length,
        })
    }
}

/// Walk forward from the published end over complete frames written before
/// a crash could publish them.
fn recover_end(map: &[u8], committed_end: usize, session_id: SessionId) -> usize {
    let mut end = committed_end;
    while let Ok(view) = FrameView::parse(&map[end..]) {
        let next = end + view.header.aligned_length();
        if view.header.session_id != session_id || next > map.len() {
            break;
        }
        end = next;
    }
    if end != committed_end {
        tracing::info!(
            session_id,
            committed_end,
            recovered_end = end,
            "recovered unpublished archive frames"
        );
    }
    end
}

// =============================================================================
// Reader
// =============================================================================

/// Produces [`ArchiveSessionReader`]s over archive files on disk.
#[derive(Clone)]
pub struct ArchiveReader {
    dir: PathBuf,
    stream_id: StreamId,
    cache: Arc<MappedFileCache>,
    errors: Arc<dyn ErrorSink>,
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("dir", &self.dir)
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

impl ArchiveReader {
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
}

impl ArchiveSource for ArchiveReader {
    type Reader = ArchiveSessionReader;

    fn session(&self, session_id: SessionId) -> ArchiveSessionReader {
        ArchiveSessionReader {
            identity: FileIdentity::archive(&self.dir, session_id, self.stream_id),
            cache: Arc::clone(&self.cache),
            errors: Arc::clone(&self.errors),
            scratch: Vec::new(),
        }
    }
}

/// Positioned reader over one session's archive.
pub struct ArchiveSessionReader {
    identity: FileIdentity,
    cache: Arc<MappedFileCache>,
    errors: Arc<dyn ErrorSink>,
    scratch: Vec<u8>,
}

impl std::fmt::Debug for ArchiveSessionReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSessionReader")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

enum Located {
    Frame { next: usize },
    Stop(ReadOutcome),
    /// A fault to report once the mapping is released.
    Fault(ReplayError, ReadOutcome),
}

impl ArchiveSessionReader {
    /// Copy the frame at `position` into the scratch buffer. The mapping is
    /// only locked for the duration of this call; faults are returned so they
    /// reach the sink after the lock is gone.
    fn locate(&mut self, position: u64) -> Located {
        let Some(lease) = self.cache.acquire(&self.identity, OpenMode::ExistingOnly) else {
            return Located::Stop(ReadOutcome::SessionMismatch);
        };
        let map = lease.read();
        let session_id = self.identity.session_id;
        let committed_end = match read_header(&map, ARCHIVE_MAGIC, session_id) {
            HeaderState::Valid { committed_end } => committed_end,
            HeaderState::Empty => return Located::Stop(ReadOutcome::EndOfData),
            HeaderState::OtherSession(_) => return Located::Stop(ReadOutcome::SessionMismatch),
            HeaderState::Corrupt(reason) => {
                return Located::Fault(
                    ReplayError::CorruptFile {
                        path: self.identity.path.clone(),
                        reason,
                    },
                    ReadOutcome::SessionMismatch,
                );
            }
        };

        let Ok(start) = usize::try_from(position) else {
            return Located::Stop(ReadOutcome::EndOfData);
        };
        if start < FILE_HEADER_LENGTH
            || start % FRAME_ALIGNMENT != 0
            || start > committed_end - FRAME_HEADER_LENGTH
        {
            return Located::Stop(ReadOutcome::EndOfData);
        }

        let header = match FrameHeader::decode(&map[start..committed_end]) {
            Ok(header) => header,
            Err(err) => return self.corrupt_frame(position, err.to_string()),
        };
        if header.session_id != session_id {
            return Located::Stop(ReadOutcome::SessionMismatch);
        }
        let end = start + header.frame_length();
        if end > committed_end {
            return Located::Stop(ReadOutcome::EndOfData);
        }
        if !header.verify(&map[start + FRAME_HEADER_LENGTH..end]) {
            return self.corrupt_frame(position, "body checksum mismatch".to_string());
        }

        self.scratch.clear();
        self.scratch.extend_from_slice(&map[start..end]);
        Located::Frame {
            next: start + header.aligned_length(),
        }
    }

    fn corrupt_frame(&self, position: u64, reason: String) -> Located {
        Located::Fault(
            ReplayError::CorruptFrame {
                path: self.identity.path.clone(),
                position,
                reason,
            },
            ReadOutcome::EndOfData,
        )
    }
}

impl SessionReader for ArchiveSessionReader {
    fn read(&mut self, position: u64, handler: &mut dyn FrameHandler) -> ReadOutcome {
        let outcome = match self.locate(position) {
            Located::Frame { next } => {
                return match handler.on_frame(&self.scratch) {
                    ControlAction::Continue => ReadOutcome::NextPosition(next as u64),
                    ControlAction::Abort => ReadOutcome::Aborted,
                };
            }
            Located::Stop(outcome) => outcome,
            Located::Fault(err, outcome) => {
                self.errors.on_error(&err);
                outcome
            }
        };
        tracing::trace!(
            session_id = self.identity.session_id,
            position,
            ?outcome,
            "archive read stopped"
        );
        outcome
    }
}
