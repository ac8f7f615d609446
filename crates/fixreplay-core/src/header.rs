//! Fixed header at the start of archive and index files.
//!
//! ```text
//! 0        8            16              24         32
//! ├────────┼────────────┼───────────────┼──────────┤
//! │ magic  │ session id │ committed end │ reserved │ records…
//! ```
//!
//! `committed_end` is the absolute file offset one past the last published
//! record. A zeroed header marks a preallocated file nobody has written yet.

use crate::frame::{get_u64, put_u64};
use crate::types::SessionId;

pub(crate) const FILE_HEADER_LENGTH: usize = 32;

pub(crate) const ARCHIVE_MAGIC: [u8; 8] = *b"FXARCH01";
pub(crate) const INDEX_MAGIC: [u8; 8] = *b"FXRIDX01";

const SESSION_OFFSET: usize = 8;
const COMMITTED_END_OFFSET: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HeaderState {
    /// Never written.
    Empty,
    Valid { committed_end: usize },
    /// A well-formed header that belongs to another session.
    OtherSession(SessionId),
    Corrupt(String),
}

/// Inspect the header of a mapped file.
pub(crate) fn read_header(bytes: &[u8], magic: [u8; 8], session_id: SessionId) -> HeaderState {
    if bytes.len() < FILE_HEADER_LENGTH {
        return HeaderState::Corrupt(format!(
            "{} bytes is shorter than the file header",
            bytes.len()
        ));
    }
    let head = &bytes[..FILE_HEADER_LENGTH];
    if head.iter().all(|&b| b == 0) {
        return HeaderState::Empty;
    }
    if head[..8] != magic {
        return HeaderState::Corrupt("unrecognised file magic".to_string());
    }
    let owner = get_u64(head, SESSION_OFFSET);
    if owner != session_id {
        return HeaderState::OtherSession(owner);
    }
    let committed_end = get_u64(head, COMMITTED_END_OFFSET);
    if committed_end < FILE_HEADER_LENGTH as u64 || committed_end > bytes.len() as u64 {
        return HeaderState::Corrupt(format!(
            "committed end {committed_end} outside file of {} bytes",
            bytes.len()
        ));
    }
    HeaderState::Valid {
        committed_end: committed_end as usize,
    }
}

/// Stamp a fresh header with no records committed.
pub(crate) fn init_header(bytes: &mut [u8], magic: [u8; 8], session_id: SessionId) {
    bytes[..8].copy_from_slice(&magic);
    put_u64(bytes, SESSION_OFFSET, session_id);
    put_u64(bytes, COMMITTED_END_OFFSET, FILE_HEADER_LENGTH as u64);
    put_u64(bytes, COMMITTED_END_OFFSET + 8, 0);
}

/// Publish a new committed end. Record bytes must already be in place.
pub(crate) fn publish_end(bytes: &mut [u8], committed_end: usize) {
    put_u64(bytes, COMMITTED_END_OFFSET, committed_end as u64);
}
