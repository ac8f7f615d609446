//! Error types for fixreplay-core

use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SessionId;

/// Result type alias using the library's error type
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Stable classification for replay errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Filesystem or mapping fault; the affected session degrades to "no data".
    Io,
    /// A file or frame failed validation.
    Corruption,
    /// A preallocated file has no room for another record.
    Capacity,
    /// The caller handed over something unusable.
    Caller,
}

/// Main error type for fixreplay-core
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to map {}: {source}", .path.display())]
    Map {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt file {}: {reason}", .path.display())]
    CorruptFile { path: PathBuf, reason: String },

    #[error("corrupt frame in {} at position {position}: {reason}", .path.display())]
    CorruptFrame {
        path: PathBuf,
        position: u64,
        reason: String,
    },

    #[error("index file for session {session_id} is full ({capacity} bytes)")]
    IndexFull { session_id: SessionId, capacity: u64 },

    #[error(
        "archive for session {session_id} is full: {needed} more bytes do not fit in {capacity}"
    )]
    ArchiveFull {
        session_id: SessionId,
        needed: u64,
        capacity: u64,
    },

    #[error("storage for session {session_id} is unavailable ({})", .path.display())]
    Unavailable { session_id: SessionId, path: PathBuf },

    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("frame body of {len} bytes exceeds the maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse config {}: {source}", .path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },
}

impl ReplayError {
    /// Stable error-class mapping for reporting and policy decisions.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io { .. } | Self::Map { .. } | Self::Unavailable { .. } => ErrorClass::Io,
            Self::CorruptFile { .. } | Self::CorruptFrame { .. } => ErrorClass::Corruption,
            Self::IndexFull { .. } | Self::ArchiveFull { .. } => ErrorClass::Capacity,
            Self::MalformedFrame { .. }
            | Self::FrameTooLarge { .. }
            | Self::InvalidConfig(_)
            | Self::ConfigParse { .. } => ErrorClass::Caller,
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            reason: reason.into(),
        }
    }
}

/// Receiver of storage faults.
///
/// One sink is handed to every component at construction and invoked
/// synchronously on I/O faults, corrupt files and index exhaustion. It is
/// never called for "no data" outcomes such as an unknown session or an
/// out-of-range query.
///
/// No cache or mapping lock is held while the sink runs, so a sink may call
/// back into the store.
pub trait ErrorSink: Send + Sync {
    fn on_error(&self, error: &ReplayError);
}

impl<F> ErrorSink for F
where
    F: Fn(&ReplayError) + Send + Sync,
{
    fn on_error(&self, error: &ReplayError) {
        self(error);
    }
}

/// Sink that logs every fault at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn on_error(&self, error: &ReplayError) {
        tracing::error!(class = ?error.class(), error = %error, "replay storage fault");
    }
}

/// Sink that keeps every reported fault in memory.
#[derive(Debug, Default)]
pub struct CollectingErrorSink {
    reported: Mutex<Vec<(ErrorClass, String)>>,
}

impl CollectingErrorSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of faults reported so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Rendered messages, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.lock().iter().map(|(_, msg)| msg.clone()).collect()
    }

    /// Classes of the reported faults, oldest first.
    pub fn classes(&self) -> Vec<ErrorClass> {
        self.lock().iter().map(|(class, _)| *class).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ErrorClass, String)>> {
        self.reported.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ErrorSink for CollectingErrorSink {
    fn on_error(&self, error: &ReplayError) {
        tracing::debug!(error = %error, "collected replay storage fault");
        self.lock().push((error.class(), error.to_string()));
    }
}
