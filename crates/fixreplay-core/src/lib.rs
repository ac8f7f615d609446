//! fixreplay-core: replay subsystem for a FIX gateway
//!
//! Every inbound and outbound message is appended to a per-session archive
//! log. A compact per-session index maps `(sequence index, sequence number)`
//! to the archive position, and range queries re-deliver the original frame
//! bytes to a caller-supplied handler.
//!
//! # Architecture
//!
//! ```text
//!  writer path                          read path
//!  ───────────                          ─────────
//!  Recorder::record                     ReplayQuery::query
//!     │                                    │
//!     ├─→ ArchiveWriter ──┐        ┌── IndexReader::scan
//!     │                   ▼        ▼       │
//!     └─→ ReplayIndex ─→ MappedFileCache ←─┴── ArchiveReader → FrameHandler
//! ```
//!
//! # Modules
//!
//! - `types`: session ids, sequence keys and replay ranges
//! - `frame`: binary frame layout shared by archive, index and readers
//! - `mapped_cache`: bounded set-associative pool of memory-mapped files
//! - `archive`: append-only archive writer and positioned session readers
//! - `replay_index`: per-session position index and its reader
//! - `replay_query`: range query engine
//! - `recorder`: writer path glue (archive append then index)
//! - `store`: one-call wiring of the above around a shared cache
//! - `config`: configuration surface
//! - `error`: error taxonomy and the error sink
//! - `logging`: tracing subscriber setup

pub mod archive;
pub mod config;
pub mod error;
pub mod frame;
mod header;
pub mod logging;
pub mod mapped_cache;
pub mod recorder;
pub mod replay_index;
pub mod replay_query;
pub mod store;
pub mod types;

pub use archive::{
    AppendedRecord, ArchiveReader, ArchiveSessionReader, ArchiveSource, ArchiveWriter,
    ControlAction, FrameHandler, ReadOutcome, SessionReader,
};
pub use config::ReplayConfig;
pub use error::{CollectingErrorSink, ErrorClass, ErrorSink, ReplayError, Result, TracingErrorSink};
pub use mapped_cache::{
    CacheStats, FileIdentity, FileKind, FileRegionFactory, MappedFileCache, MappedRegion,
    OpenMode, RegionFactory, RegionLease,
};
pub use recorder::{RecordSummary, RecordedMessage, Recorder};
pub use replay_index::{INDEX_ENTRY_LENGTH, IndexEntry, IndexOutcome, IndexReader, ReplayIndex};
pub use replay_query::ReplayQuery;
pub use store::ReplayStore;
pub use types::{MOST_RECENT_MESSAGE, ReplayRange, SequenceKey, SessionId, StreamId, UpperBound};
