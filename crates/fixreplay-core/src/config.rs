//! Configuration for the replay store.
//!
//! Every setting only affects capacity and file placement. Loaded from TOML:
//!
//! ```toml
//! log_dir = "/var/lib/fix-gateway/replay"
//! stream_id = 1
//! index_file_size = 2097152
//! archive_file_size = 67108864
//! cache_num_sets = 8
//! cache_set_size = 4
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ReplayError, Result};
use crate::frame::FRAME_HEADER_LENGTH;
use crate::header::FILE_HEADER_LENGTH;
use crate::logging::LogConfig;
use crate::mapped_cache::FileIdentity;
use crate::replay_index::INDEX_ENTRY_LENGTH;
use crate::types::{SessionId, StreamId};

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Replay store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Directory holding archive and index files.
    pub log_dir: PathBuf,
    /// Stream whose messages this store records.
    pub stream_id: StreamId,
    /// Preallocated size of each index file, in bytes.
    pub index_file_size: u64,
    /// Preallocated size of each archive file, in bytes.
    pub archive_file_size: u64,
    /// Number of sets in the mapped-file cache.
    pub cache_num_sets: usize,
    /// Mappings per cache set.
    pub cache_set_size: usize,
    pub logging: LogConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            stream_id: 1,
            index_file_size: 2 * 1024 * 1024,
            archive_file_size: 64 * 1024 * 1024,
            cache_num_sets: 8,
            cache_set_size: 4,
            logging: LogConfig::default(),
        }
    }
}

impl ReplayConfig {
    /// Defaults with files placed under `dir`.
    #[must_use]
    pub fn for_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: dir.into(),
            ..Self::default()
        }
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Self::parse(text, Path::new("<inline>"))
    }

    fn parse(text: &str, origin: &Path) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|source| ReplayError::ConfigParse {
            path: origin.to_path_buf(),
            source: Box::new(source),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the store cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let min_index = (FILE_HEADER_LENGTH + INDEX_ENTRY_LENGTH) as u64;
        if self.index_file_size < min_index {
            return Err(ReplayError::InvalidConfig(format!(
                "index_file_size {} is below the minimum of {min_index}",
                self.index_file_size
            )));
        }
        let min_archive = (FILE_HEADER_LENGTH + FRAME_HEADER_LENGTH) as u64;
        if self.archive_file_size < min_archive {
            return Err(ReplayError::InvalidConfig(format!(
                "archive_file_size {} is below the minimum of {min_archive}",
                self.archive_file_size
            )));
        }
        if self.cache_num_sets == 0 {
            return Err(ReplayError::InvalidConfig(
                "cache_num_sets must be > 0".to_string(),
            ));
        }
        if self.cache_set_size == 0 {
            return Err(ReplayError::InvalidConfig(
                "cache_set_size must be > 0".to_string(),
            ));
        }
        if self.log_dir.as_os_str().is_empty() {
            return Err(ReplayError::InvalidConfig("log_dir is empty".to_string()));
        }
        Ok(())
    }

    /// Create the log directory if it does not exist.
    pub fn ensure_log_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.log_dir).map_err(|source| ReplayError::Io {
            path: self.log_dir.clone(),
            source,
        })
    }

    #[must_use]
    pub fn index_identity(&self, session_id: SessionId) -> FileIdentity {
        FileIdentity::index(&self.log_dir, session_id, self.stream_id)
    }

    #[must_use]
    pub fn archive_identity(&self, session_id: SessionId) -> FileIdentity {
        FileIdentity::archive(&self.log_dir, session_id, self.stream_id)
    }

    #[must_use]
    pub fn index_path(&self, session_id: SessionId) -> PathBuf {
        self.index_identity(session_id).path
    }

    #[must_use]
    pub fn archive_path(&self, session_id: SessionId) -> PathBuf {
        self.archive_identity(session_id).path
    }
}
