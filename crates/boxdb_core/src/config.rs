//! Store configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Where a store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreLocation {
    /// A directory on disk.
    Directory(PathBuf),
    /// A named, process-local in-memory store. Data is lost when the
    /// last handle closes.
    Memory(String),
}

impl StoreLocation {
    /// Prefix selecting in-memory stores in [`StoreLocation::parse`].
    pub const MEMORY_PREFIX: &'static str = "memory:";

    /// Parses a location string; `memory:<name>` selects an in-memory store,
    /// anything else is treated as a directory path.
    #[must_use]
    pub fn parse(location: &str) -> Self {
        match location.strip_prefix(Self::MEMORY_PREFIX) {
            Some(name) => Self::Memory(name.to_string()),
            None => Self::Directory(PathBuf::from(location)),
        }
    }

    /// Returns true for in-memory stores.
    #[must_use]
    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory(_))
    }

    /// Key identifying this location in the open-store registry.
    pub(crate) fn registry_key(&self) -> String {
        match self {
            Self::Memory(name) => format!("{}{name}", Self::MEMORY_PREFIX),
            Self::Directory(path) => {
                let path = path.canonicalize().unwrap_or_else(|_| path.clone());
                path.to_string_lossy().into_owned()
            }
        }
    }
}

impl From<&str> for StoreLocation {
    fn from(location: &str) -> Self {
        Self::parse(location)
    }
}

impl From<PathBuf> for StoreLocation {
    fn from(path: PathBuf) -> Self {
        Self::Directory(path)
    }
}

impl From<&std::path::Path> for StoreLocation {
    fn from(path: &std::path::Path) -> Self {
        Self::Directory(path.to_path_buf())
    }
}

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Maximum on-disk size in bytes (0 = unlimited). Commits that would
    /// grow the store past this fail with `DbFull`.
    pub max_db_size: u64,

    /// Unix permission bits for newly created files.
    pub file_mode: u32,

    /// Maximum number of concurrently open read transactions.
    pub max_readers: usize,

    /// Whether to fsync the WAL on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// How long a write transaction waits for the writer slot.
    /// `None` waits indefinitely.
    pub write_lock_timeout: Option<Duration>,

    /// Whether bulk reads load objects one at a time instead of
    /// materializing the whole table first.
    pub stream_reads: bool,

    /// WAL size that triggers an automatic checkpoint after commit
    /// (0 = only on close).
    pub checkpoint_wal_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            max_db_size: 1024 * 1024 * 1024, // 1 GiB
            file_mode: 0o644,
            max_readers: 126,
            sync_on_commit: true,
            write_lock_timeout: None,
            stream_reads: false,
            checkpoint_wal_size: 16 * 1024 * 1024, // 16 MiB
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the store directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the maximum store size in bytes (0 = unlimited).
    #[must_use]
    pub const fn max_db_size(mut self, bytes: u64) -> Self {
        self.max_db_size = bytes;
        self
    }

    /// Sets the permission bits for created files.
    #[must_use]
    pub const fn file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    /// Sets the maximum number of concurrent readers.
    #[must_use]
    pub const fn max_readers(mut self, readers: usize) -> Self {
        self.max_readers = readers;
        self
    }

    /// Sets whether to sync the WAL on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets how long writers wait for the writer slot.
    #[must_use]
    pub const fn write_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_lock_timeout = timeout;
        self
    }

    /// Enables streaming bulk reads.
    #[must_use]
    pub const fn stream_reads(mut self, value: bool) -> Self {
        self.stream_reads = value;
        self
    }

    /// Sets the WAL size that triggers an automatic checkpoint.
    #[must_use]
    pub const fn checkpoint_wal_size(mut self, bytes: u64) -> Self {
        self.checkpoint_wal_size = bytes;
        self
    }
}
