use crate::Store;
use std::path::{Path, PathBuf};

/// Block compression codec for sorted files
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CompressionType {
    /// No compression
    #[default]
    None,

    /// Gzip (DEFLATE) compression
    Gzip,

    /// Snappy compression
    Snappy,
}

impl From<CompressionType> for u8 {
    fn from(value: CompressionType) -> Self {
        match value {
            CompressionType::None => 0,
            CompressionType::Gzip => 1,
            CompressionType::Snappy => 2,
        }
    }
}

impl TryFrom<u8> for CompressionType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            2 => Ok(Self::Snappy),
            _ => Err(()),
        }
    }
}

/// Pacing policy for background merge work
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum MergeStrategy {
    /// Every level gets a full work quantum per flush, so merges
    /// finish as early as possible
    #[default]
    Fast,

    /// The work quantum is split across levels with pending work,
    /// trading throughput for uniform write latency
    Predictable,
}

/// Durability policy for the nursery log
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyncStrategy {
    /// Never fsync, durability limited to process survival
    None,

    /// Fsync after every write and transaction
    Sync,

    /// Fsync on a timer with the given period as an upper bound
    Seconds(u64),
}

/// Store configuration
#[derive(Clone)]
pub struct Config {
    /// Folder path
    pub(crate) path: PathBuf,

    /// Block compression codec for sorted files
    pub(crate) compression: CompressionType,

    /// Page (block) size of sorted files in bytes
    pub(crate) page_size: u32,

    /// Per-reader I/O buffer size in bytes
    pub(crate) read_buffer_size: u32,

    /// Per-writer I/O buffer size in bytes
    pub(crate) write_buffer_size: u32,

    /// Merge pacing policy
    pub(crate) merge_strategy: MergeStrategy,

    /// Nursery log durability policy
    pub(crate) sync_strategy: SyncStrategy,

    /// Default TTL in seconds applied to entries the caller gives none,
    /// 0 = entries never expire by default
    pub(crate) expiry_secs: u64,
}

const DEFAULT_FILE_FOLDER: &str = ".terrace.data";

impl Default for Config {
    fn default() -> Self {
        Self {
            path: DEFAULT_FILE_FOLDER.into(),
            compression: CompressionType::default(),
            page_size: 4_096,
            read_buffer_size: 64 * 1_024,
            write_buffer_size: 512_000,
            merge_strategy: MergeStrategy::default(),
            sync_strategy: SyncStrategy::Seconds(1),
            expiry_secs: 0,
        }
    }
}

impl Config {
    /// Initializes a new config
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().into(),
            ..Default::default()
        }
    }

    /// Sets the compression codec used for sorted file blocks.
    ///
    /// Defaults to no compression.
    #[must_use]
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the page size of sorted files.
    ///
    /// Defaults to 4 KiB (4096 bytes).
    ///
    /// # Panics
    ///
    /// Panics if the page size is smaller than 1 KiB (1024 bytes).
    #[must_use]
    pub fn page_size(mut self, page_size: u32) -> Self {
        assert!(page_size >= 1_024);

        self.page_size = page_size;
        self
    }

    /// Sets the per-reader I/O buffer size.
    ///
    /// Defaults to 64 KiB.
    #[must_use]
    pub fn read_buffer_size(mut self, bytes: u32) -> Self {
        self.read_buffer_size = bytes;
        self
    }

    /// Sets the per-writer I/O buffer size.
    ///
    /// Defaults to 500 KiB.
    #[must_use]
    pub fn write_buffer_size(mut self, bytes: u32) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    /// Sets the merge pacing policy.
    ///
    /// Defaults to [`MergeStrategy::Fast`].
    #[must_use]
    pub fn merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    /// Sets the nursery log durability policy.
    ///
    /// Defaults to a timed fsync every second.
    ///
    /// # Panics
    ///
    /// Panics if a timed strategy is given a zero period.
    #[must_use]
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        if let SyncStrategy::Seconds(secs) = strategy {
            assert!(secs > 0);
        }

        self.sync_strategy = strategy;
        self
    }

    /// Sets the default TTL in seconds for entries inserted without one.
    ///
    /// Defaults to 0, meaning entries never expire unless the write
    /// itself carries an expiry.
    #[must_use]
    pub fn expiry_secs(mut self, secs: u64) -> Self {
        self.expiry_secs = secs;
        self
    }

    /// Opens a store using the config.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn open(self) -> crate::Result<Store> {
        Store::open(self)
    }
}
