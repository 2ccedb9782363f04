use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

/// Magic trailer bytes, written wherever a frame needs a recognizable end
pub const MAGIC_BYTES: &[u8; 4] = b"TRRC";

pub const NURSERY_FILE: &str = "nursery.data";
pub const VERSION_FILE: &str = "version";

pub const DATA_EXT: &str = "data";
pub const TMP_EXT: &str = "tmp";

/// Which of a level's two slots a file occupies
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileSlot {
    /// The older file
    A,

    /// The newer file
    B,
}

impl std::fmt::Display for FileSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "a"),
            Self::B => write!(f, "b"),
        }
    }
}

/// Canonical name of a level's sorted file, e.g. `a-8.data`
pub fn level_file_path<P: AsRef<Path>>(dir: P, slot: FileSlot, level: u8) -> PathBuf {
    dir.as_ref().join(format!("{slot}-{level}.{DATA_EXT}"))
}

/// Name of the in-progress merge output destined for the given level
pub fn merge_tmp_path<P: AsRef<Path>>(dir: P, level: u8) -> PathBuf {
    dir.as_ref().join(format!("merge-{level}.{TMP_EXT}"))
}

/// Name of the nursery flush staging file
pub fn flush_tmp_path<P: AsRef<Path>>(dir: P) -> PathBuf {
    dir.as_ref().join(format!("flush.{TMP_EXT}"))
}

/// Parses a file name of the shape `<prefix>-<level>.data`,
/// where the prefix contains no digits.
///
/// Returns the level number, or `None` if the name has a different shape.
pub fn parse_level_file_name(name: &str) -> Option<u8> {
    let stem = name.strip_suffix(&format!(".{DATA_EXT}"))?;
    let (prefix, level) = stem.rsplit_once('-')?;

    if prefix.is_empty() || prefix.contains(|c: char| c.is_ascii_digit()) {
        return None;
    }

    level.parse::<u8>().ok()
}

/// Atomically rewrites a file
pub fn rewrite_atomic<P: AsRef<Path>>(path: P, content: &[u8]) -> std::io::Result<()> {
    let path = path.as_ref();
    let folder = path.parent().expect("should have parent folder");

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.persist(path)?;

    let file = File::open(path)?;
    file.sync_all()?;

    Ok(())
}

/// Fsyncs a directory so renames and unlinks inside it are durable
pub fn fsync_directory<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    let file = File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}
