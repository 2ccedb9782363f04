pub mod log;

use crate::{
    config::{Config, SyncStrategy},
    file,
    sorted_file::{writer, Writer as SortedFileWriter},
    value::{Entry, Timestamp, UserKey, UserValue},
};
use std::{
    collections::BTreeMap,
    ops::Bound,
    path::{Path, PathBuf},
};

/// Result of a nursery point lookup
#[derive(Debug, Eq, PartialEq)]
pub enum Lookup {
    /// A live value for the key
    Found(UserValue),

    /// The key was deleted (or its entry expired); deeper levels
    /// must not be consulted
    Tombstone,

    /// The nursery knows nothing about the key
    Absent,
}

/// The nursery absorbs writes at memory speed and persists them to an
/// append-only log so they survive a crash.
///
/// When the write counter reaches the capacity of the top level, the
/// nursery is flushed into the level chain as a sorted file.
pub struct Nursery {
    dir: PathBuf,

    map: BTreeMap<UserKey, Entry>,
    log: log::Writer,

    /// Number of log records appended since creation.
    ///
    /// This counts writes, not distinct keys, so repeatedly updating one
    /// key still flushes regularly and keeps the log bounded.
    writes: usize,

    capacity: usize,
    sync_strategy: SyncStrategy,
}

impl Nursery {
    /// Creates an empty nursery with a fresh log file
    pub fn create<P: AsRef<Path>>(
        dir: P,
        capacity: usize,
        sync_strategy: SyncStrategy,
    ) -> crate::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let log = log::Writer::create(dir.join(file::NURSERY_FILE))?;

        Ok(Self {
            dir,
            map: BTreeMap::new(),
            log,
            writes: 0,
            capacity,
            sync_strategy,
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn apply_sync_strategy(&mut self) -> crate::Result<()> {
        match self.sync_strategy {
            SyncStrategy::Sync => self.log.sync(),
            // Timed syncs are driven by the engine's sync timer
            SyncStrategy::None | SyncStrategy::Seconds(_) => self.log.flush(),
        }
    }

    /// Adds an entry, logging it first.
    ///
    /// Returns `true` if the nursery reached capacity and must be flushed.
    pub fn add(&mut self, entry: Entry) -> crate::Result<bool> {
        self.log.write_batch(std::slice::from_ref(&entry))?;
        self.apply_sync_strategy()?;

        self.map.insert(entry.key.clone(), entry);
        self.writes += 1;

        Ok(self.writes >= self.capacity)
    }

    /// Applies a batch of entries as one atomic log record.
    ///
    /// If the same key appears twice in a batch, the last occurrence wins.
    ///
    /// Returns `true` if the nursery reached capacity and must be flushed.
    pub fn transact(&mut self, entries: Vec<Entry>) -> crate::Result<bool> {
        if entries.is_empty() {
            return Ok(false);
        }

        self.log.write_batch(&entries)?;
        self.apply_sync_strategy()?;

        self.writes += entries.len();
        for entry in entries {
            self.map.insert(entry.key.clone(), entry);
        }

        Ok(self.writes >= self.capacity)
    }

    /// Point lookup, honoring tombstones and expiry
    pub fn lookup(&self, key: &[u8], now: Timestamp) -> Lookup {
        match self.map.get(key) {
            Some(entry) if entry.is_live(now) => Lookup::Found(entry.value.clone()),
            Some(_) => Lookup::Tombstone,
            None => Lookup::Absent,
        }
    }

    /// Clones the raw entries intersecting `[from, to)`, in key order.
    ///
    /// Tombstones and expired entries are included: they must keep
    /// shadowing older data in the levels below.
    pub fn entries_in_range(
        &self,
        from: Option<&UserKey>,
        to: Option<&UserKey>,
    ) -> Vec<Entry> {
        let lower = from.map_or(Bound::Unbounded, |key| Bound::Included(key.as_ref()));
        let upper = to.map_or(Bound::Unbounded, |key| Bound::Excluded(key.as_ref()));

        self.map
            .range::<[u8], _>((lower, upper))
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// Fsyncs the log, used by the engine's sync timer
    pub fn sync(&mut self) -> crate::Result<()> {
        self.log.sync()
    }

    /// Writes the nursery contents as a sorted file staged for injection
    /// into the top level.
    ///
    /// Returns `None` if the nursery holds no entries.
    pub fn write_flush_file(&mut self, config: &Config) -> crate::Result<Option<PathBuf>> {
        if self.map.is_empty() {
            return Ok(None);
        }

        // Make the log durable before its contents move into the levels
        self.log.sync()?;

        let path = file::flush_tmp_path(&self.dir);

        let mut writer = SortedFileWriter::new(writer::Options {
            path: path.clone(),
            page_size: config.page_size,
            write_buffer_size: config.write_buffer_size,
            compression: config.compression,
        })?;

        for entry in self.map.values() {
            writer.write(entry.clone())?;
        }

        let count = writer.finish()?;

        ::log::trace!("Flushed nursery ({count} entries) to {}", path.display());

        Ok(Some(path))
    }

    /// Empties the nursery and starts a fresh log.
    ///
    /// Only call after the flush file has been injected into the levels.
    pub fn reset(&mut self) -> crate::Result<()> {
        self.map.clear();
        self.writes = 0;
        self.log = log::Writer::create(self.dir.join(file::NURSERY_FILE))?;
        Ok(())
    }

    /// Deletes the log file; the nursery is unusable afterwards
    pub fn delete_log(&mut self) -> crate::Result<()> {
        let path = self.dir.join(file::NURSERY_FILE);

        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn nursery(dir: &Path) -> crate::Result<Nursery> {
        Nursery::create(dir, 4, SyncStrategy::Sync)
    }

    #[test]
    fn test_add_and_lookup() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut nursery = nursery(dir.path())?;

        assert!(!nursery.add(Entry::new(*b"a", *b"1", None))?);
        assert!(!nursery.add(Entry::new(*b"b", *b"2", None))?);

        assert_eq!(Lookup::Found(b"1".as_slice().into()), nursery.lookup(b"a", 0));
        assert_eq!(Lookup::Found(b"2".as_slice().into()), nursery.lookup(b"b", 0));
        assert_eq!(Lookup::Absent, nursery.lookup(b"c", 0));

        Ok(())
    }

    #[test]
    fn test_tombstone_shadows() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut nursery = nursery(dir.path())?;

        nursery.add(Entry::new(*b"a", *b"1", None))?;
        nursery.add(Entry::tombstone(*b"a"))?;

        assert_eq!(Lookup::Tombstone, nursery.lookup(b"a", 0));

        Ok(())
    }

    #[test]
    fn test_expired_counts_as_tombstone() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut nursery = nursery(dir.path())?;

        nursery.add(Entry::new(*b"a", *b"1", Some(100)))?;

        assert_eq!(Lookup::Found(b"1".as_slice().into()), nursery.lookup(b"a", 99));
        assert_eq!(Lookup::Tombstone, nursery.lookup(b"a", 100));

        Ok(())
    }

    #[test]
    fn test_capacity() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut nursery = nursery(dir.path())?;

        // Capacity counts writes, not distinct keys
        assert!(!nursery.add(Entry::new(*b"a", *b"1", None))?);
        assert!(!nursery.add(Entry::new(*b"a", *b"2", None))?);
        assert!(!nursery.add(Entry::new(*b"a", *b"3", None))?);
        assert!(nursery.add(Entry::new(*b"a", *b"4", None))?);

        assert_eq!(1, nursery.len());

        Ok(())
    }

    #[test]
    fn test_range() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut nursery = Nursery::create(dir.path(), 100, SyncStrategy::None)?;

        for key in [b"a", b"b", b"c", b"d"] {
            nursery.add(Entry::new(key.as_slice(), b"v".as_slice(), None))?;
        }

        let from: UserKey = b"b".as_slice().into();
        let to: UserKey = b"d".as_slice().into();

        let entries = nursery.entries_in_range(Some(&from), Some(&to));
        let keys = entries.iter().map(|e| &*e.key).collect::<Vec<_>>();

        assert_eq!(vec![b"b".as_slice(), b"c".as_slice()], keys);

        Ok(())
    }

    #[test]
    fn test_transact_last_wins() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut nursery = Nursery::create(dir.path(), 100, SyncStrategy::Sync)?;

        nursery.transact(vec![
            Entry::new(*b"x", *b"1", None),
            Entry::new(*b"x", *b"2", None),
        ])?;

        assert_eq!(Lookup::Found(b"2".as_slice().into()), nursery.lookup(b"x", 0));

        Ok(())
    }
}
