use crate::{
    config::Config,
    file,
    level::{level_capacity, LevelHandle, Notification, TOP_LEVEL},
    nursery::{log as nursery_log, Nursery},
    sorted_file::{writer, Writer as SortedFileWriter},
    value::{Entry, UserKey},
    version::Version,
};
use std::{
    collections::BTreeMap,
    sync::{atomic::AtomicU8, Arc},
};

/// Number of merge units to pre-pay per staged quantum while settling
/// debt on open
const RECOVERY_QUANTUM: usize = 1_024;

pub struct RecoveredStore {
    pub nursery: Nursery,
    pub top: LevelHandle,
    pub max_level: Arc<AtomicU8>,
    pub notifications: flume::Receiver<Notification>,
}

/// Opens a store directory: creates it if absent, otherwise heals and
/// replays whatever a previous process - cleanly closed or not - left
/// behind.
///
/// Steps, in order:
///
/// 1. verify (or write) the format version marker
/// 2. delete stale temporary merge/flush outputs
/// 3. discover levels from file names and spawn the chain bottom-up
/// 4. pre-pay pending merge work in staged quanta, so the write path
///    cannot stall behind unbounded debt
/// 5. replay the nursery log into the top level, then (and only then)
///    delete it and start a fresh nursery
pub fn recover_store(config: &Arc<Config>) -> crate::Result<RecoveredStore> {
    let dir = &config.path;

    if !dir.try_exists()? {
        log::info!("Creating new store at {}", dir.display());
        std::fs::create_dir_all(dir)?;
        write_version_marker(config)?;
    } else {
        check_version_marker(config)?;
    }

    let mut deepest = TOP_LEVEL;

    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        let file_name = dirent.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };

        if name.ends_with(&format!(".{}", file::TMP_EXT)) {
            log::debug!("Deleting stale temporary file {name}");
            std::fs::remove_file(dirent.path())?;
            continue;
        }

        if let Some(level) = file::parse_level_file_name(name) {
            if level < TOP_LEVEL {
                return Err(crate::Error::Corrupt("data file below the top level"));
            }
            deepest = deepest.max(level);
        }
    }

    file::fsync_directory(dir)?;

    let max_level = Arc::new(AtomicU8::new(deepest));
    let (notify_tx, notifications) = flume::unbounded();

    // Chain the levels bottom-up so each one can own its successor
    let mut next: Option<LevelHandle> = None;
    for number in (TOP_LEVEL..=deepest).rev() {
        next = Some(LevelHandle::spawn(
            number,
            dir,
            Arc::clone(config),
            next.take(),
            Arc::clone(&max_level),
            notify_tx.clone(),
        )?);
    }

    // Expect is fine, the loop covers at least the top level
    #[allow(clippy::expect_used)]
    let top = next.expect("top level should exist");

    // Settle merge debt before admitting writes
    loop {
        let debt = top.unmerged_count()?;
        if debt == 0 {
            break;
        }

        log::debug!("Pre-paying merge debt, {debt} entries left");
        top.merge(RECOVERY_QUANTUM)?;
    }

    recover_nursery(config, &top)?;

    // NOTE: Truncation is okay, the top level is tiny
    #[allow(clippy::cast_possible_truncation)]
    let nursery_capacity = level_capacity(TOP_LEVEL) as usize;

    let nursery = Nursery::create(dir, nursery_capacity, config.sync_strategy)?;

    Ok(RecoveredStore {
        nursery,
        top,
        max_level,
        notifications,
    })
}

/// Replays the nursery log (if any) and flushes its contents into the
/// top level through the normal flush path.
///
/// The log is deleted only after its entries are durably inside the
/// levels; a crash at any point before that replays it again on the
/// next open.
fn recover_nursery(config: &Arc<Config>, top: &LevelHandle) -> crate::Result<()> {
    let dir = &config.path;
    let log_path = dir.join(file::NURSERY_FILE);

    if !log_path.try_exists()? {
        return Ok(());
    }

    let batches = nursery_log::recover(&log_path)?;

    let mut map: BTreeMap<UserKey, Entry> = BTreeMap::new();
    for batch in batches {
        for entry in batch {
            map.insert(entry.key.clone(), entry);
        }
    }

    if map.is_empty() {
        log::debug!("Nursery log is empty, nothing to recover");
    } else {
        log::info!("Recovering {} nursery entries", map.len());

        let flush_path = file::flush_tmp_path(dir);

        let mut flush_writer = SortedFileWriter::new(writer::Options {
            path: flush_path.clone(),
            page_size: config.page_size,
            write_buffer_size: config.write_buffer_size,
            compression: config.compression,
        })?;

        for entry in map.values() {
            flush_writer.write(entry.clone())?;
        }
        flush_writer.finish()?;

        top.inject(flush_path)?;

        // The injected file may have filled the top level
        top.merge(RECOVERY_QUANTUM)?;
    }

    std::fs::remove_file(&log_path)?;
    file::fsync_directory(dir)?;

    Ok(())
}

fn write_version_marker(config: &Config) -> crate::Result<()> {
    let mut bytes = Vec::new();
    Version::V0.write_file_header(&mut bytes)?;

    file::rewrite_atomic(config.path.join(file::VERSION_FILE), &bytes)?;

    Ok(())
}

fn check_version_marker(config: &Config) -> crate::Result<()> {
    let marker_path = config.path.join(file::VERSION_FILE);

    if marker_path.try_exists()? {
        let bytes = std::fs::read(&marker_path)?;

        return match Version::parse_file_header(&bytes) {
            Some(Version::V0) => Ok(()),
            None => Err(crate::Error::InvalidVersion(None)),
        };
    }

    // No marker: only adopt the directory if it holds no store data
    let has_data = std::fs::read_dir(&config.path)?.any(|dirent| {
        dirent.ok().is_some_and(|d| {
            d.file_name()
                .to_str()
                .is_some_and(|name| {
                    name == file::NURSERY_FILE || file::parse_level_file_name(name).is_some()
                })
        })
    });

    if has_data {
        return Err(crate::Error::InvalidVersion(None));
    }

    write_version_marker(config)
}
