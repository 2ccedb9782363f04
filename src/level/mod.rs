pub mod merge;

use self::merge::{IncrementalMerge, MergeStep};
use crate::{
    config::Config,
    file::{self, FileSlot},
    fold::FoldRange,
    merge::BoxedStream,
    sorted_file::{Reader, SortedFile},
    value::{Timestamp, UserKey, UserValue},
};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

/// Index of the top level: top-level files hold up to `2^TOP_LEVEL` entries
pub const TOP_LEVEL: u8 = 8;

/// Target size of a level: `2^n` entries
pub fn level_capacity(n: u8) -> u64 {
    1 << u64::from(n)
}

/// A sorted stream tagged with its origin, used to order fold inputs by
/// shadowing priority: lower level first, `b` slot before `a` slot
pub type TaggedStream = (u8, u8, BoxedStream);

/// Notifications sent from level tasks up to the engine
#[derive(Debug)]
pub enum Notification {
    /// A merge cascaded into a never-before-used level
    BottomLevel(u8),
}

enum LevelMessage {
    Inject {
        path: PathBuf,
        ack: flume::Sender<crate::Result<()>>,
    },
    Lookup {
        key: UserKey,
        now: Timestamp,
        reply: flume::Sender<crate::Result<Option<UserValue>>>,
    },
    Range {
        range: FoldRange,
        blocking: bool,
        streams: flume::Sender<crate::Result<TaggedStream>>,
    },
    Merge {
        units: usize,
        ack: flume::Sender<crate::Result<()>>,
    },
    UnmergedCount {
        reply: flume::Sender<usize>,
    },
    Close {
        ack: flume::Sender<()>,
    },
    Destroy {
        ack: flume::Sender<crate::Result<()>>,
    },
}

/// Handle to a level task.
///
/// The engine holds the top level's handle; every level owns the handle
/// of the next one down, forming a singly linked chain. All methods
/// communicate with the level's thread by message passing.
pub struct LevelHandle {
    number: u8,
    tx: flume::Sender<LevelMessage>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LevelHandle {
    /// Opens the level's files from `dir` and spawns its task.
    pub fn spawn(
        number: u8,
        dir: &Path,
        config: Arc<Config>,
        next: Option<LevelHandle>,
        max_level: Arc<AtomicU8>,
        notify: flume::Sender<Notification>,
    ) -> crate::Result<Self> {
        let a_path = file::level_file_path(dir, FileSlot::A, number);
        let b_path = file::level_file_path(dir, FileSlot::B, number);

        // A lone `b` file means the previous merge's inputs were only
        // partially unlinked before a crash; the survivor is the oldest
        // data this level has, so it takes the `a` slot
        if b_path.try_exists()? && !a_path.try_exists()? {
            std::fs::rename(&b_path, &a_path)?;
            file::fsync_directory(dir)?;
        }

        let mut a = None;
        let mut b = None;

        for (path, file) in [(a_path, &mut a), (b_path, &mut b)] {
            if path.try_exists()? {
                log::debug!("Level {number}: opening {}", path.display());
                *file = Some(Arc::new(SortedFile::open(&path, config.read_buffer_size)?));
            }
        }

        let (tx, rx) = flume::unbounded();

        let mut level = Level {
            number,
            dir: dir.to_path_buf(),
            config,
            a,
            b,
            merge: None,
            next,
            max_level,
            notify,
            rx,
        };

        // Both slots full means a merge was interrupted; re-schedule it
        level.start_merge()?;

        let thread = std::thread::Builder::new()
            .name(format!("terrace-level-{number}"))
            .spawn(move || level.run())?;

        Ok(Self {
            number,
            tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn send(&self, msg: LevelMessage) -> crate::Result<()> {
        self.tx.send(msg).map_err(|_| crate::Error::Poisoned)
    }

    /// Places a sorted file into this level, waiting until the level has
    /// accepted it (which may require finishing an in-progress merge).
    pub fn inject(&self, path: PathBuf) -> crate::Result<()> {
        let (ack, done) = flume::bounded(1);
        self.send(LevelMessage::Inject { path, ack })?;
        done.recv().map_err(|_| crate::Error::Poisoned)?
    }

    /// Starts an asynchronous point lookup; the reply arrives on the
    /// returned one-shot channel once the chain has resolved it.
    pub fn request_lookup(
        &self,
        key: UserKey,
        now: Timestamp,
    ) -> crate::Result<flume::Receiver<crate::Result<Option<UserValue>>>> {
        let (reply, rx) = flume::bounded(1);
        self.send(LevelMessage::Lookup { key, now, reply })?;
        Ok(rx)
    }

    /// Asks the whole chain to open range readers for a fold.
    ///
    /// Each level sends its tagged streams on `streams` and forwards the
    /// request; the channel disconnects once the deepest level is done.
    pub fn open_range(
        &self,
        range: FoldRange,
        blocking: bool,
        streams: flume::Sender<crate::Result<TaggedStream>>,
    ) -> crate::Result<()> {
        self.send(LevelMessage::Range {
            range,
            blocking,
            streams,
        })
    }

    /// Performs up to `units` of merge work on every level of the chain,
    /// returning once the whole quantum is done.
    pub fn merge(&self, units: usize) -> crate::Result<()> {
        let (ack, done) = flume::bounded(1);
        self.send(LevelMessage::Merge { units, ack })?;
        done.recv().map_err(|_| crate::Error::Poisoned)?
    }

    /// Total pending merge work across this level and everything below it
    pub fn unmerged_count(&self) -> crate::Result<usize> {
        let (reply, rx) = flume::bounded(1);
        self.send(LevelMessage::UnmergedCount { reply })?;
        rx.recv().map_err(|_| crate::Error::Poisoned)
    }

    /// Closes the chain from this level downward and joins its task
    pub fn close(&self) {
        let (ack, done) = flume::bounded(1);
        if self.send(LevelMessage::Close { ack }).is_ok() {
            let _ = done.recv();
        }
        self.join();
    }

    /// Deletes the chain's files from this level downward and joins its task
    pub fn destroy(&self) -> crate::Result<()> {
        let (ack, done) = flume::bounded(1);
        self.send(LevelMessage::Destroy { ack })?;
        let result = done.recv().map_err(|_| crate::Error::Poisoned)?;
        self.join();
        result
    }

    fn join(&self) {
        if let Some(thread) = self.thread.lock().expect("lock is poisoned").take() {
            if thread.join().is_err() {
                log::error!("Level {} task panicked", self.number);
            }
        }
    }
}

/// Task-owned state of one level
struct Level {
    number: u8,
    dir: PathBuf,
    config: Arc<Config>,

    /// The older sorted file
    a: Option<Arc<SortedFile>>,

    /// The newer sorted file
    b: Option<Arc<SortedFile>>,

    /// Merge of `a` and `b` into a file for the next level
    merge: Option<IncrementalMerge>,

    next: Option<LevelHandle>,

    max_level: Arc<AtomicU8>,
    notify: flume::Sender<Notification>,

    rx: flume::Receiver<LevelMessage>,
}

impl Level {
    fn run(mut self) {
        while let Ok(msg) = self.rx.recv() {
            match msg {
                LevelMessage::Inject { path, ack } => {
                    let _ = ack.send(self.handle_inject(path));
                }
                LevelMessage::Lookup { key, now, reply } => self.handle_lookup(&key, now, reply),
                LevelMessage::Range {
                    range,
                    blocking,
                    streams,
                } => self.handle_range(&range, blocking, &streams),
                LevelMessage::Merge { units, ack } => self.handle_merge_quantum(units, ack),
                LevelMessage::UnmergedCount { reply } => {
                    let _ = reply.send(self.unmerged_count_total());
                }
                LevelMessage::Close { ack } => {
                    self.handle_close();
                    let _ = ack.send(());
                    break;
                }
                LevelMessage::Destroy { ack } => {
                    let _ = ack.send(self.handle_destroy());
                    break;
                }
            }
        }

        log::trace!("Level {} task exiting", self.number);
    }

    /// Starts the merge of `a` and `b` if both are present
    fn start_merge(&mut self) -> crate::Result<()> {
        let (Some(a), Some(b)) = (&self.a, &self.b) else {
            return Ok(());
        };

        let out_path = file::merge_tmp_path(&self.dir, self.number + 1);

        // If nothing deeper holds data, the output becomes the new bottom
        // and tombstones have nothing left to shadow
        let drop_dead = self.number >= self.max_level.load(Ordering::Acquire);

        log::debug!(
            "Level {}: merging {} + {} entries towards level {}",
            self.number,
            a.item_count(),
            b.item_count(),
            self.number + 1,
        );

        self.merge = Some(IncrementalMerge::new(a, b, out_path, &self.config, drop_dead)?);

        Ok(())
    }

    fn handle_inject(&mut self, path: PathBuf) -> crate::Result<()> {
        if self.a.is_some() && self.b.is_some() {
            // No slot free: the in-progress merge must finish first
            self.complete_merge()?;
        }

        let slot = if self.a.is_none() {
            FileSlot::A
        } else {
            FileSlot::B
        };

        let dest = file::level_file_path(&self.dir, slot, self.number);
        std::fs::rename(&path, &dest)?;
        file::fsync_directory(&self.dir)?;

        let sorted_file = Arc::new(SortedFile::open(&dest, self.config.read_buffer_size)?);

        debug_assert!(sorted_file.item_count() <= level_capacity(self.number));

        log::debug!(
            "Level {}: accepted {} entries into slot {slot}",
            self.number,
            sorted_file.item_count(),
        );

        match slot {
            FileSlot::A => self.a = Some(sorted_file),
            FileSlot::B => {
                self.b = Some(sorted_file);
                self.start_merge()?;
            }
        }

        Ok(())
    }

    fn handle_lookup(
        &self,
        key: &UserKey,
        now: Timestamp,
        reply: flume::Sender<crate::Result<Option<UserValue>>>,
    ) {
        // b shadows a
        for sorted_file in [&self.b, &self.a].into_iter().flatten() {
            match sorted_file.get(key) {
                Ok(Some(entry)) => {
                    let result = if entry.is_live(now) {
                        Some(entry.value)
                    } else {
                        None
                    };
                    let _ = reply.send(Ok(result));
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    let _ = reply.send(Err(e));
                    return;
                }
            }
        }

        if let Some(next) = &self.next {
            if let Err(e) = next.tx.send(LevelMessage::Lookup {
                key: key.clone(),
                now,
                reply,
            }) {
                if let LevelMessage::Lookup { reply, .. } = e.0 {
                    let _ = reply.send(Err(crate::Error::Poisoned));
                }
            }
        } else {
            let _ = reply.send(Ok(None));
        }
    }

    fn handle_range(
        &mut self,
        range: &FoldRange,
        blocking: bool,
        streams: &flume::Sender<crate::Result<TaggedStream>>,
    ) {
        if blocking && self.merge.is_some() {
            if let Err(e) = self.complete_merge() {
                let _ = streams.send(Err(e));
                return;
            }
        }

        for (slot, sorted_file) in [(0u8, &self.b), (1u8, &self.a)] {
            if let Some(sorted_file) = sorted_file {
                match Reader::new(
                    Arc::clone(sorted_file),
                    range.from_key.clone(),
                    range.to_key.clone(),
                ) {
                    Ok(reader) => {
                        let stream: BoxedStream = Box::new(reader);
                        let _ = streams.send(Ok((self.number, slot, stream)));
                    }
                    Err(e) => {
                        let _ = streams.send(Err(e));
                        return;
                    }
                }
            }
        }

        if let Some(next) = &self.next {
            let _ = next.tx.send(LevelMessage::Range {
                range: range.clone(),
                blocking,
                streams: streams.clone(),
            });
        }
    }

    fn handle_merge_quantum(&mut self, units: usize, ack: flume::Sender<crate::Result<()>>) {
        if let Err(e) = self.merge_quantum(units) {
            log::error!("Level {}: merge failed, will retry: {e:?}", self.number);
            self.merge = None;
            let _ = ack.send(Err(e));
            return;
        }

        if let Some(next) = &self.next {
            if let Err(e) = next.tx.send(LevelMessage::Merge { units, ack }) {
                if let LevelMessage::Merge { ack, .. } = e.0 {
                    let _ = ack.send(Err(crate::Error::Poisoned));
                }
            }
        } else {
            let _ = ack.send(Ok(()));
        }
    }

    /// Performs up to `units` of merge work, finalizing the merge if it
    /// completes within the quantum
    fn merge_quantum(&mut self, units: usize) -> crate::Result<()> {
        // A previously failed merge is restarted from its intact inputs
        if self.merge.is_none() {
            self.start_merge()?;
        }

        let Some(merge) = &mut self.merge else {
            return Ok(());
        };

        let mut budget = units;

        loop {
            match merge.step()? {
                MergeStep::Done => return self.finalize_merge(),
                MergeStep::Consumed(n) => {
                    budget = budget.saturating_sub(n);
                    if budget == 0 {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Drives the in-progress merge to completion
    fn complete_merge(&mut self) -> crate::Result<()> {
        while self.merge.is_some() {
            self.merge_quantum(usize::MAX)?;
        }
        Ok(())
    }

    /// Injects the finished merge output into the next level and discards
    /// the inputs
    fn finalize_merge(&mut self) -> crate::Result<()> {
        let Some(merge) = self.merge.take() else {
            return Ok(());
        };

        let (out_path, count) = merge.finish()?;

        if count == 0 {
            // Everything was dead, nothing to push down
            std::fs::remove_file(&out_path)?;
            log::debug!("Level {}: merge produced no live entries", self.number);
        } else {
            self.ensure_next()?;
            if let Some(next) = &self.next {
                next.inject(out_path)?;
            }
        }

        if let Some(a) = self.a.take() {
            a.mark_for_deletion();
        }
        if let Some(b) = self.b.take() {
            b.mark_for_deletion();
        }

        log::debug!(
            "Level {}: merge complete, {count} entries moved to level {}",
            self.number,
            self.number + 1,
        );

        Ok(())
    }

    /// Materializes the next level on demand
    fn ensure_next(&mut self) -> crate::Result<()> {
        if self.next.is_some() {
            return Ok(());
        }

        let number = self.number + 1;

        let handle = LevelHandle::spawn(
            number,
            &self.dir,
            Arc::clone(&self.config),
            None,
            Arc::clone(&self.max_level),
            self.notify.clone(),
        )?;

        let previous = self.max_level.fetch_max(number, Ordering::AcqRel);
        if number > previous {
            log::debug!("Level {number} is the new bottom level");
            let _ = self.notify.send(Notification::BottomLevel(number));
        }

        self.next = Some(handle);
        Ok(())
    }

    fn unmerged_count_total(&self) -> usize {
        let own = match &self.merge {
            Some(merge) => merge.remaining(),
            None => match (&self.a, &self.b) {
                // NOTE: Truncation is okay, counts are far below usize::MAX
                #[allow(clippy::cast_possible_truncation)]
                (Some(a), Some(b)) => (a.item_count() + b.item_count()) as usize,
                _ => 0,
            },
        };

        let below = self
            .next
            .as_ref()
            .and_then(|next| next.unmerged_count().ok())
            .unwrap_or(0);

        own + below
    }

    fn drop_merge_output(&mut self) {
        if self.merge.take().is_some() {
            let tmp = file::merge_tmp_path(&self.dir, self.number + 1);
            if let Err(e) = std::fs::remove_file(&tmp) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::error!("Failed to delete {}: {e:?}", tmp.display());
                }
            }
        }
    }

    fn handle_close(&mut self) {
        self.drop_merge_output();
        self.a = None;
        self.b = None;

        if let Some(next) = self.next.take() {
            next.close();
        }
    }

    fn handle_destroy(&mut self) -> crate::Result<()> {
        self.drop_merge_output();

        if let Some(a) = self.a.take() {
            a.mark_for_deletion();
        }
        if let Some(b) = self.b.take() {
            b.mark_for_deletion();
        }

        if let Some(next) = self.next.take() {
            next.destroy()?;
        }

        Ok(())
    }
}
