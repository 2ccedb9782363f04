use crate::{
    batch::{Batch, BatchOp},
    config::{Config, MergeStrategy, SyncStrategy},
    fold::{FoldMessage, FoldRange, FoldWorker},
    level::{level_capacity, LevelHandle, Notification, TOP_LEVEL},
    merge::{BoxedStream, MergeIterator},
    nursery::{Lookup, Nursery},
    recovery,
    time::unix_timestamp,
    value::{Entry, Timestamp, UserKey, UserValue},
};
use std::{
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex, RwLock,
    },
    thread::JoinHandle,
};

fn validate_key(key: &[u8]) -> crate::Result<()> {
    if key.is_empty() {
        return Err(crate::Error::InvalidArgument("key is empty"));
    }
    if key.len() > u16::MAX.into() {
        return Err(crate::Error::InvalidArgument("key is longer than 2^16 bytes"));
    }
    Ok(())
}

fn validate_value(value: &[u8]) -> crate::Result<()> {
    if u32::try_from(value.len()).is_err() {
        return Err(crate::Error::InvalidArgument(
            "value is longer than 2^32 bytes",
        ));
    }
    Ok(())
}

struct SyncTimer {
    shutdown: flume::Sender<()>,
    thread: JoinHandle<()>,
}

pub(crate) struct StoreInner {
    config: Arc<Config>,

    /// In-memory write buffer; the writer side of the lock serializes
    /// all mutations, so writes appear in lock acquisition order
    nursery: Arc<RwLock<Nursery>>,

    /// Head of the level chain
    top: LevelHandle,

    /// Deepest level materialized so far; grows as merges cascade
    max_level: Arc<AtomicU8>,

    /// Bottom-level notifications from the level tasks
    notifications: flume::Receiver<Notification>,

    /// Set on fatal write errors; all subsequent mutations are refused
    poisoned: Arc<AtomicBool>,

    closed: AtomicBool,

    sync_timer: Mutex<Option<SyncTimer>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        log::trace!("Dropping unclosed store, syncing nursery log");
        self.stop_sync_timer();

        if let Ok(mut nursery) = self.nursery.write() {
            if let Err(e) = nursery.sync() {
                log::error!("Final nursery sync failed: {e:?}");
            }
        }

        self.top.close();
    }
}

impl StoreInner {
    fn stop_sync_timer(&self) {
        if let Some(timer) = self.sync_timer.lock().expect("lock is poisoned").take() {
            drop(timer.shutdown);
            let _ = timer.thread.join();
        }
    }

    fn drain_notifications(&self) {
        while let Ok(notification) = self.notifications.try_recv() {
            match notification {
                Notification::BottomLevel(n) => {
                    log::debug!("Level chain now reaches down to level {n}");
                }
            }
        }
    }
}

/// An embedded ordered key-value store.
///
/// Writes land in an in-memory nursery backed by an append-only log and
/// cascade down a chain of exponentially growing levels in the
/// background. Reads consult the nursery first and then descend the
/// chain top-down.
///
/// All methods take `&self` and the handle is cheap to clone; writes are
/// serialized internally while reads and folds proceed concurrently.
#[derive(Clone)]
pub struct Store(Arc<StoreInner>);

impl Store {
    pub(crate) fn open(config: Config) -> crate::Result<Self> {
        log::info!("Opening store at {}", config.path.display());

        let config = Arc::new(config);
        let state = recovery::recover_store(&config)?;

        let nursery = Arc::new(RwLock::new(state.nursery));
        let poisoned = Arc::new(AtomicBool::new(false));

        let sync_timer = match config.sync_strategy {
            SyncStrategy::Seconds(secs) => Some(spawn_sync_timer(
                secs,
                Arc::clone(&nursery),
                Arc::clone(&poisoned),
            )?),
            SyncStrategy::None | SyncStrategy::Sync => None,
        };

        Ok(Self(Arc::new(StoreInner {
            config,
            nursery,
            top: state.top,
            max_level: state.max_level,
            notifications: state.notifications,
            poisoned,
            closed: AtomicBool::new(false),
            sync_timer: Mutex::new(sync_timer),
        })))
    }

    fn check_usable(&self) -> crate::Result<()> {
        if self.0.closed.load(Ordering::SeqCst) || self.0.poisoned.load(Ordering::Acquire) {
            return Err(crate::Error::Poisoned);
        }
        Ok(())
    }

    /// Marks the store poisoned if an operation on the write path failed
    fn fatal<T>(&self, result: crate::Result<T>) -> crate::Result<T> {
        if result.is_err() {
            log::error!("Fatal write path error, poisoning store");
            self.0.poisoned.store(true, Ordering::Release);
        }
        result
    }

    fn default_expiry(&self, now: Timestamp) -> Option<Timestamp> {
        if self.0.config.expiry_secs > 0 {
            Some(now + self.0.config.expiry_secs)
        } else {
            None
        }
    }

    /// Retrieves the value of a key, or `None` if the key does not exist,
    /// was deleted, or its entry expired.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<Option<UserValue>> {
        self.check_usable()?;

        let key = key.as_ref();
        validate_key(key)?;

        let now = unix_timestamp();

        // The read guard pins a consistent nursery state: writers release
        // the write side only after their insert is complete
        let reply = {
            let nursery = self.0.nursery.read().expect("lock is poisoned");

            match nursery.lookup(key, now) {
                Lookup::Found(value) => return Ok(Some(value)),
                Lookup::Tombstone => return Ok(None),
                Lookup::Absent => self.0.top.request_lookup(key.into(), now)?,
            }
        };

        // The guard is released; the level chain resolves the lookup on
        // its own threads and fulfils the one-shot reply
        reply.recv().map_err(|_| crate::Error::Poisoned)?
    }

    /// Returns `true` if the store contains the key
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn contains_key<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<bool> {
        self.get(key).map(|value| value.is_some())
    }

    /// Inserts a key-value pair.
    ///
    /// Keys may be up to 65536 bytes long, values up to 2^32 bytes.
    ///
    /// If a `expiry_secs` default is configured, the entry expires that
    /// many seconds from now; otherwise it never expires.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&self, key: K, value: V) -> crate::Result<()> {
        self.put_with_expiry(key, value, None)
    }

    /// Inserts a key-value pair that expires `ttl_secs` seconds from now.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn put_expiring<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        ttl_secs: u64,
    ) -> crate::Result<()> {
        let expiry = unix_timestamp() + ttl_secs;
        self.put_with_expiry(key, value, Some(expiry))
    }

    fn put_with_expiry<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        expiry: Option<Timestamp>,
    ) -> crate::Result<()> {
        self.check_usable()?;

        let key = key.as_ref();
        let value = value.as_ref();
        validate_key(key)?;
        validate_value(value)?;

        let expiry = expiry.or_else(|| self.default_expiry(unix_timestamp()));

        self.write_entry(Entry::new(key, value, expiry))
    }

    /// Deletes a key by writing a tombstone for it.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn delete<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<()> {
        self.check_usable()?;

        let key = key.as_ref();
        validate_key(key)?;

        self.write_entry(Entry::tombstone(key))
    }

    fn write_entry(&self, entry: Entry) -> crate::Result<()> {
        let mut nursery = self.0.nursery.write().expect("lock is poisoned");

        let full = self.fatal(nursery.add(entry))?;
        if full {
            self.flush_nursery(&mut nursery)?;
        }

        Ok(())
    }

    /// Atomically applies a list of operations.
    ///
    /// The whole list occupies a single position in the write order and
    /// shares one log record, so it is all-or-nothing both for concurrent
    /// readers and for crash recovery. If the same key appears twice,
    /// the last occurrence wins.
    ///
    /// A list with an invalid key or value is rejected as a whole,
    /// without any state change.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn transact(&self, ops: Vec<BatchOp>) -> crate::Result<()> {
        self.check_usable()?;

        let now = unix_timestamp();

        let mut entries = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    validate_key(&key)?;
                    validate_value(&value)?;
                    entries.push(Entry::new(key, value, self.default_expiry(now)));
                }
                BatchOp::Delete { key } => {
                    validate_key(&key)?;
                    entries.push(Entry::tombstone(key));
                }
            }
        }

        if entries.is_empty() {
            return Ok(());
        }

        let mut nursery = self.0.nursery.write().expect("lock is poisoned");

        let full = self.fatal(nursery.transact(entries))?;
        if full {
            self.flush_nursery(&mut nursery)?;
        }

        Ok(())
    }

    /// Initializes a new atomic write batch, see [`Batch`]
    #[must_use]
    pub fn batch(&self) -> Batch {
        Batch::new(self.clone())
    }

    /// Freezes the nursery into a sorted file, hands it to the top level
    /// and drives one quantum of merge work across the chain
    fn flush_nursery(&self, nursery: &mut Nursery) -> crate::Result<()> {
        let Some(path) = self.fatal(nursery.write_flush_file(&self.0.config))? else {
            return Ok(());
        };

        self.fatal(self.0.top.inject(path))?;
        self.fatal(nursery.reset())?;

        self.incremental_merge();
        self.0.drain_notifications();

        Ok(())
    }

    fn merge_quantum_units(&self) -> usize {
        // NOTE: Truncation is okay, the top level is tiny
        #[allow(clippy::cast_possible_truncation)]
        let base = 2 * level_capacity(TOP_LEVEL) as usize;

        match self.0.config.merge_strategy {
            MergeStrategy::Fast => base,
            MergeStrategy::Predictable => {
                let depth =
                    usize::from(self.0.max_level.load(Ordering::Acquire) - TOP_LEVEL + 1);
                (base / depth).max(1)
            }
        }
    }

    /// Performs a bounded amount of merge work proportional to one flush.
    ///
    /// Merge failures are not fatal: the inputs stay intact and the merge
    /// is retried on the next quantum.
    fn incremental_merge(&self) {
        if let Err(e) = self.0.top.merge(self.merge_quantum_units()) {
            log::error!("Incremental merge quantum failed: {e:?}");
        }
    }

    /// Folds over all keys in ascending order.
    ///
    /// See [`Store::fold_range`].
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or with the fold
    /// function's own error.
    pub fn fold<A, F>(&self, init: A, f: F) -> crate::Result<A>
    where
        F: FnMut(A, UserKey, UserValue) -> crate::Result<A>,
    {
        self.fold_range(FoldRange::all(), init, f)
    }

    /// Folds over the live keys in `range`, in ascending order, calling
    /// `f` with the accumulator and each key-value pair.
    ///
    /// The fold observes a consistent snapshot taken when the call
    /// acquires the level files; concurrent writers proceed but do not
    /// affect the iteration. Folds with a limit below 10 instead take a
    /// blocking view: pending merges are completed first, trading a
    /// brief stall for the most compact possible read.
    ///
    /// Results are streamed with per-result backpressure, so the fold
    /// holds at most one unconsumed entry at any time.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or with the fold
    /// function's own error.
    ///
    /// # Panics
    ///
    /// Resumes the fold function's panic after cleaning up the worker.
    pub fn fold_range<A, F>(&self, range: FoldRange, init: A, mut f: F) -> crate::Result<A>
    where
        F: FnMut(A, UserKey, UserValue) -> crate::Result<A>,
    {
        self.check_usable()?;
        range.validate()?;

        if range.limit == Some(0) {
            return Ok(init);
        }

        let now = unix_timestamp();
        let blocking = range.is_blocking();

        let (streams_tx, streams_rx) = flume::unbounded();

        // Pin the snapshot: the nursery view and every level's files are
        // acquired under the read guard, so the fold sees a consistent
        // prefix of the write order
        let (nursery_entries, mut tagged) = {
            let nursery = self.0.nursery.read().expect("lock is poisoned");

            self.0.top.open_range(range.clone(), blocking, streams_tx)?;

            let entries = nursery.entries_in_range(range.from_key.as_ref(), range.to_key.as_ref());

            let mut tagged = Vec::new();
            for stream in streams_rx.iter() {
                tagged.push(stream?);
            }

            (entries, tagged)
        };

        // Order the streams by shadowing priority
        tagged.sort_by_key(|(level, slot, _)| (*level, *slot));

        let mut streams: Vec<BoxedStream> = Vec::with_capacity(tagged.len() + 1);
        streams.push(Box::new(nursery_entries.into_iter().map(Ok)));
        streams.extend(tagged.into_iter().map(|(_, _, stream)| stream));

        let iter = MergeIterator::new(streams, now);

        let (tx, rx) = flume::bounded(0);
        let worker = FoldWorker::new(iter, tx, range.limit);

        let worker_thread = std::thread::Builder::new()
            .name("terrace-fold".into())
            .spawn(move || worker.run())?;

        let mut rx = Some(rx);
        let mut acc = Some(init);

        let outcome: crate::Result<()> = loop {
            let message = match rx.as_ref().expect("receiver should be present").recv() {
                Ok(message) => message,
                Err(_) => {
                    // The worker died without a terminal message
                    return match worker_thread.join() {
                        Ok(Err(e)) => Err(e),
                        _ => Err(crate::Error::FoldWorkerDied),
                    };
                }
            };

            match message {
                FoldMessage::Result(key, value) => {
                    let current = acc.take().expect("accumulator should be present");

                    match catch_unwind(AssertUnwindSafe(|| f(current, key, value))) {
                        Ok(Ok(next)) => acc = Some(next),
                        Ok(Err(e)) => break Err(e),
                        Err(panic) => {
                            // Cancel the worker, then resurface the panic
                            rx.take();
                            let _ = worker_thread.join();
                            resume_unwind(panic);
                        }
                    }
                }
                FoldMessage::Done | FoldMessage::Limit => break Ok(()),
            }
        };

        // Dropping the receiver cancels a worker that is still running
        // (the user function failed); a finished worker just joins
        rx.take();
        if worker_thread.join().is_err() {
            return Err(crate::Error::FoldWorkerDied);
        }

        outcome.map(|()| acc.take().expect("accumulator should be present"))
    }

    /// Flushes the nursery and shuts down the level chain.
    ///
    /// Idempotent; also invoked (minus the flush) when the last handle
    /// is dropped.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn close(&self) -> crate::Result<()> {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        log::info!("Closing store at {}", self.0.config.path.display());

        self.0.stop_sync_timer();

        if self.0.poisoned.load(Ordering::Acquire) {
            // The log is the only trustworthy state left; keep it for
            // recovery on the next open
            self.0.top.close();
            return Ok(());
        }

        {
            let mut nursery = self.0.nursery.write().expect("lock is poisoned");

            if let Some(path) = nursery.write_flush_file(&self.0.config)? {
                self.0.top.inject(path)?;
            }

            nursery.delete_log()?;
        }

        self.0.top.close();
        self.0.drain_notifications();

        Ok(())
    }

    /// Closes the store without flushing and deletes all of its files.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn destroy(self) -> crate::Result<()> {
        log::info!("Destroying store at {}", self.0.config.path.display());

        self.0.closed.store(true, Ordering::SeqCst);
        self.0.stop_sync_timer();

        {
            let mut nursery = self.0.nursery.write().expect("lock is poisoned");
            nursery.delete_log()?;
        }

        self.0.top.destroy()?;
        self.0.drain_notifications();

        let dir = &self.0.config.path;

        if let Err(e) = std::fs::remove_file(dir.join(crate::file::VERSION_FILE)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        // The directory may hold unrelated user files; only remove it
        // if it is empty now
        if let Err(e) = std::fs::remove_dir(dir) {
            log::debug!("Leaving store directory in place: {e:?}");
        }

        Ok(())
    }
}

fn spawn_sync_timer(
    secs: u64,
    nursery: Arc<RwLock<Nursery>>,
    poisoned: Arc<AtomicBool>,
) -> crate::Result<SyncTimer> {
    let (shutdown, shutdown_rx) = flume::bounded(0);

    let thread = std::thread::Builder::new()
        .name("terrace-sync".into())
        .spawn(move || loop {
            match shutdown_rx.recv_timeout(std::time::Duration::from_secs(secs)) {
                Err(flume::RecvTimeoutError::Timeout) => {
                    let result = nursery.write().expect("lock is poisoned").sync();

                    if let Err(e) = result {
                        log::error!("Timed nursery sync failed, poisoning store: {e:?}");
                        poisoned.store(true, Ordering::Release);
                        break;
                    }
                }
                _ => break,
            }
        })?;

    Ok(SyncTimer { shutdown, thread })
}
