use crate::{
    merge::MergeIterator,
    value::{UserKey, UserValue},
};

/// Folds with a limit below this take the blocking path: pending merges
/// are completed first so the iteration sees the most compact structure
pub const BLOCKING_FOLD_LIMIT: usize = 10;

/// Key range of a fold: `[from, to)`, optionally bounded to a maximum
/// number of results.
///
/// An unset bound is unbounded; an unset limit yields the whole range.
#[derive(Clone, Debug, Default)]
pub struct FoldRange {
    /// Inclusive lower bound
    pub from_key: Option<UserKey>,

    /// Exclusive upper bound
    pub to_key: Option<UserKey>,

    /// Maximum number of results
    pub limit: Option<usize>,
}

impl FoldRange {
    /// The full, unbounded range
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Sets the inclusive lower bound
    #[must_use]
    pub fn from_key<K: AsRef<[u8]>>(mut self, key: K) -> Self {
        self.from_key = Some(key.as_ref().into());
        self
    }

    /// Sets the exclusive upper bound
    #[must_use]
    pub fn to_key<K: AsRef<[u8]>>(mut self, key: K) -> Self {
        self.to_key = Some(key.as_ref().into());
        self
    }

    /// Bounds the fold to at most `n` results
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Small limits indicate a brief fold that prefers a compact view
    pub(crate) fn is_blocking(&self) -> bool {
        self.limit.is_some_and(|limit| limit < BLOCKING_FOLD_LIMIT)
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.from_key.as_deref().is_some_and(<[u8]>::is_empty)
            || self.to_key.as_deref().is_some_and(<[u8]>::is_empty)
        {
            return Err(crate::Error::InvalidArgument("range bound key is empty"));
        }

        if let (Some(from), Some(to)) = (&self.from_key, &self.to_key) {
            if from.as_ref() > to.as_ref() {
                return Err(crate::Error::InvalidArgument(
                    "range start must not exceed range end",
                ));
            }
        }

        Ok(())
    }
}

/// Messages streamed from a fold worker to the fold caller
#[derive(Debug)]
pub(crate) enum FoldMessage {
    /// One result; the worker blocks until the caller takes it
    Result(UserKey, UserValue),

    /// The range limit was reached
    Limit,

    /// The range is exhausted
    Done,
}

/// Drives a range fold: consumes the merge iterator and streams results
/// to the caller with per-result backpressure.
///
/// The result channel is a rendezvous channel, so every send suspends the
/// worker until the caller has acknowledged the previous result by
/// receiving it. Dropping the receiver cancels the worker at the next send.
pub(crate) struct FoldWorker {
    iter: MergeIterator,
    tx: flume::Sender<FoldMessage>,
    limit: Option<usize>,
}

impl FoldWorker {
    pub fn new(iter: MergeIterator, tx: flume::Sender<FoldMessage>, limit: Option<usize>) -> Self {
        Self { iter, tx, limit }
    }

    pub fn run(self) -> crate::Result<()> {
        let Self { iter, tx, limit } = self;

        let mut emitted: usize = 0;

        for item in iter {
            let entry = item?;

            if tx.send(FoldMessage::Result(entry.key, entry.value)).is_err() {
                // Caller went away, nothing left to do
                log::trace!("Fold worker cancelled by caller");
                return Ok(());
            }

            emitted += 1;
            if limit.is_some_and(|limit| emitted >= limit) {
                let _ = tx.send(FoldMessage::Limit);
                return Ok(());
            }
        }

        let _ = tx.send(FoldMessage::Done);
        Ok(())
    }
}
