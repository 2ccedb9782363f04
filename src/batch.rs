use crate::{
    value::{UserKey, UserValue},
    Store,
};

/// A single operation inside an atomic batch
#[derive(Clone, Debug)]
pub enum BatchOp {
    /// Insert or overwrite a key
    Put {
        /// Key to write
        key: UserKey,
        /// Value to write
        value: UserValue,
    },

    /// Delete a key
    Delete {
        /// Key to delete
        key: UserKey,
    },
}

impl BatchOp {
    /// Creates a put operation
    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(key: K, value: V) -> Self {
        Self::Put {
            key: key.as_ref().into(),
            value: value.as_ref().into(),
        }
    }

    /// Creates a delete operation
    pub fn delete<K: AsRef<[u8]>>(key: K) -> Self {
        Self::Delete {
            key: key.as_ref().into(),
        }
    }
}

/// An atomic write batch.
///
/// All operations are applied at the same logical position in the write
/// order: a reader sees either none or all of them, and recovery replays
/// the batch all-or-nothing. If the same key appears twice, the last
/// occurrence wins.
pub struct Batch {
    data: Vec<BatchOp>,
    store: Store,
}

impl Batch {
    /// Initializes a new write batch
    /// This function is called by [`Store::batch`]
    pub(crate) fn new(store: Store) -> Self {
        Self {
            data: Vec::with_capacity(100),
            store,
        }
    }

    /// Inserts a key-value pair into the batch
    pub fn insert<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) -> &mut Self {
        self.data.push(BatchOp::put(key, value));
        self
    }

    /// Adds a deletion for a key
    pub fn remove<K: AsRef<[u8]>>(&mut self, key: K) -> &mut Self {
        self.data.push(BatchOp::delete(key));
        self
    }

    /// Amount of operations in the batch
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the batch is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Commits the batch to the store atomically
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs
    pub fn commit(self) -> crate::Result<()> {
        log::trace!("Committing batch of {} items", self.data.len());
        self.store.transact(self.data)
    }
}
