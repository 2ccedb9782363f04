use super::{block, SortedFile};
use crate::value::{Entry, UserKey};
use std::{
    fs::File,
    io::{BufReader, Seek, SeekFrom},
    sync::Arc,
};

/// Streams the entries of a [`SortedFile`] in ascending key order,
/// optionally bounded to `[from, to)`.
///
/// Holding a reader pins the file: it cannot be deleted from disk
/// until the reader is dropped.
pub struct Reader {
    file: Arc<SortedFile>,
    inner: BufReader<File>,

    block_idx: usize,
    items: std::vec::IntoIter<Entry>,

    from: Option<UserKey>,
    to: Option<UserKey>,

    positioned: bool,
    started: bool,
    done: bool,
    failed: bool,
}

impl Reader {
    /// Opens a reader over `[from, to)` of the given file; unset bounds
    /// are unbounded
    pub fn new(
        file: Arc<SortedFile>,
        from: Option<UserKey>,
        to: Option<UserKey>,
    ) -> crate::Result<Self> {
        let inner = BufReader::with_capacity(
            file.read_buffer_size as usize,
            File::open(file.path())?,
        );

        let block_idx = from
            .as_ref()
            .map_or(0, |key| file.block_index_for(key));

        Ok(Self {
            file,
            inner,
            block_idx,
            items: Vec::new().into_iter(),
            from,
            to,
            positioned: false,
            started: false,
            done: false,
            failed: false,
        })
    }

    /// Loads the next data block, returning `false` once the file
    /// (or the range's upper bound) is exhausted
    fn load_next_block(&mut self) -> crate::Result<bool> {
        let Some(handle) = self.file.index.get(self.block_idx) else {
            return Ok(false);
        };

        // The range ends before this block starts
        if let Some(to) = &self.to {
            if handle.first_key.as_ref() >= to.as_ref() {
                return Ok(false);
            }
        }

        // Blocks are laid out back to back, so a single seek positions
        // the stream; subsequent blocks are read sequentially
        if !self.positioned {
            self.inner.seek(SeekFrom::Start(handle.offset))?;
            self.positioned = true;
        }

        let block = block::read_block(&mut self.inner, self.file.compression)?;
        self.items = block.items.into_iter();
        self.block_idx += 1;

        Ok(true)
    }
}

impl Iterator for Reader {
    type Item = crate::Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.failed {
            return None;
        }

        loop {
            if let Some(entry) = self.items.next() {
                if !self.started {
                    if let Some(from) = &self.from {
                        if entry.key.as_ref() < from.as_ref() {
                            continue;
                        }
                    }
                    self.started = true;
                }

                if let Some(to) = &self.to {
                    if entry.key.as_ref() >= to.as_ref() {
                        self.done = true;
                        return None;
                    }
                }

                return Some(Ok(entry));
            }

            match self.load_next_block() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
