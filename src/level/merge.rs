use crate::{
    config::Config,
    sorted_file::{writer, Reader, SortedFile, Writer},
    time::unix_timestamp,
    value::{Entry, Timestamp},
};
use std::{path::PathBuf, sync::Arc};

/// Outcome of one unit of merge work
pub enum MergeStep {
    /// Consumed this many input entries
    Consumed(usize),

    /// Both inputs are exhausted; call [`IncrementalMerge::finish`]
    Done,
}

fn next_entry(reader: &mut Reader) -> crate::Result<Option<Entry>> {
    reader.next().transpose()
}

/// Merges a level's two sorted files into one output file for the next
/// level, one entry at a time, so the work can be interleaved with
/// foreground writes.
///
/// Identical keys collapse with the `b` side (the newer file) winning.
/// Tombstones are preserved while deeper data may exist; an expired entry
/// is rewritten as a tombstone for the same reason. At the deepest level
/// both are dropped.
///
/// The output is written under a temporary name; it reaches its canonical
/// name only when the next level renames it during injection, so a crash
/// mid-merge leaves the inputs intact and the partial output is swept
/// away on recovery.
pub struct IncrementalMerge {
    a: Reader,
    b: Reader,
    a_head: Option<Entry>,
    b_head: Option<Entry>,

    out: Writer,
    out_path: PathBuf,

    remaining: usize,
    drop_dead: bool,
    now: Timestamp,
}

enum Side {
    A,
    B,
    Both,
}

impl IncrementalMerge {
    pub fn new(
        a: &Arc<SortedFile>,
        b: &Arc<SortedFile>,
        out_path: PathBuf,
        config: &Config,
        drop_dead: bool,
    ) -> crate::Result<Self> {
        // NOTE: Truncation is okay, files hold at most 2^63 entries
        #[allow(clippy::cast_possible_truncation)]
        let remaining = (a.item_count() + b.item_count()) as usize;

        let mut a = Reader::new(Arc::clone(a), None, None)?;
        let mut b = Reader::new(Arc::clone(b), None, None)?;
        let a_head = next_entry(&mut a)?;
        let b_head = next_entry(&mut b)?;

        let out = Writer::new(writer::Options {
            path: out_path.clone(),
            page_size: config.page_size,
            write_buffer_size: config.write_buffer_size,
            compression: config.compression,
        })?;

        Ok(Self {
            a,
            b,
            a_head,
            b_head,
            out,
            out_path,
            remaining,
            drop_dead,
            now: unix_timestamp(),
        })
    }

    /// Input entries not yet consumed
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    fn emit(&mut self, entry: Entry) -> crate::Result<()> {
        if self.drop_dead {
            // Deepest level: nothing below can be shadowed
            if entry.is_live(self.now) {
                self.out.write(entry)?;
            }
        } else if entry.is_expired(self.now) && !entry.is_tombstone() {
            self.out.write(Entry::tombstone(entry.key))?;
        } else {
            self.out.write(entry)?;
        }

        Ok(())
    }

    /// Performs one unit of merge work
    pub fn step(&mut self) -> crate::Result<MergeStep> {
        let side = match (&self.a_head, &self.b_head) {
            (None, None) => return Ok(MergeStep::Done),
            (Some(_), None) => Side::A,
            (None, Some(_)) => Side::B,
            (Some(a), Some(b)) => match a.key.cmp(&b.key) {
                std::cmp::Ordering::Less => Side::A,
                std::cmp::Ordering::Greater => Side::B,
                std::cmp::Ordering::Equal => Side::Both,
            },
        };

        match side {
            Side::A => {
                let Some(entry) = self.a_head.take() else {
                    return Ok(MergeStep::Done);
                };
                self.a_head = next_entry(&mut self.a)?;
                self.remaining = self.remaining.saturating_sub(1);

                self.emit(entry)?;
                Ok(MergeStep::Consumed(1))
            }
            Side::B => {
                let Some(entry) = self.b_head.take() else {
                    return Ok(MergeStep::Done);
                };
                self.b_head = next_entry(&mut self.b)?;
                self.remaining = self.remaining.saturating_sub(1);

                self.emit(entry)?;
                Ok(MergeStep::Consumed(1))
            }
            Side::Both => {
                // b is newer, the a version is shadowed
                self.a_head.take();
                let Some(entry) = self.b_head.take() else {
                    return Ok(MergeStep::Done);
                };

                self.a_head = next_entry(&mut self.a)?;
                self.b_head = next_entry(&mut self.b)?;
                self.remaining = self.remaining.saturating_sub(2);

                self.emit(entry)?;
                Ok(MergeStep::Consumed(2))
            }
        }
    }

    /// Finishes the output file durably.
    ///
    /// Returns the temporary output path and the number of entries written.
    pub fn finish(self) -> crate::Result<(PathBuf, u64)> {
        let count = self.out.finish()?;
        Ok((self.out_path, count))
    }
}
