use crate::value::{Entry, Timestamp};
use min_max_heap::MinMaxHeap;

/// A sorted stream of entries, as contributed by the nursery or a level file
pub type BoxedStream = Box<dyn Iterator<Item = crate::Result<Entry>> + Send>;

/// Stream index doubling as shadowing priority: 0 is the nursery,
/// then the levels top-down, each `b` file before its `a` file
type StreamPriority = usize;

#[derive(Debug)]
struct HeapItem {
    priority: StreamPriority,
    entry: Entry,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.entry.key == other.entry.key && self.priority == other.priority
    }
}
impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// Order by key, THEN by stream priority.
// This is one of the most important functions in the crate:
// popping the heap minimum must yield the freshest entry of the
// smallest key, otherwise shadowing breaks.
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.entry.key.as_ref(), self.priority).cmp(&(other.entry.key.as_ref(), other.priority))
    }
}

/// This iterator can iterate through N sorted streams simultaneously in
/// order, merging with a simple k-way merge algorithm.
///
/// If multiple streams yield the same key, the stream with the highest
/// priority (lowest index) wins and the shadowed entries are discarded.
/// Tombstones and expired entries win shadowing like any other entry,
/// but are not emitted.
pub struct MergeIterator {
    streams: Vec<BoxedStream>,
    heap: MinMaxHeap<HeapItem>,
    initialized: bool,
    now: Timestamp,
}

impl MergeIterator {
    /// Initializes a new merge iterator.
    ///
    /// `streams` must be ordered from highest priority (the nursery)
    /// to lowest (the deepest level's `a` file).
    pub fn new(streams: Vec<BoxedStream>, now: Timestamp) -> Self {
        Self {
            streams,
            heap: MinMaxHeap::new(),
            initialized: false,
            now,
        }
    }

    fn advance_stream(&mut self, idx: StreamPriority) -> crate::Result<()> {
        // Expect is fine, priorities are stream indices by construction
        #[allow(clippy::expect_used)]
        let stream = self.streams.get_mut(idx).expect("stream should exist");

        if let Some(entry) = stream.next() {
            self.heap.push(HeapItem {
                priority: idx,
                entry: entry?,
            });
        }

        Ok(())
    }

    fn push_first(&mut self) -> crate::Result<()> {
        for idx in 0..self.streams.len() {
            self.advance_stream(idx)?;
        }

        Ok(())
    }
}

impl Iterator for MergeIterator {
    type Item = crate::Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.initialized {
            if let Err(e) = self.push_first() {
                return Some(Err(e));
            }
            self.initialized = true;
        }

        while let Some(head) = self.heap.pop_min() {
            if let Err(e) = self.advance_stream(head.priority) {
                return Some(Err(e));
            }

            // Discard shadowed entries for the same key
            while let Some(next) = self.heap.pop_min() {
                if next.entry.key == head.entry.key {
                    if let Err(e) = self.advance_stream(next.priority) {
                        return Some(Err(e));
                    }
                } else {
                    // Reached the next user key, push back and exit
                    self.heap.push(next);
                    break;
                }
            }

            if head.entry.is_live(self.now) {
                return Some(Ok(head.entry));
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn stream(entries: Vec<Entry>) -> BoxedStream {
        Box::new(entries.into_iter().map(Ok))
    }

    #[test]
    fn test_non_overlapping() -> crate::Result<()> {
        let lo = (0u64..5)
            .map(|x| Entry::new(x.to_be_bytes(), *b"old", None))
            .collect::<Vec<_>>();
        let hi = (5u64..10)
            .map(|x| Entry::new(x.to_be_bytes(), *b"new", None))
            .collect::<Vec<_>>();

        let merged = MergeIterator::new(vec![stream(hi), stream(lo)], 0);

        for (idx, item) in merged.enumerate() {
            let item = item?;
            assert_eq!(item.key, (idx as u64).to_be_bytes().into());
        }

        Ok(())
    }

    #[test]
    fn test_shadowing_by_priority() -> crate::Result<()> {
        let newer = vec![
            Entry::new(1u64.to_be_bytes(), *b"new", None),
            Entry::new(3u64.to_be_bytes(), *b"new", None),
        ];
        let older = vec![
            Entry::new(1u64.to_be_bytes(), *b"old", None),
            Entry::new(2u64.to_be_bytes(), *b"old", None),
            Entry::new(3u64.to_be_bytes(), *b"old", None),
        ];

        let merged = MergeIterator::new(vec![stream(newer), stream(older)], 0);
        let items = merged.collect::<crate::Result<Vec<_>>>()?;

        assert_eq!(
            items,
            vec![
                Entry::new(1u64.to_be_bytes(), *b"new", None),
                Entry::new(2u64.to_be_bytes(), *b"old", None),
                Entry::new(3u64.to_be_bytes(), *b"new", None),
            ]
        );

        Ok(())
    }

    #[test]
    fn test_tombstone_shadowing() -> crate::Result<()> {
        let newer = vec![
            Entry::tombstone(1u64.to_be_bytes()),
            Entry::tombstone(2u64.to_be_bytes()),
        ];
        let older = vec![
            Entry::new(1u64.to_be_bytes(), *b"old", None),
            Entry::new(2u64.to_be_bytes(), *b"old", None),
            Entry::new(3u64.to_be_bytes(), *b"old", None),
        ];

        let merged = MergeIterator::new(vec![stream(newer), stream(older)], 0);
        let items = merged.collect::<crate::Result<Vec<_>>>()?;

        assert_eq!(items, vec![Entry::new(3u64.to_be_bytes(), *b"old", None)]);

        Ok(())
    }

    #[test]
    fn test_expired_entries_are_hidden() -> crate::Result<()> {
        let newer = vec![Entry::new(1u64.to_be_bytes(), *b"new", Some(50))];
        let older = vec![
            Entry::new(1u64.to_be_bytes(), *b"old", None),
            Entry::new(2u64.to_be_bytes(), *b"old", Some(200)),
        ];

        // At t=100, key 1's newest version is expired and must hide the
        // older one; key 2 is still alive
        let merged = MergeIterator::new(vec![stream(newer), stream(older)], 100);
        let items = merged.collect::<crate::Result<Vec<_>>>()?;

        assert_eq!(
            items,
            vec![Entry::new(2u64.to_be_bytes(), *b"old", Some(200))]
        );

        Ok(())
    }

    #[test]
    fn test_three_way_priority() -> crate::Result<()> {
        let nursery = vec![Entry::new(1u64.to_be_bytes(), *b"n", None)];
        let top = vec![
            Entry::new(1u64.to_be_bytes(), *b"t", None),
            Entry::new(2u64.to_be_bytes(), *b"t", None),
        ];
        let deep = vec![
            Entry::new(1u64.to_be_bytes(), *b"d", None),
            Entry::new(2u64.to_be_bytes(), *b"d", None),
            Entry::new(3u64.to_be_bytes(), *b"d", None),
        ];

        let merged = MergeIterator::new(vec![stream(nursery), stream(top), stream(deep)], 0);
        let items = merged.collect::<crate::Result<Vec<_>>>()?;

        assert_eq!(
            items,
            vec![
                Entry::new(1u64.to_be_bytes(), *b"n", None),
                Entry::new(2u64.to_be_bytes(), *b"t", None),
                Entry::new(3u64.to_be_bytes(), *b"d", None),
            ]
        );

        Ok(())
    }
}
