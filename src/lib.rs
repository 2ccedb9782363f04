//! An embedded ordered key-value store based on a tiered LSM-tree.
//!
//! ##### About
//!
//! Keys and values are arbitrary byte arrays. Writes land in an
//! in-memory buffer (the "nursery") backed by an append-only log for
//! crash recovery. When the nursery fills up, it is frozen into an
//! immutable sorted file and handed to a chain of levels of doubling
//! capacity; each level merges its two files into one for the next
//! level, a few entries at a time, so merge work is interleaved with
//! foreground writes instead of stalling them.
//!
//! The store supports point lookups, deletes (via tombstones), optional
//! per-entry time-to-live, atomic multi-operation batches, and ordered
//! range folds over a consistent snapshot.
//!
//! # Example usage
//!
//! ```
//! use terrace::Config;
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! // A store is a single physical keyspace, with an API in the spirit
//! // of a persistent BTreeMap
//! let store = Config::new(folder.path()).open()?;
//!
//! // Note compared to the BTreeMap API, operations return a Result<T>
//! // so you can handle I/O errors if they occur
//! store.put("planet", "earth")?;
//!
//! let item = store.get("planet")?;
//! assert_eq!(Some("earth".as_bytes().into()), item);
//!
//! // Multiple operations can be applied atomically
//! let mut batch = store.batch();
//! batch.insert("moon", "luna").remove("planet");
//! batch.commit()?;
//!
//! // Fold over a key range in ascending order
//! let count = store.fold(0, |acc, _key, _value| Ok(acc + 1))?;
//! assert_eq!(1, count);
//!
//! // Flush and shut down; pending data is recovered from the log
//! // even without a clean close
//! store.close()?;
//! #
//! # Ok::<(), terrace::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]

mod batch;
mod coding;
mod config;
mod engine;
mod error;
mod file;
mod fold;
mod level;
mod merge;
mod nursery;
mod recovery;
mod sorted_file;
mod time;
mod value;
mod version;

pub use {
    batch::{Batch, BatchOp},
    coding::{DecodeError, EncodeError},
    config::{CompressionType, Config, MergeStrategy, SyncStrategy},
    engine::Store,
    error::{Error, Result},
    fold::FoldRange,
    value::{UserKey, UserValue},
    version::Version,
};
