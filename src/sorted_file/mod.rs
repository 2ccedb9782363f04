pub mod block;
pub mod reader;
pub mod writer;

pub use reader::Reader;
pub use writer::Writer;

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    config::CompressionType,
    value::{Entry, UserKey},
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Mutex},
};

/// Size of the fixed trailer at the end of every sorted file:
///
/// \[index offset; 8 bytes] \[index count; 4 bytes] \[index crc; 4 bytes]
/// \[item count; 8 bytes] \[compression; 1 byte] \[magic; 4 bytes]
const TRAILER_SIZE: usize = 8 + 4 + 4 + 8 + 1 + 4;

/// Points to a data block inside a sorted file
#[derive(Clone, Debug)]
pub struct BlockHandle {
    pub first_key: UserKey,
    pub offset: u64,
}

impl Encode for BlockHandle {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.first_key.len() as u16)?;
        writer.write_all(&self.first_key)?;
        writer.write_u64::<BigEndian>(self.offset)?;
        Ok(())
    }
}

impl Decode for BlockHandle {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let key_len = reader.read_u16::<BigEndian>()?;
        let mut first_key = vec![0; key_len.into()];
        reader.read_exact(&mut first_key)?;

        let offset = reader.read_u64::<BigEndian>()?;

        Ok(Self {
            first_key: first_key.into(),
            offset,
        })
    }
}

/// An immutable, sorted, keyed file of entries.
///
/// Sorted files are created by nursery flushes and level merges and are
/// never modified afterwards. They are shared behind `Arc`; a file marked
/// for deletion is unlinked only when the last reference is dropped, so
/// in-flight readers keep working on files a merge has already replaced.
pub struct SortedFile {
    path: PathBuf,

    index: Vec<BlockHandle>,
    item_count: u64,
    compression: CompressionType,

    pub(crate) read_buffer_size: u32,

    /// Shared handle for point lookups
    point_reader: Mutex<BufReader<File>>,

    delete_on_drop: AtomicBool,
}

impl std::fmt::Debug for SortedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SortedFile({}, {} items)", self.path.display(), self.item_count)
    }
}

impl SortedFile {
    /// Opens a sorted file, reading its trailer and block index into memory.
    pub fn open<P: AsRef<Path>>(path: P, read_buffer_size: u32) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file_len = std::fs::metadata(&path)?.len();
        if (file_len as usize) < TRAILER_SIZE {
            return Err(crate::Error::Corrupt("sorted file is truncated"));
        }

        let mut reader = BufReader::new(File::open(&path)?);

        // NOTE: Cast is okay, the trailer is tiny
        #[allow(clippy::cast_possible_wrap)]
        reader.seek(SeekFrom::End(-(TRAILER_SIZE as i64)))?;

        let index_offset = reader.read_u64::<BigEndian>()?;
        let index_count = reader.read_u32::<BigEndian>()?;
        let index_crc = reader.read_u32::<BigEndian>()?;
        let item_count = reader.read_u64::<BigEndian>()?;
        let compression = reader.read_u8()?;

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != crate::file::MAGIC_BYTES {
            return Err(crate::Error::Corrupt("invalid sorted file trailer"));
        }

        let Ok(compression) = CompressionType::try_from(compression) else {
            return Err(crate::Error::Corrupt("unknown compression codec"));
        };

        if index_offset + TRAILER_SIZE as u64 > file_len {
            return Err(crate::Error::Corrupt("block index offset out of bounds"));
        }

        let index_len = file_len - index_offset - TRAILER_SIZE as u64;
        reader.seek(SeekFrom::Start(index_offset))?;

        let mut index_bytes = vec![0; index_len as usize];
        reader.read_exact(&mut index_bytes)?;

        if crc32fast::hash(&index_bytes) != index_crc {
            return Err(crate::Error::Corrupt("block index checksum mismatch"));
        }

        let mut index = Vec::with_capacity(index_count as usize);
        let mut cursor = &index_bytes[..];
        for _ in 0..index_count {
            index.push(BlockHandle::decode_from(&mut cursor)?);
        }

        let point_reader = BufReader::with_capacity(
            read_buffer_size as usize,
            File::open(&path)?,
        );

        Ok(Self {
            path,
            index,
            item_count,
            compression,
            read_buffer_size,
            point_reader: Mutex::new(point_reader),
            delete_on_drop: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries in the file
    pub fn item_count(&self) -> u64 {
        self.item_count
    }

    /// Index of the first block that may contain keys `>= key`
    pub(crate) fn block_index_for(&self, key: &[u8]) -> usize {
        self.index
            .partition_point(|handle| handle.first_key.as_ref() <= key)
            .saturating_sub(1)
    }

    /// Point lookup.
    ///
    /// Returns the raw entry; tombstone and expiry handling is up to
    /// the caller.
    pub fn get(&self, key: &[u8]) -> crate::Result<Option<Entry>> {
        if self.index.is_empty() {
            return Ok(None);
        }

        let i = self
            .index
            .partition_point(|handle| handle.first_key.as_ref() <= key);

        // Key sorts before the first block
        if i == 0 {
            return Ok(None);
        }

        // Expect is fine, i > 0 was just checked
        #[allow(clippy::expect_used)]
        let handle = self.index.get(i - 1).expect("block handle should exist");

        let block = {
            let mut reader = self.point_reader.lock().expect("lock is poisoned");
            reader.seek(SeekFrom::Start(handle.offset))?;
            block::read_block(&mut *reader, self.compression)?
        };

        Ok(block
            .items
            .binary_search_by(|entry| entry.key.as_ref().cmp(key))
            .ok()
            .and_then(|idx| block.items.get(idx).cloned()))
    }

    /// Marks the file for deletion once the last reference is dropped
    pub fn mark_for_deletion(&self) {
        self.delete_on_drop
            .store(true, std::sync::atomic::Ordering::Release);
    }
}

impl Drop for SortedFile {
    fn drop(&mut self) {
        if self
            .delete_on_drop
            .load(std::sync::atomic::Ordering::Acquire)
        {
            log::trace!("Deleting dropped sorted file {}", self.path.display());

            if let Err(e) = std::fs::remove_file(&self.path) {
                log::error!("Failed to delete {}: {e:?}", self.path.display());
            }
        }
    }
}
