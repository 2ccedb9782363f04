use super::{block, block::ValueBlock, BlockHandle};
use crate::{
    coding::Encode,
    config::CompressionType,
    value::{Entry, UserKey},
};
use byteorder::{BigEndian, WriteBytesExt};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

pub struct Options {
    pub path: PathBuf,
    pub page_size: u32,
    pub write_buffer_size: u32,
    pub compression: CompressionType,
}

/// Serializes and compresses entries into blocks and writes them to disk,
/// followed by the block index and a fixed-size trailer.
///
/// Entries must arrive in strictly ascending key order.
pub struct Writer {
    opts: Options,

    inner: BufWriter<File>,
    chunk: Vec<Entry>,
    chunk_size: usize,
    index: Vec<BlockHandle>,

    file_pos: u64,
    item_count: u64,

    last_key: Option<UserKey>,
}

impl Writer {
    pub fn new(opts: Options) -> crate::Result<Self> {
        let file = File::create(&opts.path)?;
        let inner = BufWriter::with_capacity(opts.write_buffer_size as usize, file);

        Ok(Self {
            opts,
            inner,
            chunk: Vec::with_capacity(100),
            chunk_size: 0,
            index: Vec::with_capacity(100),
            file_pos: 0,
            item_count: 0,
            last_key: None,
        })
    }

    fn write_chunk(&mut self) -> crate::Result<()> {
        if self.chunk.is_empty() {
            return Ok(());
        }

        // Expect is fine, because the chunk is not empty
        #[allow(clippy::expect_used)]
        let first_key = self
            .chunk
            .first()
            .expect("chunk should not be empty")
            .key
            .clone();

        let items = std::mem::take(&mut self.chunk);
        let crc = ValueBlock::create_crc(&items)?;
        let block = ValueBlock { items, crc };

        let bytes_written = block::write_block(&mut self.inner, &block, self.opts.compression)?;

        self.index.push(BlockHandle {
            first_key,
            offset: self.file_pos,
        });

        self.file_pos += u64::from(bytes_written);
        self.chunk_size = 0;

        Ok(())
    }

    /// Writes an entry
    pub fn write(&mut self, entry: Entry) -> crate::Result<()> {
        debug_assert!(
            self.last_key
                .as_ref()
                .map_or(true, |last| last.as_ref() < entry.key.as_ref()),
            "entries must be written in strictly ascending key order",
        );
        self.last_key = Some(entry.key.clone());

        self.chunk_size += entry.encoded_size();
        self.chunk.push(entry);
        self.item_count += 1;

        if self.chunk_size >= self.opts.page_size as usize {
            self.write_chunk()?;
        }

        Ok(())
    }

    /// Finishes the file, making sure all data is written durably.
    ///
    /// Returns the number of entries written.
    pub fn finish(mut self) -> crate::Result<u64> {
        self.write_chunk()?;

        let index_offset = self.file_pos;

        let mut index_bytes = Vec::new();
        for handle in &self.index {
            handle.encode_into(&mut index_bytes)?;
        }
        let index_crc = crc32fast::hash(&index_bytes);

        self.inner.write_all(&index_bytes)?;

        self.inner.write_u64::<BigEndian>(index_offset)?;

        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        self.inner.write_u32::<BigEndian>(self.index.len() as u32)?;

        self.inner.write_u32::<BigEndian>(index_crc)?;
        self.inner.write_u64::<BigEndian>(self.item_count)?;
        self.inner.write_u8(u8::from(self.opts.compression))?;
        self.inner.write_all(crate::file::MAGIC_BYTES)?;

        self.inner.flush()?;
        self.inner.get_mut().sync_all()?;

        log::trace!(
            "Written {} entries in {} blocks to {}",
            self.item_count,
            self.index.len(),
            self.opts.path.display(),
        );

        Ok(self.item_count)
    }
}
