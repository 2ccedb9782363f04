use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    config::CompressionType,
    value::Entry,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Contains the items of a block after decompressing & deserializing.
///
/// The integrity of a block can be checked using the CRC value that is
/// stored inside it.
#[derive(Clone, Debug)]
pub struct ValueBlock {
    pub items: Vec<Entry>,
    pub crc: u32,
}

impl ValueBlock {
    /// Calculates the CRC from a list of entries
    pub fn create_crc(items: &[Entry]) -> Result<u32, EncodeError> {
        let mut hasher = crc32fast::Hasher::new();

        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        hasher.update(&(items.len() as u32).to_be_bytes());

        for item in items {
            let bytes = item.encode_into_vec()?;
            hasher.update(&bytes);
        }

        Ok(hasher.finalize())
    }

    pub(crate) fn check_crc(&self, expected_crc: u32) -> Result<bool, EncodeError> {
        let crc = Self::create_crc(&self.items)?;
        Ok(crc == expected_crc)
    }
}

impl Encode for ValueBlock {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.crc)?;

        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.items.len() as u32)?;

        for item in &self.items {
            item.encode_into(writer)?;
        }

        Ok(())
    }
}

impl Decode for ValueBlock {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let crc = reader.read_u32::<BigEndian>()?;
        let item_count = reader.read_u32::<BigEndian>()? as usize;

        let mut items = Vec::with_capacity(item_count);
        for _ in 0..item_count {
            items.push(Entry::decode_from(reader)?);
        }

        Ok(Self { items, crc })
    }
}

fn compress(bytes: &[u8], compression: CompressionType) -> crate::Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(bytes.to_vec()),
        CompressionType::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(bytes)?;
            Ok(encoder.finish()?)
        }
        CompressionType::Snappy => snap::raw::Encoder::new()
            .compress_vec(bytes)
            .map_err(|_| crate::Error::Corrupt("snappy compression failed")),
    }
}

fn decompress(bytes: &[u8], compression: CompressionType) -> crate::Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(bytes.to_vec()),
        CompressionType::Gzip => {
            let mut output = Vec::new();
            flate2::read::GzDecoder::new(bytes)
                .read_to_end(&mut output)
                .map_err(|_| crate::Error::Corrupt("failed to decompress gzip block"))?;
            Ok(output)
        }
        CompressionType::Snappy => snap::raw::Decoder::new()
            .decompress_vec(bytes)
            .map_err(|_| crate::Error::Corrupt("failed to decompress snappy block")),
    }
}

/// Writes a block as a length-prefixed, possibly compressed frame.
///
/// Returns the number of bytes that hit the writer.
pub fn write_block<W: Write>(
    writer: &mut W,
    block: &ValueBlock,
    compression: CompressionType,
) -> crate::Result<u32> {
    let bytes = block.encode_into_vec()?;
    let bytes = compress(&bytes, compression)?;

    // NOTE: Truncation is okay, blocks are page-sized
    #[allow(clippy::cast_possible_truncation)]
    let payload_len = bytes.len() as u32;

    writer.write_u32::<BigEndian>(payload_len)?;
    writer.write_all(&bytes)?;

    Ok(4 + payload_len)
}

/// Reads back a block frame written by [`write_block`], verifying its CRC
pub fn read_block<R: Read>(
    reader: &mut R,
    compression: CompressionType,
) -> crate::Result<ValueBlock> {
    let payload_len = reader.read_u32::<BigEndian>()?;

    let mut bytes = vec![0; payload_len as usize];
    reader.read_exact(&mut bytes)?;

    let bytes = decompress(&bytes, compression)?;
    let block = ValueBlock::decode_from(&mut &bytes[..])?;

    if !block.check_crc(block.crc)? {
        return Err(crate::Error::Corrupt("block checksum mismatch"));
    }

    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn test_items() -> Vec<Entry> {
        vec![
            Entry::new(vec![1, 2, 3], vec![4, 5, 6], None),
            Entry::new(vec![7, 8, 9], vec![10, 11, 12], Some(42)),
            Entry::tombstone(vec![13, 14]),
        ]
    }

    #[test]
    fn test_block_roundtrip() -> crate::Result<()> {
        for compression in [
            CompressionType::None,
            CompressionType::Gzip,
            CompressionType::Snappy,
        ] {
            let items = test_items();
            let crc = ValueBlock::create_crc(&items)?;
            let block = ValueBlock { items, crc };

            let mut buf = Vec::new();
            write_block(&mut buf, &block, compression)?;

            let read_back = read_block(&mut &buf[..], compression)?;
            assert_eq!(block.items, read_back.items);
            assert_eq!(crc, read_back.crc);
        }

        Ok(())
    }

    #[test]
    fn test_block_crc_mismatch() -> crate::Result<()> {
        let items = test_items();
        let block = ValueBlock { items, crc: 12345 };

        let mut buf = Vec::new();
        write_block(&mut buf, &block, CompressionType::None)?;

        let result = read_block(&mut &buf[..], CompressionType::None);
        match result {
            Err(crate::Error::Corrupt("block checksum mismatch")) => {}
            _ => panic!("should detect checksum mismatch"),
        }

        Ok(())
    }
}
