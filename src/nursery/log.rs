use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    file::MAGIC_BYTES,
    value::Entry,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

/// Log marker. Every record is a batch: a start marker, followed by N
/// items, followed by an end marker.
///
/// - The start marker contains the number of items. If the number of
///   items following doesn't match, the batch is broken.
///
/// - The end marker contains a checksum value. If the checksum of the
///   items doesn't match, the batch is broken.
///
/// - The end marker terminates each batch with the magic bytes, so a
///   partially written checksum cannot be mistaken for a valid one.
#[derive(Debug, Eq, PartialEq)]
pub enum Marker {
    Start { item_count: u32 },
    Item(Entry),
    End(u32),
}

pub enum Tag {
    Start = 1,
    Item = 2,
    End = 3,
}

impl TryFrom<u8> for Tag {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Tag::{End, Item, Start};

        match value {
            1 => Ok(Start),
            2 => Ok(Item),
            3 => Ok(End),
            _ => Err(DecodeError::InvalidTag(("LogMarkerTag", value))),
        }
    }
}

impl From<Tag> for u8 {
    fn from(val: Tag) -> Self {
        val as Self
    }
}

impl Encode for Marker {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        use Marker::{End, Item, Start};

        match self {
            Start { item_count } => {
                writer.write_u8(Tag::Start.into())?;
                writer.write_u32::<BigEndian>(*item_count)?;
            }
            Item(entry) => {
                writer.write_u8(Tag::Item.into())?;
                entry.encode_into(writer)?;
            }
            End(checksum) => {
                writer.write_u8(Tag::End.into())?;
                writer.write_u32::<BigEndian>(*checksum)?;
                writer.write_all(MAGIC_BYTES)?;
            }
        }

        Ok(())
    }
}

impl Decode for Marker {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        match reader.read_u8()?.try_into()? {
            Tag::Start => {
                let item_count = reader.read_u32::<BigEndian>()?;
                Ok(Self::Start { item_count })
            }
            Tag::Item => Ok(Self::Item(Entry::decode_from(reader)?)),
            Tag::End => {
                let checksum = reader.read_u32::<BigEndian>()?;

                let mut magic = [0u8; MAGIC_BYTES.len()];
                reader.read_exact(&mut magic)?;

                if &magic != MAGIC_BYTES {
                    return Err(DecodeError::InvalidTrailer);
                }

                Ok(Self::End(checksum))
            }
        }
    }
}

/// Appends batches of entries to the nursery log
pub struct Writer {
    path: PathBuf,
    file: BufWriter<File>,
}

impl Writer {
    /// Creates a fresh log, truncating any previous one
    pub fn create<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;

        Ok(Self {
            path,
            file: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one batch of entries as a single atomic record.
    ///
    /// Returns the number of bytes written.
    pub fn write_batch(&mut self, entries: &[Entry]) -> crate::Result<usize> {
        // NOTE: entries.len() is surely never > u32::MAX
        #[allow(clippy::cast_possible_truncation)]
        let item_count = entries.len() as u32;

        let mut hasher = crc32fast::Hasher::new();
        let mut byte_count = 0;

        let start = Marker::Start { item_count }.encode_into_vec()?;
        self.file.write_all(&start)?;
        byte_count += start.len();

        for entry in entries {
            let bytes = Marker::Item(entry.clone()).encode_into_vec()?;
            self.file.write_all(&bytes)?;

            hasher.update(&bytes);
            byte_count += bytes.len();
        }

        let end = Marker::End(hasher.finalize()).encode_into_vec()?;
        self.file.write_all(&end)?;
        byte_count += end.len();

        Ok(byte_count)
    }

    /// Flushes buffered records to the OS
    pub fn flush(&mut self) -> crate::Result<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs the log file
    pub fn sync(&mut self) -> crate::Result<()> {
        self.file.flush()?;
        self.file.get_mut().sync_all()?;
        Ok(())
    }
}

/// Replays a nursery log, yielding its batches in write order.
///
/// The tail of the log may be torn by a crash: the first broken batch
/// (truncated record, bad tag, missing trailer, or checksum mismatch)
/// ends the replay and everything from there on is discarded.
pub fn recover<P: AsRef<Path>>(path: P) -> crate::Result<Vec<Vec<Entry>>> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);

    let mut batches = Vec::new();

    loop {
        match read_batch(&mut reader) {
            Ok(Some(batch)) => batches.push(batch),
            Ok(None) => break,
            Err(e) => {
                log::warn!(
                    "Dropping torn tail of nursery log {}: {e:?}",
                    path.as_ref().display(),
                );
                break;
            }
        }
    }

    Ok(batches)
}

/// Reads one batch, returning `None` on a clean end of file
fn read_batch<R: Read>(reader: &mut R) -> Result<Option<Vec<Entry>>, DecodeError> {
    let item_count = match Marker::decode_from(reader) {
        Ok(Marker::Start { item_count }) => item_count,
        Ok(_) => return Err(DecodeError::InvalidTag(("LogMarkerTag", 0))),
        Err(DecodeError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let mut hasher = crc32fast::Hasher::new();
    let mut entries = Vec::with_capacity(item_count as usize);

    for _ in 0..item_count {
        match Marker::decode_from(reader)? {
            Marker::Item(entry) => {
                // Hash the marker bytes exactly as the writer did
                let bytes = Marker::Item(entry.clone())
                    .encode_into_vec()
                    .map_err(|EncodeError::Io(e)| DecodeError::Io(e))?;
                hasher.update(&bytes);

                entries.push(entry);
            }
            _ => return Err(DecodeError::InvalidTag(("LogMarkerTag", 0))),
        }
    }

    let expected = hasher.finalize();

    match Marker::decode_from(reader)? {
        Marker::End(checksum) if checksum == expected => Ok(Some(entries)),
        Marker::End(_) => Err(DecodeError::InvalidTrailer),
        _ => Err(DecodeError::InvalidTag(("LogMarkerTag", 0))),
    }
}
