use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// On-disk format version of a store directory
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Version {
    /// Initial format
    V0,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0")
    }
}

impl From<Version> for u16 {
    fn from(value: Version) -> Self {
        match value {
            Version::V0 => 0,
        }
    }
}

impl TryFrom<u16> for Version {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::V0),
            _ => Err(()),
        }
    }
}

impl Version {
    /// Length of the encoded version header in bytes
    pub fn len() -> u8 {
        // NOTE: Truncation is okay, the magic is tiny
        #[allow(clippy::cast_possible_truncation)]
        let magic_len = crate::file::MAGIC_BYTES.len() as u8;

        magic_len + 2
    }

    /// Parses a version header, returning `None` if the magic or the
    /// version number is unknown
    pub fn parse_file_header(bytes: &[u8]) -> Option<Self> {
        let magic_len = crate::file::MAGIC_BYTES.len();

        let magic = bytes.get(0..magic_len)?;

        if magic == crate::file::MAGIC_BYTES {
            let next_two = bytes.get(magic_len..magic_len + 2)?;

            let mut bytes = [0; 2];
            bytes.copy_from_slice(next_two);
            let mut cursor = Cursor::new(&bytes);

            let value = cursor.read_u16::<BigEndian>().ok()?;
            let version = Self::try_from(value).ok()?;

            Some(version)
        } else {
            None
        }
    }

    /// Writes the version header, returning the number of bytes written
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn write_file_header<W: std::io::Write>(self, writer: &mut W) -> std::io::Result<usize> {
        writer.write_all(crate::file::MAGIC_BYTES)?;
        writer.write_u16::<BigEndian>(u16::from(self))?;
        Ok(usize::from(Self::len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    #[allow(clippy::expect_used)]
    fn version_round_trip() {
        let mut buf = vec![];
        Version::V0.write_file_header(&mut buf).expect("can't fail");

        let version = Version::parse_file_header(&buf).expect("should parse");
        assert_eq!(version, Version::V0);
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_version_len() {
        let mut buf = vec![];
        let size = Version::V0.write_file_header(&mut buf).expect("can't fail");

        assert_eq!(Version::len() as usize, size);
    }
}
