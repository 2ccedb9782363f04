use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    io::{Read, Write},
    sync::Arc,
};

/// User defined key
pub type UserKey = Arc<[u8]>;

/// User defined data (blob of bytes)
pub type UserValue = Arc<[u8]>;

/// Wall-clock UNIX timestamp with second granularity
pub type Timestamp = u64;

/// Value type (regular value or tombstone)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ValueType {
    /// Existing value
    Value,

    /// Deleted value
    Tombstone,
}

impl TryFrom<u8> for ValueType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Value),
            1 => Ok(Self::Tombstone),
            _ => Err(DecodeError::InvalidTag(("ValueType", value))),
        }
    }
}

impl From<ValueType> for u8 {
    fn from(value: ValueType) -> Self {
        match value {
            ValueType::Value => 0,
            ValueType::Tombstone => 1,
        }
    }
}

/// Represents an item stored in the tree
///
/// `key` and `value` are arbitrary user-defined byte arrays.
/// An entry may carry an absolute expiry timestamp; readers treat
/// an expired entry the same as a tombstone.
///
/// # Disk representation
///
/// \[value type; 1 byte] \[expiry; 8 bytes, 0 = never] \[key length; 2 bytes] \[key; N bytes] \[value length; 4 bytes] \[value: N bytes]
#[derive(Clone, PartialEq, Eq)]
pub struct Entry {
    /// User-defined key - an arbitrary byte array
    ///
    /// Supports up to 2^16 bytes
    pub key: UserKey,

    /// User-defined value - an arbitrary byte array
    ///
    /// Supports up to 2^32 bytes
    pub value: UserValue,

    /// Tombstone marker
    pub value_type: ValueType,

    /// Absolute expiry time, `None` = never expires
    pub expiry: Option<Timestamp>,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}:{}:{} => {:?}",
            self.key,
            match self.value_type {
                ValueType::Value => "V",
                ValueType::Tombstone => "T",
            },
            self.expiry.unwrap_or_default(),
            self.value,
        )
    }
}

impl Entry {
    /// Creates a new value entry.
    ///
    /// # Panics
    ///
    /// Panics if the key is empty or longer than 2^16 bytes,
    /// or the value is longer than 2^32 bytes.
    pub fn new<K: Into<UserKey>, V: Into<UserValue>>(
        key: K,
        value: V,
        expiry: Option<Timestamp>,
    ) -> Self {
        let key = key.into();
        let value = value.into();

        assert!(!key.is_empty());
        assert!(key.len() <= u16::MAX.into());
        assert!(u32::try_from(value.len()).is_ok());

        Self {
            key,
            value,
            value_type: ValueType::Value,
            expiry,
        }
    }

    /// Creates a new tombstone entry for a key.
    ///
    /// # Panics
    ///
    /// Panics if the key is empty or longer than 2^16 bytes.
    pub fn tombstone<K: Into<UserKey>>(key: K) -> Self {
        let key = key.into();

        assert!(!key.is_empty());
        assert!(key.len() <= u16::MAX.into());

        Self {
            key,
            value: Arc::new([]),
            value_type: ValueType::Tombstone,
            expiry: None,
        }
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value_type == ValueType::Tombstone
    }

    /// Whether the entry's expiry time has passed
    #[must_use]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }

    /// An entry is live if it is neither a tombstone nor expired
    #[must_use]
    pub fn is_live(&self, now: Timestamp) -> bool {
        !self.is_tombstone() && !self.is_expired(now)
    }

    /// Exact encoded size in bytes
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        1 + 8 + 2 + self.key.len() + 4 + self.value.len()
    }
}

impl Encode for Entry {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(u8::from(self.value_type))?;
        writer.write_u64::<BigEndian>(self.expiry.unwrap_or(0))?;

        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.key.len() as u16)?;
        writer.write_all(&self.key)?;

        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.value.len() as u32)?;
        writer.write_all(&self.value)?;

        Ok(())
    }
}

impl Decode for Entry {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let value_type = reader.read_u8()?.try_into()?;

        let expiry = reader.read_u64::<BigEndian>()?;
        let expiry = if expiry == 0 { None } else { Some(expiry) };

        let key_len = reader.read_u16::<BigEndian>()?;
        let mut key = vec![0; key_len.into()];
        reader.read_exact(&mut key)?;

        let value_len = reader.read_u32::<BigEndian>()?;
        let mut value = vec![0; value_len as usize];
        reader.read_exact(&mut value)?;

        Ok(Self {
            key: key.into(),
            value: value.into(),
            value_type,
            expiry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_value_roundtrip() -> crate::Result<()> {
        let entry = Entry::new(vec![1, 2, 3], vec![4, 5, 6], None);

        let mut serialized = Vec::new();
        entry.encode_into(&mut serialized)?;

        let deserialized = Entry::decode_from(&mut &serialized[..])?;
        assert_eq!(entry, deserialized);

        Ok(())
    }

    #[test]
    fn test_empty_value_roundtrip() -> crate::Result<()> {
        let entry = Entry::new(vec![1, 2, 3], vec![], Some(42));

        let mut serialized = Vec::new();
        entry.encode_into(&mut serialized)?;

        let deserialized = Entry::decode_from(&mut &serialized[..])?;
        assert_eq!(entry, deserialized);
        assert_eq!(Some(42), deserialized.expiry);

        Ok(())
    }

    #[test]
    fn test_tombstone_roundtrip() -> crate::Result<()> {
        let entry = Entry::tombstone(vec![9, 9, 9]);

        let mut serialized = Vec::new();
        entry.encode_into(&mut serialized)?;

        let deserialized = Entry::decode_from(&mut &serialized[..])?;
        assert!(deserialized.is_tombstone());
        assert_eq!(entry, deserialized);

        Ok(())
    }

    #[test]
    fn test_expiry() {
        let entry = Entry::new(*b"abc", *b"def", Some(100));

        assert!(!entry.is_expired(99));
        assert!(entry.is_expired(100));
        assert!(entry.is_expired(101));

        assert!(entry.is_live(99));
        assert!(!entry.is_live(100));
    }

    #[test]
    fn test_invalid_value_type() {
        let serialized = [7u8; 32];
        let result = Entry::decode_from(&mut &serialized[..]);

        match result {
            Err(DecodeError::InvalidTag(("ValueType", 7))) => {}
            _ => panic!("should throw InvalidTag"),
        }
    }
}
