//! Fixed-length encodings for keys and values stored in tree pages.

use crate::storage::error::{StorageError, StorageResult};
use byteorder::{ByteOrder, LittleEndian};

/// Encodes values of `T` into exactly [`serialized_length`] bytes.
///
/// [`serialized_length`]: FixedLengthSerializer::serialized_length
pub trait FixedLengthSerializer<T>: Send + Sync {
    /// Number of bytes every encoded value occupies. Must never change.
    fn serialized_length(&self) -> usize;

    /// Encode `value` into `out`, which is exactly `serialized_length()` long.
    fn serialize_into(&self, value: &T, out: &mut [u8]) -> StorageResult<()>;

    fn deserialize(&self, bytes: &[u8]) -> StorageResult<T>;

    fn serialize(&self, value: &T) -> StorageResult<Vec<u8>> {
        let mut out = vec![0u8; self.serialized_length()];
        self.serialize_into(value, &mut out)?;
        Ok(out)
    }
}

fn check_length(bytes: &[u8], expected: usize) -> StorageResult<()> {
    if bytes.len() != expected {
        return Err(StorageError::SerializationOverflow {
            length: bytes.len(),
            max: expected,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct I32Serializer;

impl FixedLengthSerializer<i32> for I32Serializer {
    fn serialized_length(&self) -> usize {
        4
    }

    fn serialize_into(&self, value: &i32, out: &mut [u8]) -> StorageResult<()> {
        check_length(out, 4)?;
        LittleEndian::write_i32(out, *value);
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> StorageResult<i32> {
        check_length(bytes, 4)?;
        Ok(LittleEndian::read_i32(bytes))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct I64Serializer;

impl FixedLengthSerializer<i64> for I64Serializer {
    fn serialized_length(&self) -> usize {
        8
    }

    fn serialize_into(&self, value: &i64, out: &mut [u8]) -> StorageResult<()> {
        check_length(out, 8)?;
        LittleEndian::write_i64(out, *value);
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> StorageResult<i64> {
        check_length(bytes, 8)?;
        Ok(LittleEndian::read_i64(bytes))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct U32Serializer;

impl FixedLengthSerializer<u32> for U32Serializer {
    fn serialized_length(&self) -> usize {
        4
    }

    fn serialize_into(&self, value: &u32, out: &mut [u8]) -> StorageResult<()> {
        check_length(out, 4)?;
        LittleEndian::write_u32(out, *value);
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> StorageResult<u32> {
        check_length(bytes, 4)?;
        Ok(LittleEndian::read_u32(bytes))
    }
}

/// UTF-8 strings padded with zero bytes up to `length`.
///
/// Trailing zero bytes are stripped on decode, so strings ending in `'\0'`
/// do not round-trip.
#[derive(Debug, Clone, Copy)]
pub struct FixedStringSerializer {
    length: usize,
}

impl FixedStringSerializer {
    pub fn new(length: usize) -> Self {
        Self { length }
    }

    pub fn length(&self) -> usize {
        self.length
    }
}

impl FixedLengthSerializer<String> for FixedStringSerializer {
    fn serialized_length(&self) -> usize {
        self.length
    }

    fn serialize_into(&self, value: &String, out: &mut [u8]) -> StorageResult<()> {
        check_length(out, self.length)?;
        let bytes = value.as_bytes();
        if bytes.len() > self.length {
            return Err(StorageError::SerializationOverflow {
                length: bytes.len(),
                max: self.length,
            });
        }
        out[..bytes.len()].copy_from_slice(bytes);
        out[bytes.len()..].fill(0);
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> StorageResult<String> {
        check_length(bytes, self.length)?;
        let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        String::from_utf8(bytes[..end].to_vec())
            .map_err(|e| StorageError::corruption(format!("stored string is not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_serializers() -> anyhow::Result<()> {
        assert_eq!(I32Serializer.deserialize(&I32Serializer.serialize(&-42)?)?, -42);
        assert_eq!(I64Serializer.deserialize(&I64Serializer.serialize(&i64::MIN)?)?, i64::MIN);
        assert_eq!(U32Serializer.serialize(&1)?, vec![1, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn test_wrong_buffer_length() {
        let mut out = [0u8; 3];
        assert!(matches!(
            I32Serializer.serialize_into(&1, &mut out),
            Err(StorageError::SerializationOverflow { length: 3, max: 4 })
        ));
        assert!(I64Serializer.deserialize(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_fixed_string_padding() -> anyhow::Result<()> {
        let serializer = FixedStringSerializer::new(8);
        let bytes = serializer.serialize(&"abc".to_string())?;
        assert_eq!(bytes, b"abc\0\0\0\0\0".to_vec());
        assert_eq!(serializer.deserialize(&bytes)?, "abc");
        assert_eq!(serializer.deserialize(&[0u8; 8])?, "");
        Ok(())
    }

    #[test]
    fn test_fixed_string_overflow() {
        let serializer = FixedStringSerializer::new(4);
        assert!(matches!(
            serializer.serialize(&"too long".to_string()),
            Err(StorageError::SerializationOverflow { length: 8, max: 4 })
        ));
    }
}
