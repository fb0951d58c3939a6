// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The byte-codec contract for characteristic values.
//!
//! [`Decodable`] and [`Encodable`] operate purely on in-memory cursored
//! buffers; neither performs I/O. A decode failure always reports
//! [`Error::IncompatibleDataFormat`].

use crate::error::{Error, Result};

/// A cursor over an immutable byte slice, advanced by successive decodes.
pub struct ByteCursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteCursor { bytes, position: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.position..]
    }

    pub fn remaining_len(&self) -> usize {
        self.bytes.len() - self.position
    }

    /// Take exactly `n` bytes, advancing the cursor, or fail if short.
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining_len() < n {
            return Err(Error::IncompatibleDataFormat);
        }
        let (head, _) = self.bytes[self.position..].split_at(n);
        self.position += n;
        Ok(head)
    }

    /// Consume every remaining byte, leaving the cursor exhausted.
    fn take_rest(&mut self) -> &'a [u8] {
        let rest = self.remaining();
        self.position = self.bytes.len();
        rest
    }
}

/// A byte buffer that characteristic values are serialized into.
#[derive(Debug, Default, Clone)]
pub struct ByteBuffer {
    bytes: Vec<u8>,
}

impl ByteBuffer {
    pub fn new() -> Self {
        ByteBuffer::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }
}

/// Construct-or-fail from a cursored byte buffer. Implementors must consume
/// exactly the bytes they decode, advancing the cursor's read position.
pub trait Decodable: Sized {
    fn decode(cursor: &mut ByteCursor<'_>) -> Result<Self>;

    /// Convenience wrapper that decodes a standalone buffer in full.
    fn decode_all(bytes: &[u8]) -> Result<Self> {
        let mut cursor = ByteCursor::new(bytes);
        Self::decode(&mut cursor)
    }
}

/// Append bytes to a buffer, advancing the write cursor.
pub trait Encodable {
    fn encode(&self, buffer: &mut ByteBuffer);

    /// Convenience wrapper that encodes into a fresh standalone buffer.
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buffer = ByteBuffer::new();
        self.encode(&mut buffer);
        buffer.into_bytes()
    }
}

macro_rules! impl_int_codec {
    ($($t:ty),* $(,)?) => {
        $(
            impl Decodable for $t {
                fn decode(cursor: &mut ByteCursor<'_>) -> Result<Self> {
                    let bytes = cursor.take(std::mem::size_of::<$t>())?;
                    Ok(<$t>::from_le_bytes(bytes.try_into().expect("length checked above")))
                }
            }

            impl Encodable for $t {
                fn encode(&self, buffer: &mut ByteBuffer) {
                    buffer.extend(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_int_codec!(u8, u16, u32, u64, i8, i16, i32, i64);

impl Decodable for f32 {
    fn decode(cursor: &mut ByteCursor<'_>) -> Result<Self> {
        let bytes = cursor.take(4)?;
        Ok(f32::from_le_bytes(bytes.try_into().expect("length checked above")))
    }
}

impl Encodable for f32 {
    fn encode(&self, buffer: &mut ByteBuffer) {
        buffer.extend(&self.to_le_bytes());
    }
}

impl Decodable for f64 {
    fn decode(cursor: &mut ByteCursor<'_>) -> Result<Self> {
        let bytes = cursor.take(8)?;
        Ok(f64::from_le_bytes(bytes.try_into().expect("length checked above")))
    }
}

impl Encodable for f64 {
    fn encode(&self, buffer: &mut ByteBuffer) {
        buffer.extend(&self.to_le_bytes());
    }
}

/// A single-byte boolean characteristic value: `0x01` is true, anything
/// else (including other non-zero bytes) is false. Matches GATT
/// Supplement §3.36, which this crate mandates over a lenient
/// any-nonzero-is-true reading.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BoolValue(pub bool);

impl Decodable for BoolValue {
    fn decode(cursor: &mut ByteCursor<'_>) -> Result<Self> {
        let byte = cursor.take(1)?[0];
        Ok(BoolValue(byte == 0x01))
    }
}

impl Encodable for BoolValue {
    fn encode(&self, buffer: &mut ByteBuffer) {
        buffer.extend(&[if self.0 { 0x01 } else { 0x00 }]);
    }
}

/// The GATT Manufacturer Identifier field: a little-endian `u16`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ManufacturerId(pub u16);

impl Decodable for ManufacturerId {
    fn decode(cursor: &mut ByteCursor<'_>) -> Result<Self> {
        Ok(ManufacturerId(u16::decode(cursor)?))
    }
}

impl Encodable for ManufacturerId {
    fn encode(&self, buffer: &mut ByteBuffer) {
        self.0.encode(buffer);
    }
}

/// A variable-length UTF-8 string occupying all remaining bytes of the
/// value. Decoding fails if the remaining bytes are not valid UTF-8.
impl Decodable for String {
    fn decode(cursor: &mut ByteCursor<'_>) -> Result<Self> {
        let rest = cursor.take_rest();
        String::from_utf8(rest.to_vec()).map_err(|_| Error::IncompatibleDataFormat)
    }
}

impl Encodable for String {
    fn encode(&self, buffer: &mut ByteBuffer) {
        buffer.extend(self.as_bytes());
    }
}

impl Encodable for str {
    fn encode(&self, buffer: &mut ByteBuffer) {
        buffer.extend(self.as_bytes());
    }
}

/// A raw bytes blob: all remaining bytes, verbatim.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RawBytes(pub Vec<u8>);

impl Decodable for RawBytes {
    fn decode(cursor: &mut ByteCursor<'_>) -> Result<Self> {
        Ok(RawBytes(cursor.take_rest().to_vec()))
    }
}

impl Encodable for RawBytes {
    fn encode(&self, buffer: &mut ByteBuffer) {
        buffer.extend(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_u16() {
        assert_eq!(0x00ABu16.encode_to_vec(), vec![0xAB, 0x00]);
    }

    #[test]
    fn little_endian_i32_negative_one() {
        assert_eq!((-1i32).encode_to_vec(), vec![0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn bool_encode() {
        assert_eq!(BoolValue(true).encode_to_vec(), vec![0x01]);
        assert_eq!(BoolValue(false).encode_to_vec(), vec![0x00]);
    }

    #[test]
    fn bool_decode_is_strict() {
        assert_eq!(BoolValue::decode_all(&[0x01]).unwrap(), BoolValue(true));
        assert_eq!(BoolValue::decode_all(&[0x00]).unwrap(), BoolValue(false));
        assert_eq!(BoolValue::decode_all(&[0x02]).unwrap(), BoolValue(false));
    }

    #[test]
    fn utf8_decode_failure() {
        let err = String::decode_all(&[0xC3, 0x28]).unwrap_err();
        assert!(matches!(err, Error::IncompatibleDataFormat));
    }

    #[test]
    fn round_trip_every_builtin() {
        assert_eq!(u8::decode_all(&42u8.encode_to_vec()).unwrap(), 42u8);
        assert_eq!(u16::decode_all(&4242u16.encode_to_vec()).unwrap(), 4242u16);
        assert_eq!(u32::decode_all(&424242u32.encode_to_vec()).unwrap(), 424242u32);
        assert_eq!(u64::decode_all(&42u64.encode_to_vec()).unwrap(), 42u64);
        assert_eq!(i8::decode_all(&(-42i8).encode_to_vec()).unwrap(), -42i8);
        assert_eq!(i16::decode_all(&(-4242i16).encode_to_vec()).unwrap(), -4242i16);
        assert_eq!(i32::decode_all(&(-424242i32).encode_to_vec()).unwrap(), -424242i32);
        assert_eq!(i64::decode_all(&(-42i64).encode_to_vec()).unwrap(), -42i64);
        assert_eq!(f32::decode_all(&1.5f32.encode_to_vec()).unwrap(), 1.5f32);
        assert_eq!(f64::decode_all(&1.5f64.encode_to_vec()).unwrap(), 1.5f64);
        assert_eq!(
            String::decode_all(&"hello".to_string().encode_to_vec()).unwrap(),
            "hello"
        );
        assert_eq!(
            RawBytes::decode_all(&RawBytes(vec![1, 2, 3]).encode_to_vec()).unwrap(),
            RawBytes(vec![1, 2, 3])
        );
        assert_eq!(
            ManufacturerId::decode_all(&ManufacturerId(0x1234).encode_to_vec()).unwrap(),
            ManufacturerId(0x1234)
        );
    }

    #[test]
    fn insufficient_bytes_fails() {
        assert!(matches!(u32::decode_all(&[1, 2]), Err(Error::IncompatibleDataFormat)));
    }
}
