//! Built-in codecs for common Rust types.

use std::marker::PhantomData;

use crate::codec::{JoinKey, JoinValue, KeyCodec, ValueCodec};
use crate::error::{JoinError, Result};

/// Codec for fixed-width primitive integers, encoded little-endian.
pub struct FixedIntCodec<T>(PhantomData<T>);

macro_rules! fixed_int_codec {
    ($($t:ty),* $(,)?) => {
        $(
            impl KeyCodec<$t> for FixedIntCodec<$t> {
                const IS_FIXED: bool = true;
                const FIXED_LEN: usize = std::mem::size_of::<$t>();

                #[inline]
                fn encoded_len(_key: &$t) -> usize {
                    <Self as KeyCodec<$t>>::FIXED_LEN
                }

                #[inline]
                fn encode_into(key: &$t, dst: &mut [u8]) {
                    dst[..<Self as KeyCodec<$t>>::FIXED_LEN].copy_from_slice(&key.to_le_bytes());
                }

                #[inline]
                fn equals_encoded(encoded: &[u8], key: &$t) -> bool {
                    encoded.len() == <Self as KeyCodec<$t>>::FIXED_LEN && encoded == key.to_le_bytes()
                }

                #[inline]
                fn decode(encoded: &[u8]) -> Result<$t> {
                    let bytes: [u8; std::mem::size_of::<$t>()] =
                        encoded.try_into().map_err(|_| {
                            JoinError::Corrupt(format!(
                                "expected {} key bytes, found {}",
                                <Self as KeyCodec<$t>>::FIXED_LEN,
                                encoded.len()
                            ))
                        })?;
                    Ok(<$t>::from_le_bytes(bytes))
                }

                #[inline]
                fn hash32(key: &$t) -> u32 {
                    Self::hash32_encoded(&key.to_le_bytes())
                }
            }

            impl ValueCodec<$t> for FixedIntCodec<$t> {
                const IS_FIXED: bool = true;
                const FIXED_LEN: usize = std::mem::size_of::<$t>();

                #[inline]
                fn encoded_len(_value: &$t) -> usize {
                    <Self as ValueCodec<$t>>::FIXED_LEN
                }

                #[inline]
                fn encode_into(value: &$t, dst: &mut [u8]) {
                    dst[..<Self as ValueCodec<$t>>::FIXED_LEN].copy_from_slice(&value.to_le_bytes());
                }

                #[inline]
                fn decode(encoded: &[u8]) -> Result<$t> {
                    let bytes: [u8; std::mem::size_of::<$t>()] =
                        encoded.try_into().map_err(|_| {
                            JoinError::Corrupt(format!(
                                "expected {} value bytes, found {}",
                                <Self as ValueCodec<$t>>::FIXED_LEN,
                                encoded.len()
                            ))
                        })?;
                    Ok(<$t>::from_le_bytes(bytes))
                }
            }

            impl JoinKey for $t {
                type Codec = FixedIntCodec<$t>;
            }

            impl JoinValue for $t {
                type Codec = FixedIntCodec<$t>;
            }
        )*
    };
}

fixed_int_codec!(u16, u32, u64, i16, i32, i64);

/// Wrapper type to route keys/values through the raw-bytes codec.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RawBytes(pub Vec<u8>);

impl From<Vec<u8>> for RawBytes {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for RawBytes {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

/// Codec for [`RawBytes`]: the bytes themselves, no envelope.
pub struct RawBytesCodec;

impl KeyCodec<RawBytes> for RawBytesCodec {
    const IS_FIXED: bool = false;
    const FIXED_LEN: usize = 0;

    #[inline]
    fn encoded_len(key: &RawBytes) -> usize {
        key.0.len()
    }

    #[inline]
    fn encode_into(key: &RawBytes, dst: &mut [u8]) {
        dst[..key.0.len()].copy_from_slice(&key.0);
    }

    #[inline]
    fn equals_encoded(encoded: &[u8], key: &RawBytes) -> bool {
        encoded == key.0.as_slice()
    }

    #[inline]
    fn decode(encoded: &[u8]) -> Result<RawBytes> {
        Ok(RawBytes(encoded.to_vec()))
    }

    #[inline]
    fn hash32(key: &RawBytes) -> u32 {
        Self::hash32_encoded(&key.0)
    }
}

impl ValueCodec<RawBytes> for RawBytesCodec {
    const IS_FIXED: bool = false;
    const FIXED_LEN: usize = 0;

    #[inline]
    fn encoded_len(value: &RawBytes) -> usize {
        value.0.len()
    }

    #[inline]
    fn encode_into(value: &RawBytes, dst: &mut [u8]) {
        dst[..value.0.len()].copy_from_slice(&value.0);
    }

    #[inline]
    fn decode(encoded: &[u8]) -> Result<RawBytes> {
        Ok(RawBytes(encoded.to_vec()))
    }
}

impl JoinKey for RawBytes {
    type Codec = RawBytesCodec;
}

impl JoinValue for RawBytes {
    type Codec = RawBytesCodec;
}

/// Wrapper type to route keys/values through the UTF-8 codec.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Utf8(pub String);

impl From<String> for Utf8 {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Utf8 {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Codec for [`Utf8`]: raw UTF-8 bytes, validated on decode.
pub struct Utf8Codec;

impl KeyCodec<Utf8> for Utf8Codec {
    const IS_FIXED: bool = false;
    const FIXED_LEN: usize = 0;

    #[inline]
    fn encoded_len(key: &Utf8) -> usize {
        key.0.len()
    }

    #[inline]
    fn encode_into(key: &Utf8, dst: &mut [u8]) {
        dst[..key.0.len()].copy_from_slice(key.0.as_bytes());
    }

    #[inline]
    fn equals_encoded(encoded: &[u8], key: &Utf8) -> bool {
        encoded == key.0.as_bytes()
    }

    #[inline]
    fn decode(encoded: &[u8]) -> Result<Utf8> {
        let s = String::from_utf8(encoded.to_vec())
            .map_err(|_| JoinError::Corrupt("stored key is not valid utf-8".into()))?;
        Ok(Utf8(s))
    }

    #[inline]
    fn hash32(key: &Utf8) -> u32 {
        Self::hash32_encoded(key.0.as_bytes())
    }
}

impl ValueCodec<Utf8> for Utf8Codec {
    const IS_FIXED: bool = false;
    const FIXED_LEN: usize = 0;

    #[inline]
    fn encoded_len(value: &Utf8) -> usize {
        value.0.len()
    }

    #[inline]
    fn encode_into(value: &Utf8, dst: &mut [u8]) {
        dst[..value.0.len()].copy_from_slice(value.0.as_bytes());
    }

    #[inline]
    fn decode(encoded: &[u8]) -> Result<Utf8> {
        let s = String::from_utf8(encoded.to_vec())
            .map_err(|_| JoinError::Corrupt("stored value is not valid utf-8".into()))?;
        Ok(Utf8(s))
    }
}

impl JoinKey for Utf8 {
    type Codec = Utf8Codec;
}

impl JoinValue for Utf8 {
    type Codec = Utf8Codec;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_int_roundtrip() {
        let key: u64 = 0xfeed_face_cafe_beef;
        let mut buf = [0u8; 8];
        <FixedIntCodec<u64> as KeyCodec<u64>>::encode_into(&key, &mut buf);

        assert!(<FixedIntCodec<u64> as KeyCodec<u64>>::equals_encoded(
            &buf, &key
        ));
        assert_eq!(
            <FixedIntCodec<u64> as KeyCodec<u64>>::decode(&buf).unwrap(),
            key
        );
    }

    #[test]
    fn test_fixed_int_decode_wrong_size() {
        let buf = [0u8; 4];
        assert!(<FixedIntCodec<u64> as KeyCodec<u64>>::decode(&buf).is_err());
    }

    #[test]
    fn test_fixed_int_equals_rejects_other_keys() {
        let mut buf = [0u8; 4];
        <FixedIntCodec<u32> as KeyCodec<u32>>::encode_into(&7u32, &mut buf);
        assert!(!<FixedIntCodec<u32> as KeyCodec<u32>>::equals_encoded(
            &buf, &8u32
        ));
    }

    #[test]
    fn test_raw_bytes_roundtrip() {
        let key = RawBytes::from(b"opaque payload".as_slice());
        let mut buf = vec![0u8; <RawBytesCodec as KeyCodec<RawBytes>>::encoded_len(&key)];
        <RawBytesCodec as KeyCodec<RawBytes>>::encode_into(&key, &mut buf);

        assert!(<RawBytesCodec as KeyCodec<RawBytes>>::equals_encoded(
            &buf, &key
        ));
        assert_eq!(
            <RawBytesCodec as KeyCodec<RawBytes>>::decode(&buf).unwrap(),
            key
        );
    }

    #[test]
    fn test_raw_bytes_empty() {
        let key = RawBytes::from(Vec::new());
        assert_eq!(<RawBytesCodec as KeyCodec<RawBytes>>::encoded_len(&key), 0);
        assert_eq!(
            <RawBytesCodec as KeyCodec<RawBytes>>::decode(&[]).unwrap(),
            key
        );
    }

    #[test]
    fn test_utf8_roundtrip() {
        let value = Utf8::from("grüße");
        let mut buf = vec![0u8; <Utf8Codec as ValueCodec<Utf8>>::encoded_len(&value)];
        <Utf8Codec as ValueCodec<Utf8>>::encode_into(&value, &mut buf);
        assert_eq!(
            <Utf8Codec as ValueCodec<Utf8>>::decode(&buf).unwrap(),
            value
        );
    }

    #[test]
    fn test_utf8_decode_invalid() {
        let invalid = [0xff, 0xfe, 0x00];
        assert!(<Utf8Codec as KeyCodec<Utf8>>::decode(&invalid).is_err());
    }
}
