//! Record encoding and hashing model.
//!
//! This module defines the serialization boundary of the join. A join
//! instance uses a [`KeyCodec`] and a [`ValueCodec`] (selected by the key
//! and value types through [`JoinKey`] / [`JoinValue`]) to turn records
//! into length-delimited bytes inside partition buffers and spill files,
//! and to compare probe keys against stored record bytes in place.
//!
//! The key codec also supplies the stable 32-bit key hash every table
//! lookup starts from; bucket and partition selection are derived from it
//! by the mixers in [`hash`].

mod bytes;
pub(crate) mod hash;

pub use bytes::{FixedIntCodec, RawBytes, RawBytesCodec, Utf8, Utf8Codec};
pub use hash::{bucket_mix, hash32, partition_mix};

use crate::error::Result;

/// Trait binding a key type to its default codec.
pub trait JoinKey: Clone + Eq + Send + Sync + 'static {
    /// Default codec for this key type.
    type Codec: KeyCodec<Self>;
}

/// Trait binding a value type to its default codec.
pub trait JoinValue: Clone + Send + Sync + 'static {
    /// Default codec for this value type.
    type Codec: ValueCodec<Self>;
}

/// Encode/decode and hashing contract for keys.
pub trait KeyCodec<K>: Send + Sync + 'static {
    /// Whether this codec produces fixed-size bytes for any `K`.
    const IS_FIXED: bool;
    /// Fixed encoded length in bytes (only meaningful when `IS_FIXED` is true).
    const FIXED_LEN: usize;

    /// Encoded length for the given key.
    fn encoded_len(key: &K) -> usize;

    /// Encode the key into the provided buffer.
    ///
    /// Implementations must write exactly `encoded_len(key)` bytes.
    fn encode_into(key: &K, dst: &mut [u8]);

    /// Compare an encoded key (from a partition buffer or spill file) to a
    /// typed key without allocating.
    fn equals_encoded(encoded: &[u8], key: &K) -> bool;

    /// Decode an encoded key into an owned value.
    fn decode(encoded: &[u8]) -> Result<K>;

    /// Hash encoded key bytes (stable, deterministic).
    #[inline]
    fn hash32_encoded(encoded: &[u8]) -> u32 {
        hash::hash32(encoded)
    }

    /// Hash a typed key (stable, deterministic).
    ///
    /// Implementations may override this to avoid the scratch encode.
    #[inline]
    fn hash32(key: &K) -> u32 {
        let mut buf = vec![0u8; Self::encoded_len(key)];
        Self::encode_into(key, &mut buf);
        Self::hash32_encoded(&buf)
    }
}

/// Encode/decode contract for values.
pub trait ValueCodec<V>: Send + Sync + 'static {
    /// Whether this codec produces fixed-size bytes for any `V`.
    const IS_FIXED: bool;
    /// Fixed encoded length in bytes (only meaningful when `IS_FIXED` is true).
    const FIXED_LEN: usize;

    /// Encoded length for the given value.
    fn encoded_len(value: &V) -> usize;

    /// Encode the value into the provided buffer.
    ///
    /// Implementations must write exactly `encoded_len(value)` bytes.
    fn encode_into(value: &V, dst: &mut [u8]);

    /// Decode an encoded value into an owned value.
    fn decode(encoded: &[u8]) -> Result<V>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const _: () = {
        assert!(<FixedIntCodec<u64> as KeyCodec<u64>>::IS_FIXED);
        assert!(<FixedIntCodec<u64> as KeyCodec<u64>>::FIXED_LEN == 8);
        assert!(!<RawBytesCodec as KeyCodec<RawBytes>>::IS_FIXED);
    };

    #[test]
    fn test_typed_hash_matches_encoded_hash() {
        let key: u64 = 12345;
        let mut buf = [0u8; 8];
        <FixedIntCodec<u64> as KeyCodec<u64>>::encode_into(&key, &mut buf);

        assert_eq!(
            <FixedIntCodec<u64> as KeyCodec<u64>>::hash32(&key),
            <FixedIntCodec<u64> as KeyCodec<u64>>::hash32_encoded(&buf)
        );
    }

    #[test]
    fn test_default_codec_bindings() {
        fn assert_join_key<K: JoinKey>() {}
        fn assert_join_value<V: JoinValue>() {}

        assert_join_key::<u64>();
        assert_join_key::<RawBytes>();
        assert_join_key::<Utf8>();
        assert_join_value::<u32>();
        assert_join_value::<RawBytes>();
        assert_join_value::<Utf8>();
    }
}
