//! Hash bucket layout over memory segments.
//!
//! Buckets are fixed 1024-byte regions packed side by side into segments.
//! The layout inside a bucket is:
//!
//! ```text
//! +------------------------------ bucket ------------------------------+
//! | partition (1) | status (1) | element count (2) | overflow link (8) |
//! | hash 1 (4) | hash 2 (4) | ... | hash 84 (4)                        |
//! | pointer 1 (8) | pointer 2 (8) | ... | pointer 84 (8)               |
//! +--------------------------------------------------------------------+
//! ```
//!
//! Hashes and pointers are two parallel arrays rather than interleaved
//! pairs, so a probe can scan the contiguous hash region before touching
//! any pointer bytes. Once a bucket's partition has spilled, the 1012
//! payload bytes are reinterpreted as a bit vector over a secondary hash;
//! the entries that were present are folded into the vector so membership
//! tests have no false negatives.

use crate::pointer::RecordPointer;
use crate::segment::MemorySegment;

/// Number of address bits inside a bucket; bucket size is `1 << 10`.
pub const NUM_INTRA_BUCKET_BITS: u32 = 10;

/// Size of one hash bucket in bytes.
pub const HASH_BUCKET_SIZE: usize = 1 << NUM_INTRA_BUCKET_BITS;

/// Bytes of header before the hash array.
pub const BUCKET_HEADER_LEN: usize = 12;

/// Per-record overhead in the bucket table: a 4-byte hash plus an
/// 8-byte pointer.
pub const RECORD_OVERHEAD_BYTES: usize = 12;

/// Entries one bucket can hold before chaining into an overflow bucket.
pub const BUCKET_CAPACITY: usize = (HASH_BUCKET_SIZE - BUCKET_HEADER_LEN) / RECORD_OVERHEAD_BYTES;

/// Width of the degraded bucket's bit vector in bits.
pub const BIT_VECTOR_BITS: u32 = ((HASH_BUCKET_SIZE - BUCKET_HEADER_LEN) * 8) as u32;

/// Bucket status: its partition is in memory, entries are live pointers.
pub const STATUS_IN_MEMORY: u8 = 0;

/// Bucket status: its partition has spilled, payload is a bit vector.
pub const STATUS_SPILLED: u8 = 1;

const PARTITION_OFFSET: usize = 0;
const STATUS_OFFSET: usize = 1;
const COUNT_OFFSET: usize = 2;
const OVERFLOW_LINK_OFFSET: usize = 4;
const HASH_ARRAY_OFFSET: usize = BUCKET_HEADER_LEN;
const POINTER_ARRAY_OFFSET: usize = HASH_ARRAY_OFFSET + 4 * BUCKET_CAPACITY;

const _: () = assert!(POINTER_ARRAY_OFFSET + 8 * BUCKET_CAPACITY <= HASH_BUCKET_SIZE);
const _: () = assert!(BUCKET_CAPACITY == 84);

/// Mutable view of one bucket inside a segment.
pub struct BucketView<'a> {
    segment: &'a mut MemorySegment,
    base: usize,
}

impl<'a> BucketView<'a> {
    /// View the bucket starting at byte `base` of `segment`.
    #[inline]
    pub fn new(segment: &'a mut MemorySegment, base: usize) -> Self {
        debug_assert!(base + HASH_BUCKET_SIZE <= segment.size());
        Self { segment, base }
    }

    /// Initialize the bucket header for an in-memory partition.
    pub fn init(&mut self, partition: u8) {
        self.segment.put_u8(self.base + PARTITION_OFFSET, partition);
        self.segment
            .put_u8(self.base + STATUS_OFFSET, STATUS_IN_MEMORY);
        self.segment.put_u16(self.base + COUNT_OFFSET, 0);
        self.segment.put_u64(self.base + OVERFLOW_LINK_OFFSET, 0);
    }

    /// Partition this bucket belongs to.
    #[inline]
    pub fn partition(&self) -> u8 {
        self.segment.get_u8(self.base + PARTITION_OFFSET)
    }

    /// Current bucket status byte.
    #[inline]
    pub fn status(&self) -> u8 {
        self.segment.get_u8(self.base + STATUS_OFFSET)
    }

    /// Number of live entries.
    #[inline]
    pub fn count(&self) -> u16 {
        self.segment.get_u16(self.base + COUNT_OFFSET)
    }

    /// 1-based number of the next overflow bucket, 0 when the chain ends.
    #[inline]
    pub fn overflow_link(&self) -> u64 {
        self.segment.get_u64(self.base + OVERFLOW_LINK_OFFSET)
    }

    /// Link this bucket to overflow bucket `link` (1-based).
    #[inline]
    pub fn set_overflow_link(&mut self, link: u64) {
        self.segment.put_u64(self.base + OVERFLOW_LINK_OFFSET, link);
    }

    /// Append an entry, or report the bucket full.
    pub fn try_push(&mut self, hash: u32, pointer: RecordPointer) -> bool {
        let count = self.count() as usize;
        if count >= BUCKET_CAPACITY {
            return false;
        }
        self.segment
            .put_u32(self.base + HASH_ARRAY_OFFSET + 4 * count, hash);
        self.segment
            .put_u64(self.base + POINTER_ARRAY_OFFSET + 8 * count, pointer.raw());
        self.segment
            .put_u16(self.base + COUNT_OFFSET, (count + 1) as u16);
        true
    }

    /// Hash code of entry `index`.
    #[inline]
    pub fn hash_at(&self, index: usize) -> u32 {
        debug_assert!(index < self.count() as usize);
        self.segment.get_u32(self.base + HASH_ARRAY_OFFSET + 4 * index)
    }

    /// Record pointer of entry `index`.
    #[inline]
    pub fn pointer_at(&self, index: usize) -> RecordPointer {
        debug_assert!(index < self.count() as usize);
        RecordPointer::from_raw(
            self.segment
                .get_u64(self.base + POINTER_ARRAY_OFFSET + 8 * index),
        )
    }

    /// Collect the pointers of every entry whose hash equals `hash`.
    ///
    /// Scans the hash array only; pointer bytes are read for hits alone.
    pub fn collect_matches(&self, hash: u32, out: &mut Vec<RecordPointer>) {
        let count = self.count() as usize;
        for i in 0..count {
            if self.hash_at(i) == hash {
                out.push(self.pointer_at(i));
            }
        }
    }

    /// Collect every stored hash code.
    pub fn collect_hashes(&self, out: &mut Vec<u32>) {
        let count = self.count() as usize;
        for i in 0..count {
            out.push(self.hash_at(i));
        }
    }

    /// Repurpose the payload as an empty bit vector and mark the bucket
    /// spilled. Existing entries must have been collected beforehand.
    pub fn degrade_to_bit_vector(&mut self) {
        self.segment
            .zero_range(self.base + BUCKET_HEADER_LEN, HASH_BUCKET_SIZE - BUCKET_HEADER_LEN);
        self.segment.put_u8(self.base + STATUS_OFFSET, STATUS_SPILLED);
        self.segment.put_u16(self.base + COUNT_OFFSET, 0);
        self.segment.put_u64(self.base + OVERFLOW_LINK_OFFSET, 0);
    }

    /// Set the bit for secondary hash `bit_hash`.
    pub fn set_bit(&mut self, bit_hash: u32) {
        debug_assert_eq!(self.status(), STATUS_SPILLED);
        let bit = bit_hash % BIT_VECTOR_BITS;
        let byte = self.base + BUCKET_HEADER_LEN + (bit / 8) as usize;
        let mask = 1u8 << (bit % 8);
        self.segment.put_u8(byte, self.segment.get_u8(byte) | mask);
    }

    /// Test the bit for secondary hash `bit_hash`.
    pub fn test_bit(&self, bit_hash: u32) -> bool {
        debug_assert_eq!(self.status(), STATUS_SPILLED);
        let bit = bit_hash % BIT_VECTOR_BITS;
        let byte = self.base + BUCKET_HEADER_LEN + (bit / 8) as usize;
        let mask = 1u8 << (bit % 8);
        self.segment.get_u8(byte) & mask != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket_segment() -> MemorySegment {
        MemorySegment::alloc(4096).unwrap()
    }

    #[test]
    fn test_init_and_header_fields() {
        let mut seg = bucket_segment();
        let mut bucket = BucketView::new(&mut seg, 2048);
        bucket.init(5);

        assert_eq!(bucket.partition(), 5);
        assert_eq!(bucket.status(), STATUS_IN_MEMORY);
        assert_eq!(bucket.count(), 0);
        assert_eq!(bucket.overflow_link(), 0);
    }

    #[test]
    fn test_push_until_full() {
        let mut seg = bucket_segment();
        let mut bucket = BucketView::new(&mut seg, 0);
        bucket.init(0);

        for i in 0..BUCKET_CAPACITY {
            assert!(bucket.try_push(i as u32, RecordPointer::new(0, i as u32)));
        }
        assert_eq!(bucket.count() as usize, BUCKET_CAPACITY);
        assert!(!bucket.try_push(999, RecordPointer::new(0, 999)));

        // Entries kept insertion order.
        assert_eq!(bucket.hash_at(0), 0);
        assert_eq!(bucket.hash_at(83), 83);
        assert_eq!(bucket.pointer_at(83).offset(), 83);
    }

    #[test]
    fn test_parallel_arrays_do_not_overlap() {
        let mut seg = bucket_segment();
        let mut bucket = BucketView::new(&mut seg, 1024);
        bucket.init(1);

        for i in 0..BUCKET_CAPACITY {
            bucket.try_push(0xaaaa_0000 | i as u32, RecordPointer::new(7, i as u32));
        }
        for i in 0..BUCKET_CAPACITY {
            assert_eq!(bucket.hash_at(i), 0xaaaa_0000 | i as u32);
            assert_eq!(bucket.pointer_at(i).buffer_index(), 7);
            assert_eq!(bucket.pointer_at(i).offset(), i as u32);
        }
    }

    #[test]
    fn test_collect_matches_scans_hashes() {
        let mut seg = bucket_segment();
        let mut bucket = BucketView::new(&mut seg, 0);
        bucket.init(0);
        bucket.try_push(42, RecordPointer::new(0, 1));
        bucket.try_push(7, RecordPointer::new(0, 2));
        bucket.try_push(42, RecordPointer::new(0, 3));

        let mut hits = Vec::new();
        bucket.collect_matches(42, &mut hits);
        assert_eq!(
            hits,
            vec![RecordPointer::new(0, 1), RecordPointer::new(0, 3)]
        );
    }

    #[test]
    fn test_degrade_and_bit_vector() {
        let mut seg = bucket_segment();
        let mut bucket = BucketView::new(&mut seg, 0);
        bucket.init(3);
        bucket.try_push(100, RecordPointer::new(0, 0));
        bucket.set_overflow_link(17);

        let mut hashes = Vec::new();
        bucket.collect_hashes(&mut hashes);
        assert_eq!(hashes, vec![100]);

        bucket.degrade_to_bit_vector();
        assert_eq!(bucket.status(), STATUS_SPILLED);
        assert_eq!(bucket.count(), 0);
        assert_eq!(bucket.overflow_link(), 0);
        assert_eq!(bucket.partition(), 3);

        assert!(!bucket.test_bit(100));
        bucket.set_bit(100);
        assert!(bucket.test_bit(100));
        assert!(bucket.test_bit(100 + BIT_VECTOR_BITS));
        assert!(!bucket.test_bit(101));
    }

    #[test]
    fn test_adjacent_buckets_are_independent() {
        let mut seg = bucket_segment();
        {
            let mut first = BucketView::new(&mut seg, 0);
            first.init(1);
            for i in 0..BUCKET_CAPACITY {
                first.try_push(i as u32, RecordPointer::new(0, i as u32));
            }
        }
        {
            let mut second = BucketView::new(&mut seg, HASH_BUCKET_SIZE);
            second.init(2);
            assert_eq!(second.count(), 0);
            second.try_push(9, RecordPointer::new(0, 9));
        }

        let first = BucketView::new(&mut seg, 0);
        assert_eq!(first.count() as usize, BUCKET_CAPACITY);
        assert_eq!(first.partition(), 1);
    }
}
