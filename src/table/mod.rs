//! Hybrid hash join driver.
//!
//! [`HashJoin`] builds an in-memory hash table over the build side of a
//! join, sharded into partitions selected by a hash independent of the
//! bucket hash. While memory lasts, records live in partition buffers and
//! buckets hold `(hash, pointer)` entries. Under pressure the driver picks
//! the largest in-memory partition and streams its buffers to disk; the
//! partition keeps accepting records through a single write buffer that
//! cycles through the write-behind queue, and its buckets degrade into bit
//! vectors that route probe records to a probe-side spill file for a later
//! pass.

pub mod bucket;
mod partition;

use std::io;

use tracing::{debug, info, warn};

use crate::codec::{bucket_mix, partition_mix, JoinKey, JoinValue, KeyCodec, ValueCodec};
use crate::config::JoinConfig;
use crate::error::{JoinError, Result};
use crate::io::{ChannelEnumerator, ChannelId, FileIoManager, IoManager};
use crate::pointer::RecordPointer;
use crate::pool::SegmentPool;
use crate::segment::MemorySegment;
use crate::stats::JoinStats;
use crate::utility::{is_power_of_two, log2_floor, next_power_of_two};

use bucket::{
    BucketView, HASH_BUCKET_SIZE, NUM_INTRA_BUCKET_BITS, RECORD_OVERHEAD_BYTES, STATUS_SPILLED,
};
use partition::Partition;

/// Fewest memory segments a join will accept.
pub const MIN_NUM_MEMORY_SEGMENTS: usize = 33;

/// Largest possible partition fan-out (the bucket header stores the
/// partition number in one byte with the high bit reserved).
pub const MAX_NUM_PARTITIONS: usize = 127;

/// Record length estimate used when the caller provides none.
pub const DEFAULT_RECORD_LEN: usize = 100;

/// Cap on the number of write-behind buffers.
pub const MAX_WRITE_BEHIND_BUFFERS: usize = 6;

/// Number of segments diverted for asynchronous write-behind: the ceiling
/// of `log4(num_segments) - 1.5`, clamped to `[0, 6]`.
pub fn num_write_behind_buffers(num_segments: usize) -> usize {
    let raw = ((num_segments as f64).ln() / 4f64.ln() - 1.5).ceil() as i64;
    raw.clamp(0, MAX_WRITE_BEHIND_BUFFERS as i64) as usize
}

/// Partition fan-out when no cardinality estimates are available: close to
/// a tenth of the buffers, and always between 10 and 127.
pub fn partitioning_fan_out(num_segments: usize) -> usize {
    10.max((num_segments / 10).min(MAX_NUM_PARTITIONS))
}

/// Initial bucket count, rounded up to a power of two.
///
/// The table starts comparatively small, aiming for 200% bucket
/// utilization once every partition buffer is full: oversizing it would
/// take buffers away from the partitions with no way to give them back,
/// while undersizing only costs overflow buckets later.
pub fn initial_table_size(num_segments: usize, segment_size: usize, avg_record_len: usize) -> u32 {
    let total_bytes = segment_size as u64 * num_segments as u64;
    let records_storable = total_bytes / (avg_record_len + RECORD_OVERHEAD_BYTES) as u64;
    let bucket_bytes = records_storable * RECORD_OVERHEAD_BYTES as u64;
    let num_buckets = bucket_bytes / (2 * HASH_BUCKET_SIZE as u64) + 1;
    next_power_of_two(num_buckets).min(1 << 30) as u32
}

/// Outcome of probing one record against the table.
#[derive(Debug)]
pub enum ProbeOutcome<V> {
    /// The record's partition is in memory; these are the matching build
    /// values (possibly none).
    Matches(Vec<V>),
    /// The record's partition is spilled and the bit vector admitted the
    /// key; the record went to the partition's probe-side spill file.
    Forwarded,
    /// The record's partition is spilled and the bit vector ruled the key
    /// out. No match exists.
    Filtered,
}

/// Totals from draining the probe input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    /// Probe records processed.
    pub records: u64,
    /// In-memory matches found.
    pub matches: u64,
    /// Records forwarded to probe-side spill files.
    pub forwarded: u64,
    /// Records dropped by bit-vector filtering.
    pub filtered: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Built,
    Failed,
    Closed,
}

#[derive(Clone, Copy)]
enum BucketLoc {
    Primary(u32),
    Overflow(u64),
}

/// A hybrid hash join instance.
///
/// Statically parameterized over the key and value types (through their
/// codecs), both inputs, and the I/O manager; no dynamic dispatch sits on
/// the insert or probe path.
pub struct HashJoin<K, V, B, P, IO>
where
    K: JoinKey,
    V: JoinValue,
    B: Iterator<Item = (K, V)>,
    P: Iterator<Item = (K, V)>,
    IO: IoManager,
{
    build_input: Option<B>,
    probe_input: Option<P>,
    io: IO,
    pool: SegmentPool,
    enumerator: Option<ChannelEnumerator>,
    partitions: Vec<Partition>,
    bucket_segments: Vec<MemorySegment>,
    overflow_segments: Vec<MemorySegment>,
    allocated_overflow_buckets: u64,
    segment_size: usize,
    buckets_per_segment_bits: u32,
    buckets_per_segment_mask: u32,
    avg_record_len: usize,
    level: u32,
    num_buckets: u32,
    initial_segment_count: usize,
    phase: Phase,
    stats: JoinStats,
    key_scratch: Vec<u8>,
    value_scratch: Vec<u8>,
}

impl<K, V, B, P, IO> HashJoin<K, V, B, P, IO>
where
    K: JoinKey,
    V: JoinValue,
    B: Iterator<Item = (K, V)>,
    P: Iterator<Item = (K, V)>,
    IO: IoManager,
{
    /// Create a join over the given inputs and memory.
    ///
    /// `memory` is consumed and handed back by [`close`](Self::close). An
    /// `avg_record_len` below 1 falls back to 100 bytes.
    pub fn new(
        build_input: B,
        probe_input: P,
        memory: Vec<MemorySegment>,
        io: IO,
        avg_record_len: usize,
    ) -> Result<Self> {
        Self::with_write_behind(build_input, probe_input, memory, io, avg_record_len, None)
    }

    fn with_write_behind(
        build_input: B,
        probe_input: P,
        memory: Vec<MemorySegment>,
        io: IO,
        avg_record_len: usize,
        write_behind_override: Option<usize>,
    ) -> Result<Self> {
        if memory.len() < MIN_NUM_MEMORY_SEGMENTS {
            return Err(JoinError::invalid(format!(
                "too few memory segments provided; the hash join needs at least {MIN_NUM_MEMORY_SEGMENTS}"
            )));
        }
        let segment_size = memory[0].size();
        if !is_power_of_two(segment_size as u64) {
            return Err(JoinError::invalid(
                "the hash table requires segments whose size is a power of 2",
            ));
        }
        if segment_size < HASH_BUCKET_SIZE {
            return Err(JoinError::invalid(format!(
                "the hash table requires segments of at least {HASH_BUCKET_SIZE} bytes"
            )));
        }
        if memory.iter().any(|s| s.size() != segment_size) {
            return Err(JoinError::invalid(
                "all memory segments must share a single size",
            ));
        }

        let buckets_per_segment = (segment_size >> NUM_INTRA_BUCKET_BITS) as u32;
        let initial_segment_count = memory.len();
        let mut pool = SegmentPool::new(memory);

        let write_behind = write_behind_override
            .map(|n| n.min(MAX_WRITE_BEHIND_BUFFERS))
            .unwrap_or_else(|| num_write_behind_buffers(initial_segment_count));
        for _ in 0..write_behind {
            let segment = pool
                .acquire()?
                .ok_or_else(|| JoinError::internal("write-behind diversion drained the pool"))?;
            pool.park_write_behind(segment);
        }
        debug!(
            segments = initial_segment_count,
            segment_size, write_behind, "hash join constructed"
        );

        Ok(Self {
            build_input: Some(build_input),
            probe_input: Some(probe_input),
            io,
            pool,
            enumerator: None,
            partitions: Vec::new(),
            bucket_segments: Vec::new(),
            overflow_segments: Vec::new(),
            allocated_overflow_buckets: 0,
            segment_size,
            buckets_per_segment_bits: log2_floor(buckets_per_segment),
            buckets_per_segment_mask: buckets_per_segment - 1,
            avg_record_len: if avg_record_len < 1 {
                DEFAULT_RECORD_LEN
            } else {
                avg_record_len
            },
            level: 0,
            num_buckets: 0,
            initial_segment_count,
            phase: Phase::Created,
            stats: JoinStats::default(),
            key_scratch: Vec::new(),
            value_scratch: Vec::new(),
        })
    }

    /// Set the recursion level of this pass, perturbing both hash
    /// functions. Level 0 is the initial pass.
    pub fn with_partition_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    // ------------------------------------------------------------------
    // Life cycle
    // ------------------------------------------------------------------

    /// Run the build phase: consume the build input into the table,
    /// spilling partitions as memory demands.
    pub fn open(&mut self) -> Result<()> {
        if self.phase != Phase::Created {
            return Err(JoinError::internal(
                "open() called on a join that was already opened",
            ));
        }
        match self.build() {
            Ok(()) => {
                self.phase = Phase::Built;
                Ok(())
            }
            Err(e) => {
                self.phase = Phase::Failed;
                Err(e)
            }
        }
    }

    /// Probe one record against the table.
    pub fn probe(&mut self, key: &K, value: &V) -> Result<ProbeOutcome<V>> {
        if self.phase != Phase::Built {
            return Err(JoinError::internal("probe on a join that is not open"));
        }
        self.stats.probe_records += 1;

        self.encode_record(key, value);
        let hash = bucket_mix(K::Codec::hash32_encoded(&self.key_scratch), self.level);
        let bucket_index = hash & (self.num_buckets - 1);
        let partition_number = self.bucket_partition(bucket_index)? as usize;

        if self.partitions[partition_number].is_in_memory() {
            let matches = self.collect_matches(bucket_index, hash, key, partition_number)?;
            self.stats.probe_matches += matches.len() as u64;
            return Ok(ProbeOutcome::Matches(matches));
        }

        self.ensure_degraded(bucket_index);
        let bit = bucket_mix(hash, self.level + 1);
        let hit = self
            .bucket_view(BucketLoc::Primary(bucket_index))
            .test_bit(bit);
        if hit {
            self.forward_probe_record(partition_number)?;
            self.stats.probe_forwarded += 1;
            Ok(ProbeOutcome::Forwarded)
        } else {
            self.stats.probe_filtered += 1;
            Ok(ProbeOutcome::Filtered)
        }
    }

    /// Drain the probe input through [`probe`](Self::probe) and seal the
    /// probe-side spill channels.
    pub fn run_probe(&mut self) -> Result<ProbeSummary> {
        let input = self
            .probe_input
            .take()
            .ok_or_else(|| JoinError::internal("probe input already consumed"))?;

        let mut summary = ProbeSummary::default();
        for (key, value) in input {
            summary.records += 1;
            match self.probe(&key, &value)? {
                ProbeOutcome::Matches(matches) => summary.matches += matches.len() as u64,
                ProbeOutcome::Forwarded => summary.forwarded += 1,
                ProbeOutcome::Filtered => summary.filtered += 1,
            }
        }
        self.finish_probe()?;
        Ok(summary)
    }

    /// Seal and flush the probe-side spill channels so their contents are
    /// complete for the second pass.
    pub fn finish_probe(&mut self) -> Result<()> {
        for index in 0..self.partitions.len() {
            let flushed = self.partitions[index].finish_probe()?;
            if flushed > 0 {
                self.pool.reclaim_from_spill(flushed as usize);
                self.stats.blocks_spilled += flushed as u64;
            }
        }
        Ok(())
    }

    /// Release every resource: close writers, delete spill files, and hand
    /// back the complete segment list.
    pub fn close(&mut self) -> Result<Vec<MemorySegment>> {
        if self.phase == Phase::Closed {
            return Ok(Vec::new());
        }
        self.phase = Phase::Closed;

        // Stop the writers first so every in-flight segment lands back on
        // the write-behind queue before it is swept.
        for partition in &mut self.partitions {
            if let Err(e) = partition.close_writers() {
                warn!("spill writer reported an error during close: {e}");
            }
        }

        let mut segments: Vec<MemorySegment> = Vec::with_capacity(self.initial_segment_count);
        for partition in &mut self.partitions {
            segments.append(&mut partition.take_segments());
        }
        for partition in &self.partitions {
            for channel in [partition.spill_channel(), partition.probe_channel()]
                .into_iter()
                .flatten()
            {
                if let Err(e) = self.io.delete_channel(channel) {
                    warn!(channel = %channel, "failed to delete spill channel: {e}");
                }
            }
        }
        self.partitions.clear();

        segments.append(&mut self.bucket_segments);
        segments.append(&mut self.overflow_segments);

        let pool = std::mem::replace(&mut self.pool, SegmentPool::new(Vec::new()));
        segments.extend(pool.into_available());

        if segments.len() != self.initial_segment_count {
            return Err(JoinError::internal(format!(
                "segment conservation violated on close: expected {}, collected {}",
                self.initial_segment_count,
                segments.len()
            )));
        }
        Ok(segments)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Number of partitions the build side was fanned out into.
    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Number of primary buckets in the table.
    pub fn num_buckets(&self) -> u32 {
        self.num_buckets
    }

    /// Whether partition `index` has spilled.
    pub fn partition_is_spilled(&self, index: usize) -> bool {
        !self.partitions[index].is_in_memory()
    }

    /// Build-side records routed to partition `index`.
    pub fn partition_record_count(&self, index: usize) -> u64 {
        self.partitions[index].record_count()
    }

    /// Probe-side records forwarded to partition `index`.
    pub fn partition_probe_record_count(&self, index: usize) -> u64 {
        self.partitions[index].probe_record_count()
    }

    /// Build-side spill channel of partition `index`, if it spilled.
    pub fn partition_build_channel(&self, index: usize) -> Option<&ChannelId> {
        self.partitions[index].spill_channel()
    }

    /// Probe-side spill channel of partition `index`, if one was opened.
    pub fn partition_probe_channel(&self, index: usize) -> Option<&ChannelId> {
        self.partitions[index].probe_channel()
    }

    /// Partition a key would be routed to, via its bucket's partition byte.
    pub fn partition_of_key(&self, key: &K) -> Result<usize> {
        if self.num_buckets == 0 {
            return Err(JoinError::internal(
                "partition lookup before the table was built",
            ));
        }
        let mut encoded = vec![0u8; K::Codec::encoded_len(key)];
        K::Codec::encode_into(key, &mut encoded);
        let hash = bucket_mix(K::Codec::hash32_encoded(&encoded), self.level);
        let bucket_index = hash & (self.num_buckets - 1);
        Ok(self.bucket_partition(bucket_index)? as usize)
    }

    /// Segments owed to the available list but still in flight.
    pub fn write_behind_available(&self) -> usize {
        self.pool.write_behind_available()
    }

    /// Segment size shared by every buffer of this join.
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Activity counters.
    pub fn stats(&self) -> JoinStats {
        self.stats
    }

    /// The I/O manager, e.g. to replay spill channels for a second pass.
    pub fn io(&self) -> &IO {
        &self.io
    }

    // ------------------------------------------------------------------
    // Build phase
    // ------------------------------------------------------------------

    fn build(&mut self) -> Result<()> {
        let fan_out = partitioning_fan_out(self.pool.num_available());
        self.create_partitions(fan_out)?;

        let remaining = self.pool.num_available();
        let desired = initial_table_size(remaining, self.segment_size, self.avg_record_len);
        self.init_table(desired)?;
        info!(
            fan_out,
            num_buckets = self.num_buckets,
            "hash table initialized"
        );

        let mut input = self
            .build_input
            .take()
            .ok_or_else(|| JoinError::internal("build input already consumed"))?;
        while let Some((key, value)) = input.next() {
            self.insert_build_record(&key, &value)?;
        }

        self.finish_build()
    }

    fn create_partitions(&mut self, fan_out: usize) -> Result<()> {
        if self.pool.num_available() < fan_out {
            return Err(JoinError::internal(
                "cannot create more partitions than available buffers",
            ));
        }
        self.enumerator = Some(self.io.create_channel_enumerator());

        let write_behind = self.pool.write_behind_receiver();
        for _ in 0..fan_out {
            let segment = self
                .pool
                .acquire()?
                .ok_or_else(|| JoinError::internal("partition buffer allocation failed"))?;
            self.partitions
                .push(Partition::new(segment, write_behind.clone()));
        }
        Ok(())
    }

    fn init_table(&mut self, desired_buckets: u32) -> Result<()> {
        let buckets_per_segment = 1u32 << self.buckets_per_segment_bits;

        // The table never takes more than half of what is left; collisions
        // go to overflow buckets instead.
        let max_table_segments = (self.pool.num_available() / 2).max(1) as u32;
        let mut num_buckets = desired_buckets;
        while num_buckets.div_ceil(buckets_per_segment) > max_table_segments {
            num_buckets /= 2;
        }
        let num_segments = num_buckets.div_ceil(buckets_per_segment);

        let fan_out = self.partitions.len() as u32;
        for segment_index in 0..num_segments {
            let mut segment = self
                .pool
                .acquire()?
                .ok_or_else(|| JoinError::internal("bucket table allocation failed"))?;
            for in_segment in 0..buckets_per_segment {
                let bucket_index = segment_index * buckets_per_segment + in_segment;
                let partition = (partition_mix(bucket_index, self.level) % fan_out) as u8;
                let base = (in_segment << NUM_INTRA_BUCKET_BITS) as usize;
                BucketView::new(&mut segment, base).init(partition);
            }
            self.bucket_segments.push(segment);
        }
        self.num_buckets = num_buckets;
        Ok(())
    }

    fn insert_build_record(&mut self, key: &K, value: &V) -> Result<()> {
        self.encode_record(key, value);
        let hash = bucket_mix(K::Codec::hash32_encoded(&self.key_scratch), self.level);

        let key_scratch = std::mem::take(&mut self.key_scratch);
        let value_scratch = std::mem::take(&mut self.value_scratch);
        let result = self.insert_encoded(hash, &key_scratch, &value_scratch);
        self.key_scratch = key_scratch;
        self.value_scratch = value_scratch;

        if result.is_ok() {
            self.stats.records_built += 1;
        }
        result
    }

    fn insert_encoded(&mut self, hash: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let bucket_index = hash & (self.num_buckets - 1);
        let partition_number = self.bucket_partition(bucket_index)? as usize;

        // Step 1: the record goes into the partition's buffers.
        let pointer = match self.partitions[partition_number].insert(key, value)? {
            Some(pointer) => pointer,
            None => {
                let segment = self.next_buffer()?;
                if self.partitions[partition_number].is_in_memory() {
                    self.partitions[partition_number].add_buffer(segment);
                } else {
                    // Spilling freed memory by taking this very partition;
                    // its write path now cycles write-behind buffers.
                    self.pool.release(segment);
                }
                match self.partitions[partition_number].insert(key, value)? {
                    Some(pointer) => pointer,
                    None => {
                        return Err(JoinError::Io(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "record could not be added to a fresh buffer; record length exceeds the segment size limit",
                        )))
                    }
                }
            }
        };

        // Step 2: the bucket learns about the record.
        if self.partitions[partition_number].is_in_memory() {
            self.bucket_insert(bucket_index, hash, pointer, partition_number)
        } else {
            self.note_spilled_record(bucket_index, hash);
            Ok(())
        }
    }

    fn bucket_insert(
        &mut self,
        bucket_index: u32,
        hash: u32,
        pointer: RecordPointer,
        partition_number: usize,
    ) -> Result<()> {
        let mut loc = BucketLoc::Primary(bucket_index);
        loop {
            let next = {
                let mut view = self.bucket_view(loc);
                if view.try_push(hash, pointer) {
                    return Ok(());
                }
                view.overflow_link()
            };
            if next != 0 {
                loc = BucketLoc::Overflow(next);
                continue;
            }

            // End of the chain: grow it by one overflow bucket.
            let link = self.allocate_overflow_bucket()?;
            if !self.partitions[partition_number].is_in_memory() {
                // The allocation spilled this record's own partition; the
                // record lives on disk now and the chain degrades.
                self.note_spilled_record(bucket_index, hash);
                return Ok(());
            }
            self.bucket_view(BucketLoc::Overflow(link))
                .init(partition_number as u8);
            self.bucket_view(loc).set_overflow_link(link);
            let pushed = self.bucket_view(BucketLoc::Overflow(link)).try_push(hash, pointer);
            if !pushed {
                return Err(JoinError::internal("fresh overflow bucket rejected an entry"));
            }
            return Ok(());
        }
    }

    fn allocate_overflow_bucket(&mut self) -> Result<u64> {
        let per_segment = (self.segment_size >> NUM_INTRA_BUCKET_BITS) as u64;
        let capacity = self.overflow_segments.len() as u64 * per_segment;
        if self.allocated_overflow_buckets == capacity {
            let segment = self.next_buffer()?;
            self.overflow_segments.push(segment);
        }
        self.allocated_overflow_buckets += 1;
        self.stats.overflow_buckets += 1;
        Ok(self.allocated_overflow_buckets)
    }

    /// Next buffer for a partition or the table, spilling a partition when
    /// the pool comes up empty.
    fn next_buffer(&mut self) -> Result<MemorySegment> {
        if let Some(segment) = self.pool.acquire()? {
            return Ok(segment);
        }
        self.spill_partition()?;
        self.pool.acquire()?.ok_or_else(|| {
            JoinError::internal("no memory became available after spilling a partition")
        })
    }

    /// Spill the largest in-memory partition and return its index.
    fn spill_partition(&mut self) -> Result<usize> {
        let mut victim = None;
        let mut largest_blocks = 1; // a single-buffer partition cannot spill
        for (index, partition) in self.partitions.iter().enumerate() {
            if partition.is_in_memory() && partition.block_count() > largest_blocks {
                largest_blocks = partition.block_count();
                victim = Some(index);
            }
        }
        let Some(index) = victim else {
            return Err(JoinError::internal(
                "no in-memory partition with two or more buffers left to spill; the table is structurally too small",
            ));
        };

        let channel = self
            .enumerator
            .as_mut()
            .ok_or_else(|| JoinError::internal("spill requested before partitions were created"))?
            .next_id();
        let freed = self.partitions[index].spill(
            &self.io,
            channel,
            self.segment_size,
            self.pool.write_behind_sender(),
        )?;
        self.pool.reclaim_from_spill(freed as usize);
        self.stats.partitions_spilled += 1;
        self.stats.blocks_spilled += freed as u64 + 1;
        info!(partition = index, blocks = freed + 1, "spilled largest partition");
        Ok(index)
    }

    fn finish_build(&mut self) -> Result<()> {
        for index in 0..self.partitions.len() {
            if self.partitions[index].finish_build()? {
                self.pool.reclaim_from_spill(1);
                self.stats.blocks_spilled += 1;
            }
        }

        // Degrade any bucket of a spilled partition that no insert touched
        // after the spill, so probe-time status checks are uniform.
        for bucket_index in 0..self.num_buckets {
            let partition_number = self.bucket_partition(bucket_index)? as usize;
            if !self.partitions[partition_number].is_in_memory() {
                self.ensure_degraded(bucket_index);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Buckets
    // ------------------------------------------------------------------

    fn bucket_partition(&self, bucket_index: u32) -> Result<u8> {
        let segment = (bucket_index >> self.buckets_per_segment_bits) as usize;
        let base =
            ((bucket_index & self.buckets_per_segment_mask) << NUM_INTRA_BUCKET_BITS) as usize;
        let partition = self.bucket_segments[segment].get_u8(base);
        if (partition as usize) >= self.partitions.len() {
            return Err(JoinError::Corrupt(format!(
                "invalid partition number {partition} for bucket {bucket_index}"
            )));
        }
        Ok(partition)
    }

    fn bucket_view(&mut self, loc: BucketLoc) -> BucketView<'_> {
        match loc {
            BucketLoc::Primary(bucket_index) => {
                let segment = (bucket_index >> self.buckets_per_segment_bits) as usize;
                let base = ((bucket_index & self.buckets_per_segment_mask)
                    << NUM_INTRA_BUCKET_BITS) as usize;
                BucketView::new(&mut self.bucket_segments[segment], base)
            }
            BucketLoc::Overflow(link) => {
                let index = (link - 1) as usize;
                let per_segment = self.segment_size >> NUM_INTRA_BUCKET_BITS;
                let segment = index / per_segment;
                let base = (index % per_segment) << NUM_INTRA_BUCKET_BITS;
                BucketView::new(&mut self.overflow_segments[segment], base)
            }
        }
    }

    /// Turn the bucket into a bit vector if it still carries entries.
    ///
    /// Every hash already recorded in the bucket and its overflow chain is
    /// folded into the vector, so membership tests never miss a record of
    /// the spilled partition.
    fn ensure_degraded(&mut self, bucket_index: u32) {
        if self
            .bucket_view(BucketLoc::Primary(bucket_index))
            .status()
            == STATUS_SPILLED
        {
            return;
        }

        let mut hashes = Vec::new();
        let mut loc = BucketLoc::Primary(bucket_index);
        loop {
            let view = self.bucket_view(loc);
            view.collect_hashes(&mut hashes);
            let next = view.overflow_link();
            if next == 0 {
                break;
            }
            loc = BucketLoc::Overflow(next);
        }

        let level = self.level;
        let mut view = self.bucket_view(BucketLoc::Primary(bucket_index));
        view.degrade_to_bit_vector();
        for hash in hashes {
            view.set_bit(bucket_mix(hash, level + 1));
        }
    }

    fn note_spilled_record(&mut self, bucket_index: u32, hash: u32) {
        self.ensure_degraded(bucket_index);
        let bit = bucket_mix(hash, self.level + 1);
        self.bucket_view(BucketLoc::Primary(bucket_index)).set_bit(bit);
    }

    // ------------------------------------------------------------------
    // Probe phase
    // ------------------------------------------------------------------

    fn collect_matches(
        &mut self,
        bucket_index: u32,
        hash: u32,
        key: &K,
        partition_number: usize,
    ) -> Result<Vec<V>> {
        let mut pointers = Vec::new();
        let mut loc = BucketLoc::Primary(bucket_index);
        loop {
            let view = self.bucket_view(loc);
            view.collect_matches(hash, &mut pointers);
            let next = view.overflow_link();
            if next == 0 {
                break;
            }
            loc = BucketLoc::Overflow(next);
        }

        let partition = &self.partitions[partition_number];
        let mut matches = Vec::new();
        for pointer in pointers {
            let (key_bytes, value_bytes) = partition.record_at(pointer)?;
            if K::Codec::equals_encoded(key_bytes, key) {
                matches.push(V::Codec::decode(value_bytes)?);
            }
        }
        Ok(matches)
    }

    fn forward_probe_record(&mut self, partition_number: usize) -> Result<()> {
        if !self.partitions[partition_number].has_probe_channel() {
            let channel = self
                .enumerator
                .as_mut()
                .ok_or_else(|| JoinError::internal("probe before partitions were created"))?
                .next_id();
            let writer = self.io.create_block_writer(
                &channel,
                self.segment_size,
                self.pool.write_behind_sender(),
            )?;
            let buffer = self.next_buffer()?;
            self.partitions[partition_number].attach_probe_channel(writer, channel, buffer);
        }

        let key_scratch = std::mem::take(&mut self.key_scratch);
        let value_scratch = std::mem::take(&mut self.value_scratch);
        let result =
            self.partitions[partition_number].forward_probe(&key_scratch, &value_scratch);
        self.key_scratch = key_scratch;
        self.value_scratch = value_scratch;
        result
    }

    fn encode_record(&mut self, key: &K, value: &V) {
        self.key_scratch.clear();
        self.key_scratch.resize(K::Codec::encoded_len(key), 0);
        K::Codec::encode_into(key, &mut self.key_scratch);

        self.value_scratch.clear();
        self.value_scratch.resize(V::Codec::encoded_len(value), 0);
        V::Codec::encode_into(value, &mut self.value_scratch);
    }
}

impl<K, V, B, P> HashJoin<K, V, B, P, FileIoManager>
where
    K: JoinKey,
    V: JoinValue,
    B: Iterator<Item = (K, V)>,
    P: Iterator<Item = (K, V)>,
{
    /// Create a file-backed join configured through a [`JoinConfig`].
    ///
    /// Spill channels go under `config.spill_dir`, or a crate-named
    /// directory below the system temp directory when unset.
    pub fn with_config(
        build_input: B,
        probe_input: P,
        memory: Vec<MemorySegment>,
        config: &JoinConfig,
    ) -> Result<Self> {
        let spill_dir = config
            .spill_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("oxijoin"));
        let io = FileIoManager::new(spill_dir)?;
        Self::with_write_behind(
            build_input,
            probe_input,
            memory,
            io,
            config.avg_record_len,
            config.write_behind,
        )
    }
}
