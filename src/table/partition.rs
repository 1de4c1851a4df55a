//! Build partitions and their record buffers.
//!
//! A partition owns the record buffers for one shard of the build side. It
//! starts in memory with a single buffer and grows by whole segments. When
//! the join spills it, every buffer is streamed to a block channel and the
//! partition continues with exactly one active write buffer that cycles
//! through the write-behind queue. The transition happens at most once; a
//! spilled partition never returns to memory.
//!
//! Records are length-delimited inside a buffer:
//! `u32 total_len | u32 key_len | key | value`, where `total_len` counts
//! everything after the length word. A zero length word (or fewer than four
//! bytes of tail space) terminates the block.

use std::io;

use crossbeam::channel::{Receiver, Sender};
use tracing::debug;

use crate::error::{JoinError, Result};
use crate::io::{BlockChannelWriter, ChannelId, IoManager};
use crate::pointer::RecordPointer;
use crate::segment::MemorySegment;

/// Bytes of record framing ahead of the key: total length and key length.
pub(crate) const RECORD_FRAME_LEN: usize = 8;

/// Length-delimited write cursor over one segment.
pub(crate) struct BuildBuffer {
    segment: MemorySegment,
    position: usize,
}

impl BuildBuffer {
    pub(crate) fn new(segment: MemorySegment) -> Self {
        Self {
            segment,
            position: 0,
        }
    }

    /// Write one record, returning its byte offset, or `None` when the
    /// remaining space is too small.
    pub(crate) fn try_write(&mut self, key: &[u8], value: &[u8]) -> Option<u32> {
        let needed = RECORD_FRAME_LEN + key.len() + value.len();
        if self.position + needed > self.segment.size() {
            return None;
        }

        let offset = self.position;
        self.segment
            .put_u32(offset, (4 + key.len() + value.len()) as u32);
        self.segment.put_u32(offset + 4, key.len() as u32);
        self.segment.write_slice(offset + 8, key);
        self.segment.write_slice(offset + 8 + key.len(), value);
        self.position += needed;
        Some(offset as u32)
    }

    /// Read the record starting at `offset`, returning key and value bytes.
    pub(crate) fn record_at(&self, offset: usize) -> Result<(&[u8], &[u8])> {
        if offset + RECORD_FRAME_LEN > self.position {
            return Err(JoinError::Corrupt(format!(
                "record pointer offset {offset} past write position {}",
                self.position
            )));
        }
        let total_len = self.segment.get_u32(offset) as usize;
        let key_len = self.segment.get_u32(offset + 4) as usize;
        if total_len < 4 + key_len || offset + 4 + total_len > self.position {
            return Err(JoinError::Corrupt(format!(
                "malformed record frame at offset {offset}"
            )));
        }
        let key = self.segment.slice(offset + 8, key_len);
        let value = self
            .segment
            .slice(offset + 8 + key_len, total_len - 4 - key_len);
        Ok((key, value))
    }

    /// Terminate the block so a reader stops at the last record.
    ///
    /// Zeroes the whole unused tail: a reused write-behind segment may
    /// carry bytes from its previous life, and spilled blocks must depend
    /// only on the records written into them.
    pub(crate) fn seal(&mut self) {
        let tail = self.segment.size() - self.position;
        if tail > 0 {
            self.segment.zero_range(self.position, tail);
        }
    }

    pub(crate) fn into_segment(self) -> MemorySegment {
        self.segment
    }
}

/// One shard of the build side.
pub(crate) struct Partition {
    /// In memory: all record buffers, tail last. Spilled: the single
    /// active write buffer.
    buffers: Vec<BuildBuffer>,
    /// Build-side spill channel, present once spilled.
    spill_writer: Option<BlockChannelWriter>,
    spill_channel: Option<ChannelId>,
    /// Probe-side spill channel, opened lazily during the probe phase.
    probe_writer: Option<BlockChannelWriter>,
    probe_channel: Option<ChannelId>,
    probe_buffer: Option<BuildBuffer>,
    /// Records inserted on the build side.
    record_counter: u64,
    /// Probe records forwarded to the probe-side channel.
    probe_record_counter: u64,
    /// Buffers ever attached to this partition.
    block_counter: u32,
    /// Replacement buffers for the spilled write path.
    write_behind: Receiver<MemorySegment>,
}

impl Partition {
    pub(crate) fn new(initial_buffer: MemorySegment, write_behind: Receiver<MemorySegment>) -> Self {
        let mut partition = Self {
            buffers: Vec::with_capacity(4),
            spill_writer: None,
            spill_channel: None,
            probe_writer: None,
            probe_channel: None,
            probe_buffer: None,
            record_counter: 0,
            probe_record_counter: 0,
            block_counter: 0,
            write_behind,
        };
        partition.add_buffer(initial_buffer);
        partition
    }

    /// Whether this partition still holds its records in memory.
    #[inline]
    pub(crate) fn is_in_memory(&self) -> bool {
        self.spill_writer.is_none()
    }

    pub(crate) fn record_count(&self) -> u64 {
        self.record_counter
    }

    pub(crate) fn probe_record_count(&self) -> u64 {
        self.probe_record_counter
    }

    pub(crate) fn block_count(&self) -> u32 {
        self.block_counter
    }

    pub(crate) fn spill_channel(&self) -> Option<&ChannelId> {
        self.spill_channel.as_ref()
    }

    pub(crate) fn probe_channel(&self) -> Option<&ChannelId> {
        self.probe_channel.as_ref()
    }

    /// Insert a record.
    ///
    /// In memory, returns the record's pointer, or `None` when the tail
    /// buffer is full — the caller then attaches another buffer or spills.
    /// Spilled, the partition cycles its write buffer through the
    /// write-behind queue by itself and never reports a full buffer; the
    /// returned pointer carries no meaning.
    pub(crate) fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<Option<RecordPointer>> {
        if self.is_in_memory() {
            let tail_index = (self.buffers.len() - 1) as u32;
            let tail = self.buffers.last_mut().expect("partition without buffers");
            match tail.try_write(key, value) {
                Some(offset) => {
                    self.record_counter += 1;
                    Ok(Some(RecordPointer::new(tail_index, offset)))
                }
                None => Ok(None),
            }
        } else {
            let buffer = self.buffers.last_mut().expect("spilled partition lost its write buffer");
            if buffer.try_write(key, value).is_none() {
                // Tail is full: send it off and continue on a fresh one.
                let mut full = self.buffers.pop().expect("spilled partition lost its write buffer");
                full.seal();
                self.writer()?.write_block(full.into_segment())?;

                let next = self.take_write_behind_buffer()?;
                self.buffers.push(BuildBuffer::new(next));
                let fresh = self.buffers.last_mut().expect("just pushed");
                if fresh.try_write(key, value).is_none() {
                    return Err(JoinError::Io(oversized_record_error(key, value)));
                }
            }
            self.record_counter += 1;
            Ok(Some(RecordPointer::from_raw(0)))
        }
    }

    /// Attach a fresh buffer as the new tail.
    ///
    /// Only meaningful while in memory, or exactly once during the spill
    /// transition.
    pub(crate) fn add_buffer(&mut self, segment: MemorySegment) {
        self.buffers.push(BuildBuffer::new(segment));
        self.block_counter += 1;
    }

    /// Spill this partition: stream every buffer to a new block channel and
    /// continue with a single write buffer from the write-behind queue.
    ///
    /// Returns the number of buffers the pool may count as liberated (one
    /// less than were streamed, because the replacement tail is taken right
    /// back).
    pub(crate) fn spill<IO: IoManager>(
        &mut self,
        io: &IO,
        channel: ChannelId,
        block_size: usize,
        return_queue: Sender<MemorySegment>,
    ) -> Result<u32> {
        if !self.is_in_memory() {
            return Err(JoinError::internal(
                "request to spill a partition that has already been spilled",
            ));
        }
        if self.block_counter < 2 {
            return Err(JoinError::internal(
                "request to spill a partition with less than two buffers",
            ));
        }

        let writer = io.create_block_writer(&channel, block_size, return_queue)?;
        let num_blocks = self.buffers.len() as u32;
        debug!(
            channel = %channel,
            blocks = num_blocks,
            records = self.record_counter,
            "spilling partition"
        );

        for mut buffer in self.buffers.drain(..) {
            buffer.seal();
            writer.write_block(buffer.into_segment())?;
        }
        self.spill_writer = Some(writer);
        self.spill_channel = Some(channel);

        // Reclaim one buffer as the ongoing spill tail.
        let tail = self.take_write_behind_buffer()?;
        self.add_buffer(tail);

        Ok(num_blocks - 1)
    }

    /// Seal and flush the spill tail at the end of the build phase, then
    /// close the build-side writer so write errors surface before probing.
    ///
    /// Returns `true` when a tail buffer was handed to the writer (the pool
    /// may then count one more write-behind segment).
    pub(crate) fn finish_build(&mut self) -> Result<bool> {
        if self.is_in_memory() {
            return Ok(false);
        }

        let mut tail = self.buffers.pop().expect("spilled partition lost its write buffer");
        tail.seal();
        self.writer()?.write_block(tail.into_segment())?;

        if let Some(writer) = self.spill_writer.as_mut() {
            writer.close()?;
        }
        Ok(true)
    }

    /// Forward a probe-side record to this spilled partition's probe
    /// channel. The caller supplies the channel and first buffer on the
    /// first call.
    pub(crate) fn forward_probe(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let buffer = self
            .probe_buffer
            .as_mut()
            .ok_or_else(|| JoinError::internal("probe forwarding without a probe buffer"))?;

        if buffer.try_write(key, value).is_none() {
            let mut full = self.probe_buffer.take().expect("checked above");
            full.seal();
            let writer = self
                .probe_writer
                .as_ref()
                .ok_or_else(|| JoinError::internal("probe forwarding without a probe writer"))?;
            writer.write_block(full.into_segment())?;

            let next = self.take_write_behind_buffer()?;
            let mut fresh = BuildBuffer::new(next);
            if fresh.try_write(key, value).is_none() {
                return Err(JoinError::Io(oversized_record_error(key, value)));
            }
            self.probe_buffer = Some(fresh);
        }
        self.probe_record_counter += 1;
        Ok(())
    }

    /// Whether the probe-side channel has been opened.
    pub(crate) fn has_probe_channel(&self) -> bool {
        self.probe_writer.is_some()
    }

    /// Install the lazily created probe-side channel and its first buffer.
    pub(crate) fn attach_probe_channel(
        &mut self,
        writer: BlockChannelWriter,
        channel: ChannelId,
        buffer: MemorySegment,
    ) {
        self.probe_writer = Some(writer);
        self.probe_channel = Some(channel);
        self.probe_buffer = Some(BuildBuffer::new(buffer));
    }

    /// Seal and flush the probe tail and close the probe-side writer.
    ///
    /// Returns the number of buffers handed to the writer.
    pub(crate) fn finish_probe(&mut self) -> Result<u32> {
        let Some(writer) = self.probe_writer.as_mut() else {
            return Ok(0);
        };
        let mut flushed = 0;
        if let Some(mut tail) = self.probe_buffer.take() {
            tail.seal();
            writer.write_block(tail.into_segment())?;
            flushed = 1;
        }
        writer.close()?;
        Ok(flushed)
    }

    /// Read the record a pointer refers to. Only valid while in memory.
    pub(crate) fn record_at(&self, pointer: RecordPointer) -> Result<(&[u8], &[u8])> {
        let index = pointer.buffer_index() as usize;
        let buffer = self.buffers.get(index).ok_or_else(|| {
            JoinError::Corrupt(format!(
                "record pointer into buffer {index} of a partition with {} buffers",
                self.buffers.len()
            ))
        })?;
        buffer.record_at(pointer.offset() as usize)
    }

    /// Close both writers, surfacing the first latched error.
    pub(crate) fn close_writers(&mut self) -> io::Result<()> {
        let mut first_error = None;
        for writer in [self.spill_writer.as_mut(), self.probe_writer.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = writer.close() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove and return every segment this partition still owns.
    pub(crate) fn take_segments(&mut self) -> Vec<MemorySegment> {
        let mut segments: Vec<MemorySegment> = self
            .buffers
            .drain(..)
            .map(BuildBuffer::into_segment)
            .collect();
        if let Some(buffer) = self.probe_buffer.take() {
            segments.push(buffer.into_segment());
        }
        segments
    }

    fn writer(&self) -> Result<&BlockChannelWriter> {
        self.spill_writer
            .as_ref()
            .ok_or_else(|| JoinError::internal("spilled partition without a writer"))
    }

    fn take_write_behind_buffer(&mut self) -> Result<MemorySegment> {
        self.write_behind.recv().map_err(|_| {
            JoinError::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                "hybrid hash join partition was interrupted while taking a buffer",
            ))
        })
    }
}

fn oversized_record_error(key: &[u8], value: &[u8]) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!(
            "record could not be added to a fresh buffer; record length {} exceeds the segment size limit",
            RECORD_FRAME_LEN + key.len() + value.len()
        ),
    )
}
