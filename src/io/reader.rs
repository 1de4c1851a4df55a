//! Sequential block-channel reader.
//!
//! Reads back the whole segments a [`super::BlockChannelWriter`] produced,
//! in write order. Used to replay a spilled partition as the build or probe
//! input of a later join pass.

use std::io;
use std::sync::Arc;

use crate::io::device::BlockDevice;
use crate::segment::MemorySegment;

/// Reader for one spill channel.
pub struct BlockChannelReader {
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    next_block: u64,
}

impl BlockChannelReader {
    /// Create a reader positioned at the first block.
    pub fn new(device: Arc<dyn BlockDevice>, block_size: usize) -> Self {
        Self {
            device,
            block_size,
            next_block: 0,
        }
    }

    /// Read the next block into `segment`.
    ///
    /// Returns `false` at end of channel. A trailing partial block means the
    /// channel was cut short and is reported as `UnexpectedEof`.
    pub fn read_block(&mut self, segment: &mut MemorySegment) -> io::Result<bool> {
        debug_assert_eq!(segment.size(), self.block_size);

        let offset = self.next_block * self.block_size as u64;
        let n = self.device.read_at(offset, segment.as_mut_slice())?;
        if n == 0 {
            return Ok(false);
        }
        if n < self.block_size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("truncated spill block: {n} of {} bytes", self.block_size),
            ));
        }

        self.next_block += 1;
        Ok(true)
    }

    /// Number of whole blocks read so far.
    pub fn blocks_read(&self) -> u64 {
        self.next_block
    }
}
