//! Shared test utilities: fault injection and spill file inspection.

#![allow(dead_code)]

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::Sender;
use oxijoin::io::{
    BlockChannelReader, BlockChannelWriter, BlockDevice, ChannelEnumerator, ChannelId, FileDevice,
    IoManager,
};
use oxijoin::MemorySegment;

/// A fault-injection wrapper around any [`BlockDevice`].
///
/// Allows deterministic injection of a write error at a specific global
/// operation count, shared across every channel of one I/O manager.
pub struct FaultInjectionDevice<D> {
    inner: D,
    /// Total write_at calls observed across the manager.
    write_count: Arc<AtomicU64>,
    /// When non-zero, the Nth write (1-based) and all later ones fail.
    fail_writes_from: Arc<AtomicU64>,
}

impl<D: BlockDevice> BlockDevice for FaultInjectionDevice<D> {
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let n = self.write_count.fetch_add(1, Ordering::SeqCst) + 1;
        let from = self.fail_writes_from.load(Ordering::SeqCst);
        if from != 0 && n >= from {
            return Err(io::Error::other(format!(
                "injected write error at operation {n}"
            )));
        }
        self.inner.write_at(offset, buf)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_at(offset, buf)
    }

    fn flush(&self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// An I/O manager whose devices fail writes on demand.
pub struct FaultIoManager {
    base_dir: PathBuf,
    write_count: Arc<AtomicU64>,
    fail_writes_from: Arc<AtomicU64>,
}

impl FaultIoManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            write_count: Arc::new(AtomicU64::new(0)),
            fail_writes_from: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Make the Nth write (1-based) and every later write return an error.
    pub fn fail_writes_from(&self, operation_n: u64) {
        self.fail_writes_from.store(operation_n, Ordering::SeqCst);
    }

    /// Total writes observed so far.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }
}

impl IoManager for FaultIoManager {
    fn create_channel_enumerator(&self) -> ChannelEnumerator {
        ChannelEnumerator::new(self.base_dir.clone())
    }

    fn create_block_writer(
        &self,
        id: &ChannelId,
        block_size: usize,
        return_queue: Sender<MemorySegment>,
    ) -> io::Result<BlockChannelWriter> {
        let device = FaultInjectionDevice {
            inner: FileDevice::open(id.path(), true)?,
            write_count: Arc::clone(&self.write_count),
            fail_writes_from: Arc::clone(&self.fail_writes_from),
        };
        Ok(BlockChannelWriter::new(
            Arc::new(device),
            block_size,
            return_queue,
        ))
    }

    fn create_block_reader(
        &self,
        id: &ChannelId,
        block_size: usize,
    ) -> io::Result<BlockChannelReader> {
        let device = Arc::new(FileDevice::open(id.path(), false)?);
        Ok(BlockChannelReader::new(device, block_size))
    }

    fn delete_channel(&self, id: &ChannelId) -> io::Result<()> {
        match std::fs::remove_file(id.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Parse every record out of a spill channel, in file order.
pub fn read_channel_records<IO: IoManager>(
    io: &IO,
    channel: &ChannelId,
    block_size: usize,
) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut reader = io.create_block_reader(channel, block_size).unwrap();
    let mut block = MemorySegment::alloc(block_size).unwrap();
    let mut records = Vec::new();

    while reader.read_block(&mut block).unwrap() {
        let mut pos = 0usize;
        while pos + 4 <= block.size() {
            let total_len = block.get_u32(pos) as usize;
            if total_len == 0 {
                break;
            }
            let key_len = block.get_u32(pos + 4) as usize;
            let key = block.slice(pos + 8, key_len).to_vec();
            let value = block.slice(pos + 8 + key_len, total_len - 4 - key_len).to_vec();
            records.push((key, value));
            pos += 4 + total_len;
        }
    }
    records
}

/// Decode a little-endian u64 key from spill file bytes.
pub fn u64_from_bytes(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes.try_into().expect("u64 key bytes"))
}
