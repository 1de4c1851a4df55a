//! Asynchronous block-channel writer.
//!
//! A [`BlockChannelWriter`] owns one worker thread that appends whole
//! segments to a block device. Each segment is returned through the
//! caller-supplied return queue once its write has been attempted — on
//! success *and* on failure — so the segment complement of the join stays
//! intact no matter what the disk does. The first write error is latched
//! and surfaced on the next `write_block` or on `close`.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::warn;

use crate::io::device::BlockDevice;
use crate::segment::MemorySegment;

enum WriteRequest {
    Block(MemorySegment),
    Shutdown,
}

struct WriterShared {
    error: Mutex<Option<io::Error>>,
    blocks_written: AtomicU64,
}

impl WriterShared {
    fn latched_error(&self) -> Option<io::Error> {
        self.error
            .lock()
            .as_ref()
            .map(|e| io::Error::new(e.kind(), e.to_string()))
    }
}

/// Writer for one spill channel.
pub struct BlockChannelWriter {
    tx: Sender<WriteRequest>,
    worker: Option<thread::JoinHandle<()>>,
    shared: Arc<WriterShared>,
    return_queue: Sender<MemorySegment>,
}

impl BlockChannelWriter {
    /// Create a writer over `device`, returning written segments through
    /// `return_queue`.
    pub fn new(
        device: Arc<dyn BlockDevice>,
        block_size: usize,
        return_queue: Sender<MemorySegment>,
    ) -> Self {
        let (tx, rx) = unbounded::<WriteRequest>();
        let shared = Arc::new(WriterShared {
            error: Mutex::new(None),
            blocks_written: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let worker_return_queue = return_queue.clone();
        let worker = thread::Builder::new()
            .name("oxijoin-spill-writer".into())
            .spawn(move || {
                worker_loop(device, block_size, worker_return_queue, rx, worker_shared)
            })
            .expect("failed to spawn spill writer thread");

        Self {
            tx,
            worker: Some(worker),
            shared,
            return_queue,
        }
    }

    /// Queue one full segment for writing.
    ///
    /// The segment comes back through the return queue once the write has
    /// been attempted — on failure too, so the caller's segment complement
    /// stays intact. Fails if an earlier write already failed.
    pub fn write_block(&self, segment: MemorySegment) -> io::Result<()> {
        let latched = self.shared.latched_error();

        if let Err(send_error) = self.tx.send(WriteRequest::Block(segment)) {
            // Worker is gone; hand the segment back ourselves.
            let WriteRequest::Block(segment) = send_error.0 else {
                unreachable!("block sends only carry blocks")
            };
            let _ = self.return_queue.send(segment);
            return Err(io::Error::other("spill writer thread is gone"));
        }

        match latched {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of blocks successfully written so far.
    pub fn blocks_written(&self) -> u64 {
        self.shared.blocks_written.load(Ordering::Acquire)
    }

    /// Stop the worker, flush the device, and surface any latched error.
    ///
    /// Idempotent; later calls return `Ok(())`.
    pub fn close(&mut self) -> io::Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let _ = self.tx.send(WriteRequest::Shutdown);
        let _ = worker.join();

        match self.shared.latched_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for BlockChannelWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn worker_loop(
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    return_queue: Sender<MemorySegment>,
    rx: Receiver<WriteRequest>,
    shared: Arc<WriterShared>,
) {
    let mut offset = 0u64;

    while let Ok(request) = rx.recv() {
        match request {
            WriteRequest::Block(segment) => {
                let failed_already = shared.error.lock().is_some();
                if !failed_already {
                    match device.write_at(offset, segment.as_slice()) {
                        Ok(()) => {
                            offset += block_size as u64;
                            shared.blocks_written.fetch_add(1, Ordering::AcqRel);
                        }
                        Err(e) => {
                            warn!("spill block write failed at offset {offset}: {e}");
                            *shared.error.lock() = Some(e);
                        }
                    }
                }
                // The segment goes back to the pool either way.
                let _ = return_queue.send(segment);
            }
            WriteRequest::Shutdown => break,
        }
    }

    if shared.error.lock().is_none() {
        if let Err(e) = device.flush() {
            warn!("spill channel flush failed: {e}");
            *shared.error.lock() = Some(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::device::FileDevice;

    fn segment_with_byte(size: usize, byte: u8) -> MemorySegment {
        let mut seg = MemorySegment::alloc(size).unwrap();
        seg.as_mut_slice().fill(byte);
        seg
    }

    #[test]
    fn test_blocks_written_in_order_and_returned() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(FileDevice::open(dir.path().join("chan"), true).unwrap());
        let (tx, rx) = unbounded();

        let mut writer = BlockChannelWriter::new(device.clone(), 512, tx);
        for i in 0..4u8 {
            writer.write_block(segment_with_byte(512, i)).unwrap();
        }
        writer.close().unwrap();

        // All four segments came back.
        assert_eq!(rx.try_iter().count(), 4);
        assert_eq!(writer.blocks_written(), 4);

        // Blocks landed sequentially.
        let mut buf = [0u8; 512];
        for i in 0..4u8 {
            assert_eq!(device.read_at(i as u64 * 512, &mut buf).unwrap(), 512);
            assert!(buf.iter().all(|&b| b == i));
        }
    }

    #[test]
    fn test_write_error_is_latched_and_segments_still_return() {
        struct FailingDevice;
        impl BlockDevice for FailingDevice {
            fn write_at(&self, _offset: u64, _buf: &[u8]) -> io::Result<()> {
                Err(io::Error::other("disk on fire"))
            }
            fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&self) -> io::Result<()> {
                Ok(())
            }
        }

        let (tx, rx) = unbounded();
        let mut writer = BlockChannelWriter::new(Arc::new(FailingDevice), 512, tx);

        writer.write_block(segment_with_byte(512, 1)).unwrap();
        let err = writer.close().unwrap_err();
        assert!(err.to_string().contains("disk on fire"));

        // The failed segment was still handed back.
        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(writer.blocks_written(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(FileDevice::open(dir.path().join("chan"), true).unwrap());
        let (tx, _rx) = unbounded();

        let mut writer = BlockChannelWriter::new(device, 512, tx);
        writer.close().unwrap();
        writer.close().unwrap();
    }
}
