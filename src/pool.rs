//! Segment pool: free-list plus write-behind bridge.
//!
//! The pool tracks every segment the join is not actively using: an
//! `available` list served LIFO to the driver, and the write-behind queue —
//! a channel the spill writers push segments back through once their disk
//! writes complete. A counter records how many segments are logically owed
//! to the available list but still in flight behind the queue; `acquire`
//! may block on the queue only while that counter is positive.
//!
//! The queue is the single structure shared between the driver and the
//! writer threads. Spilled partitions hold their own receiver clone and
//! take replacement tail buffers from it directly, without touching the
//! counter; those takes are balanced by the sends of their own full tails.

use std::io;

use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};

use crate::segment::MemorySegment;

/// Pool of free memory segments for one join instance.
pub struct SegmentPool {
    /// Synchronously available segments, popped from the tail.
    available: Vec<MemorySegment>,
    /// Producer half of the write-behind queue, cloned into spill writers.
    write_behind_tx: Sender<MemorySegment>,
    /// Consumer half of the write-behind queue.
    write_behind_rx: Receiver<MemorySegment>,
    /// Segments owed to the available list but still behind the queue.
    write_behind_available: usize,
}

impl SegmentPool {
    /// Create a pool over an initial list of free segments.
    pub fn new(available: Vec<MemorySegment>) -> Self {
        let (write_behind_tx, write_behind_rx) = unbounded();
        Self {
            available,
            write_behind_tx,
            write_behind_rx,
            write_behind_available: 0,
        }
    }

    /// Sender handle for block-channel writers returning finished segments.
    pub fn write_behind_sender(&self) -> Sender<MemorySegment> {
        self.write_behind_tx.clone()
    }

    /// Receiver handle for spilled partitions cycling their tail buffers.
    pub fn write_behind_receiver(&self) -> Receiver<MemorySegment> {
        self.write_behind_rx.clone()
    }

    /// Park a segment on the write-behind queue.
    ///
    /// Used at construction time to divert the configured number of
    /// write-behind buffers; they circulate through spill writers and are
    /// not counted as owed to the available list.
    pub fn park_write_behind(&self, segment: MemorySegment) {
        // Cannot fail: the pool holds both channel halves.
        let _ = self.write_behind_tx.send(segment);
    }

    /// Get the next free segment, or `None` if no segment can be produced.
    ///
    /// Pops from the available list first. When the list is empty but
    /// write-behind segments are outstanding, blocks for one, then drains
    /// any further segments that already arrived.
    pub fn acquire(&mut self) -> io::Result<Option<MemorySegment>> {
        if let Some(segment) = self.available.pop() {
            return Ok(Some(segment));
        }

        if self.write_behind_available == 0 {
            return Ok(None);
        }

        // Grab at least one, no matter what.
        let segment = self.write_behind_rx.recv().map_err(|_| {
            io::Error::new(
                io::ErrorKind::Interrupted,
                "hybrid hash join was interrupted while taking a write-behind buffer",
            )
        })?;
        self.write_behind_available -= 1;

        self.drain_ready();
        Ok(Some(segment))
    }

    /// Register `n` freshly spilled segments as in flight, then move any
    /// that already came back onto the available list.
    pub fn reclaim_from_spill(&mut self, n: usize) {
        self.write_behind_available += n;
        self.drain_ready();
    }

    /// Return a segment to the available list.
    pub fn release(&mut self, segment: MemorySegment) {
        self.available.push(segment);
    }

    /// Number of synchronously available segments.
    pub fn num_available(&self) -> usize {
        self.available.len()
    }

    /// Number of segments still owed by the write-behind queue.
    pub fn write_behind_available(&self) -> usize {
        self.write_behind_available
    }

    /// Blocking take from the write-behind queue, regardless of the counter.
    ///
    /// Used during teardown to collect in-flight segments.
    pub fn take_write_behind_blocking(&mut self) -> io::Result<MemorySegment> {
        self.write_behind_rx.recv().map_err(|_| {
            io::Error::new(
                io::ErrorKind::Interrupted,
                "hybrid hash join was interrupted while draining write-behind buffers",
            )
        })
    }

    /// Consume the pool and hand back everything on the available list.
    pub fn into_available(mut self) -> Vec<MemorySegment> {
        // Sweep anything parked on the queue as well; in-flight segments
        // must have been drained by the caller beforehand.
        while let Ok(segment) = self.write_behind_rx.try_recv() {
            self.available.push(segment);
        }
        self.available
    }

    fn drain_ready(&mut self) {
        while self.write_behind_available > 0 {
            match self.write_behind_rx.try_recv() {
                Ok(segment) => {
                    self.available.push(segment);
                    self.write_behind_available -= 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }
}

impl std::fmt::Debug for SegmentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentPool")
            .field("available", &self.available.len())
            .field("write_behind_available", &self.write_behind_available)
            .finish()
    }
}
