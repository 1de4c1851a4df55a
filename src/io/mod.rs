//! Spill channel management.
//!
//! An [`IoManager`] hands out spill channels: unique [`ChannelId`]s from an
//! enumerator, [`BlockChannelWriter`]s that stream segments to a channel
//! and return them through the write-behind queue, and
//! [`BlockChannelReader`]s that replay a channel for a later pass. The
//! default [`FileIoManager`] maps each channel to one file under a base
//! directory; tests substitute their own manager to inject device faults.

mod device;
mod reader;
mod writer;

pub use device::{BlockDevice, FileDevice};
pub use reader::BlockChannelReader;
pub use writer::BlockChannelWriter;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam::channel::Sender;
use uuid::Uuid;

use crate::segment::MemorySegment;

/// Identity of one spill channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId {
    path: PathBuf,
}

impl ChannelId {
    /// Create a channel id from a concrete path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Path of the channel's backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Generator of unique channel ids under one base directory.
///
/// Ids carry a random tag so concurrent join instances sharing a spill
/// directory never collide.
pub struct ChannelEnumerator {
    base_dir: PathBuf,
    tag: String,
    counter: u32,
}

impl ChannelEnumerator {
    /// Create an enumerator rooted at `base_dir`.
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            tag: Uuid::new_v4().simple().to_string(),
            counter: 0,
        }
    }

    /// Produce the next unique channel id.
    pub fn next_id(&mut self) -> ChannelId {
        let id = ChannelId::new(
            self.base_dir
                .join(format!("{}.{:06}.channel", self.tag, self.counter)),
        );
        self.counter += 1;
        id
    }
}

/// Factory for spill channels.
pub trait IoManager: Send + Sync + 'static {
    /// Create an enumerator producing unique channel ids.
    fn create_channel_enumerator(&self) -> ChannelEnumerator;

    /// Create a writer for `id` that returns segments via `return_queue`.
    fn create_block_writer(
        &self,
        id: &ChannelId,
        block_size: usize,
        return_queue: Sender<MemorySegment>,
    ) -> io::Result<BlockChannelWriter>;

    /// Create a reader over the blocks previously written to `id`.
    fn create_block_reader(
        &self,
        id: &ChannelId,
        block_size: usize,
    ) -> io::Result<BlockChannelReader>;

    /// Delete the channel's backing storage.
    fn delete_channel(&self, id: &ChannelId) -> io::Result<()>;
}

/// File-backed I/O manager: one file per channel under a base directory.
pub struct FileIoManager {
    base_dir: PathBuf,
}

impl FileIoManager {
    /// Create a manager rooted at `base_dir`, creating the directory.
    pub fn new(base_dir: impl AsRef<Path>) -> io::Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// The directory spill files are created under.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

impl IoManager for FileIoManager {
    fn create_channel_enumerator(&self) -> ChannelEnumerator {
        ChannelEnumerator::new(self.base_dir.clone())
    }

    fn create_block_writer(
        &self,
        id: &ChannelId,
        block_size: usize,
        return_queue: Sender<MemorySegment>,
    ) -> io::Result<BlockChannelWriter> {
        let device = Arc::new(FileDevice::open(id.path(), true)?);
        Ok(BlockChannelWriter::new(device, block_size, return_queue))
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
