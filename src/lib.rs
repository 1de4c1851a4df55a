//! oxijoin - a hybrid hash join core
//!
//! The crate joins two streams of key/value records by building an
//! in-memory hash table over the *build* side and probing it with the
//! *probe* side. The build side is fanned out into partitions; when memory
//! runs out, the largest partition is streamed to disk and its hash
//! buckets degrade into bit-vector filters that route probe records to a
//! spill file for a later pass — the classic hybrid hash join.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use oxijoin::{HashJoin, FileIoManager, MemorySegment, ProbeOutcome};
//!
//! let memory = MemorySegment::alloc_many(64, 32 * 1024).unwrap();
//! let io = FileIoManager::new("/tmp/oxijoin")?;
//! let mut join = HashJoin::new(build_pairs, probe_pairs, memory, io, 100)?;
//!
//! join.open()?;
//! if let ProbeOutcome::Matches(values) = join.probe(&key, &value)? {
//!     // emit joined pairs
//! }
//! let memory = join.close()?;
//! ```

#![warn(missing_docs)]

pub mod codec;
pub mod config;
pub mod error;
pub mod io;
pub mod pointer;
pub mod pool;
pub mod segment;
pub mod stats;
pub mod table;
mod utility;

// Re-exports for convenience
pub use config::{ConfigError, JoinConfig};
pub use error::{JoinError, Result};
pub use io::{ChannelId, FileIoManager, IoManager};
pub use pointer::RecordPointer;
pub use segment::MemorySegment;
pub use stats::JoinStats;
pub use table::{HashJoin, ProbeOutcome, ProbeSummary};

/// Prelude module for common imports.
pub mod prelude {
    pub use crate::codec::{JoinKey, JoinValue, KeyCodec, RawBytes, Utf8, ValueCodec};
    pub use crate::error::{JoinError, Result};
    pub use crate::io::{FileIoManager, IoManager};
    pub use crate::segment::MemorySegment;
    pub use crate::table::{HashJoin, ProbeOutcome, ProbeSummary};
}
