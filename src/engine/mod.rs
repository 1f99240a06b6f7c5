//! Engine Module
//!
//! The contract between the connection layer and the storage engine it
//! drives, plus `LogEngine`, the hybrid-log engine used by default.
//!
//! ## Session affinity
//! An `EngineSession` is opened by the worker thread that drives it and never
//! leaves that thread: the trait does not require `Send`, and `LogSession`
//! is explicitly `!Send`. The shared `Engine` handle is `Send + Sync` and only
//! exposes whole-log operations (flush, compact, scan, checkpoint).
//!
//! ## Three-way status
//! ```text
//!   read / upsert / delete ──► Ok(value)       resolved immediately
//!                         ├──► Pending(id)     resolved by a later complete_pending()
//!                         └──► Error(err)      failed immediately
//! ```

mod checkpoint;
mod device;
mod hybrid_log;

pub use checkpoint::{CheckpointInfo, CHECKPOINT_FILENAME};
pub use device::{LogDevice, DEVICE_FILENAME, FRAME_HEADER_SIZE};
pub use hybrid_log::{LogEngine, LogScanner, LogSession};

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EpochError, Result};

/// First valid log address; 0 is never assigned
pub const FIRST_ADDRESS: u64 = 1;

/// Identifier of an operation the engine deferred, unique per session
pub type PendingId = u64;

/// Outcome of a single engine call
#[derive(Debug)]
pub enum Status<T> {
    /// Completed synchronously
    Ok(T),

    /// Accepted; the outcome is delivered by a later `complete_pending`
    Pending(PendingId),

    /// Failed
    Error(EpochError),
}

impl<T> Status<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Status::Pending(_))
    }
}

/// A deferred operation that finished during `complete_pending`
#[derive(Debug)]
pub struct CompletedOperation {
    pub id: PendingId,

    /// Read value for reads (`None` when absent), `None` for writes
    pub outcome: Result<Option<Vec<u8>>>,
}

/// Result of one `complete_pending` call
#[derive(Debug, Default)]
pub struct Drained {
    /// Operations that finished during this call
    pub completed: Vec<CompletedOperation>,

    /// True when the session has nothing outstanding anymore
    pub done: bool,
}

/// One record of the log, as seen by a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Key atom
    pub key: Vec<u8>,

    /// Value atom; `None` for tombstones
    pub value: Option<Vec<u8>>,
}

impl LogRecord {
    pub fn upsert(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value: Some(value),
        }
    }

    pub fn tombstone(key: Vec<u8>) -> Self {
        Self { key, value: None }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// A log record together with its address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedRecord {
    pub address: u64,
    pub record: LogRecord,
}

/// Exclusive, thread-bound execution context for engine calls
pub trait EngineSession {
    /// Look up the latest value of `key`
    fn read(&mut self, key: &[u8]) -> Status<Option<Vec<u8>>>;

    /// Insert or replace the value of `key`
    fn upsert(&mut self, key: &[u8], value: &[u8]) -> Status<()>;

    /// Write a tombstone for `key` (succeeds for absent keys)
    fn delete(&mut self, key: &[u8]) -> Status<()>;

    /// Finish deferred operations; `wait` blocks until nothing is outstanding
    fn complete_pending(&mut self, wait: bool) -> Result<Drained>;

    /// Advance this session's view of the engine epoch
    fn refresh(&mut self);

    /// Number of deferred operations not yet delivered
    fn pending_count(&self) -> usize;

    /// End the session
    fn stop(self);
}

/// Shared engine handle
pub trait Engine: Send + Sync + 'static {
    type Session: EngineSession;
    type Scanner: Iterator<Item = Result<ScannedRecord>>;

    /// Open a session bound to the calling thread
    fn start_session(&self) -> Result<Self::Session>;

    /// Write the in-memory log region to the device and drop it from memory
    fn flush_and_evict(&self, wait: bool) -> Result<()>;

    /// Oldest address still part of the log
    fn begin_address(&self) -> u64;

    /// Address the next record will be written at
    fn tail_address(&self) -> u64;

    /// Read-only boundary as of the last refresh
    fn safe_read_only_address(&self) -> u64;

    /// Drop obsolete records below `until`, keeping live data
    fn compact(&self, until: u64) -> Result<()>;

    /// Iterate records in `[begin, end)` in log order, tombstones included
    fn scan(&self, begin: u64, end: u64) -> Result<Self::Scanner>;

    /// Persist a checkpoint into `dir` (which must exist)
    fn checkpoint(&self, dir: &Path) -> Result<CheckpointInfo>;

    /// Restore state from a checkpoint directory
    fn recover(&self, dir: &Path) -> Result<CheckpointInfo>;

    /// Flush and release the device
    fn close(&self) -> Result<()>;
}
