//! Hybrid Log Engine
//!
//! Append-only log split between a device and memory:
//!
//! ```text
//!   begin            head          flushed             tail
//!     │   device only  │  memory + device │  memory only  │
//!     ├────────────────┼──────────────────┼───────────────┤
//!                              ▲ read-only │ mutable ▲
//!                      (tail - mutable_records)
//! ```
//!
//! - Every upsert/delete appends a record at `tail`; the index maps a key to
//!   the address of its latest record.
//! - Reads of records still in memory complete immediately. Reads of records
//!   below `head` are deferred and served by `complete_pending`.
//! - When memory holds more than `memory_records`, the oldest half is flushed
//!   and evicted.
//!
//! ## Concurrency
//! - `state`: RwLock (reads share, appends/compaction/checkpoints exclude)
//! - `device`: Mutex, always acquired after `state`
//! - Sessions are `!Send`; they live on the thread that opened them.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::{ConnectionSettings, LogSettings};
use crate::error::{EpochError, Result};

use super::checkpoint::{self, CheckpointInfo, CheckpointMeta};
use super::device::LogDevice;
use super::{
    CompletedOperation, Drained, Engine, EngineSession, LogRecord, PendingId, ScannedRecord,
    Status, FIRST_ADDRESS,
};

/// Deferred reads served per non-blocking `complete_pending` call
const PENDING_BATCH: usize = 64;

/// The default engine: a hybrid log with a hash index
pub struct LogEngine {
    shared: Arc<LogShared>,
}

struct LogShared {
    dir: PathBuf,
    settings: LogSettings,
    state: RwLock<LogState>,
    device: Mutex<LogDevice>,
    safe_read_only: AtomicU64,
    sessions: AtomicUsize,
    refreshes: AtomicU64,
}

struct LogState {
    begin: u64,
    head: u64,
    flushed: u64,
    tail: u64,

    /// Records `[head, tail)`
    memory: VecDeque<LogRecord>,

    /// Device offset of every address in `[FIRST_ADDRESS, flushed)`
    offsets: Vec<u64>,

    /// Key → address of its latest record
    index: HashMap<Vec<u8>, u64>,
}

impl LogEngine {
    /// Open or create an engine in `dir`.
    ///
    /// The engine starts empty; call `recover` to adopt a checkpoint.
    pub fn open(dir: &Path, settings: &ConnectionSettings) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let device = LogDevice::open(dir)?;

        tracing::debug!("Opened log engine in {}", dir.display());

        Ok(Self {
            shared: Arc::new(LogShared {
                dir: dir.to_path_buf(),
                settings: settings.log,
                state: RwLock::new(LogState::empty(settings.index_size)),
                device: Mutex::new(device),
                safe_read_only: AtomicU64::new(FIRST_ADDRESS),
                sessions: AtomicUsize::new(0),
                refreshes: AtomicU64::new(0),
            }),
        })
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    /// Number of sessions currently open
    pub fn session_count(&self) -> usize {
        self.shared.sessions.load(Ordering::SeqCst)
    }

    /// Number of refreshes performed by all sessions
    pub fn refresh_count(&self) -> u64 {
        self.shared.refreshes.load(Ordering::SeqCst)
    }

    /// Lowest address still held in memory
    pub fn head_address(&self) -> u64 {
        self.shared.state.read().head
    }

    /// Number of records held in memory
    pub fn memory_records(&self) -> usize {
        self.shared.state.read().memory.len()
    }

    /// Number of live keys
    pub fn key_count(&self) -> usize {
        self.shared.state.read().index.len()
    }

    /// Device length in bytes
    pub fn device_len(&self) -> u64 {
        self.shared.device.lock().len()
    }
}

impl Engine for LogEngine {
    type Session = LogSession;
    type Scanner = LogScanner;

    fn start_session(&self) -> Result<LogSession> {
        self.shared.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(LogSession {
            shared: Arc::clone(&self.shared),
            next_id: 0,
            pending: VecDeque::new(),
            _not_send: PhantomData,
        })
    }

    fn flush_and_evict(&self, wait: bool) -> Result<()> {
        let mut state = self.shared.state.write();
        let mut device = self.shared.device.lock();

        let tail = state.tail;
        state.evict_to(&mut device, tail)?;
        if wait {
            device.sync()?;
        }
        Ok(())
    }

    fn begin_address(&self) -> u64 {
        self.shared.state.read().begin
    }

    fn tail_address(&self) -> u64 {
        self.shared.state.read().tail
    }

    fn safe_read_only_address(&self) -> u64 {
        let begin = self.shared.state.read().begin;
        self.shared.safe_read_only.load(Ordering::SeqCst).max(begin)
    }

    fn compact(&self, until: u64) -> Result<()> {
        let mut state = self.shared.state.write();
        let mut device = self.shared.device.lock();

        let until = until.clamp(state.begin, state.tail);
        let mut relocated = 0usize;
        let mut dropped = 0usize;

        for address in state.begin..until {
            let record = state.record_at(&mut device, address)?;
            if state.index.get(&record.key) != Some(&address) {
                dropped += 1;
                continue;
            }

            if record.is_tombstone() {
                state.index.remove(&record.key);
                dropped += 1;
            } else {
                state.append(&mut device, &self.shared.settings, record)?;
                relocated += 1;
            }
        }

        state.begin = until;

        tracing::debug!(
            "Compacted log up to {}: {} records relocated, {} dropped",
            until,
            relocated,
            dropped
        );
        Ok(())
    }

    fn scan(&self, begin: u64, end: u64) -> Result<LogScanner> {
        let state = self.shared.state.read();
        Ok(LogScanner {
            shared: Arc::clone(&self.shared),
            next: begin.max(state.begin),
            end: end.min(state.tail),
        })
    }

    fn checkpoint(&self, dir: &Path) -> Result<CheckpointInfo> {
        let mut state = self.shared.state.write();
        let mut device = self.shared.device.lock();

        // Fold-over: everything up to the tail goes to the device, memory stays
        let tail = state.tail;
        state.flush_to(&mut device, tail)?;
        device.sync()?;

        let meta = CheckpointMeta {
            begin_address: state.begin,
            tail_address: state.tail,
            safe_read_only_address: self.shared.safe_read_only.load(Ordering::SeqCst),
            device_len: device.len(),
            index: state
                .index
                .iter()
                .map(|(key, address)| (key.clone(), *address))
                .collect(),
        };

        checkpoint::write_meta(dir, &meta)
    }

    fn recover(&self, dir: &Path) -> Result<CheckpointInfo> {
        let meta = checkpoint::read_meta(dir)?;
        let mut state = self.shared.state.write();
        let mut device = self.shared.device.lock();

        device.restore(meta.device_len)?;

        let frames = device.frames()?;
        let expected = meta.tail_address.saturating_sub(FIRST_ADDRESS);
        if frames.len() as u64 != expected {
            return Err(EpochError::Corruption(format!(
                "Device holds {} records, checkpoint expects {}",
                frames.len(),
                expected
            )));
        }

        let mut offsets = Vec::with_capacity(frames.len());
        for (i, (address, offset)) in frames.into_iter().enumerate() {
            if address != FIRST_ADDRESS + i as u64 {
                return Err(EpochError::Corruption(format!(
                    "Device frame {} carries address {}",
                    i, address
                )));
            }
            offsets.push(offset);
        }

        let mut index = HashMap::with_capacity(meta.index.len().max(state.index.capacity()));
        for (key, address) in &meta.index {
            if *address < meta.begin_address || *address >= meta.tail_address {
                return Err(EpochError::Corruption(format!(
                    "Index entry points outside the log: {}",
                    address
                )));
            }
            index.insert(key.clone(), *address);
        }

        *state = LogState {
            begin: meta.begin_address,
            head: meta.tail_address,
            flushed: meta.tail_address,
            tail: meta.tail_address,
            memory: VecDeque::new(),
            offsets,
            index,
        };
        self.shared
            .safe_read_only
            .store(meta.safe_read_only_address, Ordering::SeqCst);

        Ok(meta.info())
    }

    fn close(&self) -> Result<()> {
        let _state = self.shared.state.write();
        self.shared.device.lock().sync()
    }
}

// =============================================================================
// Log State
// =============================================================================

impl LogState {
    fn empty(index_size: usize) -> Self {
        Self {
            begin: FIRST_ADDRESS,
            head: FIRST_ADDRESS,
            flushed: FIRST_ADDRESS,
            tail: FIRST_ADDRESS,
            memory: VecDeque::new(),
            offsets: Vec::new(),
            index: HashMap::with_capacity(index_size),
        }
    }

    fn read_only_address(&self, settings: &LogSettings) -> u64 {
        self.tail
            .saturating_sub(settings.mutable_records as u64)
            .max(self.begin)
    }

    /// Append a record at the tail, evicting when memory is over budget
    fn append(
        &mut self,
        device: &mut LogDevice,
        settings: &LogSettings,
        record: LogRecord,
    ) -> Result<u64> {
        let address = self.tail;
        self.index.insert(record.key.clone(), address);
        self.memory.push_back(record);
        self.tail += 1;

        if self.memory.len() > settings.memory_records {
            let keep = (settings.memory_records / 2) as u64;
            let until = self.tail - keep;
            self.evict_to(device, until)?;
        }

        Ok(address)
    }

    /// Write memory records up to `until` to the device
    fn flush_to(&mut self, device: &mut LogDevice, until: u64) -> Result<()> {
        while self.flushed < until {
            let address = self.flushed;
            let record = &self.memory[(address - self.head) as usize];
            let offset = device.append(address, record)?;
            self.offsets.push(offset);
            self.flushed += 1;
        }
        Ok(())
    }

    /// Flush and drop memory records up to `until`
    fn evict_to(&mut self, device: &mut LogDevice, until: u64) -> Result<()> {
        self.flush_to(device, until)?;
        while self.head < until {
            self.memory.pop_front();
            self.head += 1;
        }
        Ok(())
    }

    /// Fetch the record at `address` from memory or the device
    fn record_at(&self, device: &mut LogDevice, address: u64) -> Result<LogRecord> {
        if address >= self.tail || address < FIRST_ADDRESS {
            return Err(EpochError::Engine(format!(
                "Address {} is outside the log",
                address
            )));
        }

        if address >= self.head {
            return Ok(self.memory[(address - self.head) as usize].clone());
        }

        let offset = self.offsets[(address - FIRST_ADDRESS) as usize];
        let (stored, record) = device.read_at(offset)?;
        if stored != address {
            return Err(EpochError::Corruption(format!(
                "Expected address {} at offset {}, found {}",
                address, offset, stored
            )));
        }
        Ok(record)
    }
}

// =============================================================================
// Sessions
// =============================================================================

struct PendingRead {
    id: PendingId,
    key: Vec<u8>,
    address: u64,
}

/// Session on a `LogEngine`; bound to the thread that opened it
pub struct LogSession {
    shared: Arc<LogShared>,
    next_id: PendingId,
    pending: VecDeque<PendingRead>,
    _not_send: PhantomData<*const ()>,
}

impl LogSession {
    fn write(&mut self, record: LogRecord) -> Status<()> {
        let mut state = self.shared.state.write();
        let mut device = self.shared.device.lock();
        match state.append(&mut device, &self.shared.settings, record) {
            Ok(_) => Status::Ok(()),
            Err(e) => Status::Error(e),
        }
    }

    fn complete_one(&self, read: &PendingRead) -> Result<Option<Vec<u8>>> {
        let state = self.shared.state.read();
        let mut device = self.shared.device.lock();
        let record = state.record_at(&mut device, read.address)?;
        if record.key != read.key {
            return Err(EpochError::Corruption(format!(
                "Record at {} belongs to a different key",
                read.address
            )));
        }
        Ok(record.value)
    }
}

impl EngineSession for LogSession {
    fn read(&mut self, key: &[u8]) -> Status<Option<Vec<u8>>> {
        let state = self.shared.state.read();
        let address = match state.index.get(key) {
            Some(&address) => address,
            None => return Status::Ok(None),
        };

        if address >= state.head {
            let record = &state.memory[(address - state.head) as usize];
            return Status::Ok(record.value.clone());
        }
        drop(state);

        let id = self.next_id;
        self.next_id += 1;
        self.pending.push_back(PendingRead {
            id,
            key: key.to_vec(),
            address,
        });
        Status::Pending(id)
    }

    fn upsert(&mut self, key: &[u8], value: &[u8]) -> Status<()> {
        self.write(LogRecord::upsert(key.to_vec(), value.to_vec()))
    }

    fn delete(&mut self, key: &[u8]) -> Status<()> {
        self.write(LogRecord::tombstone(key.to_vec()))
    }

    fn complete_pending(&mut self, wait: bool) -> Result<Drained> {
        let batch = if wait {
            self.pending.len()
        } else {
            self.pending.len().min(PENDING_BATCH)
        };

        let mut completed = Vec::with_capacity(batch);
        for _ in 0..batch {
            let Some(read) = self.pending.pop_front() else {
                break;
            };
            let outcome = self.complete_one(&read);
            completed.push(CompletedOperation {
                id: read.id,
                outcome,
            });
        }

        Ok(Drained {
            completed,
            done: self.pending.is_empty(),
        })
    }

    fn refresh(&mut self) {
        let read_only = self
            .shared
            .state
            .read()
            .read_only_address(&self.shared.settings);
        self.shared.safe_read_only.fetch_max(read_only, Ordering::SeqCst);
        self.shared.refreshes.fetch_add(1, Ordering::SeqCst);
    }

    fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn stop(self) {
        drop(self);
    }
}

impl Drop for LogSession {
    fn drop(&mut self) {
        self.shared.sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Scanning
// =============================================================================

/// Iterator over a range of log addresses, in log order
pub struct LogScanner {
    shared: Arc<LogShared>,
    next: u64,
    end: u64,
}

impl Iterator for LogScanner {
    type Item = Result<ScannedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }

        let address = self.next;
        self.next += 1;

        let state = self.shared.state.read();
        let mut device = self.shared.device.lock();
        Some(
            state
                .record_at(&mut device, address)
                .map(|record| ScannedRecord { address, record }),
        )
    }
}
