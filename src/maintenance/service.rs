//! Checkpoint Service
//!
//! Default `Maintenance` implementation.
//!
//! ## Directory Layout
//! ```text
//!   {dir}/
//!     ├── hlog.log                       (engine device)
//!     └── checkpoints/
//!           ├── 00000000000000000007/    (complete checkpoint)
//!           ├── 00000000000000000008/
//!           └── 00000000000000000009.tmp/ (in progress, removed at recovery)
//! ```
//!
//! A checkpoint is written into `<token>.tmp` and renamed once the engine
//! has finished writing it, so a directory without the suffix is complete.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendError, Sender};
use parking_lot::{Mutex, RwLock};

use crate::completion::{self, Completion, Promise};
use crate::config::ConnectionSettings;
use crate::engine::Engine;
use crate::error::{EpochError, Result};

use super::Maintenance;

/// Checkpoint directory inside the connection directory
pub const CHECKPOINT_DIR: &str = "checkpoints";

const TMP_SUFFIX: &str = ".tmp";

enum Request {
    Checkpoint(Promise<()>),
    Stop,
}

/// Background checkpointing over any `Engine`
pub struct CheckpointService<E: Engine> {
    inner: Arc<ServiceInner<E>>,
    requests: Sender<Request>,
    receiver: Mutex<Option<Receiver<Request>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct ServiceInner<E> {
    root: PathBuf,
    interval: Duration,
    retention: usize,
    name: String,
    engine: RwLock<Option<Arc<E>>>,

    /// Bumped by every mutating operation
    version: AtomicU64,

    /// Version covered by the newest checkpoint
    checkpointed: AtomicU64,

    running: AtomicBool,
    next_token: AtomicU64,

    /// Serializes checkpoints
    checkpoint_lock: Mutex<()>,
}

impl<E: Engine> CheckpointService<E> {
    /// Create a service keeping its checkpoints under `{dir}/checkpoints`
    pub fn new(dir: &Path, settings: &ConnectionSettings, name: &str) -> Self {
        let (requests, receiver) = channel::unbounded();

        Self {
            inner: Arc::new(ServiceInner {
                root: dir.join(CHECKPOINT_DIR),
                interval: settings.maintenance_interval(),
                retention: settings.checkpoint_retention.max(1),
                name: name.to_string(),
                engine: RwLock::new(None),
                version: AtomicU64::new(0),
                checkpointed: AtomicU64::new(0),
                running: AtomicBool::new(false),
                next_token: AtomicU64::new(1),
                checkpoint_lock: Mutex::new(()),
            }),
            requests,
            receiver: Mutex::new(Some(receiver)),
            thread: Mutex::new(None),
        }
    }

    /// Complete checkpoint directories, newest first
    pub fn checkpoints(&self) -> Result<Vec<PathBuf>> {
        Ok(list_tokens(&self.inner.root)?
            .into_iter()
            .map(|token| self.inner.root.join(token_name(token)))
            .collect())
    }

    /// Root directory holding the checkpoints
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Version covered by the newest checkpoint
    pub fn checkpointed_version(&self) -> u64 {
        self.inner.checkpointed.load(Ordering::SeqCst)
    }
}

impl<E: Engine> Maintenance<E> for CheckpointService<E> {
    fn recover(&self, create: &dyn Fn() -> Result<E>) -> Result<Arc<E>> {
        let inner = &self.inner;
        fs::create_dir_all(&inner.root)?;
        remove_incomplete(&inner.root)?;

        let tokens = list_tokens(&inner.root)?;
        let next = tokens.first().map(|&t| t + 1).unwrap_or(1);
        inner.next_token.store(next, Ordering::SeqCst);

        for token in tokens {
            let dir = inner.root.join(token_name(token));
            let engine = create()?;
            match engine.recover(&dir) {
                Ok(info) => {
                    tracing::info!(
                        "[{}] Recovered checkpoint {}: {} keys, log [{}, {})",
                        inner.name,
                        token,
                        info.index_entries,
                        info.begin_address,
                        info.tail_address
                    );
                    let engine = Arc::new(engine);
                    *inner.engine.write() = Some(Arc::clone(&engine));
                    return Ok(engine);
                }
                Err(e) => {
                    tracing::warn!(
                        "[{}] Checkpoint {} is unusable, trying an older one: {}",
                        inner.name,
                        token,
                        e
                    );
                }
            }
        }

        tracing::info!("[{}] No usable checkpoint, starting empty", inner.name);
        let engine = Arc::new(create()?);
        *inner.engine.write() = Some(Arc::clone(&engine));
        Ok(engine)
    }

    fn start(&self) -> Result<()> {
        if self.inner.engine.read().is_none() {
            return Err(EpochError::Checkpoint(
                "maintenance started before recovery".to_string(),
            ));
        }

        let receiver = match self.receiver.lock().take() {
            Some(receiver) => receiver,
            // already started once
            None => return Ok(()),
        };

        self.inner.running.store(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(format!("{} maintenance", self.inner.name))
            .spawn(move || run(inner, receiver))
            .map_err(|e| {
                self.inner.running.store(false, Ordering::SeqCst);
                EpochError::Io(e)
            })?;

        *self.thread.lock() = Some(handle);
        tracing::debug!("[{}] Maintenance service started", self.inner.name);
        Ok(())
    }

    fn stop(&self) {
        if self.is_running() {
            let _ = self.requests.send(Request::Stop);
        }
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn checkpoint_async(&self) -> Completion<()> {
        let (promise, completion) = completion::pair();

        let promise = if self.is_running() {
            match self.requests.send(Request::Checkpoint(promise)) {
                Ok(()) => return completion,
                Err(SendError(Request::Checkpoint(promise))) => promise,
                Err(SendError(Request::Stop)) => return completion,
            }
        } else {
            promise
        };

        // No background thread: checkpoint on the caller
        promise.resolve(self.inner.take_checkpoint().map(|_| ()));
        completion
    }

    fn increment_version(&self) {
        self.inner.version.fetch_add(1, Ordering::SeqCst);
    }

    fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<()> {
        self.stop();

        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("[{}] Maintenance thread panicked", self.inner.name);
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);

        *self.inner.engine.write() = None;
        tracing::debug!("[{}] Maintenance service closed", self.inner.name);
        Ok(())
    }
}

impl<E: Engine> Drop for CheckpointService<E> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("[{}] Failed to close maintenance: {}", self.inner.name, e);
        }
    }
}

// =============================================================================
// Background Schedule
// =============================================================================

fn run<E: Engine>(inner: Arc<ServiceInner<E>>, requests: Receiver<Request>) {
    loop {
        match requests.recv_timeout(inner.interval) {
            Ok(Request::Checkpoint(promise)) => {
                promise.resolve(inner.take_checkpoint().map(|_| ()));
            }
            Ok(Request::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => inner.checkpoint_if_dirty("scheduled"),
        }
    }

    inner.checkpoint_if_dirty("final");

    for request in requests.try_iter() {
        if let Request::Checkpoint(promise) = request {
            promise.resolve(inner.take_checkpoint().map(|_| ()));
        }
    }

    inner.running.store(false, Ordering::SeqCst);
    tracing::debug!("[{}] Maintenance service stopped", inner.name);
}

impl<E: Engine> ServiceInner<E> {
    fn is_dirty(&self) -> bool {
        self.version.load(Ordering::SeqCst) > self.checkpointed.load(Ordering::SeqCst)
    }

    fn checkpoint_if_dirty(&self, reason: &str) {
        if !self.is_dirty() {
            return;
        }
        if let Err(e) = self.take_checkpoint() {
            tracing::error!("[{}] {} checkpoint failed: {}", self.name, reason, e);
        }
    }

    /// Write a new checkpoint and prune old ones; returns its token
    fn take_checkpoint(&self) -> Result<u64> {
        let _guard = self.checkpoint_lock.lock();

        let engine = self
            .engine
            .read()
            .clone()
            .ok_or_else(|| EpochError::Checkpoint("no engine to checkpoint".to_string()))?;

        let version = self.version.load(Ordering::SeqCst);
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let tmp_dir = self.root.join(format!("{}{}", token_name(token), TMP_SUFFIX));
        let final_dir = self.root.join(token_name(token));

        fs::create_dir_all(&tmp_dir)?;
        let info = match engine.checkpoint(&tmp_dir) {
            Ok(info) => info,
            Err(e) => {
                let _ = fs::remove_dir_all(&tmp_dir);
                return Err(e);
            }
        };
        fs::rename(&tmp_dir, &final_dir)?;
        self.checkpointed.fetch_max(version, Ordering::SeqCst);

        tracing::info!(
            "[{}] Checkpoint {} taken at version {}: {} keys, {} device bytes",
            self.name,
            token,
            version,
            info.index_entries,
            info.device_len
        );

        if let Err(e) = self.prune() {
            tracing::warn!("[{}] Failed to prune old checkpoints: {}", self.name, e);
        }

        Ok(token)
    }

    /// Keep only the `retention` newest checkpoints
    fn prune(&self) -> Result<()> {
        for token in list_tokens(&self.root)?.into_iter().skip(self.retention) {
            fs::remove_dir_all(self.root.join(token_name(token)))?;
            tracing::debug!("[{}] Removed checkpoint {}", self.name, token);
        }
        Ok(())
    }
}

// =============================================================================
// Private Helpers
// =============================================================================

/// "00000000000000000042" for token 42
fn token_name(token: u64) -> String {
    format!("{:020}", token)
}

/// Parse a checkpoint token from a directory name
/// "00000000000000000042" → Some(42), "00000000000000000042.tmp" → None
fn parse_token(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    if name.len() != 20 {
        return None;
    }
    name.parse().ok()
}

/// Complete checkpoint tokens, newest first
fn list_tokens(root: &Path) -> Result<Vec<u64>> {
    let mut tokens = Vec::new();
    if !root.exists() {
        return Ok(tokens);
    }

    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_dir() {
            if let Some(token) = parse_token(&path) {
                tokens.push(token);
            }
        }
    }

    tokens.sort_unstable_by(|a, b| b.cmp(a));
    Ok(tokens)
}

/// Remove checkpoints that never finished
fn remove_incomplete(root: &Path) -> Result<()> {
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        let is_tmp = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(TMP_SUFFIX))
            .unwrap_or(false);

        if path.is_dir() && is_tmp {
            tracing::warn!("Removing incomplete checkpoint {}", path.display());
            fs::remove_dir_all(&path)?;
        }
    }
    Ok(())
}
