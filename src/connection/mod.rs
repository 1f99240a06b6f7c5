//! Connection Module
//!
//! The public surface: turns a session-affine engine into a concurrent,
//! completion-based service.
//!
//! ## Request path
//! ```text
//!   caller ──► Connection::set() ──► WorkQueue ──► worker #n ──► EngineSession
//!     ▲                                                               │
//!     └──────────────── Completion<T> ◄──── Promise<T> resolved ◄─────┘
//! ```
//!
//! ## Lifecycle
//! ```text
//!   Created ──► Initializing ──► Open ──► Closing ──► Closed
//!                (recover, start workers          (cancel, drain, final
//!                 and maintenance)                 checkpoint, join, close)
//! ```
//!
//! Submitting never blocks the caller. Any call made once `Closing` has been
//! entered fails with `EpochError::AlreadyClosed` without touching the queue.

mod item;
mod queue;
mod worker;

pub use item::{Action, CompletedCallback, RecordCallback, ScanRecord};
pub use queue::WorkQueue;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel;
use crossbeam::sync::WaitGroup;
use parking_lot::{Mutex, RwLock};

use crate::completion::{self, Completion, Promise};
use crate::config::ConnectionSettings;
use crate::engine::{Engine, LogEngine};
use crate::error::{EpochError, Result};
use crate::maintenance::{CheckpointService, Maintenance};
use crate::serializer::Serializer;

use item::WorkItem;

/// Name used when a connection is opened without one
pub const DEFAULT_NAME: &str = "epochkv";

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Initializing,
    Open,
    Closing,
    Closed,
}

/// State shared by the façade and every worker
pub(crate) struct Shared<KS: Serializer, VS: Serializer, E: Engine> {
    pub queue: WorkQueue<WorkItem<KS::Item, VS::Item>>,
    pub cancelled: AtomicBool,
    pub engine: Arc<E>,
    pub maintenance: Arc<dyn Maintenance<E>>,
    pub keys: KS,
    pub values: VS,
    pub refresh_interval: Duration,
    pub name: String,
}

/// A connection to a key-value engine served by a pool of worker threads
///
/// ## Thread Safety
/// `Connection` is `Send + Sync`; share it behind an `Arc` and submit from
/// any thread. Engine sessions never leave the worker that opened them.
pub struct Connection<KS: Serializer, VS: Serializer, E: Engine = LogEngine> {
    shared: Arc<Shared<KS, VS, E>>,

    /// Guards submission against a concurrent close
    state: RwLock<LifecycleState>,

    workers: Mutex<Vec<JoinHandle<()>>>,

    /// Released by each worker once it drained the queue during shutdown
    drained: Mutex<Option<WaitGroup>>,

    directory: PathBuf,
}

impl<KS: Serializer, VS: Serializer> Connection<KS, VS, LogEngine> {
    /// Open or create a connection backed by a `LogEngine` in `dir`.
    ///
    /// Recovers the newest usable checkpoint and returns once every worker
    /// has opened its session.
    pub fn open(
        dir: impl AsRef<Path>,
        keys: KS,
        values: VS,
        settings: ConnectionSettings,
        name: Option<&str>,
    ) -> Result<Self> {
        let engine_dir = dir.as_ref().to_path_buf();
        let engine_settings = settings.clone();

        Self::open_with_engine(dir, keys, values, settings, name, move || {
            LogEngine::open(&engine_dir, &engine_settings)
        })
    }
}

impl<KS, VS, E> Connection<KS, VS, E>
where
    KS: Serializer,
    VS: Serializer,
    E: Engine,
{
    /// Open a connection over the engine built by `factory`, with a
    /// `CheckpointService` keeping its checkpoints under `dir`
    pub fn open_with_engine<F>(
        dir: impl AsRef<Path>,
        keys: KS,
        values: VS,
        settings: ConnectionSettings,
        name: Option<&str>,
        factory: F,
    ) -> Result<Self>
    where
        F: Fn() -> Result<E>,
    {
        let dir = dir.as_ref();
        let name = name.unwrap_or(DEFAULT_NAME);
        let maintenance: Arc<dyn Maintenance<E>> =
            Arc::new(CheckpointService::new(dir, &settings, name));

        Self::open_with_maintenance(dir, keys, values, settings, Some(name), factory, maintenance)
    }

    /// Open a connection with a caller-supplied maintenance service
    ///
    /// On startup:
    /// 1. Validate the directory and settings
    /// 2. Let maintenance recover (or create) the engine
    /// 3. Start the workers and wait until each one opened its session
    /// 4. Start the maintenance schedule
    pub fn open_with_maintenance<F>(
        dir: impl AsRef<Path>,
        keys: KS,
        values: VS,
        settings: ConnectionSettings,
        name: Option<&str>,
        factory: F,
        maintenance: Arc<dyn Maintenance<E>>,
    ) -> Result<Self>
    where
        F: Fn() -> Result<E>,
    {
        // Step 1: Validate inputs and make sure the directory exists
        let dir = dir.as_ref();
        check_directory(dir)?;
        settings.validate()?;
        fs::create_dir_all(dir)?;

        let name = name.unwrap_or(DEFAULT_NAME).to_string();
        tracing::debug!("[{}] Opening connection in {}", name, dir.display());

        // Step 2: Recover the engine from the newest usable checkpoint
        let engine = maintenance.recover(&factory)?;

        let shared = Arc::new(Shared {
            queue: WorkQueue::new(),
            cancelled: AtomicBool::new(false),
            engine,
            maintenance,
            keys,
            values,
            refresh_interval: settings.worker_refresh_interval(),
            name,
        });

        let drained = WaitGroup::new();
        let connection = Self {
            shared,
            state: RwLock::new(LifecycleState::Initializing),
            workers: Mutex::new(Vec::with_capacity(settings.worker_thread_count)),
            drained: Mutex::new(Some(drained.clone())),
            directory: dir.to_path_buf(),
        };

        // Step 3: Start workers; each reports whether its session opened
        if let Err(e) = connection.start_workers(settings.worker_thread_count, drained) {
            connection.abort_open(&e);
            return Err(e);
        }

        // Step 4: Start the background checkpoint schedule
        if let Err(e) = connection.shared.maintenance.start() {
            connection.abort_open(&e);
            return Err(e);
        }

        *connection.state.write() = LifecycleState::Open;
        tracing::info!(
            "[{}] Connection open with {} workers",
            connection.shared.name,
            settings.worker_thread_count
        );

        Ok(connection)
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Look up `key`
    pub fn get(&self, key: KS::Item) -> Result<Completion<Option<VS::Item>>> {
        self.get_with(key, false)
    }

    /// Look up `key`; with `wait_pending` the worker finishes a deferred
    /// read before taking its next item
    pub fn get_with(
        &self,
        key: KS::Item,
        wait_pending: bool,
    ) -> Result<Completion<Option<VS::Item>>> {
        self.submit(|sink| WorkItem::Get {
            key,
            wait_pending,
            sink,
        })
    }

    /// Insert or replace the value of `key`
    pub fn set(&self, key: KS::Item, value: VS::Item) -> Result<Completion<()>> {
        self.set_with(key, value, false)
    }

    pub fn set_with(
        &self,
        key: KS::Item,
        value: VS::Item,
        wait_pending: bool,
    ) -> Result<Completion<()>> {
        self.submit(|sink| WorkItem::Set {
            key,
            value,
            wait_pending,
            sink,
        })
    }

    /// Remove `key`; succeeds when the key does not exist
    pub fn delete(&self, key: KS::Item) -> Result<Completion<()>> {
        self.delete_with(key, false)
    }

    pub fn delete_with(&self, key: KS::Item, wait_pending: bool) -> Result<Completion<()>> {
        self.submit(|sink| WorkItem::Delete {
            key,
            wait_pending,
            sink,
        })
    }

    /// Move the in-memory log to disk; `wait` also syncs the device
    pub fn flush(&self, wait: bool) -> Result<Completion<()>> {
        self.submit(|sink| WorkItem::Flush { wait, sink })
    }

    /// Visit every record of the log, oldest first, tombstones included.
    ///
    /// Resolves with the number of records visited.
    pub fn for_each<F>(&self, on_record: F) -> Result<Completion<u64>>
    where
        F: FnMut(ScanRecord<KS::Item, VS::Item>) + Send + 'static,
    {
        self.submit(|sink| WorkItem::ForEach {
            on_record: Box::new(on_record),
            on_completed: None,
            sink,
        })
    }

    /// Like `for_each`, running `on_completed` after the last record
    pub fn for_each_then<F, C>(&self, on_record: F, on_completed: C) -> Result<Completion<u64>>
    where
        F: FnMut(ScanRecord<KS::Item, VS::Item>) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.submit(|sink| WorkItem::ForEach {
            on_record: Box::new(on_record),
            on_completed: Some(Box::new(on_completed)),
            sink,
        })
    }

    /// Drop obsolete records below the engine's safe read-only address
    pub fn compact(&self) -> Result<Completion<()>> {
        self.submit(|sink| WorkItem::Compact { sink })
    }

    /// Run `action` on a worker thread.
    ///
    /// Fire-and-forget: a panic inside `action` is logged and swallowed.
    pub fn execute<F>(&self, action: F) -> Result<()>
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let state = self.state.read();
        if *state != LifecycleState::Open {
            return Err(EpochError::AlreadyClosed);
        }
        self.shared.queue.push(WorkItem::Action(Box::new(action)));
        Ok(())
    }

    /// Take a checkpoint and wait until it is durable
    pub fn checkpoint(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.maintenance.checkpoint()
    }

    /// Request a checkpoint
    pub fn checkpoint_async(&self) -> Result<Completion<()>> {
        self.ensure_open()?;
        Ok(self.shared.maintenance.checkpoint_async())
    }

    /// Shut the connection down.
    ///
    /// Queued requests are finished, a final checkpoint is taken and every
    /// thread is joined before this returns. Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            match *state {
                LifecycleState::Closing | LifecycleState::Closed => return Ok(()),
                _ => *state = LifecycleState::Closing,
            }
        }

        self.shutdown()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    /// Mutations recorded so far
    pub fn version(&self) -> u64 {
        self.shared.maintenance.version()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.shared.engine
    }

    /// Items waiting for a worker
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Worker threads not yet joined
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Build a work item around a fresh sink and enqueue it
    fn submit<T, B>(&self, build: B) -> Result<Completion<T>>
    where
        B: FnOnce(Promise<T>) -> WorkItem<KS::Item, VS::Item>,
    {
        let state = self.state.read();
        if *state != LifecycleState::Open {
            return Err(EpochError::AlreadyClosed);
        }

        let (sink, completion) = completion::pair();
        self.shared.queue.push(build(sink));
        Ok(completion)
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.state.read() != LifecycleState::Open {
            return Err(EpochError::AlreadyClosed);
        }
        Ok(())
    }

    fn start_workers(&self, count: usize, drained: WaitGroup) -> Result<()> {
        let (ready_tx, ready_rx) = channel::bounded(count);

        for index in 0..count {
            let handle = worker::spawn(
                Arc::clone(&self.shared),
                index,
                ready_tx.clone(),
                drained.clone(),
            )?;
            self.workers.lock().push(handle);
        }
        drop(ready_tx);
        drop(drained);

        for _ in 0..count {
            match ready_rx.recv() {
                Ok(result) => result?,
                Err(_) => {
                    return Err(EpochError::Engine(
                        "worker exited before opening its session".to_string(),
                    ))
                }
            }
        }

        Ok(())
    }

    fn abort_open(&self, err: &EpochError) {
        tracing::error!("[{}] Failed to open connection: {}", self.shared.name, err);
        *self.state.write() = LifecycleState::Closing;
        if let Err(e) = self.shutdown() {
            tracing::warn!("[{}] Teardown after failed open: {}", self.shared.name, e);
        }
    }

    /// Shutdown sequence; the caller has already entered `Closing`
    fn shutdown(&self) -> Result<()> {
        let name = &self.shared.name;
        tracing::debug!("[{}] Closing connection", name);

        // Step 1: Signal cancellation and wake every idle worker
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.queue.notify_all();

        // Step 2: Wait until every worker finished the queue
        if let Some(drained) = self.drained.lock().take() {
            drained.wait();
        }

        // Step 3: Final checkpoint; workers keep their sessions until it is done
        self.shared.maintenance.stop();

        // Step 4: Join workers
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("[{}] Worker thread panicked", name);
            }
        }

        // Step 5: Release maintenance, then the engine
        let mut result = self.shared.maintenance.close();
        if let Err(e) = self.shared.engine.close() {
            tracing::error!("[{}] Failed to close engine: {}", name, e);
            result = result.and(Err(e));
        }

        *self.state.write() = LifecycleState::Closed;
        tracing::info!("[{}] Connection closed", name);
        result
    }
}

impl<KS, VS, E> Drop for Connection<KS, VS, E>
where
    KS: Serializer,
    VS: Serializer,
    E: Engine,
{
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("[{}] Error while closing connection: {}", self.shared.name, e);
        }
    }
}

/// Reject paths that cannot hold a connection directory
fn check_directory(dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() {
        return Err(EpochError::InvalidArgument(
            "directory path is empty".to_string(),
        ));
    }
    if dir.is_file() {
        return Err(EpochError::InvalidArgument(format!(
            "{} is a file, not a directory",
            dir.display()
        )));
    }
    Ok(())
}
