//! Worker threads
//!
//! Each worker opens one engine session on its own thread and drives it
//! until shutdown:
//!
//! ```text
//!            ┌──────────── queue empty ────────────┐
//!            ▼                                     │
//!   ┌─────────────────┐  notify / timeout  ┌───────┴───────┐
//!   │  Idle-waiting   │ ─────────────────► │   Draining    │ ◄─┐ every 128 items:
//!   └─────────────────┘                    └───────┬───────┘ ──┘ drain pending + refresh
//!            │ cancelled                           │ cancelled
//!            ▼                                     ▼
//!   ┌──────────────────────────────────────────────────────┐
//!   │ Draining-pending: finish queue, drain, wait for       │
//!   │ maintenance to stop, drain until nothing is pending   │
//!   └──────────────────────────┬───────────────────────────┘
//!                              ▼
//!                          Stopped (session closed)
//! ```
//!
//! Every request's sink is resolved by the worker that popped it, either
//! while handling it or when the engine reports its deferred completion.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::Sender;
use crossbeam::sync::WaitGroup;

use crate::completion::Promise;
use crate::engine::{CompletedOperation, Engine, EngineSession, PendingId, Status};
use crate::error::{EpochError, Result};
use crate::serializer::{AtomSource, Serializer};

use super::item::{Action, CompletedCallback, RecordCallback, ScanRecord, WorkItem};
use super::Shared;

/// Pending completions are drained and the epoch refreshed every 128 items
pub(crate) const REFRESH_BATCH_MASK: u64 = 0x7F;

/// Poll interval while waiting for maintenance to stop during shutdown
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Sink of an operation the engine deferred
enum PendingSink<V> {
    Read(Promise<Option<V>>),
    Write(Promise<()>),
}

/// Start worker `index` on its own thread.
///
/// The worker reports on `ready` whether its session opened; `drained` is
/// released once it has finished the queue during shutdown.
pub(crate) fn spawn<KS, VS, E>(
    shared: Arc<Shared<KS, VS, E>>,
    index: usize,
    ready: Sender<Result<()>>,
    drained: WaitGroup,
) -> Result<JoinHandle<()>>
where
    KS: Serializer,
    VS: Serializer,
    E: Engine,
{
    let name = format!("{} worker #{}", shared.name, index + 1);

    let handle = thread::Builder::new().name(name).spawn(move || {
        let session = match shared.engine.start_session() {
            Ok(session) => {
                let _ = ready.send(Ok(()));
                session
            }
            Err(e) => {
                tracing::error!(
                    "[{}] Worker #{} failed to open a session: {}",
                    shared.name,
                    index + 1,
                    e
                );
                let _ = ready.send(Err(e));
                return;
            }
        };
        drop(ready);

        Worker {
            shared,
            index,
            session,
            sequence: 0,
            pending: HashMap::new(),
        }
        .run(drained);
    })?;

    Ok(handle)
}

struct Worker<KS: Serializer, VS: Serializer, E: Engine> {
    shared: Arc<Shared<KS, VS, E>>,
    index: usize,
    session: E::Session,

    /// Items processed by this worker
    sequence: u64,

    /// Sinks of deferred operations, by the engine's pending id
    pending: HashMap<PendingId, PendingSink<VS::Item>>,
}

impl<KS, VS, E> Worker<KS, VS, E>
where
    KS: Serializer,
    VS: Serializer,
    E: Engine,
{
    fn run(mut self, drained: WaitGroup) {
        tracing::debug!("[{}] Worker #{} started", self.shared.name, self.index + 1);
        let interval = self.shared.refresh_interval;

        while !self.shared.cancelled.load(Ordering::SeqCst) {
            let mut need_refresh = false;
            if self.shared.queue.is_empty() {
                need_refresh = !self.shared.queue.wait(interval, &self.shared.cancelled);
            }

            while let Some(item) = self.shared.queue.try_pop() {
                need_refresh = false;
                self.process(item);
            }

            if !self.pending.is_empty() {
                self.drain();
            }

            if need_refresh {
                self.session.refresh();
            }
        }

        // Cancelled: no new items can arrive, finish the ones already queued
        while let Some(item) = self.shared.queue.try_pop() {
            self.process(item);
        }
        self.drain();
        drop(drained);

        // Keep the session alive while a checkpoint may still be running
        while self.shared.maintenance.is_running() {
            self.session.refresh();
            self.drain();
            thread::sleep(SHUTDOWN_POLL);
        }

        loop {
            self.session.refresh();
            if self.drain() {
                break;
            }
        }

        tracing::debug!(
            "[{}] Worker #{} stopped after {} items",
            self.shared.name,
            self.index + 1,
            self.sequence
        );
        self.session.stop();
    }

    /// Execute one item and run the batched drain/refresh when due
    fn process(&mut self, item: WorkItem<KS::Item, VS::Item>) {
        let kind = item.kind();
        let sequence = self.sequence;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute(item, sequence)));
        if let Err(payload) = outcome {
            tracing::error!(
                "[{}] Worker #{} {} request panicked: {}",
                self.shared.name,
                self.index + 1,
                kind,
                EpochError::from_panic(payload)
            );
        }

        self.sequence += 1;
        if self.sequence & REFRESH_BATCH_MASK == 0 {
            if !self.pending.is_empty() {
                self.drain();
            }
            self.session.refresh();
        }
    }

    fn execute(&mut self, item: WorkItem<KS::Item, VS::Item>, sequence: u64) {
        match item {
            WorkItem::Get {
                key,
                wait_pending,
                sink,
            } => self.perform_get(key, wait_pending, sink),
            WorkItem::Set {
                key,
                value,
                wait_pending,
                sink,
            } => self.perform_set(key, value, wait_pending, sink),
            WorkItem::Delete {
                key,
                wait_pending,
                sink,
            } => self.perform_delete(key, wait_pending, sink),
            WorkItem::Flush { wait, sink } => self.perform_flush(wait, sink),
            WorkItem::ForEach {
                on_record,
                on_completed,
                sink,
            } => self.perform_for_each(on_record, on_completed, sink),
            WorkItem::Compact { sink } => self.perform_compact(sink),
            WorkItem::Action(action) => self.perform_action(action, sequence),
        }
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    fn perform_get(
        &mut self,
        key: KS::Item,
        wait_pending: bool,
        sink: Promise<Option<VS::Item>>,
    ) {
        let status = match self.shared.keys.serialize(&key) {
            Ok(source) => self.session.read(source.atom()),
            Err(e) => return self.fail("get", sink, e),
        };

        match status {
            Status::Ok(Some(atom)) => match self.shared.values.deserialize(&atom) {
                Ok(value) => sink.succeed(Some(value)),
                Err(e) => self.fail("get", sink, e),
            },
            Status::Ok(None) => sink.succeed(None),
            Status::Pending(id) => self.defer(id, PendingSink::Read(sink), wait_pending),
            Status::Error(e) => self.fail("get", sink, e),
        }
    }

    fn perform_set(
        &mut self,
        key: KS::Item,
        value: VS::Item,
        wait_pending: bool,
        sink: Promise<()>,
    ) {
        let status = {
            let key_source = match self.shared.keys.serialize(&key) {
                Ok(source) => source,
                Err(e) => return self.fail("set", sink, e),
            };
            let value_source = match self.shared.values.serialize(&value) {
                Ok(source) => source,
                Err(e) => return self.fail("set", sink, e),
            };
            self.session.upsert(key_source.atom(), value_source.atom())
        };

        self.finish_write("set", status, wait_pending, sink)
    }

    fn perform_delete(&mut self, key: KS::Item, wait_pending: bool, sink: Promise<()>) {
        let status = match self.shared.keys.serialize(&key) {
            Ok(source) => self.session.delete(source.atom()),
            Err(e) => return self.fail("delete", sink, e),
        };

        self.finish_write("delete", status, wait_pending, sink)
    }

    fn perform_flush(&mut self, wait: bool, sink: Promise<()>) {
        match self.shared.engine.flush_and_evict(wait) {
            Ok(()) => {
                self.shared.maintenance.increment_version();
                sink.succeed(());
            }
            Err(e) => self.fail("flush", sink, e),
        }
    }

    fn perform_compact(&mut self, sink: Promise<()>) {
        let engine = &self.shared.engine;
        match engine.compact(engine.safe_read_only_address()) {
            Ok(()) => {
                self.shared.maintenance.increment_version();
                sink.succeed(());
            }
            Err(e) => self.fail("compact", sink, e),
        }
    }

    fn perform_for_each(
        &mut self,
        mut on_record: RecordCallback<KS::Item, VS::Item>,
        on_completed: Option<CompletedCallback>,
        sink: Promise<u64>,
    ) {
        match self.scan_all(&mut on_record) {
            Ok(visited) => {
                if let Some(on_completed) = on_completed {
                    on_completed();
                }
                sink.succeed(visited);
            }
            Err(e) => self.fail("for_each", sink, e),
        }
    }

    fn perform_action(&mut self, action: Action, sequence: u64) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| action(sequence))) {
            tracing::error!(
                "[{}] Deferred action panicked (ignored): {}",
                self.shared.name,
                EpochError::from_panic(payload)
            );
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn finish_write(
        &mut self,
        op: &str,
        status: Status<()>,
        wait_pending: bool,
        sink: Promise<()>,
    ) {
        match status {
            Status::Ok(()) => {
                self.shared.maintenance.increment_version();
                sink.succeed(());
            }
            Status::Pending(id) => {
                self.shared.maintenance.increment_version();
                self.defer(id, PendingSink::Write(sink), wait_pending)
            }
            Status::Error(e) => self.fail(op, sink, e),
        }
    }

    /// Park a sink until the engine completes `id`; with `wait_pending` the
    /// sink is resolved before the next item is taken
    fn defer(&mut self, id: PendingId, sink: PendingSink<VS::Item>, wait_pending: bool) {
        self.pending.insert(id, sink);
        if wait_pending {
            self.drain();
        }
    }

    /// Block until the engine finishes deferred operations and resolve their
    /// sinks; true when the session has nothing outstanding
    fn drain(&mut self) -> bool {
        match self.session.complete_pending(true) {
            Ok(drained) => {
                for operation in drained.completed {
                    let id = operation.id;
                    let outcome =
                        panic::catch_unwind(AssertUnwindSafe(|| self.complete(operation)));
                    // the sink was dropped while unwinding, its caller sees Abandoned
                    if let Err(payload) = outcome {
                        tracing::error!(
                            "[{}] Worker #{} completion of operation {} panicked: {}",
                            self.shared.name,
                            self.index + 1,
                            id,
                            EpochError::from_panic(payload)
                        );
                    }
                }
                drained.done
            }
            Err(e) => {
                tracing::error!(
                    "[{}] Worker #{} failed to complete pending operations: {}",
                    self.shared.name,
                    self.index + 1,
                    e
                );
                for (_, sink) in self.pending.drain() {
                    let err = EpochError::Engine(e.to_string());
                    match sink {
                        PendingSink::Read(promise) => promise.fail(err),
                        PendingSink::Write(promise) => promise.fail(err),
                    }
                }
                self.session.pending_count() == 0
            }
        }
    }

    fn complete(&mut self, operation: CompletedOperation) {
        let Some(sink) = self.pending.remove(&operation.id) else {
            tracing::warn!(
                "[{}] Engine completed unknown operation {}",
                self.shared.name,
                operation.id
            );
            return;
        };

        match sink {
            PendingSink::Read(promise) => {
                let values = &self.shared.values;
                let result = operation
                    .outcome
                    .and_then(|atom| atom.map(|atom| values.deserialize(&atom)).transpose());
                if let Err(e) = &result {
                    tracing::error!("[{}] Deferred get failed: {}", self.shared.name, e);
                }
                promise.resolve(result);
            }
            PendingSink::Write(promise) => {
                if let Err(e) = &operation.outcome {
                    tracing::error!("[{}] Deferred write failed: {}", self.shared.name, e);
                }
                promise.resolve(operation.outcome.map(|_| ()));
            }
        }
    }

    /// Walk the whole log, oldest record first
    fn scan_all(&self, on_record: &mut RecordCallback<KS::Item, VS::Item>) -> Result<u64> {
        let engine = &self.shared.engine;
        let mut visited = 0;

        for scanned in engine.scan(engine.begin_address(), engine.tail_address())? {
            let scanned = scanned?;
            let deleted = scanned.record.is_tombstone();
            let key = self.shared.keys.deserialize(&scanned.record.key)?;
            let value = match &scanned.record.value {
                Some(atom) => Some(self.shared.values.deserialize(atom)?),
                None => None,
            };

            on_record(ScanRecord {
                address: scanned.address,
                key,
                value,
                deleted,
            });
            visited += 1;
        }

        Ok(visited)
    }

    fn fail<T>(&self, op: &str, sink: Promise<T>, err: EpochError) {
        tracing::error!("[{}] {} failed: {}", self.shared.name, op, err);
        sink.fail(err);
    }
}
