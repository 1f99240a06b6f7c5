//! Maintenance Module
//!
//! Background checkpointing and crash recovery, running beside the workers.
//!
//! ## Responsibilities
//! - Build the engine from the newest usable checkpoint at startup
//! - Track a version counter bumped by every mutating request
//! - Checkpoint on a schedule when the version moved, and on request
//! - Report whether it is still running, so workers keep their sessions
//!   alive until no checkpoint can be in flight
//!
//! ## Lifecycle
//! ```text
//!   recover(create) ──► start() ──► [scheduled / requested checkpoints] ──► stop() ──► close()
//!                                                                  final checkpoint ┘
//! ```

mod service;

pub use service::{CheckpointService, CHECKPOINT_DIR};

use std::sync::Arc;

use crate::completion::Completion;
use crate::engine::Engine;
use crate::error::Result;

/// Contract between a connection and its maintenance service
pub trait Maintenance<E: Engine>: Send + Sync {
    /// Build the engine via `create` and restore the newest usable checkpoint.
    ///
    /// Called once, before any worker starts.
    fn recover(&self, create: &dyn Fn() -> Result<E>) -> Result<Arc<E>>;

    /// Begin the background schedule
    fn start(&self) -> Result<()>;

    /// Ask the background schedule to finish; returns without waiting
    fn stop(&self);

    /// True until the background schedule has fully finished
    fn is_running(&self) -> bool;

    /// Take a checkpoint and wait for it
    fn checkpoint(&self) -> Result<()> {
        self.checkpoint_async().wait()
    }

    /// Request a checkpoint
    fn checkpoint_async(&self) -> Completion<()>;

    /// Record that a mutating operation happened
    fn increment_version(&self);

    /// Current version counter
    fn version(&self) -> u64;

    /// Final teardown, after all workers have joined
    fn close(&self) -> Result<()>;
}
