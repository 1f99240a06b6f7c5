//! # EpochKV
//!
//! An asynchronous front end for a session-affine key-value engine:
//! - Non-blocking submission from any thread, one `Completion` per request
//! - A fixed pool of worker threads, each owning one engine session
//! - Batched epoch refresh and pending-operation drains
//! - Background checkpointing and crash recovery
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Connection Façade                        │
//! │              (any caller thread, returns Completion)         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ push + notify
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                        Work Queue                            │
//! │                 (unbounded MPMC FIFO + monitor)              │
//! └──────┬──────────────┬───────────────────────┬───────────────┘
//!        │              │                       │
//!        ▼              ▼                       ▼
//!   ┌──────────┐   ┌──────────┐           ┌──────────┐
//!   │ Worker 1 │   │ Worker 2 │    ...    │ Worker N │
//!   │ session  │   │ session  │           │ session  │
//!   └────┬─────┘   └────┬─────┘           └────┬─────┘
//!        └──────────────┼──────────────────────┘
//!                       ▼
//!               ┌───────────────┐  version   ┌─────────────────┐
//!               │    Engine     │ ◄───────── │   Maintenance   │
//!               │ (hybrid log)  │ checkpoint │ (checkpoints,   │
//!               └───────────────┘            │  recovery)      │
//!                                            └─────────────────┘
//! ```
//!
//! ## Example
//! ```no_run
//! use epochkv::{Connection, ConnectionSettings, Utf8Serializer};
//!
//! let conn = Connection::open(
//!     "/tmp/epochkv-demo",
//!     Utf8Serializer::new(),
//!     Utf8Serializer::new(),
//!     ConnectionSettings::default(),
//!     Some("demo"),
//! )?;
//!
//! conn.set("hello".to_string(), "world".to_string())?.wait()?;
//! let value = conn.get("hello".to_string())?.wait()?;
//! assert_eq!(value.as_deref(), Some("world"));
//!
//! conn.close()?;
//! # Ok::<(), epochkv::EpochError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod completion;
pub mod serializer;
pub mod engine;
pub mod maintenance;
pub mod connection;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{EpochError, Result};
pub use config::{ConnectionSettings, LogSettings};
pub use completion::{Completion, Promise};
pub use connection::{Connection, LifecycleState, ScanRecord};
pub use engine::{Engine, EngineSession, LogEngine, Status};
pub use maintenance::{CheckpointService, Maintenance};
pub use serializer::{BincodeSerializer, RawSerializer, Serializer, Utf8Serializer};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of EpochKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
