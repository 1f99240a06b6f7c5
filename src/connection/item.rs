//! Work items
//!
//! One variant per operation family. A work item is built by the façade,
//! owned by the queue until a worker pops it, and then owned by that worker
//! until its sink is resolved.

use crate::completion::Promise;

/// Per-record callback of a `for_each` scan
pub type RecordCallback<K, V> = Box<dyn FnMut(ScanRecord<K, V>) + Send>;

/// Runs once after a `for_each` scan visited every record
pub type CompletedCallback = Box<dyn FnOnce() + Send>;

/// Deferred action; receives the worker's sequence number
pub type Action = Box<dyn FnOnce(u64) + Send>;

/// A record visited by `for_each`
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord<K, V> {
    /// Log address of the record
    pub address: u64,

    pub key: K,

    /// `None` for tombstones
    pub value: Option<V>,

    /// True when the record is a tombstone
    pub deleted: bool,
}

pub(crate) enum WorkItem<K, V> {
    Get {
        key: K,
        wait_pending: bool,
        sink: Promise<Option<V>>,
    },
    Set {
        key: K,
        value: V,
        wait_pending: bool,
        sink: Promise<()>,
    },
    Delete {
        key: K,
        wait_pending: bool,
        sink: Promise<()>,
    },
    Flush {
        wait: bool,
        sink: Promise<()>,
    },
    ForEach {
        on_record: RecordCallback<K, V>,
        on_completed: Option<CompletedCallback>,
        sink: Promise<u64>,
    },
    Compact {
        sink: Promise<()>,
    },

    /// Best-effort: failures are logged and never reported to the caller
    Action(Action),
}

impl<K, V> WorkItem<K, V> {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::Get { .. } => "get",
            WorkItem::Set { .. } => "set",
            WorkItem::Delete { .. } => "delete",
            WorkItem::Flush { .. } => "flush",
            WorkItem::ForEach { .. } => "for_each",
            WorkItem::Compact { .. } => "compact",
            WorkItem::Action(_) => "action",
        }
    }
}
