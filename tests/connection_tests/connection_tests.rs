//! Tests for Connection
//!
//! These tests verify:
//! - get/set/delete through the worker pool
//! - for_each over the whole log, tombstones included
//! - flush, compact and checkpoint requests
//! - Durability across close and reopen
//! - Lifecycle: argument checks, closed connections, drop
//! - Failures stay local to their own request

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use epochkv::engine::{Engine, FIRST_ADDRESS};
use epochkv::maintenance::CHECKPOINT_DIR;
use epochkv::serializer::Serializer;
use epochkv::{
    Connection, ConnectionSettings, EpochError, LifecycleState, RawSerializer, ScanRecord,
    Utf8Serializer,
};
use futures::executor::block_on;
use tempfile::TempDir;

type StringConnection = Connection<Utf8Serializer, Utf8Serializer>;

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn settings(workers: usize) -> ConnectionSettings {
    ConnectionSettings::builder()
        .worker_thread_count(workers)
        .worker_refresh_interval_ms(5)
        .maintenance_interval_ms(60_000)
        .memory_records(256)
        .mutable_records(8)
        .build()
}

fn open(dir: &Path, workers: usize) -> StringConnection {
    init_tracing();
    Connection::open(
        dir,
        Utf8Serializer::new(),
        Utf8Serializer::new(),
        settings(workers),
        Some("test"),
    )
    .unwrap()
}

fn s(value: &str) -> String {
    value.to_string()
}

/// UTF-8 strings, except that reading back "bad" panics
struct PanickingSerializer;

impl Serializer for PanickingSerializer {
    type Item = String;
    type Source = Vec<u8>;

    fn serialize(&self, item: &String) -> epochkv::Result<Vec<u8>> {
        Ok(item.as_bytes().to_vec())
    }

    fn deserialize(&self, atom: &[u8]) -> epochkv::Result<String> {
        if atom == b"bad" {
            panic!("cannot decode value");
        }
        Ok(String::from_utf8_lossy(atom).into_owned())
    }
}

fn open_panicking(dir: &Path) -> Connection<Utf8Serializer, PanickingSerializer> {
    init_tracing();
    Connection::open(
        dir,
        Utf8Serializer::new(),
        PanickingSerializer,
        settings(1),
        Some("panicking"),
    )
    .unwrap()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_open_starts_workers_and_maintenance() {
    let temp = TempDir::new().unwrap();
    let data_dir = temp.path().join("db");

    let conn = open(&data_dir, 3);

    assert_eq!(conn.state(), LifecycleState::Open);
    assert_eq!(conn.worker_count(), 3);
    assert_eq!(conn.name(), "test");
    assert_eq!(conn.directory(), data_dir.as_path());
    assert!(data_dir.join(CHECKPOINT_DIR).is_dir());
    assert_eq!(conn.engine().session_count(), 3);

    conn.close().unwrap();

    assert_eq!(conn.state(), LifecycleState::Closed);
    assert_eq!(conn.worker_count(), 0);
    assert_eq!(conn.engine().session_count(), 0);
}

#[test]
fn test_default_name() {
    let temp = TempDir::new().unwrap();
    let conn: StringConnection = Connection::open(
        temp.path(),
        Utf8Serializer::new(),
        Utf8Serializer::new(),
        settings(1),
        None,
    )
    .unwrap();

    assert_eq!(conn.name(), "epochkv");
}

#[test]
fn test_open_rejects_file_path() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("plain.txt");
    fs::write(&file, b"x").unwrap();

    let result: Result<StringConnection, _> = Connection::open(
        &file,
        Utf8Serializer::new(),
        Utf8Serializer::new(),
        settings(1),
        None,
    );

    assert!(matches!(result, Err(EpochError::InvalidArgument(_))));
}

#[test]
fn test_open_rejects_empty_path() {
    let result: Result<StringConnection, _> = Connection::open(
        "",
        Utf8Serializer::new(),
        Utf8Serializer::new(),
        settings(1),
        None,
    );

    assert!(matches!(result, Err(EpochError::InvalidArgument(_))));
}

#[test]
fn test_open_rejects_invalid_settings() {
    let temp = TempDir::new().unwrap();
    let bad = ConnectionSettings::builder().worker_thread_count(0).build();

    let result: Result<StringConnection, _> = Connection::open(
        temp.path(),
        Utf8Serializer::new(),
        Utf8Serializer::new(),
        bad,
        None,
    );

    assert!(matches!(result, Err(EpochError::Config(_))));
}

#[test]
fn test_closed_connection_rejects_requests() {
    let temp = TempDir::new().unwrap();
    let conn = open(temp.path(), 2);
    conn.close().unwrap();

    assert!(matches!(conn.get(s("k")), Err(EpochError::AlreadyClosed)));
    assert!(matches!(conn.set(s("k"), s("v")), Err(EpochError::AlreadyClosed)));
    assert!(matches!(conn.delete(s("k")), Err(EpochError::AlreadyClosed)));
    assert!(matches!(conn.flush(true), Err(EpochError::AlreadyClosed)));
    assert!(matches!(conn.compact(), Err(EpochError::AlreadyClosed)));
    assert!(matches!(conn.for_each(|_| {}), Err(EpochError::AlreadyClosed)));
    assert!(matches!(conn.execute(|_| {}), Err(EpochError::AlreadyClosed)));
    assert!(matches!(conn.checkpoint(), Err(EpochError::AlreadyClosed)));
    assert!(matches!(conn.checkpoint_async(), Err(EpochError::AlreadyClosed)));
    assert_eq!(conn.queue_len(), 0);
}

#[test]
fn test_close_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let conn = open(temp.path(), 2);

    conn.close().unwrap();
    conn.close().unwrap();

    assert_eq!(conn.state(), LifecycleState::Closed);
}

#[test]
fn test_drop_closes_connection() {
    let temp = TempDir::new().unwrap();

    {
        let conn = open(temp.path(), 2);
        conn.set(s("kept"), s("yes")).unwrap().wait().unwrap();
    }

    let conn = open(temp.path(), 2);
    assert_eq!(conn.get(s("kept")).unwrap().wait().unwrap(), Some(s("yes")));
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_set_then_get() {
    let temp = TempDir::new().unwrap();
    let conn = open(temp.path(), 2);

    conn.set(s("hello"), s("world")).unwrap().wait().unwrap();
    let value = conn.get(s("hello")).unwrap().wait().unwrap();

    assert_eq!(value, Some(s("world")));
}

#[test]
fn test_get_missing_key() {
    let temp = TempDir::new().unwrap();
    let conn = open(temp.path(), 2);

    assert_eq!(conn.get(s("nope")).unwrap().wait().unwrap(), None);
}

#[test]
fn test_set_overwrites() {
    let temp = TempDir::new().unwrap();
    let conn = open(temp.path(), 1);

    conn.set(s("k"), s("v1")).unwrap().wait().unwrap();
    conn.set(s("k"), s("v2")).unwrap().wait().unwrap();

    assert_eq!(conn.get(s("k")).unwrap().wait().unwrap(), Some(s("v2")));
}

#[test]
fn test_set_delete_get() {
    let temp = TempDir::new().unwrap();
    let conn = open(temp.path(), 2);

    conn.set(s("k"), s("v")).unwrap().wait().unwrap();
    conn.delete(s("k")).unwrap().wait().unwrap();

    assert_eq!(conn.get(s("k")).unwrap().wait().unwrap(), None);
}

#[test]
fn test_delete_missing_key_succeeds() {
    let temp = TempDir::new().unwrap();
    let conn = open(temp.path(), 2);

    conn.delete(s("ghost")).unwrap().wait().unwrap();

    assert_eq!(conn.get(s("ghost")).unwrap().wait().unwrap(), None);
}

#[test]
fn test_await_completions() {
    let temp = TempDir::new().unwrap();
    let conn = open(temp.path(), 2);

    block_on(conn.set(s("async"), s("value")).unwrap()).unwrap();
    let value = block_on(conn.get(s("async")).unwrap()).unwrap();

    assert_eq!(value, Some(s("value")));
}

#[test]
fn test_version_counts_mutations() {
    let temp = TempDir::new().unwrap();
    let conn = open(temp.path(), 1);
    let start = conn.version();

    conn.set(s("a"), s("1")).unwrap().wait().unwrap();
    conn.get(s("a")).unwrap().wait().unwrap();
    conn.delete(s("a")).unwrap().wait().unwrap();
    conn.delete(s("missing")).unwrap().wait().unwrap();
    conn.flush(false).unwrap().wait().unwrap();
    conn.compact().unwrap().wait().unwrap();

    assert_eq!(conn.version() - start, 5);
}

// =============================================================================
// Scan Tests
// =============================================================================

#[test]
fn test_for_each_visits_tombstones_in_log_order() {
    let temp = TempDir::new().unwrap();
    let conn = open(temp.path(), 2);

    conn.set(s("a"), s("1")).unwrap().wait().unwrap();
    conn.set(s("b"), s("2")).unwrap().wait().unwrap();
    conn.delete(s("a")).unwrap().wait().unwrap();
    conn.set(s("c"), s("3")).unwrap().wait().unwrap();

    let seen: Arc<Mutex<Vec<ScanRecord<String, String>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    let visited = conn
        .for_each_then(
            move |record| sink.lock().unwrap().push(record),
            move || flag.store(true, Ordering::SeqCst),
        )
        .unwrap()
        .wait()
        .unwrap();

    assert_eq!(visited, 4);
    assert!(finished.load(Ordering::SeqCst));

    let seen = seen.lock().unwrap();
    let summary: Vec<_> = seen
        .iter()
        .map(|r| (r.key.as_str(), r.value.as_deref(), r.deleted))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("a", Some("1"), false),
            ("b", Some("2"), false),
            ("a", None, true),
            ("c", Some("3"), false),
        ]
    );
    assert!(seen.windows(2).all(|w| w[0].address < w[1].address));
}

#[test]
fn test_for_each_on_empty_store() {
    let temp = TempDir::new().unwrap();
    let conn = open(temp.path(), 1);

    let visited = conn.for_each(|_| panic!("no records")).unwrap().wait().unwrap();

    assert_eq!(visited, 0);
}

// =============================================================================
// Flush / Compact / Checkpoint Tests
// =============================================================================

#[test]
fn test_flush_then_get_completes_deferred_read() {
    let temp = TempDir::new().unwrap();
    let conn = open(temp.path(), 2);

    conn.set(s("k"), s("v")).unwrap().wait().unwrap();
    conn.flush(true).unwrap().wait().unwrap();

    assert_eq!(conn.engine().memory_records(), 0);
    assert_eq!(conn.get(s("k")).unwrap().wait().unwrap(), Some(s("v")));
    assert_eq!(
        conn.get_with(s("k"), true).unwrap().wait().unwrap(),
        Some(s("v"))
    );
}

#[test]
fn test_compact_preserves_live_values() {
    let temp = TempDir::new().unwrap();
    let conn = open(temp.path(), 2);

    for round in 0..5 {
        for i in 0..10 {
            conn.set(format!("key{}", i), format!("v{}", round))
                .unwrap()
                .wait()
                .unwrap();
        }
    }
    conn.delete(s("key0")).unwrap().wait().unwrap();

    // idle workers refresh, publishing the read-only boundary
    assert!(wait_until(Duration::from_secs(5), || {
        conn.engine().safe_read_only_address() > FIRST_ADDRESS
    }));

    conn.compact().unwrap().wait().unwrap();

    assert!(conn.engine().begin_address() > FIRST_ADDRESS);
    assert_eq!(conn.get(s("key0")).unwrap().wait().unwrap(), None);
    for i in 1..10 {
        let value = conn.get(format!("key{}", i)).unwrap().wait().unwrap();
        assert_eq!(value, Some(s("v4")));
    }
}

#[test]
fn test_checkpoint_writes_checkpoint_directory() {
    let temp = TempDir::new().unwrap();
    let conn = open(temp.path(), 2);

    conn.set(s("k"), s("v")).unwrap().wait().unwrap();
    conn.checkpoint().unwrap();
    conn.checkpoint_async().unwrap().wait().unwrap();

    let count = fs::read_dir(temp.path().join(CHECKPOINT_DIR)).unwrap().count();
    assert_eq!(count, 2);
}

// =============================================================================
// Durability Tests
// =============================================================================

#[test]
fn test_close_takes_final_checkpoint() {
    let temp = TempDir::new().unwrap();

    {
        let conn = open(temp.path(), 2);
        conn.set(s("a"), s("1")).unwrap().wait().unwrap();
        conn.set(s("b"), s("2")).unwrap().wait().unwrap();
        conn.delete(s("a")).unwrap().wait().unwrap();
        conn.close().unwrap();
    }

    let conn = open(temp.path(), 2);
    assert_eq!(conn.get(s("a")).unwrap().wait().unwrap(), None);
    assert_eq!(conn.get_with(s("b"), true).unwrap().wait().unwrap(), Some(s("2")));
}

#[test]
fn test_concurrent_sets_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let threads = 4;
    let per_thread = 250;

    {
        let conn = Arc::new(open(temp.path(), 4));
        let mut handles = Vec::new();

        for t in 0..threads {
            let conn = Arc::clone(&conn);
            handles.push(thread::spawn(move || {
                let pending: Vec<_> = (0..per_thread)
                    .map(|i| {
                        conn.set(format!("t{}-k{}", t, i), format!("v{}", i))
                            .unwrap()
                    })
                    .collect();
                for completion in pending {
                    completion.wait().unwrap();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        conn.close().unwrap();
    }

    let conn = open(temp.path(), 4);
    let reads: Vec<_> = (0..threads)
        .flat_map(|t| (0..per_thread).map(move |i| (t, i)))
        .map(|(t, i)| (i, conn.get(format!("t{}-k{}", t, i)).unwrap()))
        .collect();

    for (i, completion) in reads {
        assert_eq!(completion.wait().unwrap(), Some(format!("v{}", i)));
    }
}

// =============================================================================
// Failure Isolation Tests
// =============================================================================

#[test]
fn test_execute_runs_on_worker_and_swallows_panics() {
    let temp = TempDir::new().unwrap();
    let conn = open(temp.path(), 1);
    let (tx, rx) = mpsc::channel();

    conn.execute(|_| panic!("action failure")).unwrap();
    conn.execute(move |sequence| {
        let name = thread::current().name().map(str::to_string);
        tx.send((name, sequence)).unwrap();
    })
    .unwrap();

    let (name, sequence) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(name.as_deref(), Some("test worker #1"));
    assert_eq!(sequence, 1);

    // the worker keeps serving requests
    conn.set(s("k"), s("v")).unwrap().wait().unwrap();
    assert_eq!(conn.get(s("k")).unwrap().wait().unwrap(), Some(s("v")));
}

#[test]
fn test_deserialization_failure_stays_on_its_request() {
    let temp = TempDir::new().unwrap();

    {
        let raw: Connection<Utf8Serializer, RawSerializer> = Connection::open(
            temp.path(),
            Utf8Serializer::new(),
            RawSerializer,
            settings(1),
            Some("raw"),
        )
        .unwrap();
        raw.set(s("bad"), vec![0xff, 0xfe]).unwrap().wait().unwrap();
        raw.close().unwrap();
    }

    let conn = open(temp.path(), 1);

    let err = conn.get(s("bad")).unwrap().wait().unwrap_err();
    assert!(matches!(err, EpochError::Serialization(_)));

    conn.set(s("good"), s("ok")).unwrap().wait().unwrap();
    assert_eq!(conn.get(s("good")).unwrap().wait().unwrap(), Some(s("ok")));
}

#[test]
fn test_panicking_deserializer_on_in_memory_read() {
    let temp = TempDir::new().unwrap();
    let conn = open_panicking(temp.path());

    conn.set(s("k"), s("bad")).unwrap().wait().unwrap();

    let err = conn.get(s("k")).unwrap().wait().unwrap_err();
    assert!(matches!(err, EpochError::Abandoned));

    conn.set(s("other"), s("fine")).unwrap().wait().unwrap();
    assert_eq!(conn.get(s("other")).unwrap().wait().unwrap(), Some(s("fine")));
}

#[test]
fn test_panicking_deserializer_on_deferred_read() {
    let temp = TempDir::new().unwrap();
    let conn = open_panicking(temp.path());

    conn.set(s("k"), s("bad")).unwrap().wait().unwrap();
    conn.set(s("ok"), s("fine")).unwrap().wait().unwrap();
    conn.flush(true).unwrap().wait().unwrap();
    assert_eq!(conn.engine().memory_records(), 0);

    // resolved by the worker's drain after the queue empties
    let err = conn.get(s("k")).unwrap().wait().unwrap_err();
    assert!(matches!(err, EpochError::Abandoned));

    // resolved by the drain a waiting get runs before the next item
    let err = conn.get_with(s("k"), true).unwrap().wait().unwrap_err();
    assert!(matches!(err, EpochError::Abandoned));

    // a bad read deferred alongside a good one does not strand the good one
    let bad = conn.get(s("k")).unwrap();
    let good = conn.get(s("ok")).unwrap();
    assert!(matches!(bad.wait(), Err(EpochError::Abandoned)));
    assert_eq!(good.wait().unwrap(), Some(s("fine")));

    conn.set(s("after"), s("v")).unwrap().wait().unwrap();
    assert_eq!(conn.get(s("after")).unwrap().wait().unwrap(), Some(s("v")));
    assert_eq!(conn.get(s("ok")).unwrap().wait().unwrap(), Some(s("fine")));
    conn.close().unwrap();
}
