// src/store.rs
//
// =============================================================================
// VOXLOGICA: RESULT STORE (v 2.0)
// =============================================================================
//
// The Persistence Layer.
//
// Architecture:
// - SQLite, single file, WAL journal. One row per node id, keyed by the
//   content hash, so the store doubles as the memoization cache and as the
//   only channel results cross worker boundaries on.
// - Monotonic: a materialized payload is never rewritten. Failures are
//   recorded too, so re-execution replays the same error without re-running.
// - Session cache: values that cannot be serialized (dataset handles,
//   closures) live in memory for the session only. Datasets sit in an LRU
//   with a soft cap; closures are pinned, they cannot be recomputed.
// - Single-flight: a process-wide id → Notify table guarantees at most one
//   concurrent computation per id.

use crate::core::{EngineError, NodeId, Value};
use crate::workplan::ClosureValue;
use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Bumped whenever the schema or payload encoding changes. A mismatched
/// store is recreated destructively on open.
const STORE_FORMAT_VERSION: i64 = 2;

const DEFAULT_MEMORY_CAP: usize = 256;

// ============================================================================
// 1. PAYLOAD ENCODING
// ============================================================================

/// Serializable mirror of [`Value`]. Structured values take the canonical
/// binary route (bincode), primitives stay human-inspectable as JSON, blobs
/// stay raw.
#[derive(Serialize, Deserialize)]
enum SerialValue {
    Number(f64),
    Bool(bool),
    String(String),
    Blob(Vec<u8>),
    List(Vec<SerialValue>),
}

impl SerialValue {
    fn from_value(value: &Value) -> Option<SerialValue> {
        match value {
            Value::Number(n) => Some(SerialValue::Number(*n)),
            Value::Bool(b) => Some(SerialValue::Bool(*b)),
            Value::String(s) => Some(SerialValue::String(s.clone())),
            Value::Blob(b) => Some(SerialValue::Blob(b.clone())),
            Value::List(items) => items
                .iter()
                .map(SerialValue::from_value)
                .collect::<Option<Vec<_>>>()
                .map(SerialValue::List),
            Value::Bag(_) | Value::Closure(_) => None,
        }
    }

    fn into_value(self) -> Value {
        match self {
            SerialValue::Number(n) => Value::Number(n),
            SerialValue::Bool(b) => Value::Bool(b),
            SerialValue::String(s) => Value::String(s),
            SerialValue::Blob(b) => Value::Blob(b),
            SerialValue::List(items) => {
                Value::List(items.into_iter().map(SerialValue::into_value).collect())
            }
        }
    }
}

/// (encoding tag, payload bytes), or None for non-serializable values.
fn encode(value: &Value) -> Option<(&'static str, Vec<u8>)> {
    match value {
        // NaN and infinities have no JSON form; they take the binary route.
        Value::Number(n) if !n.is_finite() => {
            let mirror = SerialValue::Number(*n);
            Some(("bin", bincode::serialize(&mirror).ok()?))
        }
        Value::Number(_) | Value::Bool(_) | Value::String(_) => {
            Some(("json", serde_json::to_vec(&value.to_json()).ok()?))
        }
        Value::Blob(bytes) => Some(("raw", bytes.clone())),
        Value::List(_) => {
            let mirror = SerialValue::from_value(value)?;
            Some(("bin", bincode::serialize(&mirror).ok()?))
        }
        Value::Bag(_) | Value::Closure(_) => None,
    }
}

fn decode(encoding: &str, payload: &[u8]) -> Result<Value, EngineError> {
    match encoding {
        "json" => {
            let json: serde_json::Value = serde_json::from_slice(payload)
                .map_err(|e| EngineError::Store(format!("corrupt json payload: {e}")))?;
            match json {
                serde_json::Value::Number(n) => Ok(Value::Number(n.as_f64().unwrap_or(f64::NAN))),
                serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
                serde_json::Value::String(s) => Ok(Value::String(s)),
                other => Err(EngineError::Store(format!(
                    "unexpected json payload shape: {other}"
                ))),
            }
        }
        "raw" => Ok(Value::Blob(payload.to_vec())),
        "bin" => {
            let mirror: SerialValue = bincode::deserialize(payload)
                .map_err(|e| EngineError::Store(format!("corrupt binary payload: {e}")))?;
            Ok(mirror.into_value())
        }
        other => Err(EngineError::Store(format!("unknown encoding '{other}'"))),
    }
}

// ============================================================================
// 2. SINGLE-FLIGHT LOCK TABLE
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
pub enum FlightStatus {
    Acquired,
    AlreadyRunning,
}

/// Process-wide id → Notify map. `mark_running` atomically inserts a
/// sentinel; waiters park on the Notify and re-check the store on wakeup.
/// Released whether the computation succeeds or fails.
pub struct FlightTable {
    inner: Mutex<HashMap<NodeId, Arc<Notify>>>,
}

impl FlightTable {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn mark_running(&self, id: &NodeId) -> FlightStatus {
        let mut table = self.inner.lock().unwrap();
        if table.contains_key(id) {
            FlightStatus::AlreadyRunning
        } else {
            table.insert(id.clone(), Arc::new(Notify::new()));
            FlightStatus::Acquired
        }
    }

    pub fn release(&self, id: &NodeId) {
        let notify = self.inner.lock().unwrap().remove(id);
        if let Some(n) = notify {
            n.notify_waiters();
        }
    }

    /// Blocks until the in-flight computation for `id` (if any) releases.
    pub async fn wait(&self, id: &NodeId) {
        loop {
            let notify = {
                let table = self.inner.lock().unwrap();
                match table.get(id) {
                    Some(n) => n.clone(),
                    None => return,
                }
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register interest before the release re-check, otherwise a
            // release between the two would be missed.
            notified.as_mut().enable();
            if !self.inner.lock().unwrap().contains_key(id) {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// 3. SESSION CACHE (Non-Serializable Values)
// ============================================================================

struct SessionCache {
    values: Mutex<LruCache<NodeId, Value>>,
    closures: Mutex<HashMap<NodeId, Arc<ClosureValue>>>,
}

impl SessionCache {
    fn new(cap: usize) -> Self {
        let cap = NonZeroUsize::new(cap.max(1)).unwrap();
        Self {
            values: Mutex::new(LruCache::new(cap)),
            closures: Mutex::new(HashMap::new()),
        }
    }
}

// ============================================================================
// 4. THE STORE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    Materialized,
    Failed(String),
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// The id was already materialized; the write was ignored (monotonicity).
    Duplicate,
    /// Value is not serializable; it was kept in the session cache instead.
    MemoryOnly,
}

#[derive(Debug, Clone)]
pub struct StoreStats {
    pub path: PathBuf,
    pub materialized: usize,
    pub failed: usize,
    pub session_values: usize,
    pub pinned_closures: usize,
    pub format_version: i64,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "store:      {}", self.path.display())?;
        writeln!(f, "format:     v{}", self.format_version)?;
        writeln!(f, "records:    {} materialized, {} failed", self.materialized, self.failed)?;
        write!(
            f,
            "in-memory:  {} session values, {} pinned closures",
            self.session_values, self.pinned_closures
        )
    }
}

pub struct ResultStore {
    path: PathBuf,
    session: SessionCache,
    flights: FlightTable,
}

impl ResultStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        Self::open_with_cap(path, DEFAULT_MEMORY_CAP)
    }

    pub fn open_with_cap(path: impl AsRef<Path>, memory_cap: usize) -> Result<Self, EngineError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            session: SessionCache::new(memory_cap),
            flights: FlightTable::new(),
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> Result<Connection, EngineError> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=10000;",
        )?;
        Ok(conn)
    }

    fn init(&self) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| EngineError::Store(format!("cannot create store dir: {e}")))?;
            }
        }
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT
            );
            CREATE TABLE IF NOT EXISTS results (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                encoding TEXT,
                payload BLOB,
                error TEXT,
                created_at_ms INTEGER NOT NULL,
                engine_version TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_results_status ON results(status);",
        )?;

        let version: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'format_version'", [], |r| r.get(0))
            .optional()?;

        match version.and_then(|v| v.parse::<i64>().ok()) {
            Some(v) if v == STORE_FORMAT_VERSION => {}
            Some(v) => {
                // Destructive recreate on format mismatch.
                log::warn!(
                    "store format v{} != v{}, recreating {}",
                    v,
                    STORE_FORMAT_VERSION,
                    self.path.display()
                );
                conn.execute_batch("DELETE FROM results; DELETE FROM meta;")?;
                self.write_version(&conn)?;
            }
            None => self.write_version(&conn)?,
        }
        Ok(())
    }

    fn write_version(&self, conn: &Connection) -> Result<(), EngineError> {
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('format_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![STORE_FORMAT_VERSION.to_string()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Record API
    // ------------------------------------------------------------------------

    /// True when a materialized result for `id` is reachable, on disk or in
    /// the session cache.
    pub fn exists(&self, id: &NodeId) -> bool {
        matches!(self.status(id), Ok(RecordStatus::Materialized))
    }

    pub fn status(&self, id: &NodeId) -> Result<RecordStatus, EngineError> {
        let conn = self.conn()?;
        let row: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT status, error FROM results WHERE id = ?1",
                params![id.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        if let Some((status, error)) = row {
            return Ok(match status.as_str() {
                "failed" => RecordStatus::Failed(error.unwrap_or_else(|| "unknown error".into())),
                _ => RecordStatus::Materialized,
            });
        }
        if self.session.values.lock().unwrap().contains(id)
            || self.session.closures.lock().unwrap().contains_key(id)
        {
            return Ok(RecordStatus::Materialized);
        }
        Ok(RecordStatus::Absent)
    }

    pub fn retrieve(&self, id: &NodeId) -> Result<Option<Value>, EngineError> {
        let conn = self.conn()?;
        let row: Option<(String, Option<String>, Option<Vec<u8>>)> = conn
            .query_row(
                "SELECT status, encoding, payload FROM results WHERE id = ?1",
                params![id.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        if let Some((status, encoding, payload)) = row {
            if status == "materialized" {
                let encoding =
                    encoding.ok_or_else(|| EngineError::Store("record missing encoding".into()))?;
                let payload = payload.unwrap_or_default();
                return decode(&encoding, &payload).map(Some);
            }
            return Ok(None);
        }
        if let Some(v) = self.session.values.lock().unwrap().get(id) {
            return Ok(Some(v.clone()));
        }
        if self.session.closures.lock().unwrap().contains_key(id) {
            return Ok(Some(Value::Closure(id.clone())));
        }
        Ok(None)
    }

    /// Writes a result. Non-serializable values are demoted to the session
    /// cache with a warning; already-materialized ids are left untouched.
    pub fn store(&self, id: &NodeId, value: Value) -> Result<StoreOutcome, EngineError> {
        match encode(&value) {
            None => {
                log::warn!(
                    "result {} is a {} and cannot be serialized; keeping it in memory for this session",
                    id.short(),
                    value.kind_name()
                );
                self.put_session_value(id, value);
                Ok(StoreOutcome::MemoryOnly)
            }
            Some((encoding, payload)) => {
                let conn = self.conn()?;
                let changed = conn.execute(
                    "INSERT OR IGNORE INTO results
                     (id, status, encoding, payload, error, created_at_ms, engine_version)
                     VALUES (?1, 'materialized', ?2, ?3, NULL, ?4, ?5)",
                    params![
                        id.as_str(),
                        encoding,
                        payload,
                        chrono::Utc::now().timestamp_millis(),
                        env!("CARGO_PKG_VERSION"),
                    ],
                )?;
                if changed == 0 {
                    // Either materialized already (monotonic, keep it) or a
                    // failed record: a success after a recorded failure means
                    // the failure was transient, so upgrade it.
                    let upgraded = conn.execute(
                        "UPDATE results SET status='materialized', encoding=?2, payload=?3,
                         error=NULL, created_at_ms=?4, engine_version=?5
                         WHERE id = ?1 AND status = 'failed'",
                        params![
                            id.as_str(),
                            encoding,
                            payload,
                            chrono::Utc::now().timestamp_millis(),
                            env!("CARGO_PKG_VERSION"),
                        ],
                    )?;
                    if upgraded == 0 {
                        return Ok(StoreOutcome::Duplicate);
                    }
                }
                Ok(StoreOutcome::Stored)
            }
        }
    }

    pub fn mark_failed(&self, id: &NodeId, error: &str) -> Result<(), EngineError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO results
             (id, status, encoding, payload, error, created_at_ms, engine_version)
             VALUES (?1, 'failed', NULL, NULL, ?2, ?3, ?4)",
            params![
                id.as_str(),
                error,
                chrono::Utc::now().timestamp_millis(),
                env!("CARGO_PKG_VERSION"),
            ],
        )?;
        Ok(())
    }

    /// User opt-in: forget recorded failures so they re-run.
    pub fn clear_failed(&self) -> Result<usize, EngineError> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM results WHERE status = 'failed'", [])?;
        Ok(n)
    }

    pub fn stats(&self) -> Result<StoreStats, EngineError> {
        let conn = self.conn()?;
        let materialized: usize = conn.query_row(
            "SELECT COUNT(*) FROM results WHERE status = 'materialized'",
            [],
            |r| r.get::<_, i64>(0),
        )? as usize;
        let failed: usize = conn.query_row(
            "SELECT COUNT(*) FROM results WHERE status = 'failed'",
            [],
            |r| r.get::<_, i64>(0),
        )? as usize;
        Ok(StoreStats {
            path: self.path.clone(),
            materialized,
            failed,
            session_values: self.session.values.lock().unwrap().len(),
            pinned_closures: self.session.closures.lock().unwrap().len(),
            format_version: STORE_FORMAT_VERSION,
        })
    }

    // ------------------------------------------------------------------------
    // Session cache API
    // ------------------------------------------------------------------------

    pub fn put_session_value(&self, id: &NodeId, value: Value) {
        self.session.values.lock().unwrap().put(id.clone(), value);
    }

    pub fn put_closure(&self, closure: Arc<ClosureValue>) {
        self.session
            .closures
            .lock()
            .unwrap()
            .insert(closure.id.clone(), closure);
    }

    pub fn get_closure(&self, id: &NodeId) -> Option<Arc<ClosureValue>> {
        self.session.closures.lock().unwrap().get(id).cloned()
    }

    // ------------------------------------------------------------------------
    // Single-flight API
    // ------------------------------------------------------------------------

    pub fn mark_running(&self, id: &NodeId) -> FlightStatus {
        self.flights.mark_running(id)
    }

    pub fn release_running(&self, id: &NodeId) {
        self.flights.release(id)
    }

    pub async fn wait_running(&self, id: &NodeId) {
        self.flights.wait(id).await
    }
}

// ============================================================================
// TESTS
// ============================================================================
