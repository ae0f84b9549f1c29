//! Durable relational store for custody entities.
//!
//! One [`Store`] wraps one SQLite connection.  Writers run through
//! [`Store::immediate`], which takes the database write lock up front so a
//! whole operation (batch update plus its transfer row) commits or vanishes
//! as a unit.  Multiple `Store` handles may point at the same file; SQLite's
//! locking serialises them, and a writer that waits past the configured busy
//! timeout surfaces [`LedgerError::Timeout`].

use std::path::Path;
use std::time::Duration;

use rusqlite::{ffi, params, Connection, OptionalExtension as _, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::util;

pub const STORE_SCHEMA_VERSION: i64 = 1;

/// Default writer wait before an operation fails with a timeout.
pub const DEFAULT_BUSY_TIMEOUT_MS: u32 = 5_000;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode=WAL;
PRAGMA synchronous=FULL;
PRAGMA foreign_keys=ON;

CREATE TABLE IF NOT EXISTS meta(
  k TEXT PRIMARY KEY,
  v TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS parties(
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  role TEXT NOT NULL,
  company TEXT,
  license_no TEXT,
  contact TEXT,
  created_at_utc TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS medicines(
  id TEXT PRIMARY KEY,
  manufacturer_id TEXT NOT NULL REFERENCES parties(id),
  name TEXT NOT NULL,
  drug_code TEXT NOT NULL,
  composition TEXT NOT NULL,
  dosage TEXT NOT NULL,
  shelf_life_months INTEGER NOT NULL CHECK(shelf_life_months > 0),
  created_at_utc TEXT NOT NULL,
  UNIQUE(manufacturer_id, drug_code)
);

CREATE TABLE IF NOT EXISTS batches(
  id TEXT PRIMARY KEY,
  code TEXT NOT NULL UNIQUE,
  medicine_id TEXT NOT NULL REFERENCES medicines(id),
  manufacturer_id TEXT NOT NULL REFERENCES parties(id),
  batch_number TEXT NOT NULL,
  manufacture_date TEXT NOT NULL,
  expiry_date TEXT NOT NULL,
  initial_quantity INTEGER NOT NULL CHECK(initial_quantity > 0),
  current_quantity INTEGER NOT NULL CHECK(current_quantity >= 0),
  current_owner_id TEXT NOT NULL REFERENCES parties(id),
  status TEXT NOT NULL,
  created_at_utc TEXT NOT NULL,
  updated_at_utc TEXT NOT NULL,
  UNIQUE(manufacturer_id, batch_number),
  CHECK(current_quantity <= initial_quantity)
);

CREATE INDEX IF NOT EXISTS idx_batches_owner ON batches(current_owner_id);

CREATE TABLE IF NOT EXISTS transfers(
  seq INTEGER PRIMARY KEY,
  id TEXT NOT NULL UNIQUE,
  batch_id TEXT NOT NULL REFERENCES batches(id),
  from_party_id TEXT NOT NULL REFERENCES parties(id),
  to_party_id TEXT REFERENCES parties(id),
  kind TEXT NOT NULL,
  quantity INTEGER NOT NULL CHECK(quantity > 0),
  ts_utc TEXT NOT NULL,
  notes TEXT,
  prev_hash BLOB NOT NULL,
  entry_hash BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transfers_batch ON transfers(batch_id);

CREATE TABLE IF NOT EXISTS verifications(
  id TEXT PRIMARY KEY,
  code TEXT NOT NULL,
  resolved_batch_id TEXT REFERENCES batches(id),
  outcome TEXT NOT NULL,
  verifier_party_id TEXT REFERENCES parties(id),
  location TEXT,
  ts_utc TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_verifications_code ON verifications(code);

CREATE TABLE IF NOT EXISTS reports(
  id TEXT PRIMARY KEY,
  code TEXT NOT NULL,
  resolved_batch_id TEXT REFERENCES batches(id),
  reporter_party_id TEXT REFERENCES parties(id),
  category TEXT NOT NULL,
  description TEXT NOT NULL,
  location TEXT,
  status TEXT NOT NULL,
  admin_notes TEXT,
  created_at_utc TEXT NOT NULL,
  updated_at_utc TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reports_status ON reports(status);
"#;

// ---------------------------------------------------------------------------
// Store metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub store_id: Uuid,
    pub created_at_utc: String,
    pub schema_version: i64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    conn: Connection,
    meta: StoreMeta,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Create a fresh store at `db_path`.  Fails if the file already holds a
    /// recognisable store (create is not an open).
    pub fn create_new(db_path: &Path, busy_timeout_ms: u32) -> Result<Self> {
        util::validate_path(db_path, "store")?;
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LedgerError::Storage(format!(
                        "create db parent dir {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let conn = open_connection(db_path, busy_timeout_ms)?;
        let already: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if already.is_some() {
            return Err(LedgerError::Conflict(format!(
                "store already exists at {}",
                db_path.display()
            )));
        }

        conn.execute_batch(SCHEMA_SQL)?;
        let meta = StoreMeta {
            store_id: Uuid::new_v4(),
            created_at_utc: util::now_utc_rfc3339(),
            schema_version: STORE_SCHEMA_VERSION,
        };
        write_meta(&conn, &meta)?;
        info!(store_id = %meta.store_id, path = %db_path.display(), "store created");
        Ok(Self { conn, meta })
    }

    /// Open an existing store, checking its schema version.
    pub fn open_existing(db_path: &Path, busy_timeout_ms: u32) -> Result<Self> {
        util::validate_path(db_path, "store")?;
        if !db_path.exists() {
            return Err(LedgerError::Storage(format!(
                "no store at {}",
                db_path.display()
            )));
        }
        let conn = open_connection(db_path, busy_timeout_ms)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let has_meta: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if has_meta.is_none() {
            return Err(LedgerError::Storage(format!(
                "{} is not a custody store (no meta table)",
                db_path.display()
            )));
        }

        let meta = read_meta(&conn, db_path)?;
        if meta.schema_version != STORE_SCHEMA_VERSION {
            return Err(LedgerError::Storage(format!(
                "unsupported schema_version {} (expected {STORE_SCHEMA_VERSION})",
                meta.schema_version
            )));
        }
        Ok(Self { conn, meta })
    }

    /// Open `db_path`, creating the store on first use.
    pub fn open(db_path: &Path, busy_timeout_ms: u32) -> Result<Self> {
        if db_path.exists() {
            Self::open_existing(db_path, busy_timeout_ms)
        } else {
            Self::create_new(db_path, busy_timeout_ms)
        }
    }

    /// An in-memory store, private to this handle.  Used by unit tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        let meta = StoreMeta {
            store_id: Uuid::new_v4(),
            created_at_utc: util::now_utc_rfc3339(),
            schema_version: STORE_SCHEMA_VERSION,
        };
        write_meta(&conn, &meta)?;
        Ok(Self { conn, meta })
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.  The write lock is
    /// taken before `f` sees any data, so every read inside `f` observes the
    /// state the commit will apply to.  A lock wait past the busy timeout
    /// maps to [`LedgerError::Timeout`]; any error from `f` rolls back.
    pub fn immediate<T>(
        &mut self,
        what: &str,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| classify(e, &format!("{what}: begin")))?;
        let out = f(&tx)?;
        tx.commit().map_err(|e| classify(e, &format!("{what}: commit")))?;
        Ok(out)
    }
}

fn open_connection(db_path: &Path, busy_timeout_ms: u32) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .map_err(|e| LedgerError::Storage(format!("open db {}: {e}", db_path.display())))?;
    conn.busy_timeout(Duration::from_millis(u64::from(busy_timeout_ms)))?;
    Ok(conn)
}

fn write_meta(conn: &Connection, meta: &StoreMeta) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta(k,v) VALUES (?1,?2)",
        params!["store_id", meta.store_id.to_string()],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO meta(k,v) VALUES (?1,?2)",
        params!["created_at_utc", &meta.created_at_utc],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO meta(k,v) VALUES (?1,?2)",
        params!["schema_version", meta.schema_version.to_string()],
    )?;
    Ok(())
}

fn read_meta(conn: &Connection, db_path: &Path) -> Result<StoreMeta> {
    let get = |k: &str| -> Result<String> {
        conn.query_row("SELECT v FROM meta WHERE k=?1", params![k], |row| row.get(0))
            .optional()?
            .ok_or_else(|| {
                LedgerError::Storage(format!(
                    "{} is not a custody store (missing meta '{k}')",
                    db_path.display()
                ))
            })
    };
    let store_id = Uuid::parse_str(&get("store_id")?)
        .map_err(|e| LedgerError::Storage(format!("parse store_id: {e}")))?;
    let created_at_utc = get("created_at_utc")?;
    let schema_version: i64 = get("schema_version")?
        .parse()
        .map_err(|e| LedgerError::Storage(format!("parse schema_version: {e}")))?;
    Ok(StoreMeta {
        store_id,
        created_at_utc,
        schema_version,
    })
}

/// Parse a UUID read back from a stored row.  Failure here is store
/// corruption, not caller error.
pub(crate) fn stored_uuid(s: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| LedgerError::Integrity(format!("stored {what} '{s}': {e}")))
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Map a raw SQLite error onto the result taxonomy: lock waits become
/// `Timeout`, uniqueness violations become `Conflict`, broken references
/// become `NotFound`, and a fired CHECK means the writer let bad state
/// through validation, which is an integrity fault.
pub(crate) fn classify(e: rusqlite::Error, what: &str) -> LedgerError {
    if let rusqlite::Error::SqliteFailure(f, ref msg) = e {
        let detail = msg.clone().unwrap_or_default();
        match f.code {
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                return LedgerError::Timeout(format!("{what}: store busy: {detail}"));
            }
            rusqlite::ErrorCode::ConstraintViolation => match f.extended_code {
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    return LedgerError::Conflict(format!("{what}: {detail}"));
                }
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                    return LedgerError::NotFound(format!("{what}: referenced row missing"));
                }
                ffi::SQLITE_CONSTRAINT_CHECK => {
                    return LedgerError::Integrity(format!("{what}: {detail}"));
                }
                _ => {}
            },
            _ => {}
        }
    }
    LedgerError::Database(e)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
