//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Matching components call store methods and never execute SQL directly.
//!
//! RULE: Any read-then-write on capacity (slot headroom, plan totals,
//! provider locks) runs inside `atomic()`, which holds SQLite's writer
//! lock from the first read to commit.

use crate::{
    error::{MatchError, MatchResult},
    event::EventLogEntry,
    types::{from_epoch, to_epoch},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::time::Duration;

mod capacity;
mod job;
mod lock;
mod provider;
mod team;

pub use provider::{ProviderQuery, ProviderStats};

/// How long a writer waits for another connection's transaction.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MatchStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl MatchStore {
    pub fn open(path: &str) -> MatchResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> MatchResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    /// For file-based databases, this opens the same file.
    pub fn reopen(&self) -> MatchResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    pub fn is_file_backed(&self) -> bool {
        self.path.is_some()
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> MatchResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_providers.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_teams.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_jobs.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/005_capacity.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/006_locks.sql"))?;
        Ok(())
    }

    /// Run `f` as one atomic unit of work.
    ///
    /// Opens `BEGIN IMMEDIATE`, so the writer lock is taken before the
    /// closure's first read and competing writers queue behind it.
    /// Commits on `Ok`, rolls back on `Err`. A call made while a
    /// transaction is already open joins it instead of nesting.
    pub fn atomic<T, F>(&self, f: F) -> MatchResult<T>
    where
        F: FnOnce(&Self) -> MatchResult<T>,
    {
        if !self.conn.is_autocommit() {
            return f(self);
        }
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let out = f(self)?;
        tx.commit()?;
        Ok(out)
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> MatchResult<i64> {
        self.conn.execute(
            "INSERT INTO event_log (job_id, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.job_id,
                entry.event_type,
                entry.payload,
                to_epoch(entry.created_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn events_for_job(&self, job_id: &str) -> MatchResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, job_id, event_type, payload, created_at
             FROM event_log WHERE job_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![job_id], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    job_id: row.get(1)?,
                    event_type: row.get(2)?,
                    payload: row.get(3)?,
                    created_at: from_epoch(row.get(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn count_events(&self, event_type: &str) -> MatchResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM event_log WHERE event_type = ?1",
            params![event_type],
            |row| row.get(0),
        )?)
    }

    // ── Settings ───────────────────────────────────────────────

    pub fn put_setting(&self, key: &str, value: &str, now: DateTime<Utc>) -> MatchResult<()> {
        self.conn.execute(
            "INSERT INTO setting (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            updated_at = excluded.updated_at",
            params![key, value, to_epoch(now)],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> MatchResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM setting WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }
}

/// SQL literal list of `AssignmentStatus::BLOCKING`.
const BLOCKING_STATUSES: &str = "'proposed', 'scheduled', 'confirmed', 'in_progress'";

/// `?, ?, ?` for a dynamic IN list, starting at placeholder `first`.
fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `Some` or a `NotFound` for `entity`.
pub(crate) fn require<T>(value: Option<T>, entity: &'static str, id: &str) -> MatchResult<T> {
    value.ok_or_else(|| MatchError::not_found(entity, id))
}
