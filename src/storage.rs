//! SQLite storage layer.
//!
//! Two tables back the queue: `ce_queue` holds tasks that are pending or in
//! progress, `ce_activity` holds archived outcomes. A uuid lives in at most one
//! of them. Timestamps are stored as milliseconds since the epoch so that
//! ordering by creation time is a plain integer comparison; entries created in
//! the same millisecond keep insertion order through `rowid`.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::error::{Error, Result};
use crate::model::*;

const QUEUE_COLUMNS: &str = "uuid, task_type, component_uuid, submitter_login, status, \
     execution_count, worker_uuid, started_at, created_at, updated_at";

const ACTIVITY_COLUMNS: &str = "uuid, task_type, component_uuid, submitter_login, status, \
     execution_count, worker_uuid, analysis_uuid, error_message, error_stacktrace, is_last, \
     submitted_at, started_at, executed_at, execution_time_ms, created_at, updated_at";

/// Storage backend. Owns the SQLite connection.
pub struct Storage {
    conn: Connection,
}

/// Handle for performing storage operations within a transaction.
///
/// Everything done through one `TxContext` commits together or not at all.
pub struct TxContext<'a> {
    tx: &'a Connection,
}

impl TxContext<'_> {
    pub fn insert_queue_entry(&self, entry: &QueueEntry) -> Result<()> {
        insert_queue_entry_on(self.tx, entry)
    }

    pub fn get_queue_entry(&self, uuid: &str) -> Result<Option<QueueEntry>> {
        get_queue_entry_on(self.tx, uuid)
    }

    /// Oldest pending entry still within the retry budget.
    pub fn next_eligible(&self, max_execution_count: u32) -> Result<Option<QueueEntry>> {
        next_eligible_on(self.tx, max_execution_count)
    }

    /// Conditional claim. Returns false when the row no longer matches
    /// PENDING with `expected_count`.
    pub fn claim(
        &self,
        uuid: &str,
        expected_count: u32,
        worker_uuid: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        claim_on(self.tx, uuid, expected_count, worker_uuid, now)
    }

    /// Delete the entry if it still has `expected_status`.
    pub fn delete_queue_entry(&self, uuid: &str, expected_status: QueueStatus) -> Result<bool> {
        delete_queue_entry_on(self.tx, uuid, Some(expected_status))
    }

    /// Delete the entry whatever its status.
    pub fn delete_queue_entry_any(&self, uuid: &str) -> Result<bool> {
        delete_queue_entry_on(self.tx, uuid, None)
    }

    pub fn insert_activity(&self, record: &ActivityRecord) -> Result<()> {
        insert_activity_on(self.tx, record)
    }
}

impl Storage {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        // WAL mode for concurrent readers across processes
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mut storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS ce_queue (
                uuid             TEXT PRIMARY KEY,
                task_type        TEXT NOT NULL,
                component_uuid   TEXT,
                submitter_login  TEXT,
                status           TEXT NOT NULL,
                execution_count  INTEGER NOT NULL DEFAULT 0,
                worker_uuid      TEXT,
                started_at       INTEGER,
                created_at       INTEGER NOT NULL,
                updated_at       INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ce_queue_pending ON ce_queue(created_at ASC)
                WHERE status = 'PENDING';
            CREATE INDEX IF NOT EXISTS idx_ce_queue_component ON ce_queue(component_uuid)
                WHERE component_uuid IS NOT NULL;

            CREATE TABLE IF NOT EXISTS ce_activity (
                uuid               TEXT PRIMARY KEY,
                task_type          TEXT NOT NULL,
                component_uuid     TEXT,
                submitter_login    TEXT,
                status             TEXT NOT NULL,
                execution_count    INTEGER NOT NULL,
                worker_uuid        TEXT,
                analysis_uuid      TEXT,
                error_message      TEXT,
                error_stacktrace   TEXT,
                is_last            INTEGER NOT NULL,
                submitted_at       INTEGER NOT NULL,
                started_at         INTEGER,
                executed_at        INTEGER NOT NULL,
                execution_time_ms  INTEGER,
                created_at         INTEGER NOT NULL,
                updated_at         INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ce_activity_component ON ce_activity(component_uuid, is_last)
                WHERE component_uuid IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_ce_activity_executed ON ce_activity(executed_at DESC);
            ",
        )?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Execute a closure within an IMMEDIATE SQLite transaction.
    ///
    /// The write lock is taken up front, so the read-decide-write sequence in
    /// the closure cannot interleave with another writer, even one in a
    /// different process. Commits if the closure returns Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&TxContext) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ctx = TxContext { tx: &tx };
        let result = f(&ctx)?;
        tx.commit()?;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Queue store
    // -----------------------------------------------------------------------

    /// Insert a queue entry as is (any status or execution count).
    pub fn insert_queue_entry(&mut self, entry: &QueueEntry) -> Result<()> {
        self.with_transaction(|ctx| ctx.insert_queue_entry(entry))
    }

    pub fn get_queue_entry(&self, uuid: &str) -> Result<Option<QueueEntry>> {
        get_queue_entry_on(&self.conn, uuid)
    }

    /// List queue entries, optionally filtered by status, oldest first.
    pub fn list_queue(&self, status: Option<QueueStatus>) -> Result<Vec<QueueEntry>> {
        let entries = match status {
            Some(status) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {QUEUE_COLUMNS} FROM ce_queue WHERE status = ?1
                     ORDER BY created_at ASC, rowid ASC"
                ))?;
                stmt.query_map(params![status.as_str()], row_to_queue_entry)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {QUEUE_COLUMNS} FROM ce_queue ORDER BY created_at ASC, rowid ASC"
                ))?;
                stmt.query_map([], row_to_queue_entry)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(entries)
    }

    /// Pending entries whose execution count reached `max_execution_count`.
    pub fn select_worn_outs(&self, max_execution_count: u32) -> Result<Vec<QueueEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM ce_queue
             WHERE status = 'PENDING' AND execution_count >= ?1
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let entries = stmt
            .query_map(params![max_execution_count], row_to_queue_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn count_queue(&self, status: QueueStatus) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM ce_queue WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // -----------------------------------------------------------------------
    // Activity store
    // -----------------------------------------------------------------------

    pub fn get_activity(&self, uuid: &str) -> Result<Option<ActivityRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {ACTIVITY_COLUMNS} FROM ce_activity WHERE uuid = ?1"),
                params![uuid],
                row_to_activity,
            )
            .optional()?;
        Ok(record)
    }

    /// Most recent outcomes first, optionally for one component.
    pub fn list_activity(
        &self,
        component_uuid: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>> {
        let limit = limit as i64;
        let records = match component_uuid {
            Some(component) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {ACTIVITY_COLUMNS} FROM ce_activity WHERE component_uuid = ?1
                     ORDER BY executed_at DESC, uuid DESC LIMIT ?2"
                ))?;
                stmt.query_map(params![component, limit], row_to_activity)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {ACTIVITY_COLUMNS} FROM ce_activity
                     ORDER BY executed_at DESC, uuid DESC LIMIT ?1"
                ))?;
                stmt.query_map(params![limit], row_to_activity)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Inner functions. They take &Connection so they work with both
// Connection (auto-commit) and Transaction (deref to Connection).
// ---------------------------------------------------------------------------

fn insert_queue_entry_on(conn: &Connection, entry: &QueueEntry) -> Result<()> {
    let archived: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM ce_activity WHERE uuid = ?1",
            params![entry.uuid],
            |row| row.get(0),
        )
        .optional()?;
    if archived.is_some() {
        return Err(Error::IllegalState(format!(
            "task {} is already archived",
            entry.uuid
        )));
    }

    conn.execute(
        "INSERT INTO ce_queue (
            uuid, task_type, component_uuid, submitter_login, status,
            execution_count, worker_uuid, started_at, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.uuid,
            entry.task_type,
            entry.component_uuid,
            entry.submitter_login,
            entry.status.as_str(),
            entry.execution_count,
            entry.worker_uuid,
            entry.started_at.map(to_millis),
            to_millis(entry.created_at),
            to_millis(entry.updated_at),
        ],
    )?;
    Ok(())
}

fn get_queue_entry_on(conn: &Connection, uuid: &str) -> Result<Option<QueueEntry>> {
    let entry = conn
        .query_row(
            &format!("SELECT {QUEUE_COLUMNS} FROM ce_queue WHERE uuid = ?1"),
            params![uuid],
            row_to_queue_entry,
        )
        .optional()?;
    Ok(entry)
}

fn next_eligible_on(conn: &Connection, max_execution_count: u32) -> Result<Option<QueueEntry>> {
    let entry = conn
        .query_row(
            &format!(
                "SELECT {QUEUE_COLUMNS} FROM ce_queue
                 WHERE status = 'PENDING' AND execution_count < ?1
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT 1"
            ),
            params![max_execution_count],
            row_to_queue_entry,
        )
        .optional()?;
    Ok(entry)
}

fn claim_on(
    conn: &Connection,
    uuid: &str,
    expected_count: u32,
    worker_uuid: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let now = to_millis(now);
    let rows = conn.execute(
        "UPDATE ce_queue
         SET status = 'IN_PROGRESS', worker_uuid = ?1, execution_count = execution_count + 1,
             started_at = ?2, updated_at = ?2
         WHERE uuid = ?3 AND status = 'PENDING' AND execution_count = ?4",
        params![worker_uuid, now, uuid, expected_count],
    )?;
    Ok(rows == 1)
}

fn delete_queue_entry_on(
    conn: &Connection,
    uuid: &str,
    expected_status: Option<QueueStatus>,
) -> Result<bool> {
    let rows = match expected_status {
        Some(status) => conn.execute(
            "DELETE FROM ce_queue WHERE uuid = ?1 AND status = ?2",
            params![uuid, status.as_str()],
        )?,
        None => conn.execute("DELETE FROM ce_queue WHERE uuid = ?1", params![uuid])?,
    };
    Ok(rows == 1)
}

/// Insert an activity record, clearing `is_last` on older records of the
/// same component first.
fn insert_activity_on(conn: &Connection, record: &ActivityRecord) -> Result<()> {
    if let (true, Some(component)) = (record.is_last, record.component_uuid.as_deref()) {
        conn.execute(
            "UPDATE ce_activity SET is_last = 0, updated_at = ?1
             WHERE component_uuid = ?2 AND is_last = 1",
            params![to_millis(record.updated_at), component],
        )?;
    }

    conn.execute(
        "INSERT INTO ce_activity (
            uuid, task_type, component_uuid, submitter_login, status,
            execution_count, worker_uuid, analysis_uuid, error_message, error_stacktrace,
            is_last, submitted_at, started_at, executed_at, execution_time_ms,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            record.uuid,
            record.task_type,
            record.component_uuid,
            record.submitter_login,
            record.status.as_str(),
            record.execution_count,
            record.worker_uuid,
            record.analysis_uuid,
            record.error_message,
            record.error_stacktrace,
            record.is_last,
            to_millis(record.submitted_at),
            record.started_at.map(to_millis),
            to_millis(record.executed_at),
            record.execution_time_ms,
            to_millis(record.created_at),
            to_millis(record.updated_at),
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            Box::new(Error::Other(format!("timestamp out of range: {ms}"))),
        )
    })
}

fn parse_text<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = Error>,
{
    raw.parse()
        .map_err(|e: Error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_queue_entry(row: &rusqlite::Row) -> rusqlite::Result<QueueEntry> {
    let started_at: Option<i64> = row.get(7)?;
    Ok(QueueEntry {
        uuid: row.get(0)?,
        task_type: row.get(1)?,
        component_uuid: row.get(2)?,
        submitter_login: row.get(3)?,
        status: parse_text(4, row.get(4)?)?,
        execution_count: row.get(5)?,
        worker_uuid: row.get(6)?,
        started_at: started_at.map(|ms| from_millis(7, ms)).transpose()?,
        created_at: from_millis(8, row.get(8)?)?,
        updated_at: from_millis(9, row.get(9)?)?,
    })
}

fn row_to_activity(row: &rusqlite::Row) -> rusqlite::Result<ActivityRecord> {
    let started_at: Option<i64> = row.get(12)?;
    Ok(ActivityRecord {
        uuid: row.get(0)?,
        task_type: row.get(1)?,
        component_uuid: row.get(2)?,
        submitter_login: row.get(3)?,
        status: parse_text(4, row.get(4)?)?,
        execution_count: row.get(5)?,
        worker_uuid: row.get(6)?,
        analysis_uuid: row.get(7)?,
        error_message: row.get(8)?,
        error_stacktrace: row.get(9)?,
        is_last: row.get(10)?,
        submitted_at: from_millis(11, row.get(11)?)?,
        started_at: started_at.map(|ms| from_millis(12, ms)).transpose()?,
        executed_at: from_millis(13, row.get(13)?)?,
        execution_time_ms: row.get(14)?,
        created_at: from_millis(15, row.get(15)?)?,
        updated_at: from_millis(16, row.get(16)?)?,
    })
}
