use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use skilldeck_core::SkillError;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::store::{
    ChainReport, ContextEntry, ContextFilter, RunRecord, StateStore, chain_hash,
    parse_timestamp, timestamp,
};

fn store_err(e: rusqlite::Error) -> SkillError {
    SkillError::Store(e.to_string())
}

/// SQLite-backed state store.
///
/// `context_log` rejects UPDATE and DELETE at the database level, and each
/// row carries a blake3 checksum chained to the row before it.
pub struct SqliteStateStore {
    db: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create the state database at the given path.
    pub fn open(path: &Path) -> skilldeck_core::Result<Self> {
        info!(?path, "opening state store");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if path.as_os_str() != ":memory:" {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(store_err)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(store_err)?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS workflow_runs (
                run_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                archived INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_updated ON workflow_runs(updated_at);

            CREATE TABLE IF NOT EXISTS context_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project TEXT,
                run_id TEXT,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                details TEXT NOT NULL,
                created_at TEXT NOT NULL,
                checksum TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_context_run ON context_log(run_id);
            CREATE INDEX IF NOT EXISTS idx_context_project ON context_log(project);

            CREATE TRIGGER IF NOT EXISTS context_log_no_update
            BEFORE UPDATE ON context_log
            BEGIN
                SELECT RAISE(ABORT, 'context_log is append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS context_log_no_delete
            BEFORE DELETE ON context_log
            BEGIN
                SELECT RAISE(ABORT, 'context_log is append-only');
            END;

            CREATE TABLE IF NOT EXISTS batch_ledger (
                fingerprint TEXT PRIMARY KEY,
                item_key TEXT NOT NULL,
                submitted_at TEXT NOT NULL
            );
            ",
        )
        .map_err(store_err)?;

        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> skilldeck_core::Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    /// Raw connection access, for maintenance and tests.
    pub fn db(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.db.lock()
    }
}

/// Row shape read back from `workflow_runs`.
type RunRow = (String, String, String, String, bool, String, String);

fn run_from_row(row: RunRow) -> skilldeck_core::Result<RunRecord> {
    let (run_id, workflow_id, status, snapshot, archived, created_at, updated_at) = row;
    Ok(RunRecord {
        run_id,
        workflow_id,
        status,
        snapshot: serde_json::from_str(&snapshot)?,
        archived,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

/// Raw `context_log` row; text columns are kept verbatim for hashing.
struct ContextRow {
    id: i64,
    project: Option<String>,
    run_id: Option<String>,
    kind: String,
    message: String,
    details: String,
    created_at: String,
    checksum: String,
}

impl ContextRow {
    fn into_entry(self) -> skilldeck_core::Result<ContextEntry> {
        Ok(ContextEntry {
            id: self.id,
            project: self.project,
            run_id: self.run_id,
            kind: self.kind,
            message: self.message,
            details: serde_json::from_str(&self.details)?,
            created_at: parse_timestamp(&self.created_at)?,
            checksum: self.checksum,
        })
    }
}

fn read_context_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContextRow> {
    Ok(ContextRow {
        id: row.get(0)?,
        project: row.get(1)?,
        run_id: row.get(2)?,
        kind: row.get(3)?,
        message: row.get(4)?,
        details: row.get(5)?,
        created_at: row.get(6)?,
        checksum: row.get(7)?,
    })
}

const CONTEXT_COLUMNS: &str = "id, project, run_id, kind, message, details, created_at, checksum";

impl StateStore for SqliteStateStore {
    fn save(&self, record: &RunRecord) -> skilldeck_core::Result<()> {
        let snapshot = serde_json::to_string(&record.snapshot)?;
        let db = self.db.lock();
        db.execute(
            "INSERT INTO workflow_runs (run_id, workflow_id, status, snapshot, archived, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(run_id) DO UPDATE SET
                status = excluded.status,
                snapshot = excluded.snapshot,
                archived = excluded.archived,
                updated_at = excluded.updated_at",
            rusqlite::params![
                record.run_id,
                record.workflow_id,
                record.status,
                snapshot,
                record.archived,
                timestamp(&record.created_at),
                timestamp(&record.updated_at),
            ],
        )
        .map_err(store_err)?;
        debug!(run_id = %record.run_id, status = %record.status, "saved run snapshot");
        Ok(())
    }

    fn load(&self, run_id: &str) -> skilldeck_core::Result<RunRecord> {
        let db = self.db.lock();
        let row: Option<RunRow> = db
            .query_row(
                "SELECT run_id, workflow_id, status, snapshot, archived, created_at, updated_at
                 FROM workflow_runs WHERE run_id = ?1",
                rusqlite::params![run_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()
            .map_err(store_err)?;
        match row {
            Some(row) => run_from_row(row),
            None => Err(SkillError::RunNotFound(run_id.to_string())),
        }
    }

    fn list_runs(&self, include_archived: bool) -> skilldeck_core::Result<Vec<RunRecord>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT run_id, workflow_id, status, snapshot, archived, created_at, updated_at
                 FROM workflow_runs
                 WHERE archived = 0 OR ?1
                 ORDER BY updated_at DESC, run_id",
            )
            .map_err(store_err)?;
        let rows: Vec<RunRow> = stmt
            .query_map(rusqlite::params![include_archived], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })
            .map_err(store_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(store_err)?;
        rows.into_iter().map(run_from_row).collect()
    }

    fn append_context(&self, entry: ContextEntry) -> skilldeck_core::Result<ContextEntry> {
        let details = serde_json::to_string(&entry.details)?;
        let created_at = timestamp(&entry.created_at);

        let mut db = self.db.lock();
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_err)?;
        let prev: String = tx
            .query_row(
                "SELECT checksum FROM context_log ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?
            .unwrap_or_default();
        let checksum = chain_hash(
            &prev,
            &created_at,
            &entry.kind,
            entry.run_id.as_deref(),
            entry.project.as_deref(),
            &entry.message,
            &details,
        );
        tx.execute(
            "INSERT INTO context_log (project, run_id, kind, message, details, created_at, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.project,
                entry.run_id,
                entry.kind,
                entry.message,
                details,
                created_at,
                checksum,
            ],
        )
        .map_err(store_err)?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(store_err)?;

        Ok(ContextEntry {
            id,
            checksum,
            ..entry
        })
    }

    fn context_history(&self, filter: &ContextFilter) -> skilldeck_core::Result<Vec<ContextEntry>> {
        use rusqlite::types::Value as SqlValue;

        let mut clauses = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(run_id) = &filter.run_id {
            args.push(SqlValue::Text(run_id.clone()));
            clauses.push(format!("run_id = ?{}", args.len()));
        }
        if let Some(project) = &filter.project {
            args.push(SqlValue::Text(project.clone()));
            clauses.push(format!("project = ?{}", args.len()));
        }
        if let Some(kind) = &filter.kind {
            args.push(SqlValue::Text(kind.clone()));
            clauses.push(format!("kind = ?{}", args.len()));
        }
        if let Some(since) = &filter.since {
            args.push(SqlValue::Text(timestamp(since)));
            clauses.push(format!("created_at >= ?{}", args.len()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let limit = filter.limit.map(|n| n as i64).unwrap_or(-1);
        let sql = format!(
            "SELECT {CONTEXT_COLUMNS} FROM context_log {where_clause} ORDER BY id DESC LIMIT {limit}"
        );

        let db = self.db.lock();
        let mut stmt = db.prepare(&sql).map_err(store_err)?;
        let rows: Vec<ContextRow> = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), read_context_row)
            .map_err(store_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(store_err)?;

        let mut entries = rows
            .into_iter()
            .map(ContextRow::into_entry)
            .collect::<skilldeck_core::Result<Vec<_>>>()?;
        entries.reverse();
        Ok(entries)
    }

    fn verify_context_chain(&self) -> skilldeck_core::Result<ChainReport> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(&format!("SELECT {CONTEXT_COLUMNS} FROM context_log ORDER BY id"))
            .map_err(store_err)?;
        let rows = stmt.query_map([], read_context_row).map_err(store_err)?;

        let mut prev = String::new();
        let mut entries = 0;
        for row in rows {
            let row = row.map_err(store_err)?;
            entries += 1;
            let expected = chain_hash(
                &prev,
                &row.created_at,
                &row.kind,
                row.run_id.as_deref(),
                row.project.as_deref(),
                &row.message,
                &row.details,
            );
            if expected != row.checksum {
                warn!(id = row.id, "context log checksum mismatch");
                return Ok(ChainReport {
                    entries,
                    first_broken: Some(row.id),
                });
            }
            prev = row.checksum;
        }
        Ok(ChainReport {
            entries,
            first_broken: None,
        })
    }

    fn has_submission(&self, fingerprint: &str) -> skilldeck_core::Result<bool> {
        let db = self.db.lock();
        let found: Option<i64> = db
            .query_row(
                "SELECT 1 FROM batch_ledger WHERE fingerprint = ?1",
                rusqlite::params![fingerprint],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        Ok(found.is_some())
    }

    fn record_submission(&self, fingerprint: &str, item_key: &str) -> skilldeck_core::Result<bool> {
        let db = self.db.lock();
        let inserted = db
            .execute(
                "INSERT OR IGNORE INTO batch_ledger (fingerprint, item_key, submitted_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![fingerprint, item_key, timestamp(&chrono::Utc::now())],
            )
            .map_err(store_err)?;
        Ok(inserted > 0)
    }
}
