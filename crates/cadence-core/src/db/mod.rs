//! SQLite database layer for the Cadence core.
//!
//! Uses rusqlite with WAL mode so several scheduler / worker processes can
//! share one database file. Every cross-process decision is a single
//! conditional statement, so a plain busy timeout is enough to serialize
//! writers on the same row.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::OrchestrationError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, OrchestrationError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| OrchestrationError::Database(format!("Failed to open database: {}", e)))?;

        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| OrchestrationError::Database(format!("Failed to set busy timeout: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| OrchestrationError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, OrchestrationError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            OrchestrationError::Database(format!("Failed to open in-memory db: {}", e))
        })?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, OrchestrationError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| OrchestrationError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| OrchestrationError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, OrchestrationError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| OrchestrationError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), OrchestrationError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS executions (
                    id                  TEXT PRIMARY KEY,
                    tenant_id           TEXT NOT NULL,
                    namespace           TEXT NOT NULL,
                    flow_id             TEXT NOT NULL,
                    flow_revision       INTEGER NOT NULL DEFAULT 1,
                    labels              TEXT NOT NULL DEFAULT '{}',
                    trigger_id          TEXT,
                    trigger_date        INTEGER,
                    state_current       TEXT NOT NULL,
                    state_histories     TEXT NOT NULL,
                    created_at          INTEGER NOT NULL,
                    end_date            INTEGER,
                    duration_ms         INTEGER,
                    holds_slot          INTEGER NOT NULL DEFAULT 0,
                    version             INTEGER NOT NULL DEFAULT 0,
                    updated_at          INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_executions_flow_state
                    ON executions(tenant_id, namespace, flow_id, state_current, created_at, id);

                CREATE TABLE IF NOT EXISTS concurrency_limits (
                    tenant_id       TEXT NOT NULL,
                    namespace       TEXT NOT NULL,
                    flow_id         TEXT NOT NULL,
                    limit_value     INTEGER NOT NULL,
                    running         INTEGER NOT NULL DEFAULT 0,
                    updated_at      INTEGER NOT NULL,
                    PRIMARY KEY (tenant_id, namespace, flow_id)
                );

                CREATE TABLE IF NOT EXISTS triggers (
                    tenant_id               TEXT NOT NULL,
                    namespace               TEXT NOT NULL,
                    flow_id                 TEXT NOT NULL,
                    trigger_id              TEXT NOT NULL,
                    date                    INTEGER,
                    next_execution_date     INTEGER,
                    disabled                INTEGER NOT NULL DEFAULT 0,
                    execution_id            TEXT,
                    evaluate_running_date   INTEGER,
                    updated_at              INTEGER NOT NULL,
                    PRIMARY KEY (tenant_id, namespace, flow_id, trigger_id)
                );
                CREATE INDEX IF NOT EXISTS idx_triggers_next_execution
                    ON triggers(next_execution_date) WHERE disabled = 0 AND execution_id IS NULL;
                ",
            )
        })?;
        self.run_migrations()
    }

    /// Apply incremental migrations for schema changes on existing databases.
    fn run_migrations(&self) -> Result<(), OrchestrationError> {
        self.with_conn(|conn| {
            // Add worker_id to triggers if it doesn't exist yet (ignore error if already present)
            let _ = conn.execute("ALTER TABLE triggers ADD COLUMN worker_id TEXT", []);
            conn.execute_batch(
                "CREATE INDEX IF NOT EXISTS idx_triggers_tenant ON triggers(tenant_id, namespace, flow_id);",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_are_created_and_migrations_are_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();

        let tables: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                )?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .unwrap();
        assert_eq!(tables, vec!["concurrency_limits", "executions", "triggers"]);
    }

    #[test]
    fn test_file_database_is_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.db");
        let path = path.to_str().unwrap();

        let a = Database::open(path).unwrap();
        let b = Database::open(path).unwrap();
        a.with_conn(|conn| {
            conn.execute(
                "INSERT INTO concurrency_limits (tenant_id, namespace, flow_id, limit_value, running, updated_at)
                 VALUES ('t', 'ns', 'f', 2, 0, 0)",
                [],
            )
        })
        .unwrap();
        let count: i64 = b
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM concurrency_limits", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 1);
    }
}
