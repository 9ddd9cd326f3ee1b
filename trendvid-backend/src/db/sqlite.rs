//! SQLite database - schema definitions and connection management
//!
//! This file contains:
//! - Database struct definition
//! - Connection management (new, init)
//! - Schema creation and migrations
//!
//! All table operations are in the tables/ subdirectory.

use parking_lot::Mutex;
use rusqlite::{Connection, Result as SqliteResult};
use std::path::Path;
use std::time::Duration;

use crate::models::PipelineStage;

/// Main database wrapper; one connection serialized behind a Mutex
pub struct Database {
    pub(crate) conn: Mutex<Connection>,
}

impl Database {
    /// Create a new database connection and initialize schema
    pub fn new(database_url: &str) -> SqliteResult<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = Path::new(database_url).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }

        let conn = Connection::open(database_url)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // journal_mode returns a row, so it can't go through execute()
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Open a throwaway in-memory database (tests)
    #[cfg(test)]
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Initialize all database tables and run migrations
    fn init(&self) -> SqliteResult<()> {
        let conn = self.conn.lock();

        // Task definitions (what to produce)
        conn.execute(
            "CREATE TABLE IF NOT EXISTS task (
                task_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                prompt_format TEXT,
                user_id TEXT NOT NULL,
                category TEXT,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_task_user ON task(user_id)",
            [],
        )?;

        // Pipeline queue: one row per task, type = current stage
        conn.execute(
            "CREATE TABLE IF NOT EXISTS task_queue (
                task_id TEXT PRIMARY KEY NOT NULL,
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT,
                user_id TEXT NOT NULL,
                metadata TEXT,
                logs TEXT,
                error TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_task_queue_type_status ON task_queue(type, status, created_at)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_task_queue_user_status ON task_queue(user_id, status)",
            [],
        )?;

        // Migration: older queue tables predate started_at/updated_at
        for column in ["started_at", "updated_at"] {
            let has_column: bool = conn
                .query_row(
                    "SELECT COUNT(*) FROM pragma_table_info('task_queue') WHERE name = ?1",
                    [column],
                    |row| row.get::<_, i64>(0),
                )
                .map(|c| c > 0)
                .unwrap_or(false);

            if !has_column {
                conn.execute(&format!("ALTER TABLE task_queue ADD COLUMN {} TEXT", column), [])?;
            }
        }

        // Stage locks: one row per stage, empty when free
        conn.execute(
            "CREATE TABLE IF NOT EXISTS task_lock (
                task_type TEXT PRIMARY KEY,
                lock_task_id TEXT,
                locked_at TEXT,
                worker_pid INTEGER
            )",
            [],
        )?;

        for stage in PipelineStage::ALL {
            conn.execute(
                "INSERT OR IGNORE INTO task_lock (task_type, lock_task_id, locked_at, worker_pid)
                 VALUES (?1, NULL, NULL, NULL)",
                [stage.as_str()],
            )?;
        }

        // Stage attempt timings
        conn.execute(
            "CREATE TABLE IF NOT EXISTS task_time_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                type TEXT NOT NULL,
                retry_cnt INTEGER NOT NULL DEFAULT 0,
                start_time TEXT NOT NULL,
                end_time TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_task_time_log_task ON task_time_log(task_id, type)",
            [],
        )?;

        // Produced content
        conn.execute(
            "CREATE TABLE IF NOT EXISTS content (
                content_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                error TEXT,
                youtube_url TEXT,
                youtube_channel TEXT,
                prompt_format TEXT,
                product_info TEXT,
                category TEXT,
                source_content_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_content_status ON content(status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS content_setting (
                content_id TEXT PRIMARY KEY,
                script_mode TEXT NOT NULL DEFAULT 'chrome',
                media_mode TEXT NOT NULL DEFAULT 'crawl',
                channel TEXT,
                tts_voice TEXT NOT NULL DEFAULT 'ko-KR-SoonBokNeural',
                tts_speed TEXT NOT NULL DEFAULT '+0%',
                tags TEXT,
                priority INTEGER NOT NULL DEFAULT 0,
                settings TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (content_id) REFERENCES content(content_id) ON DELETE CASCADE
            )",
            [],
        )?;

        log::info!("[DB] Schema initialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent_and_seeds_locks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.db");
        let path = path.to_str().unwrap();

        Database::new(path).unwrap();
        let db = Database::new(path).unwrap();

        let locks = db.list_locks().unwrap();
        assert_eq!(locks.len(), 4);
        assert!(locks.iter().all(|l| !l.is_held()));
    }
}
