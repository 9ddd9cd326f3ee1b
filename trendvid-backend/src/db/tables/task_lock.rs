//! Stage lock database operations
//!
//! `task_lock` has one row per stage. A held lock records the task id, the
//! worker PID and when it was taken; a free lock has all three NULL.

use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};

use super::parse_column;
use crate::db::Database;
use crate::models::{PipelineStage, TaskLock};

fn row_to_lock(row: &Row) -> SqliteResult<TaskLock> {
    let task_type: String = row.get(0)?;
    Ok(TaskLock {
        task_type: parse_column(0, &task_type)?,
        lock_task_id: row.get(1)?,
        locked_at: row.get(2)?,
        worker_pid: row.get(3)?,
    })
}

/// Take a free (or expired) stage lock on an open connection or transaction
pub(super) fn take_lock(
    conn: &Connection,
    stage: PipelineStage,
    task_id: &str,
    worker_pid: i64,
    now: &str,
    expired_before: &str,
) -> SqliteResult<bool> {
    let rows = conn.execute(
        "UPDATE task_lock SET lock_task_id = ?1, locked_at = ?2, worker_pid = ?3
         WHERE task_type = ?4 AND (worker_pid IS NULL OR locked_at IS NULL OR locked_at < ?5)",
        params![task_id, now, worker_pid, stage.as_str(), expired_before],
    )?;
    Ok(rows > 0)
}

impl Database {
    /// Get the lock row of a stage
    pub fn get_lock(&self, stage: PipelineStage) -> SqliteResult<Option<TaskLock>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT task_type, lock_task_id, locked_at, worker_pid FROM task_lock WHERE task_type = ?1",
            [stage.as_str()],
            row_to_lock,
        )
        .optional()
    }

    /// List all stage locks
    pub fn list_locks(&self) -> SqliteResult<Vec<TaskLock>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT task_type, lock_task_id, locked_at, worker_pid FROM task_lock ORDER BY task_type",
        )?;
        let locks = stmt
            .query_map([], row_to_lock)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(locks)
    }

    /// Take a free (or expired) stage lock. Returns true when acquired.
    pub fn acquire_lock(
        &self,
        stage: PipelineStage,
        task_id: &str,
        worker_pid: i64,
        now: &str,
        expired_before: &str,
    ) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        take_lock(&conn, stage, task_id, worker_pid, now, expired_before)
    }

    /// Release a stage lock only if `task_id` holds it
    pub fn release_lock(&self, stage: PipelineStage, task_id: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE task_lock SET lock_task_id = NULL, locked_at = NULL, worker_pid = NULL
             WHERE task_type = ?1 AND lock_task_id = ?2",
            params![stage.as_str(), task_id],
        )?;
        Ok(rows > 0)
    }

    /// Release every lock held by a task, whatever the stage
    pub fn release_locks_for_task(&self, task_id: &str) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE task_lock SET lock_task_id = NULL, locked_at = NULL, worker_pid = NULL
             WHERE lock_task_id = ?1",
            [task_id],
        )
    }

    /// Release every held lock
    pub fn release_all_locks(&self) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE task_lock SET lock_task_id = NULL, locked_at = NULL, worker_pid = NULL
             WHERE worker_pid IS NOT NULL OR lock_task_id IS NOT NULL",
            [],
        )
    }

    /// Release held locks taken before `cutoff`
    pub fn release_locks_older_than(&self, cutoff: &str) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE task_lock SET lock_task_id = NULL, locked_at = NULL, worker_pid = NULL
             WHERE (worker_pid IS NOT NULL OR lock_task_id IS NOT NULL) AND locked_at < ?1",
            [cutoff],
        )
    }
}
