//! Pipeline queue database operations
//!
//! Every status change is a conditional UPDATE; callers use the affected row
//! count to learn whether they won the transition.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqliteResult, Row};
use serde_json::Value;

use super::parse_column;
use super::task_lock::take_lock;
use crate::db::Database;
use crate::models::{
    PipelineStage, QueueFilter, QueueTask, TaskLock, TaskState, TaskUpdate,
};

const QUEUE_COLUMNS: &str = "task_id, type, status, created_at, started_at, completed_at, updated_at, user_id, metadata, logs, error";

/// Result of trying to claim the next waiting row of a stage
#[derive(Debug)]
pub enum ClaimOutcome {
    /// Row moved to processing and the stage lock is ours
    Claimed(QueueTask),
    /// Another worker holds a fresh lock on this stage
    Locked(TaskLock),
    /// Nothing waiting
    Empty,
}

pub(crate) fn row_to_queue_task(row: &Row) -> SqliteResult<QueueTask> {
    let stage: String = row.get(1)?;
    let state: String = row.get(2)?;
    let metadata: Option<String> = row.get(8)?;
    let logs: Option<String> = row.get(9)?;

    Ok(QueueTask {
        task_id: row.get(0)?,
        stage: parse_column(1, &stage)?,
        state: parse_column(2, &state)?,
        created_at: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        updated_at: row.get(6)?,
        user_id: row.get(7)?,
        metadata: metadata
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or_else(|| Value::Object(Default::default())),
        logs: logs
            .and_then(|l| serde_json::from_str(&l).ok())
            .unwrap_or_default(),
        error: row.get(10)?,
    })
}

fn query_queue_rows(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> SqliteResult<Vec<QueueTask>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, row_to_queue_task)?
        .collect::<SqliteResult<Vec<_>>>()?;
    Ok(rows)
}

/// Insert or overwrite a waiting-style queue row on an open connection or transaction
pub(super) fn write_queue_row(
    conn: &Connection,
    task_id: &str,
    stage: PipelineStage,
    state: TaskState,
    created_at: &str,
    user_id: &str,
    metadata: &Value,
) -> SqliteResult<()> {
    conn.execute(
        "REPLACE INTO task_queue (task_id, type, status, created_at, updated_at, user_id, metadata, logs)
         VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, '[]')",
        params![
            task_id,
            stage.as_str(),
            state.as_str(),
            created_at,
            user_id,
            metadata.to_string()
        ],
    )?;
    Ok(())
}

impl Database {
    /// Insert or overwrite the queue row of a task
    pub fn replace_queue_row(
        &self,
        task_id: &str,
        stage: PipelineStage,
        state: TaskState,
        created_at: &str,
        user_id: &str,
        metadata: &Value,
    ) -> SqliteResult<()> {
        let conn = self.conn.lock();
        write_queue_row(&conn, task_id, stage, state, created_at, user_id, metadata)
    }

    /// Get the queue row of a task
    pub fn get_queue_row(&self, task_id: &str) -> SqliteResult<Option<QueueTask>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM task_queue WHERE task_id = ?1", QUEUE_COLUMNS),
            [task_id],
            row_to_queue_task,
        )
        .optional()
    }

    /// List queue rows matching a filter, newest first
    pub fn list_queue(&self, filter: &QueueFilter) -> SqliteResult<Vec<QueueTask>> {
        let mut sql = format!("SELECT {} FROM task_queue WHERE 1=1", QUEUE_COLUMNS);
        let mut values: Vec<String> = Vec::new();

        if let Some(task_id) = &filter.task_id {
            values.push(task_id.clone());
            sql.push_str(&format!(" AND task_id = ?{}", values.len()));
        }
        if let Some(stage) = filter.stage {
            values.push(stage.as_str().to_string());
            sql.push_str(&format!(" AND type = ?{}", values.len()));
        }
        if let Some(state) = filter.state {
            values.push(state.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", values.len()));
        }
        if let Some(user_id) = &filter.user_id {
            values.push(user_id.clone());
            sql.push_str(&format!(" AND user_id = ?{}", values.len()));
        }

        sql.push_str(" ORDER BY created_at DESC, task_id DESC");

        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
            if let Some(offset) = filter.offset {
                sql.push_str(&format!(" OFFSET {}", offset));
            }
        }

        let conn = self.conn.lock();
        query_queue_rows(&conn, &sql, params_from_iter(values.iter()))
    }

    /// Rows that are waiting or processing (health checker input)
    pub fn list_active_queue_rows(&self) -> SqliteResult<Vec<QueueTask>> {
        let conn = self.conn.lock();
        query_queue_rows(
            &conn,
            &format!(
                "SELECT {} FROM task_queue WHERE status IN ('waiting', 'processing') ORDER BY created_at ASC",
                QUEUE_COLUMNS
            ),
            [],
        )
    }

    /// Claim the oldest waiting row of a stage.
    ///
    /// Runs in one transaction: check the stage lock (expiring it when older
    /// than `lock_cutoff`), CAS the row waiting -> processing, open a time-log
    /// row and take the stage lock.
    pub fn claim_next(
        &self,
        stage: PipelineStage,
        worker_pid: i64,
        now: &str,
        lock_cutoff: &str,
    ) -> SqliteResult<ClaimOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let lock = tx.query_row(
            "SELECT lock_task_id, locked_at, worker_pid FROM task_lock WHERE task_type = ?1",
            [stage.as_str()],
            |row| {
                Ok(TaskLock {
                    task_type: stage,
                    lock_task_id: row.get(0)?,
                    locked_at: row.get(1)?,
                    worker_pid: row.get(2)?,
                })
            },
        )?;

        if lock.is_held() {
            let fresh = lock
                .locked_at
                .as_deref()
                .map(|locked_at| locked_at >= lock_cutoff)
                .unwrap_or(false);
            if fresh {
                return Ok(ClaimOutcome::Locked(lock));
            }

            log::warn!(
                "[QUEUE] Releasing expired {} lock (task: {:?}, pid: {:?}, locked_at: {:?})",
                stage,
                lock.lock_task_id,
                lock.worker_pid,
                lock.locked_at
            );
            tx.execute(
                "UPDATE task_lock SET lock_task_id = NULL, locked_at = NULL, worker_pid = NULL WHERE task_type = ?1",
                [stage.as_str()],
            )?;
        }

        let next: Option<String> = tx
            .query_row(
                "SELECT task_id FROM task_queue
                 WHERE type = ?1 AND status = 'waiting'
                 ORDER BY created_at ASC, task_id ASC
                 LIMIT 1",
                [stage.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(task_id) = next else {
            tx.commit()?;
            return Ok(ClaimOutcome::Empty);
        };

        let claimed = tx.execute(
            "UPDATE task_queue
             SET status = 'processing', started_at = ?1, updated_at = ?1, completed_at = NULL
             WHERE task_id = ?2 AND type = ?3 AND status = 'waiting'",
            params![now, task_id, stage.as_str()],
        )?;
        if claimed == 0 {
            tx.commit()?;
            return Ok(ClaimOutcome::Empty);
        }

        let retry_cnt: i64 = tx.query_row(
            "SELECT COALESCE(MAX(retry_cnt), -1) + 1 FROM task_time_log WHERE task_id = ?1 AND type = ?2",
            params![task_id, stage.as_str()],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO task_time_log (task_id, type, retry_cnt, start_time) VALUES (?1, ?2, ?3, ?4)",
            params![task_id, stage.as_str(), retry_cnt, now],
        )?;

        if !take_lock(&tx, stage, &task_id, worker_pid, now, lock_cutoff)? {
            // Dropping the transaction rolls the claim back
            return Ok(ClaimOutcome::Empty);
        }

        let task = tx.query_row(
            &format!("SELECT {} FROM task_queue WHERE task_id = ?1", QUEUE_COLUMNS),
            [&task_id],
            row_to_queue_task,
        )?;

        tx.commit()?;
        Ok(ClaimOutcome::Claimed(task))
    }

    /// Apply a partial update to the row of `task_id` at `stage`
    pub fn update_queue_fields(
        &self,
        task_id: &str,
        stage: PipelineStage,
        update: &TaskUpdate,
        now: &str,
    ) -> SqliteResult<usize> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(state) = update.state {
            sets.push("status = ?");
            values.push(state.as_str().to_string());
        }
        if let Some(error) = &update.error {
            sets.push("error = ?");
            values.push(error.clone());
        }
        if let Some(completed_at) = &update.completed_at {
            sets.push("completed_at = ?");
            values.push(completed_at.clone());
        }
        if let Some(logs) = &update.logs {
            sets.push("logs = ?");
            values.push(serde_json::to_string(logs).unwrap_or_else(|_| "[]".to_string()));
        }
        if let Some(metadata) = &update.metadata {
            sets.push("metadata = ?");
            values.push(metadata.to_string());
        }

        if sets.is_empty() {
            return Ok(0);
        }

        sets.push("updated_at = ?");
        values.push(now.to_string());
        values.push(task_id.to_string());
        values.push(stage.as_str().to_string());

        let sql = format!(
            "UPDATE task_queue SET {} WHERE task_id = ? AND type = ?",
            sets.join(", ")
        );

        let conn = self.conn.lock();
        conn.execute(&sql, params_from_iter(values.iter()))
    }

    /// Move a processing row at `from` to the next stage (waiting), or to
    /// completed when `to` is `None`. No-op unless the row is still
    /// processing at `from`.
    pub fn transition_stage(
        &self,
        task_id: &str,
        from: PipelineStage,
        to: Option<PipelineStage>,
        now: &str,
    ) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        match to {
            Some(next) => conn.execute(
                "UPDATE task_queue
                 SET type = ?1, status = 'waiting', error = NULL, started_at = NULL, updated_at = ?2
                 WHERE task_id = ?3 AND type = ?4 AND status = 'processing'",
                params![next.as_str(), now, task_id, from.as_str()],
            ),
            None => conn.execute(
                "UPDATE task_queue
                 SET status = 'completed', error = NULL, completed_at = ?1, updated_at = ?1
                 WHERE task_id = ?2 AND type = ?3 AND status = 'processing'",
                params![now, task_id, from.as_str()],
            ),
        }
    }

    /// Reset a row to waiting at `stage`. When `expected` is given the reset
    /// only applies if the row still has that stage and status.
    pub fn reset_queue_row(
        &self,
        task_id: &str,
        stage: PipelineStage,
        expected: Option<(PipelineStage, TaskState)>,
        now: &str,
    ) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        match expected {
            Some((prev_stage, prev_state)) => conn.execute(
                "UPDATE task_queue
                 SET type = ?1, status = 'waiting', error = NULL, started_at = NULL, completed_at = NULL, updated_at = ?2
                 WHERE task_id = ?3 AND type = ?4 AND status = ?5",
                params![stage.as_str(), now, task_id, prev_stage.as_str(), prev_state.as_str()],
            ),
            None => conn.execute(
                "UPDATE task_queue
                 SET type = ?1, status = 'waiting', error = NULL, started_at = NULL, completed_at = NULL, updated_at = ?2
                 WHERE task_id = ?3",
                params![stage.as_str(), now, task_id],
            ),
        }
    }

    /// Fail waiting rows of a task (user cancel of queued work)
    pub fn cancel_waiting(
        &self,
        task_id: &str,
        stage: Option<PipelineStage>,
        now: &str,
    ) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        match stage {
            Some(stage) => conn.execute(
                "UPDATE task_queue SET status = 'failed', error = 'Cancelled by user', updated_at = ?1
                 WHERE task_id = ?2 AND status = 'waiting' AND type = ?3",
                params![now, task_id, stage.as_str()],
            ),
            None => conn.execute(
                "UPDATE task_queue SET status = 'failed', error = 'Cancelled by user', updated_at = ?1
                 WHERE task_id = ?2 AND status = 'waiting'",
                params![now, task_id],
            ),
        }
    }

    /// Cancel a waiting or processing row (stop)
    pub fn cancel_active(&self, task_id: &str, error: &str, now: &str) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE task_queue SET status = 'cancelled', error = ?1, updated_at = ?2
             WHERE task_id = ?3 AND status IN ('waiting', 'processing')",
            params![error, now, task_id],
        )
    }

    /// Fail every processing row, or only those started before `cutoff`.
    /// Returns the ids that were failed.
    pub fn fail_processing_rows(
        &self,
        error: &str,
        cutoff: Option<&str>,
        now: &str,
    ) -> SqliteResult<Vec<String>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT task_id FROM task_queue
                 WHERE status = 'processing'
                   AND (?1 IS NULL OR COALESCE(started_at, updated_at, created_at) < ?1)",
            )?;
            stmt.query_map([cutoff], |row| row.get(0))?
                .collect::<SqliteResult<Vec<_>>>()?
        };

        tx.execute(
            "UPDATE task_queue SET status = 'failed', error = ?1, completed_at = ?2, updated_at = ?2
             WHERE status = 'processing'
               AND (?3 IS NULL OR COALESCE(started_at, updated_at, created_at) < ?3)",
            params![error, now, cutoff],
        )?;

        tx.commit()?;
        Ok(ids)
    }

    /// Fail the row of a single task if it is processing
    pub fn fail_processing_row(&self, task_id: &str, error: &str, now: &str) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE task_queue SET status = 'failed', error = ?1, completed_at = ?2, updated_at = ?2
             WHERE task_id = ?3 AND status = 'processing'",
            params![error, now, task_id],
        )
    }

    /// Set a row's status only if it is still at `stage` with `expected` status
    pub fn set_status_if(
        &self,
        task_id: &str,
        stage: PipelineStage,
        expected: TaskState,
        new_state: TaskState,
        error: Option<&str>,
        now: &str,
    ) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE task_queue SET status = ?1, error = ?2, completed_at = ?3, updated_at = ?3
             WHERE task_id = ?4 AND type = ?5 AND status = ?6",
            params![
                new_state.as_str(),
                error,
                now,
                task_id,
                stage.as_str(),
                expected.as_str()
            ],
        )
    }

    /// Count rows grouped by stage and status
    pub fn count_queue_by_stage(&self) -> SqliteResult<Vec<(PipelineStage, TaskState, u64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT type, status, COUNT(*) FROM task_queue GROUP BY type, status",
        )?;

        let counts = stmt
            .query_map([], |row| {
                let stage: String = row.get(0)?;
                let state: String = row.get(1)?;
                let count: i64 = row.get(2)?;
                Ok((stage, state, count))
            })?
            .filter_map(|r| r.ok())
            // Rows with unknown stage/status values are skipped, not fatal
            .filter_map(|(stage, state, count)| {
                Some((stage.parse().ok()?, state.parse().ok()?, count.max(0) as u64))
            })
            .collect();

        Ok(counts)
    }

    /// Number of waiting rows of `stage` created before `created_at`
    pub fn count_waiting_before(&self, stage: PipelineStage, created_at: &str) -> SqliteResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM task_queue WHERE type = ?1 AND status = 'waiting' AND created_at < ?2",
            params![stage.as_str(), created_at],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Delete completed/failed rows finished before `cutoff`
    pub fn delete_finished_before(&self, cutoff: &str) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM task_queue WHERE status IN ('completed', 'failed') AND completed_at < ?1",
            [cutoff],
        )
    }

    /// Delete every queue row
    pub fn clear_queue(&self) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM task_queue", [])
    }

    /// Processing rows started before `cutoff`
    pub fn list_stuck_rows(&self, cutoff: &str) -> SqliteResult<Vec<QueueTask>> {
        let conn = self.conn.lock();
        query_queue_rows(
            &conn,
            &format!(
                "SELECT {} FROM task_queue WHERE status = 'processing' AND started_at < ?1 ORDER BY started_at ASC",
                QUEUE_COLUMNS
            ),
            [cutoff],
        )
    }

    /// Processing rows whose open time-log attempt started before `cutoff`
    pub fn list_stuck_by_time_log(&self, cutoff: &str) -> SqliteResult<Vec<(String, PipelineStage)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT q.task_id, q.type
             FROM task_queue q
             JOIN task_time_log log
               ON q.task_id = log.task_id AND q.type = log.type AND log.end_time IS NULL
             WHERE q.status = 'processing' AND log.start_time < ?1",
        )?;

        let rows = stmt
            .query_map([cutoff], |row| {
                let stage: String = row.get(1)?;
                Ok((row.get::<_, String>(0)?, parse_column(1, &stage)?))
            })?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Fail the processing row of `task_id` at `stage`
    pub fn fail_stage_row(
        &self,
        task_id: &str,
        stage: PipelineStage,
        error: &str,
        now: &str,
    ) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE task_queue SET status = 'failed', error = ?1, completed_at = ?2, updated_at = ?2
             WHERE task_id = ?3 AND type = ?4 AND status = 'processing'",
            params![error, now, task_id, stage.as_str()],
        )
    }
}
