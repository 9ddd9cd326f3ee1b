//! Task definition database operations

use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};
use serde::Serialize;

use serde_json::Value;

use super::content::{write_content, write_content_setting};
use super::parse_column;
use super::task_queue::write_queue_row;
use crate::db::Database;
use crate::models::{Content, ContentSetting, PipelineStage, Task, TaskState};

/// A task joined with its queue position in the pipeline
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    #[serde(flatten)]
    pub task: Task,
    #[serde(rename = "type")]
    pub stage: Option<PipelineStage>,
    pub status: Option<TaskState>,
    pub error: Option<String>,
}

/// Rows removed by a cascading task delete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteCounts {
    pub task: usize,
    pub queue: usize,
    pub time_log: usize,
    pub locks_released: usize,
    pub content: usize,
}

fn row_to_task(row: &Row) -> SqliteResult<Task> {
    Ok(Task {
        task_id: row.get(0)?,
        title: row.get(1)?,
        prompt_format: row.get(2)?,
        user_id: row.get(3)?,
        category: row.get(4)?,
        priority: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// Insert a task row on an open connection or transaction
pub(super) fn write_task(conn: &Connection, task: &Task) -> SqliteResult<()> {
    conn.execute(
        "INSERT INTO task (task_id, title, prompt_format, user_id, category, priority, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            task.task_id,
            task.title,
            task.prompt_format,
            task.user_id,
            task.category,
            task.priority,
            task.created_at,
            task.updated_at,
        ],
    )?;
    Ok(())
}

impl Database {
    // ============================================
    // Task CRUD
    // ============================================

    /// Insert a new task definition
    pub fn insert_task(&self, task: &Task) -> SqliteResult<()> {
        let conn = self.conn.lock();
        write_task(&conn, task)
    }

    /// Insert a task with its content, settings and a waiting queue row at
    /// `stage`. Nothing is written unless every insert succeeds.
    pub fn create_task_bundle(
        &self,
        task: &Task,
        content: &Content,
        setting: &ContentSetting,
        stage: PipelineStage,
        metadata: &Value,
    ) -> SqliteResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        write_task(&tx, task)?;
        write_content(&tx, content)?;
        write_content_setting(&tx, setting, &task.created_at)?;
        write_queue_row(
            &tx,
            &task.task_id,
            stage,
            TaskState::Waiting,
            &task.created_at,
            &task.user_id,
            metadata,
        )?;
        tx.commit()
    }

    /// Get a task by id
    pub fn get_task_by_id(&self, task_id: &str) -> SqliteResult<Option<Task>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT task_id, title, prompt_format, user_id, category, priority, created_at, updated_at
             FROM task WHERE task_id = ?1",
            [task_id],
            row_to_task,
        )
        .optional()
    }

    /// List tasks (optionally for one user) with their queue stage/status, newest first
    pub fn list_tasks(&self, user_id: Option<&str>, limit: u32) -> SqliteResult<Vec<TaskRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT t.task_id, t.title, t.prompt_format, t.user_id, t.category, t.priority,
                    t.created_at, t.updated_at, q.type, q.status, q.error
             FROM task t
             LEFT JOIN task_queue q ON q.task_id = t.task_id
             WHERE (?1 IS NULL OR t.user_id = ?1)
             ORDER BY t.created_at DESC, t.task_id DESC
             LIMIT ?2",
        )?;

        let records = stmt
            .query_map(params![user_id, limit], |row| {
                let stage: Option<String> = row.get(8)?;
                let status: Option<String> = row.get(9)?;
                Ok(TaskRecord {
                    task: row_to_task(row)?,
                    stage: stage.map(|s| parse_column(8, &s)).transpose()?,
                    status: status.map(|s| parse_column(9, &s)).transpose()?,
                    error: row.get(10)?,
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(records)
    }

    /// Ids of every task, or only those of one user
    pub fn list_task_ids(&self, user_id: Option<&str>) -> SqliteResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT task_id FROM task WHERE (?1 IS NULL OR user_id = ?1)
             UNION
             SELECT task_id FROM task_queue WHERE (?1 IS NULL OR user_id = ?1)",
        )?;
        let ids = stmt
            .query_map([user_id], |row| row.get(0))?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(ids)
    }

    /// Delete a task with its queue row, attempt timings and locks.
    /// Content is deleted only while it is still a draft.
    pub fn delete_task_cascade(&self, task_id: &str) -> SqliteResult<DeleteCounts> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let counts = DeleteCounts {
            time_log: tx.execute("DELETE FROM task_time_log WHERE task_id = ?1", [task_id])?,
            queue: tx.execute("DELETE FROM task_queue WHERE task_id = ?1", [task_id])?,
            locks_released: tx.execute(
                "UPDATE task_lock SET lock_task_id = NULL, locked_at = NULL, worker_pid = NULL
                 WHERE lock_task_id = ?1",
                [task_id],
            )?,
            content: tx.execute(
                "DELETE FROM content WHERE content_id = ?1 AND status = 'draft'",
                [task_id],
            )?,
            task: tx.execute("DELETE FROM task WHERE task_id = ?1", [task_id])?,
        };

        tx.commit()?;
        Ok(counts)
    }
}
