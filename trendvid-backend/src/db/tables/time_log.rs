//! Stage attempt timing (`task_time_log`)
//!
//! Rows are opened inside the claim transaction (see task_queue.rs) and
//! closed here when the attempt ends.

use rusqlite::{params, Result as SqliteResult};

use super::parse_column;
use crate::db::Database;
use crate::models::{PipelineStage, StageTimeLog};

impl Database {
    /// Close the latest open attempt of a task at `stage`
    pub fn finish_time_log(
        &self,
        task_id: &str,
        stage: PipelineStage,
        end_time: &str,
    ) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE task_time_log SET end_time = ?1
             WHERE id = (
                SELECT id FROM task_time_log
                WHERE task_id = ?2 AND type = ?3 AND end_time IS NULL
                ORDER BY retry_cnt DESC, id DESC
                LIMIT 1
             )",
            params![end_time, task_id, stage.as_str()],
        )
    }

    /// All attempts of a task, oldest first
    pub fn list_time_logs(&self, task_id: &str) -> SqliteResult<Vec<StageTimeLog>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT task_id, type, retry_cnt, start_time, end_time
             FROM task_time_log WHERE task_id = ?1
             ORDER BY start_time ASC, id ASC",
        )?;

        let logs = stmt
            .query_map([task_id], |row| {
                let stage: String = row.get(1)?;
                Ok(StageTimeLog {
                    task_id: row.get(0)?,
                    stage: parse_column(1, &stage)?,
                    retry_cnt: row.get(2)?,
                    start_time: row.get(3)?,
                    end_time: row.get(4)?,
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(logs)
    }
}
