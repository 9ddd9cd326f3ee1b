//! Pipeline queue manager
//!
//! A task has one `task_queue` row whose `type` moves script -> image ->
//! video -> youtube. Workers claim rows through [`QueueManager::dequeue`],
//! which serializes each stage through its `task_lock` row.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::artifacts;
use crate::db::time::{format_ts, minutes_ago, now_str};
use crate::db::{ClaimOutcome, Database};
use crate::error::Result;
use crate::models::{
    PipelineStage, QueueFilter, QueueSummary, QueueTask, TaskState, TaskUpdate,
};

/// Processing rows older than this are reported as stuck
pub const STUCK_AFTER_MINUTES: i64 = 10;

/// Stuck-task report for `/api/queue/health`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealthStatus {
    pub healthy: bool,
    pub stuck_tasks: Vec<QueueTask>,
    pub checked_at: String,
}

pub struct QueueManager {
    db: Arc<Database>,
    tasks_dir: PathBuf,
    lock_timeout_minutes: i64,
}

/// `{unix_millis}_{first uuid segment}`
pub fn new_task_id() -> String {
    let uuid = uuid::Uuid::new_v4().to_string();
    let segment = uuid.split('-').next().unwrap_or(&uuid).to_string();
    format!("{}_{}", Utc::now().timestamp_millis(), segment)
}

impl QueueManager {
    pub fn new(db: Arc<Database>, tasks_dir: PathBuf, lock_timeout_minutes: i64) -> Self {
        Self {
            db,
            tasks_dir,
            lock_timeout_minutes,
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn tasks_dir(&self) -> &PathBuf {
        &self.tasks_dir
    }

    /// Start a new pipeline: fresh id, waiting at the script stage
    pub fn create_pipeline(&self, user_id: &str, metadata: &Value) -> Result<String> {
        let task_id = new_task_id();
        self.enqueue(&task_id, PipelineStage::Script, user_id, metadata)?;
        Ok(task_id)
    }

    /// (Re)place the queue row of a task as waiting at `stage`
    pub fn enqueue(
        &self,
        task_id: &str,
        stage: PipelineStage,
        user_id: &str,
        metadata: &Value,
    ) -> Result<()> {
        std::fs::create_dir_all(artifacts::task_folder(&self.tasks_dir, task_id))?;
        self.db.replace_queue_row(
            task_id,
            stage,
            TaskState::Waiting,
            &now_str(),
            user_id,
            metadata,
        )?;
        log::info!("[QUEUE] Enqueued {} at {}", task_id, stage);
        Ok(())
    }

    /// Claim the oldest waiting row of `stage` for `worker_pid`.
    ///
    /// Returns `None` when the stage is locked by a live worker or nothing is
    /// waiting.
    pub fn dequeue(&self, stage: PipelineStage, worker_pid: i64) -> Result<Option<QueueTask>> {
        let now = Utc::now();
        let outcome = self.db.claim_next(
            stage,
            worker_pid,
            &format_ts(now),
            &minutes_ago(now, self.lock_timeout_minutes),
        )?;

        match outcome {
            ClaimOutcome::Claimed(task) => {
                log::info!("[QUEUE] Dequeued {} for {}", task.task_id, stage);
                Ok(Some(task))
            }
            ClaimOutcome::Locked(lock) => {
                log::debug!(
                    "[QUEUE] {} locked by {:?} (pid {:?})",
                    stage,
                    lock.lock_task_id,
                    lock.worker_pid
                );
                Ok(None)
            }
            ClaimOutcome::Empty => Ok(None),
        }
    }

    /// Free the stage lock if `task_id` holds it
    pub fn release_task(&self, task_id: &str, stage: PipelineStage) -> Result<bool> {
        Ok(self.db.release_lock(stage, task_id)?)
    }

    /// Cancel a waiting task. Processing rows are left to [`crate::jobs::stop_task`].
    pub fn cancel(&self, task_id: &str, stage: Option<PipelineStage>) -> Result<bool> {
        let changed = self.db.cancel_waiting(task_id, stage, &now_str())?;
        if changed > 0 {
            log::info!("[QUEUE] Cancelled waiting task {}", task_id);
        }
        Ok(changed > 0)
    }

    pub fn get_queue(&self, filter: &QueueFilter) -> Result<Vec<QueueTask>> {
        Ok(self.db.list_queue(filter)?)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<QueueTask>> {
        Ok(self.db.get_queue_row(task_id)?)
    }

    pub fn get_current_stage(&self, task_id: &str) -> Result<Option<(PipelineStage, TaskState)>> {
        Ok(self.get_task(task_id)?.map(|t| (t.stage, t.state)))
    }

    /// Partial update of the row at `stage`. Setting `completed_at` closes
    /// the open attempt; completing, failing or cancelling releases the lock.
    pub fn update_task(&self, task_id: &str, stage: PipelineStage, update: TaskUpdate) -> Result<bool> {
        if update.is_empty() && update.completed_at.is_none() {
            return Ok(false);
        }

        let now = now_str();
        let changed = self.db.update_queue_fields(task_id, stage, &update, &now)?;

        if let Some(completed_at) = &update.completed_at {
            self.db.finish_time_log(task_id, stage, completed_at)?;
        }

        if update.state.map(|s| s.is_terminal()).unwrap_or(false) {
            self.db.release_lock(stage, task_id)?;
        }

        Ok(changed > 0)
    }

    /// Finish `from` successfully: move to the next stage as waiting, or mark
    /// completed after youtube. Returns false when the row was no longer
    /// processing at `from` (cancelled or reset meanwhile).
    pub fn advance(&self, task_id: &str, from: PipelineStage) -> Result<bool> {
        let now = now_str();
        let next = from.next();
        let changed = self.db.transition_stage(task_id, from, next, &now)?;

        self.db.finish_time_log(task_id, from, &now)?;
        self.db.release_lock(from, task_id)?;

        if changed == 0 {
            log::warn!(
                "[QUEUE] {} is no longer processing at {}, not advancing",
                task_id,
                from
            );
            return Ok(false);
        }

        match next {
            Some(next) => log::info!("[QUEUE] {} advanced {} -> {}", task_id, from, next),
            None => log::info!("[QUEUE] {} completed", task_id),
        }
        Ok(true)
    }

    /// Fail the attempt at `stage`. No-op when the row already left
    /// processing (stopped or reset meanwhile).
    pub fn fail(&self, task_id: &str, stage: PipelineStage, error: &str) -> Result<bool> {
        let now = now_str();
        let changed = self.db.fail_stage_row(task_id, stage, error, &now)?;
        self.db.finish_time_log(task_id, stage, &now)?;
        self.db.release_lock(stage, task_id)?;
        Ok(changed > 0)
    }

    /// Cancel the attempt at `stage` (worker shutdown)
    pub fn cancel_in_flight(&self, task_id: &str, stage: PipelineStage, reason: &str) -> Result<bool> {
        let now = now_str();
        let changed = self.db.set_status_if(
            task_id,
            stage,
            TaskState::Processing,
            TaskState::Cancelled,
            Some(reason),
            &now,
        )?;
        self.db.finish_time_log(task_id, stage, &now)?;
        self.db.release_lock(stage, task_id)?;
        Ok(changed > 0)
    }

    /// Append a line to the task's per-stage log file
    pub fn append_log(&self, task_id: &str, stage: PipelineStage, line: &str) -> Result<()> {
        artifacts::append_content_log(&self.tasks_dir, task_id, stage, line)
    }

    /// Per-stage counts, cancelled rows excluded
    pub fn get_summary(&self) -> Result<QueueSummary> {
        let mut summary = QueueSummary::default();
        for (stage, state, count) in self.db.count_queue_by_stage()? {
            summary.stage_mut(stage).add(state, count);
        }
        Ok(summary)
    }

    /// Number of waiting rows of the same stage ahead of this task
    pub fn get_position(&self, task_id: &str) -> Result<Option<u64>> {
        let Some(task) = self.get_task(task_id)? else {
            return Ok(None);
        };
        if task.state != TaskState::Waiting {
            return Ok(None);
        }
        Ok(Some(self.db.count_waiting_before(task.stage, &task.created_at)?))
    }

    /// Delete completed/failed rows finished more than `days_old` days ago
    pub fn cleanup(&self, days_old: i64) -> Result<usize> {
        let cutoff = minutes_ago(Utc::now(), days_old.saturating_mul(24 * 60));
        let deleted = self.db.delete_finished_before(&cutoff)?;
        log::info!("[QUEUE] Cleaned up {} finished rows older than {} days", deleted, days_old);
        Ok(deleted)
    }

    pub fn clear_all(&self) -> Result<usize> {
        let deleted = self.db.clear_queue()?;
        log::warn!("[QUEUE] Cleared {} queue rows", deleted);
        Ok(deleted)
    }

    /// Processing rows that started more than ten minutes ago
    pub fn get_health_status(&self) -> Result<QueueHealthStatus> {
        let now = Utc::now();
        let stuck_tasks = self.db.list_stuck_rows(&minutes_ago(now, STUCK_AFTER_MINUTES))?;
        Ok(QueueHealthStatus {
            healthy: stuck_tasks.is_empty(),
            stuck_tasks,
            checked_at: format_ts(now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> (tempfile::TempDir, QueueManager) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("queue.db").to_str().unwrap()).unwrap();
        let queue = QueueManager::new(Arc::new(db), dir.path().join("tasks"), 60);
        (dir, queue)
    }

    #[test]
    fn test_task_id_shape() {
        let id = new_task_id();
        let (millis, segment) = id.split_once('_').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(segment.len(), 8);
    }

    #[test]
    fn test_dequeue_takes_lock_and_blocks_stage() {
        let (_dir, queue) = manager();
        queue.enqueue("a", PipelineStage::Script, "u1", &json!({})).unwrap();
        queue.enqueue("b", PipelineStage::Script, "u1", &json!({})).unwrap();

        let first = queue.dequeue(PipelineStage::Script, 100).unwrap().unwrap();
        assert_eq!(first.state, TaskState::Processing);
        assert!(first.started_at.is_some());

        // Stage lock held: second worker gets nothing
        assert!(queue.dequeue(PipelineStage::Script, 200).unwrap().is_none());

        let lock = queue.db().get_lock(PipelineStage::Script).unwrap().unwrap();
        assert_eq!(lock.lock_task_id.as_deref(), Some(first.task_id.as_str()));
        assert_eq!(lock.worker_pid, Some(100));

        // Other stages are independent
        assert!(queue.dequeue(PipelineStage::Image, 300).unwrap().is_none());

        assert!(queue.release_task(&first.task_id, PipelineStage::Script).unwrap());
        let second = queue.dequeue(PipelineStage::Script, 200).unwrap().unwrap();
        assert_ne!(second.task_id, first.task_id);
    }

    #[test]
    fn test_expired_lock_is_reclaimed() {
        let (_dir, queue) = manager();
        queue
            .db()
            .acquire_lock(PipelineStage::Video, "ghost", 1, "2020-01-01T00:00:00Z", "2019-01-01T00:00:00Z")
            .unwrap();
        queue.enqueue("v1", PipelineStage::Video, "u1", &json!({})).unwrap();

        let task = queue.dequeue(PipelineStage::Video, 2).unwrap();
        assert_eq!(task.map(|t| t.task_id), Some("v1".to_string()));
    }

    #[test]
    fn test_retry_count_increments_per_attempt() {
        let (_dir, queue) = manager();
        queue.enqueue("a", PipelineStage::Script, "u1", &json!({})).unwrap();

        queue.dequeue(PipelineStage::Script, 1).unwrap().unwrap();
        queue
            .update_task("a", PipelineStage::Script, TaskUpdate::failed("boom", now_str()))
            .unwrap();

        queue.db().reset_queue_row("a", PipelineStage::Script, None, &now_str()).unwrap();
        queue.dequeue(PipelineStage::Script, 1).unwrap().unwrap();

        let logs = queue.db().list_time_logs("a").unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].retry_cnt, 0);
        assert!(logs[0].end_time.is_some());
        assert_eq!(logs[1].retry_cnt, 1);
        assert!(logs[1].end_time.is_none());
    }

    #[test]
    fn test_advance_walks_the_pipeline() {
        let (_dir, queue) = manager();
        let id = queue.create_pipeline("u1", &json!({"title": "x"})).unwrap();

        for stage in PipelineStage::ALL {
            let task = queue.dequeue(stage, 7).unwrap().unwrap();
            assert_eq!(task.task_id, id);
            assert!(queue.advance(&id, stage).unwrap());
        }

        let row = queue.get_task(&id).unwrap().unwrap();
        assert_eq!(row.stage, PipelineStage::Youtube);
        assert_eq!(row.state, TaskState::Completed);
        assert!(row.completed_at.is_some());
        assert!(queue.db().list_locks().unwrap().iter().all(|l| !l.is_held()));
    }

    #[test]
    fn test_advance_skips_cancelled_row() {
        let (_dir, queue) = manager();
        queue.enqueue("a", PipelineStage::Image, "u1", &json!({})).unwrap();
        queue.dequeue(PipelineStage::Image, 1).unwrap().unwrap();

        queue.db().cancel_active("a", "Manually stopped by user", &now_str()).unwrap();
        assert!(!queue.advance("a", PipelineStage::Image).unwrap());

        let row = queue.get_task("a").unwrap().unwrap();
        assert_eq!(row.state, TaskState::Cancelled);
        assert_eq!(row.stage, PipelineStage::Image);
    }

    #[test]
    fn test_cancel_only_touches_waiting() {
        let (_dir, queue) = manager();
        queue.enqueue("a", PipelineStage::Script, "u1", &json!({})).unwrap();
        queue.enqueue("b", PipelineStage::Script, "u1", &json!({})).unwrap();
        let claimed = queue.dequeue(PipelineStage::Script, 1).unwrap().unwrap();
        let waiting = if claimed.task_id == "a" { "b" } else { "a" };

        assert!(!queue.cancel(&claimed.task_id, None).unwrap());
        assert!(!queue.cancel(waiting, Some(PipelineStage::Video)).unwrap());
        assert!(queue.cancel(waiting, Some(PipelineStage::Script)).unwrap());

        let row = queue.get_task(waiting).unwrap().unwrap();
        assert_eq!(row.state, TaskState::Failed);
        assert_eq!(row.error.as_deref(), Some("Cancelled by user"));
    }

    #[test]
    fn test_summary_excludes_cancelled() {
        let (_dir, queue) = manager();
        queue.enqueue("a", PipelineStage::Script, "u1", &json!({})).unwrap();
        queue.enqueue("b", PipelineStage::Script, "u1", &json!({})).unwrap();
        queue.enqueue("c", PipelineStage::Video, "u1", &json!({})).unwrap();
        queue.db().cancel_active("b", "stopped", &now_str()).unwrap();

        let summary = queue.get_summary().unwrap();
        assert_eq!(summary.script.waiting, 1);
        assert_eq!(summary.video.waiting, 1);
        assert_eq!(summary.image, Default::default());
    }

    #[test]
    fn test_position_counts_earlier_waiting_rows() {
        let (_dir, queue) = manager();
        let db = queue.db();
        for (id, created) in [("a", "2026-01-01T00:00:00Z"), ("b", "2026-01-01T00:01:00Z"), ("c", "2026-01-01T00:02:00Z")] {
            db.replace_queue_row(id, PipelineStage::Image, TaskState::Waiting, created, "u1", &json!({}))
                .unwrap();
        }

        assert_eq!(queue.get_position("a").unwrap(), Some(0));
        assert_eq!(queue.get_position("c").unwrap(), Some(2));
        assert_eq!(queue.get_position("missing").unwrap(), None);

        queue.dequeue(PipelineStage::Image, 1).unwrap().unwrap();
        assert_eq!(queue.get_position("a").unwrap(), None);
        assert_eq!(queue.get_position("c").unwrap(), Some(1));
    }

    #[test]
    fn test_filter_and_cleanup() {
        let (_dir, queue) = manager();
        let db = queue.db();
        db.replace_queue_row("old", PipelineStage::Youtube, TaskState::Completed, "2020-01-01T00:00:00Z", "u1", &json!({}))
            .unwrap();
        db.set_status_if("old", PipelineStage::Youtube, TaskState::Completed, TaskState::Completed, None, "2020-01-02T00:00:00Z")
            .unwrap();
        queue.enqueue("new", PipelineStage::Script, "u2", &json!({})).unwrap();

        let filter = QueueFilter {
            user_id: Some("u2".to_string()),
            ..Default::default()
        };
        let rows = queue.get_queue(&filter).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task_id, "new");

        assert_eq!(queue.cleanup(7).unwrap(), 1);
        assert!(queue.get_task("old").unwrap().is_none());
        assert_eq!(queue.clear_all().unwrap(), 1);
    }

    #[test]
    fn test_health_status_reports_stuck_rows() {
        let (_dir, queue) = manager();
        let db = queue.db();
        db.replace_queue_row("a", PipelineStage::Video, TaskState::Waiting, "2020-01-01T00:00:00Z", "u1", &json!({}))
            .unwrap();
        queue.dequeue(PipelineStage::Video, 1).unwrap().unwrap();
        assert!(queue.get_health_status().unwrap().healthy);

        // Backdate the attempt
        {
            let conn = db.conn.lock();
            conn.execute("UPDATE task_queue SET started_at = '2020-01-01T00:00:00Z'", []).unwrap();
        }
        let status = queue.get_health_status().unwrap();
        assert!(!status.healthy);
        assert_eq!(status.stuck_tasks.len(), 1);
    }
}
