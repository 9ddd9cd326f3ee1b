//! Recovery of work interrupted by a crash or restart
//!
//! Nothing survives a restart in-process, so every `processing` row and every
//! held lock left in the database is orphaned. They are failed (not
//! re-queued) so an admin can retry them deliberately.

use chrono::Utc;
use serde::Serialize;

use crate::db::Database;
use crate::db::time::{format_ts, minutes_ago, now_str};
use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResult {
    pub content_recovered: usize,
    pub queue_recovered: usize,
    pub recovered_ids: Vec<String>,
    pub locks_released: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecoveryResult {
    pub task_id: String,
    pub content_updated: usize,
    pub queue_updated: usize,
    pub locks_released: usize,
}

impl RecoveryResult {
    fn push_ids(&mut self, ids: Vec<String>) {
        for id in ids {
            if !self.recovered_ids.contains(&id) {
                self.recovered_ids.push(id);
            }
        }
    }

    fn log_summary(&self, tag: &str) {
        if self.recovered_ids.is_empty() && self.locks_released == 0 {
            log::info!("[{}] Nothing to recover", tag);
            return;
        }
        log::info!(
            "[{}] Recovered content={}, queue={}, locks={}",
            tag,
            self.content_recovered,
            self.queue_recovered,
            self.locks_released
        );
        if !self.recovered_ids.is_empty() {
            log::info!("[{}] Recovered ids: {}", tag, self.recovered_ids.join(", "));
        }
    }
}

/// Fail everything left `processing` and release every lock.
/// Runs at startup, before any worker is spawned.
pub fn recover_stale_processing_jobs(db: &Database) -> Result<RecoveryResult> {
    let now = now_str();
    let mut result = RecoveryResult::default();

    for lock in db.list_locks()?.into_iter().filter(|l| l.is_held()) {
        log::info!(
            "[RECOVERY] Orphaned {} lock: task={:?} pid={:?} locked_at={:?}",
            lock.task_type,
            lock.lock_task_id,
            lock.locked_at,
            lock.worker_pid
        );
    }
    result.locks_released = db.release_all_locks()?;

    let content_ids = db.fail_processing_content("interrupted by server restart", None, &now)?;
    result.content_recovered = content_ids.len();
    result.push_ids(content_ids);

    let queue_ids = db.fail_processing_rows("interrupted by server restart", None, &now)?;
    result.queue_recovered = queue_ids.len();
    result.push_ids(queue_ids);

    result.log_summary("RECOVERY");
    Ok(result)
}

/// Like [`recover_stale_processing_jobs`] but only for rows idle longer
/// than `threshold_minutes`
pub fn recover_stale_jobs_by_time(db: &Database, threshold_minutes: i64) -> Result<RecoveryResult> {
    let now = Utc::now();
    let now_s = format_ts(now);
    let cutoff = minutes_ago(now, threshold_minutes);
    let reason = format!(
        "no response for {} minutes, treated as stale",
        threshold_minutes
    );
    let mut result = RecoveryResult::default();

    log::info!(
        "[STALE-RECOVERY] Recovering jobs processing for more than {} minutes",
        threshold_minutes
    );

    let content_ids = db.fail_processing_content(&reason, Some(&cutoff), &now_s)?;
    result.content_recovered = content_ids.len();
    result.push_ids(content_ids);

    let queue_ids = db.fail_processing_rows(&reason, Some(&cutoff), &now_s)?;
    result.queue_recovered = queue_ids.len();
    result.push_ids(queue_ids);

    result.locks_released = db.release_locks_older_than(&cutoff)?;

    result.log_summary("STALE-RECOVERY");
    Ok(result)
}

/// Fail a single task that is stuck mid-generation
pub fn recover_task(db: &Database, task_id: &str) -> Result<TaskRecoveryResult> {
    let now = now_str();

    let result = TaskRecoveryResult {
        task_id: task_id.to_string(),
        content_updated: db.recover_content(task_id, "manually recovered", &now)?,
        queue_updated: db.fail_processing_row(task_id, "manually recovered", &now)?,
        locks_released: db.release_locks_for_task(task_id)?,
    };

    log::info!(
        "[RECOVERY] Task {} recovered: content={}, queue={}, locks={}",
        task_id,
        result.content_updated,
        result.queue_updated,
        result.locks_released
    );
    Ok(result)
}
