//! Queue health checker
//!
//! Compares waiting/processing queue rows with their task folders and fixes
//! rows whose on-disk state says otherwise (folder gone, upload finished,
//! script crashed, attempt hung).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::artifacts::task_folder;
use crate::db::Database;
use crate::db::time::{format_ts, parse_ts};
use crate::error::Result;
use crate::models::{PipelineStage, QueueTask, TaskState};

/// Processing rows older than this are considered hung
pub const HUNG_AFTER_MINUTES: i64 = 60;

const COMPLETION_FILES: &[&str] = &["final.mp4", "final_shorts.mp4", "output.mp4"];
const LOG_FILES: &[&str] = &["video.log", "script.log", "image.log", "image_crawl.log"];
const LOG_TAIL_LINES: usize = 50;

/// Failure markers printed by the stage scripts
static ERROR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"❌\s*오류\s*발생",
        r"❌\s*실패",
        r"Python 프로세스가 코드 1로 종료",
        r"(?i)Error:",
        r"(?i)Exception:",
        r"✗\s*실패!",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// `[2026-01-01T00:00:00Z] ...` prefix written by the content log appender
static STAMP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[([0-9T:\-]+Z)\]").unwrap());

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub task_id: String,
    #[serde(rename = "type")]
    pub stage: PipelineStage,
    pub queue_status: TaskState,
    pub actual_status: TaskState,
    pub reason: String,
    pub fixed: bool,
}

pub struct QueueHealthChecker {
    db: Arc<Database>,
    tasks_dir: PathBuf,
    hung_after_minutes: i64,
}

impl QueueHealthChecker {
    pub fn new(db: Arc<Database>, tasks_dir: PathBuf) -> Self {
        Self {
            db,
            tasks_dir,
            hung_after_minutes: HUNG_AFTER_MINUTES,
        }
    }

    /// Check every waiting or processing row once
    pub fn check_all(&self) -> Result<Vec<HealthCheckResult>> {
        let rows = self.db.list_active_queue_rows()?;
        log::debug!("[HEALTH] Checking {} active tasks", rows.len());

        let now = Utc::now();
        let mut results = Vec::new();
        for row in rows {
            if let Some((actual, reason)) = self.diagnose(&row, now) {
                results.push(self.fix(&row, actual, reason, now)?);
            }
        }
        Ok(results)
    }

    /// What the row should be, or `None` when it looks healthy
    fn diagnose(&self, row: &QueueTask, now: DateTime<Utc>) -> Option<(TaskState, String)> {
        let folder = task_folder(&self.tasks_dir, &row.task_id);
        if !folder.is_dir() {
            return Some((TaskState::Failed, "task folder missing".to_string()));
        }

        if row.stage == PipelineStage::Youtube && self.upload_finished(&row.task_id, &folder) {
            return Some((TaskState::Completed, "upload finished (video file and YouTube URL present)".to_string()));
        }

        if row.state != TaskState::Processing {
            return None;
        }

        let started_at = row.started_at.as_deref().and_then(parse_ts);
        if let Some(reason) = find_error_in_logs(&folder, started_at) {
            return Some((TaskState::Failed, reason));
        }

        if let Some(started) = started_at {
            if (now - started).num_minutes() >= self.hung_after_minutes {
                return Some((TaskState::Failed, "timeout".to_string()));
            }
        }

        None
    }

    fn upload_finished(&self, task_id: &str, folder: &Path) -> bool {
        let has_file = COMPLETION_FILES.iter().any(|f| folder.join(f).is_file());
        if !has_file {
            return false;
        }
        match self.db.get_content(task_id) {
            Ok(Some(content)) => content.youtube_url.as_deref().is_some_and(|u| !u.is_empty()),
            Ok(None) => false,
            Err(e) => {
                log::warn!("[HEALTH] Content lookup failed for {}: {}", task_id, e);
                false
            }
        }
    }

    fn fix(
        &self,
        row: &QueueTask,
        actual: TaskState,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<HealthCheckResult> {
        let now_s = format_ts(now);
        let error = (actual == TaskState::Failed).then_some(reason.as_str());

        // Keyed on the observed stage and status so a concurrent worker transition wins
        let fixed = self
            .db
            .set_status_if(&row.task_id, row.stage, row.state, actual, error, &now_s)?
            > 0;

        if fixed {
            self.db.finish_time_log(&row.task_id, row.stage, &now_s)?;
            self.db.release_locks_for_task(&row.task_id)?;
            log::warn!(
                "[HEALTH] {} ({}|{}) -> {}: {}",
                row.task_id,
                row.stage,
                row.state,
                actual,
                reason
            );
        }

        Ok(HealthCheckResult {
            task_id: row.task_id.clone(),
            stage: row.stage,
            queue_status: row.state,
            actual_status: actual,
            reason,
            fixed,
        })
    }

    /// Run [`Self::check_all`] every `interval` until `shutdown` fires
    pub async fn run_periodic(&self, interval: Duration, shutdown: CancellationToken) {
        log::info!("[HEALTH] Periodic check every {}s", interval.as_secs());
        loop {
            match self.check_all() {
                Ok(results) if !results.is_empty() => log::info!("{}", report(&results)),
                Ok(_) => log::debug!("[HEALTH] All active tasks healthy"),
                Err(e) => log::error!("[HEALTH] Check failed: {}", e),
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("[HEALTH] Stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

/// First error line among the tails of the stage logs. Lines stamped
/// before `since` belong to an earlier attempt and are ignored.
fn find_error_in_logs(folder: &Path, since: Option<DateTime<Utc>>) -> Option<String> {
    for file in LOG_FILES {
        let Ok(body) = fs::read_to_string(folder.join(file)) else {
            continue;
        };
        let lines: Vec<&str> = body.lines().collect();
        let tail = &lines[lines.len().saturating_sub(LOG_TAIL_LINES)..];

        for line in tail {
            let stale = match (since, STAMP.captures(line)) {
                (Some(since), Some(caps)) => parse_ts(&caps[1]).map(|t| t < since).unwrap_or(false),
                _ => false,
            };
            if stale {
                continue;
            }
            if ERROR_PATTERNS.iter().any(|p| p.is_match(line)) {
                let snippet: String = line.chars().take(100).collect();
                return Some(format!("{}: {}", file, snippet));
            }
        }
    }
    None
}

/// Text summary of a check run
pub fn report(results: &[HealthCheckResult]) -> String {
    if results.is_empty() {
        return "[HEALTH] No mismatches found".to_string();
    }

    let fixed = results.iter().filter(|r| r.fixed).count();
    let mut out = format!(
        "[HEALTH] {} mismatches, {} fixed\n",
        results.len(),
        fixed
    );
    for r in results {
        out.push_str(&format!(
            "  {} {} ({}|{}) -> {}: {}\n",
            if r.fixed { "fixed" } else { "skipped" },
            r.task_id,
            r.stage,
            r.queue_status,
            r.actual_status,
            r.reason
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::time::now_str;
    use crate::models::Content;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        tasks_dir: PathBuf,
        checker: QueueHealthChecker,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::new(dir.path().join("h.db").to_str().unwrap()).unwrap());
        let tasks_dir = dir.path().join("tasks");
        fs::create_dir_all(&tasks_dir).unwrap();
        let checker = QueueHealthChecker::new(db.clone(), tasks_dir.clone());
        Fixture { _dir: dir, db, tasks_dir, checker }
    }

    fn processing(db: &Database, id: &str, stage: PipelineStage, started: &str) {
        db.replace_queue_row(id, stage, TaskState::Waiting, started, "u1", &json!({}))
            .unwrap();
        let conn = db.conn.lock();
        conn.execute(
            "UPDATE task_queue SET status = 'processing', started_at = ?1 WHERE task_id = ?2",
            [started, id],
        )
        .unwrap();
    }

    #[test]
    fn test_missing_folder_fails_task() {
        let f = fixture();
        f.db.replace_queue_row("gone", PipelineStage::Script, TaskState::Waiting, &now_str(), "u1", &json!({}))
            .unwrap();

        let results = f.checker.check_all().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].fixed);
        assert_eq!(results[0].actual_status, TaskState::Failed);

        let row = f.db.get_queue_row("gone").unwrap().unwrap();
        assert_eq!(row.state, TaskState::Failed);
        assert_eq!(row.error.as_deref(), Some("task folder missing"));
    }

    #[test]
    fn test_error_log_fails_processing_task() {
        let f = fixture();
        let started = format_ts(Utc::now() - ChronoDuration::minutes(5));
        processing(&f.db, "t1", PipelineStage::Video, &started);
        let folder = f.tasks_dir.join("t1");
        fs::create_dir_all(&folder).unwrap();
        fs::write(
            folder.join("video.log"),
            format!("[2020-01-01T00:00:00Z] Error: old attempt\n[{}] Traceback\n[{}] ValueError: bad scene\n", now_str(), now_str()),
        )
        .unwrap();

        let results = f.checker.check_all().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].reason.starts_with("video.log: "));
        assert!(results[0].reason.contains("bad scene"));
    }

    #[test]
    fn test_hung_task_times_out_and_healthy_task_is_left_alone() {
        let f = fixture();
        let old = format_ts(Utc::now() - ChronoDuration::minutes(90));
        let fresh = format_ts(Utc::now() - ChronoDuration::minutes(5));
        processing(&f.db, "hung", PipelineStage::Image, &old);
        processing(&f.db, "fine", PipelineStage::Image, &fresh);
        fs::create_dir_all(f.tasks_dir.join("hung")).unwrap();
        fs::create_dir_all(f.tasks_dir.join("fine")).unwrap();

        let results = f.checker.check_all().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].task_id, "hung");
        assert_eq!(results[0].reason, "timeout");
        assert_eq!(f.db.get_queue_row("fine").unwrap().unwrap().state, TaskState::Processing);
    }

    #[test]
    fn test_finished_upload_is_completed() {
        let f = fixture();
        let now = now_str();
        f.db.replace_queue_row("t1", PipelineStage::Youtube, TaskState::Waiting, &now, "u1", &json!({}))
            .unwrap();
        let mut content = Content::new("t1", "u1", "t", &now);
        content.youtube_url = Some("https://youtu.be/abc".to_string());
        f.db.insert_content(&content).unwrap();
        let folder = f.tasks_dir.join("t1");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("final.mp4"), b"").unwrap();

        let results = f.checker.check_all().unwrap();
        assert_eq!(results[0].actual_status, TaskState::Completed);
        assert_eq!(f.db.get_queue_row("t1").unwrap().unwrap().state, TaskState::Completed);

        let text = report(&results);
        assert!(text.contains("1 fixed"));
    }

    #[test]
    fn test_video_without_upload_is_not_completed() {
        let f = fixture();
        f.db.replace_queue_row("t1", PipelineStage::Youtube, TaskState::Waiting, &now_str(), "u1", &json!({}))
            .unwrap();
        let folder = f.tasks_dir.join("t1");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("final.mp4"), b"").unwrap();

        assert!(f.checker.check_all().unwrap().is_empty());
    }

    #[test]
    fn test_fix_skips_row_that_moved_to_next_stage() {
        let f = fixture();
        let old = format_ts(Utc::now() - ChronoDuration::minutes(90));
        processing(&f.db, "t1", PipelineStage::Image, &old);
        fs::create_dir_all(f.tasks_dir.join("t1")).unwrap();

        let observed = f.db.get_queue_row("t1").unwrap().unwrap();
        let now = Utc::now();
        let (actual, reason) = f.checker.diagnose(&observed, now).unwrap();
        assert_eq!(reason, "timeout");

        // The image worker finishes and the video worker claims the row
        let now_s = format_ts(now);
        f.db.transition_stage("t1", PipelineStage::Image, Some(PipelineStage::Video), &now_s)
            .unwrap();
        let claimed = f
            .db
            .claim_next(PipelineStage::Video, 1, &now_s, &now_s)
            .unwrap();
        assert!(matches!(claimed, crate::db::ClaimOutcome::Claimed(_)));

        let result = f.checker.fix(&observed, actual, reason, now).unwrap();
        assert!(!result.fixed);

        let row = f.db.get_queue_row("t1").unwrap().unwrap();
        assert_eq!(row.stage, PipelineStage::Video);
        assert_eq!(row.state, TaskState::Processing);
        assert!(f.db.get_lock(PipelineStage::Video).unwrap().unwrap().is_held());
    }
}
