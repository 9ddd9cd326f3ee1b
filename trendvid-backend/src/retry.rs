//! Manual retry of failed, cancelled or finished tasks
//!
//! The restart stage is decided from the queue row plus what is actually on
//! disk, so a retry never skips a stage whose output is missing.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::artifacts::TaskArtifacts;
use crate::db::time::{now_str, parse_ts};
use crate::error::{Error, Result};
use crate::models::{ContentSetting, ContentStatus, PipelineStage, QueueTask, TaskState};
use crate::queue::QueueManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPlan {
    pub retry_from: PipelineStage,
    pub message: String,
}

/// Why a retry was refused
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRejection {
    pub current_type: PipelineStage,
    pub current_status: TaskState,
    pub message: String,
    pub minutes_elapsed: Option<f64>,
}

/// File evidence reported with every retry response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryFiles {
    pub has_story: bool,
    pub story_valid: bool,
    pub has_images: bool,
    pub image_count: usize,
    pub has_video: bool,
    pub video_file_name: Option<String>,
    pub has_youtube_link: bool,
    pub youtube_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOutcome {
    pub task_id: String,
    pub preview: bool,
    pub previous_type: PipelineStage,
    pub previous_status: TaskState,
    pub retry_from_type: PipelineStage,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<RetryFiles>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_mode: Option<String>,
}

#[derive(Debug)]
pub enum RetryError {
    Rejected(RetryRejection),
    Failed(Error),
}

impl From<Error> for RetryError {
    fn from(e: Error) -> Self {
        RetryError::Failed(e)
    }
}

impl From<rusqlite::Error> for RetryError {
    fn from(e: rusqlite::Error) -> Self {
        RetryError::Failed(e.into())
    }
}

/// Decide where a task restarts.
///
/// Waiting tasks and tasks processing for less than `zombie_threshold_minutes`
/// are refused. Older processing rows are treated as zombies and restart
/// their current stage.
pub fn plan_retry(
    row: &QueueTask,
    artifacts: &TaskArtifacts,
    media_mode: &str,
    now: DateTime<Utc>,
    zombie_threshold_minutes: i64,
) -> std::result::Result<RetryPlan, RetryRejection> {
    match row.state {
        TaskState::Waiting => Err(RetryRejection {
            current_type: row.stage,
            current_status: row.state,
            message: format!("Task is already waiting ({})", row.stage),
            minutes_elapsed: None,
        }),
        TaskState::Processing => {
            let since = row
                .updated_at
                .as_deref()
                .or(row.started_at.as_deref())
                .and_then(parse_ts)
                .unwrap_or(now);
            let minutes = (now - since).num_seconds() as f64 / 60.0;

            if minutes > zombie_threshold_minutes as f64 {
                log::warn!(
                    "[RETRY] Zombie processing detected for {} ({:.1} min)",
                    row.task_id,
                    minutes
                );
                Ok(RetryPlan {
                    retry_from: row.stage,
                    message: format!(
                        "Zombie process detected ({:.0} min elapsed), forcing retry",
                        minutes
                    ),
                })
            } else {
                Err(RetryRejection {
                    current_type: row.stage,
                    current_status: row.state,
                    message: format!("Task is currently processing ({})", row.stage),
                    minutes_elapsed: Some((minutes * 10.0).round() / 10.0),
                })
            }
        }
        TaskState::Failed | TaskState::Cancelled | TaskState::Completed => {
            Ok(plan_from_files(row.stage, artifacts, media_mode))
        }
    }
}

fn plan_from_files(stage: PipelineStage, artifacts: &TaskArtifacts, media_mode: &str) -> RetryPlan {
    let (retry_from, message) = match stage {
        PipelineStage::Youtube => match &artifacts.video_file_name {
            Some(video) => (stage, format!("Retrying YouTube upload ({})", video)),
            None => (
                PipelineStage::Video,
                "No video file, retrying from the video stage".to_string(),
            ),
        },
        PipelineStage::Video if artifacts.has_images => (
            stage,
            format!("Retrying video creation ({} images)", artifacts.image_count),
        ),
        PipelineStage::Video => (stage, "Retrying video creation".to_string()),
        PipelineStage::Image if artifacts.has_story => (
            stage,
            format!("Retrying image generation ({})", media_mode),
        ),
        PipelineStage::Image => (
            PipelineStage::Script,
            "No story.json, retrying from the script stage".to_string(),
        ),
        PipelineStage::Script => (stage, "Retrying from script generation".to_string()),
    };
    RetryPlan { retry_from, message }
}

pub struct RetryService {
    queue: Arc<QueueManager>,
    tasks_dir: PathBuf,
    zombie_threshold_minutes: i64,
}

impl RetryService {
    pub fn new(queue: Arc<QueueManager>, tasks_dir: PathBuf, zombie_threshold_minutes: i64) -> Self {
        Self {
            queue,
            tasks_dir,
            zombie_threshold_minutes,
        }
    }

    pub fn retry(
        &self,
        task_id: &str,
        preview: bool,
        force_stage: Option<PipelineStage>,
    ) -> std::result::Result<RetryOutcome, RetryError> {
        let db = self.queue.db();

        let row = self
            .queue
            .get_task(task_id)?
            .ok_or_else(|| Error::not_found("Task in queue", task_id))?;

        if let Some(stage) = force_stage {
            let outcome = RetryOutcome {
                task_id: task_id.to_string(),
                preview,
                previous_type: row.stage,
                previous_status: row.state,
                retry_from_type: stage,
                message: format!("Forced retry from {}", stage),
                files: None,
                media_mode: None,
            };
            if !preview {
                self.apply(&row, stage, false)?;
            }
            return Ok(outcome);
        }

        db.get_task_by_id(task_id)?
            .ok_or_else(|| Error::not_found("Task", task_id))?;
        let content = db.get_content(task_id)?;
        let setting = db.get_content_setting(task_id)?;
        let media_mode = ContentSetting::effective_media_mode(setting.as_ref());

        let artifacts = TaskArtifacts::inspect(&self.tasks_dir, task_id);
        let youtube_url = content.and_then(|c| c.youtube_url).filter(|u| !u.is_empty());

        let plan = plan_retry(
            &row,
            &artifacts,
            &media_mode,
            Utc::now(),
            self.zombie_threshold_minutes,
        )
        .map_err(RetryError::Rejected)?;

        log::info!(
            "[RETRY] {}{}: {}({}) -> {}",
            if preview { "(preview) " } else { "" },
            task_id,
            row.stage,
            row.state,
            plan.retry_from
        );

        if !preview {
            self.apply(&row, plan.retry_from, true)?;
        }

        Ok(RetryOutcome {
            task_id: task_id.to_string(),
            preview,
            previous_type: row.stage,
            previous_status: row.state,
            retry_from_type: plan.retry_from,
            message: plan.message,
            files: Some(RetryFiles {
                has_story: artifacts.has_story,
                story_valid: artifacts.story_valid,
                has_images: artifacts.has_images,
                image_count: artifacts.image_count,
                has_video: artifacts.has_video,
                video_file_name: artifacts.video_file_name,
                has_youtube_link: youtube_url.is_some(),
                youtube_url,
            }),
            media_mode: Some(media_mode),
        })
    }

    /// Reset the row to waiting at `stage`. With `guarded` the reset only
    /// applies if the row is unchanged since it was read.
    fn apply(&self, row: &QueueTask, stage: PipelineStage, guarded: bool) -> Result<()> {
        let db = self.queue.db();
        let expected = guarded.then_some((row.stage, row.state));

        let changed = db.reset_queue_row(&row.task_id, stage, expected, &now_str())?;
        if changed == 0 {
            log::error!("[RETRY] Queue update for {} affected 0 rows", row.task_id);
            return Err(Error::Other(
                "task_queue update failed (affected rows = 0)".to_string(),
            ));
        }

        db.release_locks_for_task(&row.task_id)?;
        db.set_content_status(&row.task_id, ContentStatus::PENDING, None, &now_str())?;

        let line = format!("Retry: {}({}) -> {}", row.stage, row.state, stage);
        if let Err(e) = self.queue.append_log(&row.task_id, stage, &line) {
            log::warn!("[RETRY] Could not write content log for {}: {}", row.task_id, e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::db::time::format_ts;
    use crate::models::{Content, Task};
    use chrono::Duration;
    use serde_json::json;

    fn row(stage: PipelineStage, state: TaskState, updated_at: Option<String>) -> QueueTask {
        QueueTask {
            task_id: "t1".to_string(),
            stage,
            state,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            started_at: None,
            completed_at: None,
            updated_at,
            user_id: "u1".to_string(),
            error: None,
            metadata: json!({}),
            logs: vec![],
        }
    }

    fn artifacts(story: bool, images: usize, video: Option<&str>) -> TaskArtifacts {
        TaskArtifacts {
            folder_exists: true,
            has_story: story,
            story_valid: story,
            scene_count: if story { 3 } else { 0 },
            has_images: images > 0,
            image_count: images,
            has_video: video.is_some(),
            video_file_name: video.map(str::to_string),
            has_thumbnail: false,
        }
    }

    #[test]
    fn test_plan_by_stage_and_files() {
        let now = Utc::now();
        let plan = |stage, files: &TaskArtifacts| {
            plan_retry(&row(stage, TaskState::Failed, None), files, "crawl", now, 10)
                .unwrap()
                .retry_from
        };

        assert_eq!(plan(PipelineStage::Youtube, &artifacts(true, 3, Some("final.mp4"))), PipelineStage::Youtube);
        assert_eq!(plan(PipelineStage::Youtube, &artifacts(true, 3, None)), PipelineStage::Video);
        assert_eq!(plan(PipelineStage::Video, &artifacts(false, 0, None)), PipelineStage::Video);
        assert_eq!(plan(PipelineStage::Image, &artifacts(true, 0, None)), PipelineStage::Image);
        assert_eq!(plan(PipelineStage::Image, &artifacts(false, 0, None)), PipelineStage::Script);
        assert_eq!(plan(PipelineStage::Script, &artifacts(true, 3, Some("a.mp4"))), PipelineStage::Script);
    }

    #[test]
    fn test_completed_and_cancelled_are_retryable() {
        let now = Utc::now();
        let files = artifacts(true, 2, Some("final.mp4"));
        for state in [TaskState::Completed, TaskState::Cancelled] {
            let plan = plan_retry(&row(PipelineStage::Youtube, state, None), &files, "crawl", now, 10).unwrap();
            assert_eq!(plan.retry_from, PipelineStage::Youtube);
            assert!(plan.message.contains("final.mp4"));
        }
    }

    #[test]
    fn test_waiting_and_fresh_processing_are_rejected() {
        let now = Utc::now();
        let files = TaskArtifacts::default();

        let waiting = plan_retry(&row(PipelineStage::Image, TaskState::Waiting, None), &files, "crawl", now, 10);
        assert_eq!(waiting.unwrap_err().current_status, TaskState::Waiting);

        let recent = Some(format_ts(now - Duration::minutes(3)));
        let busy = plan_retry(&row(PipelineStage::Video, TaskState::Processing, recent), &files, "crawl", now, 10)
            .unwrap_err();
        assert_eq!(busy.current_type, PipelineStage::Video);
        assert!(busy.minutes_elapsed.unwrap() >= 2.9);
    }

    #[test]
    fn test_zombie_processing_restarts_same_stage() {
        let now = Utc::now();
        let stale = Some(format_ts(now - Duration::minutes(25)));
        let plan = plan_retry(
            &row(PipelineStage::Video, TaskState::Processing, stale),
            &TaskArtifacts::default(),
            "crawl",
            now,
            10,
        )
        .unwrap();
        assert_eq!(plan.retry_from, PipelineStage::Video);
        assert!(plan.message.contains("Zombie"));
    }

    fn service() -> (tempfile::TempDir, Arc<QueueManager>, RetryService) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::new(dir.path().join("q.db").to_str().unwrap()).unwrap());
        let tasks_dir = dir.path().join("tasks");
        let queue = Arc::new(QueueManager::new(db, tasks_dir.clone(), 60));
        let retry = RetryService::new(queue.clone(), tasks_dir, 10);
        (dir, queue, retry)
    }

    fn seed_failed_youtube(queue: &QueueManager) {
        let now = now_str();
        let db = queue.db();
        db.insert_task(&Task {
            task_id: "t1".to_string(),
            title: "title".to_string(),
            prompt_format: None,
            user_id: "u1".to_string(),
            category: None,
            priority: 0,
            created_at: now.clone(),
            updated_at: now.clone(),
        })
        .unwrap();
        db.insert_content(&Content::new("t1", "u1", "title", &now)).unwrap();
        db.replace_queue_row("t1", PipelineStage::Youtube, TaskState::Failed, &now, "u1", &json!({}))
            .unwrap();
    }

    #[test]
    fn test_preview_does_not_write() {
        let (_dir, queue, retry) = service();
        seed_failed_youtube(&queue);

        let outcome = retry.retry("t1", true, None).unwrap();
        assert!(outcome.preview);
        assert_eq!(outcome.retry_from_type, PipelineStage::Video);
        assert_eq!(outcome.media_mode.as_deref(), Some("crawl"));

        let row = queue.get_task("t1").unwrap().unwrap();
        assert_eq!(row.state, TaskState::Failed);
        assert_eq!(row.stage, PipelineStage::Youtube);
    }

    #[test]
    fn test_apply_resets_row_and_releases_lock() {
        let (dir, queue, retry) = service();
        seed_failed_youtube(&queue);
        let folder = dir.path().join("tasks").join("t1");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("final.mp4"), b"").unwrap();
        queue
            .db()
            .acquire_lock(PipelineStage::Youtube, "t1", 9, &now_str(), "2000-01-01T00:00:00Z")
            .unwrap();

        let outcome = retry.retry("t1", false, None).unwrap();
        assert_eq!(outcome.retry_from_type, PipelineStage::Youtube);
        assert_eq!(outcome.files.unwrap().video_file_name.as_deref(), Some("final.mp4"));

        let row = queue.get_task("t1").unwrap().unwrap();
        assert_eq!(row.state, TaskState::Waiting);
        assert!(row.error.is_none());
        assert!(!queue.db().get_lock(PipelineStage::Youtube).unwrap().unwrap().is_held());
        assert!(folder.join("youtube.log").exists());
    }

    #[test]
    fn test_forced_stage_and_missing_rows() {
        let (_dir, queue, retry) = service();
        seed_failed_youtube(&queue);

        let outcome = retry.retry("t1", false, Some(PipelineStage::Image)).unwrap();
        assert_eq!(outcome.retry_from_type, PipelineStage::Image);
        let row = queue.get_task("t1").unwrap().unwrap();
        assert_eq!((row.stage, row.state), (PipelineStage::Image, TaskState::Waiting));

        // Now waiting: a plain retry is refused
        assert!(matches!(retry.retry("t1", false, None), Err(RetryError::Rejected(_))));
        assert!(matches!(
            retry.retry("missing", false, None),
            Err(RetryError::Failed(Error::NotFound { .. }))
        ));
    }
}
