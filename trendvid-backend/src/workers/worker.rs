//! Stage workers: one polling loop per pipeline stage

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::runner::{StageContext, StageOutput, StageRunner};
use crate::db::time::now_str;
use crate::error::{Error, Result};
use crate::jobs::JobRegistry;
use crate::models::{ContentSetting, ContentStatus, PipelineStage, QueueTask, TaskState, TaskUpdate};
use crate::queue::QueueManager;

pub struct StageWorker {
    stage: PipelineStage,
    queue: Arc<QueueManager>,
    registry: Arc<JobRegistry>,
    runner: Arc<dyn StageRunner>,
    poll_interval: Duration,
    worker_pid: i64,
}

impl StageWorker {
    pub fn new(
        stage: PipelineStage,
        queue: Arc<QueueManager>,
        registry: Arc<JobRegistry>,
        runner: Arc<dyn StageRunner>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            stage,
            queue,
            registry,
            runner,
            poll_interval,
            worker_pid: std::process::id() as i64,
        }
    }

    /// Poll until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        log::info!("[WORKER:{}] Started (poll every {:?})", self.stage, self.poll_interval);

        while !shutdown.is_cancelled() {
            let busy = match self.process_next(&shutdown).await {
                Ok(processed) => processed,
                Err(e) => {
                    log::error!("[WORKER:{}] Poll failed: {}", self.stage, e);
                    false
                }
            };

            if !busy {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        log::info!("[WORKER:{}] Stopped", self.stage);
    }

    /// Claim and run one task. Returns false when nothing was claimed.
    pub async fn process_next(&self, shutdown: &CancellationToken) -> Result<bool> {
        let Some(task) = self.queue.dequeue(self.stage, self.worker_pid)? else {
            return Ok(false);
        };
        self.execute(task, shutdown).await?;
        Ok(true)
    }

    /// Run a claimed task through the stage runner
    async fn execute(&self, task: QueueTask, shutdown: &CancellationToken) -> Result<()> {
        let task_id = task.task_id.clone();
        let cancel = self.registry.register(&task_id, self.stage);

        // A stop between the claim and the registration found no job to cancel
        match self.queue.get_current_stage(&task_id) {
            Ok(Some((stage, TaskState::Processing))) if stage == self.stage => {}
            Ok(current) => {
                self.registry.unregister(&task_id);
                log::info!(
                    "[WORKER:{}] {} left processing before it started ({:?}), skipping",
                    self.stage,
                    task_id,
                    current
                );
                self.queue.cancel_in_flight(&task_id, self.stage, "stopped before start")?;
                return Ok(());
            }
            Err(e) => {
                self.registry.unregister(&task_id);
                return Err(e);
            }
        }

        let result = match self.context(task, cancel) {
            Ok(ctx) => {
                if let Err(e) = self.queue.db().mark_content_processing(&task_id, &now_str()) {
                    log::warn!("[WORKER:{}] Content status update failed for {}: {}", self.stage, task_id, e);
                }
                self.log(&task_id, &format!("Starting {}", self.stage.label()));

                tokio::select! {
                    r = self.runner.run(&ctx) => r,
                    _ = shutdown.cancelled() => Err(Error::Cancelled("worker shutdown".to_string())),
                }
            }
            Err(e) => Err(e),
        };
        self.registry.unregister(&task_id);

        match result {
            Ok(output) => self.on_success(&task_id, output)?,
            Err(Error::Cancelled(reason)) => {
                if self.queue.cancel_in_flight(&task_id, self.stage, &reason)? {
                    log::warn!("[WORKER:{}] {} cancelled: {}", self.stage, task_id, reason);
                }
                self.log(&task_id, "Cancelled");
            }
            Err(e) => self.on_failure(&task_id, &e)?,
        }

        Ok(())
    }

    fn context(&self, task: QueueTask, cancel: CancellationToken) -> Result<StageContext> {
        let db = self.queue.db();
        let record = db.get_task_by_id(&task.task_id)?;
        let content = db.get_content(&task.task_id)?;
        let setting = db.get_content_setting(&task.task_id)?;

        let title = record
            .as_ref()
            .map(|t| t.title.clone())
            .or_else(|| content.as_ref().map(|c| c.title.clone()))
            .or_else(|| metadata_str(&task.metadata, "title"))
            .unwrap_or_else(|| task.task_id.clone());
        let prompt_format = record
            .and_then(|t| t.prompt_format)
            .or_else(|| content.and_then(|c| c.prompt_format))
            .or_else(|| metadata_str(&task.metadata, "promptFormat"));
        let privacy = metadata_str(&task.metadata, "youtubePrivacy")
            .unwrap_or_else(|| "public".to_string());

        Ok(StageContext {
            stage: self.stage,
            title,
            prompt_format,
            media_mode: ContentSetting::effective_media_mode(setting.as_ref()),
            privacy,
            cancel,
            task,
        })
    }

    fn on_success(&self, task_id: &str, output: StageOutput) -> Result<()> {
        let db = self.queue.db();
        let now = now_str();

        if let Some(url) = &output.youtube_url {
            db.set_youtube_url(task_id, url, &now)?;
            if let Some(row) = self.queue.get_task(task_id)? {
                let mut metadata = row.metadata;
                if let Some(obj) = metadata.as_object_mut() {
                    obj.insert("youtubeUrl".to_string(), Value::String(url.clone()));
                }
                let update = TaskUpdate {
                    metadata: Some(metadata),
                    ..Default::default()
                };
                self.queue.update_task(task_id, self.stage, update)?;
            }
            self.log(task_id, &format!("YouTube URL: {}", url));
        }

        if !self.queue.advance(task_id, self.stage)? {
            return Ok(());
        }

        match self.stage.next() {
            Some(next) => {
                self.log(task_id, &format!("{} finished, queued for {}", self.stage.label(), next));
                db.set_content_status(task_id, ContentStatus::PENDING, None, &now)?;
            }
            None => {
                self.log(task_id, "Pipeline completed");
                db.set_content_status(task_id, ContentStatus::COMPLETED, None, &now)?;
            }
        }
        log::info!(
            "[WORKER:{}] {} done ({} output lines)",
            self.stage,
            task_id,
            output.lines
        );
        Ok(())
    }

    fn on_failure(&self, task_id: &str, error: &Error) -> Result<()> {
        let message = error.to_string();
        log::error!("[WORKER:{}] {} failed: {}", self.stage, task_id, message);

        if self.queue.fail(task_id, self.stage, &message)? {
            self.queue.db().set_content_status(
                task_id,
                ContentStatus::FAILED,
                Some(&message),
                &now_str(),
            )?;
        }
        self.log(task_id, &format!("Failed: {}", message));
        Ok(())
    }

    fn log(&self, task_id: &str, line: &str) {
        if let Err(e) = self.queue.append_log(task_id, self.stage, line) {
            log::warn!("[WORKER:{}] Log write failed for {}: {}", self.stage, task_id, e);
        }
    }
}

fn metadata_str(metadata: &Value, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The four stage workers
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn_all(
        queue: Arc<QueueManager>,
        registry: Arc<JobRegistry>,
        runner: Arc<dyn StageRunner>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        PipelineStage::ALL
            .iter()
            .map(|&stage| {
                let worker = StageWorker::new(
                    stage,
                    queue.clone(),
                    registry.clone(),
                    runner.clone(),
                    poll_interval,
                );
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect()
    }
}
