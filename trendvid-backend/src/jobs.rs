//! Running job registry and task stop
//!
//! Workers register every stage run here with a cancellation token and the
//! child PID. Stopping a task cancels the token (the runner kills its child)
//! and then cleans up the database rows.

use std::path::Path;

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::artifacts::append_content_log;
use crate::db::Database;
use crate::db::time::now_str;
use crate::error::{Error, Result};
use crate::models::PipelineStage;

pub const STOPPED_BY_USER: &str = "Manually stopped by user";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningJob {
    pub task_id: String,
    pub stage: PipelineStage,
    pub pid: Option<u32>,
    pub started_at: String,
    #[serde(skip)]
    pub cancel: CancellationToken,
}

/// In-flight stage runs keyed by task id
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<String, RunningJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run and return its cancellation token
    pub fn register(&self, task_id: &str, stage: PipelineStage) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.jobs.insert(
            task_id.to_string(),
            RunningJob {
                task_id: task_id.to_string(),
                stage,
                pid: None,
                started_at: now_str(),
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub fn set_pid(&self, task_id: &str, pid: Option<u32>) {
        if let Some(mut job) = self.jobs.get_mut(task_id) {
            job.pid = pid;
        }
    }

    pub fn unregister(&self, task_id: &str) -> Option<RunningJob> {
        self.jobs.remove(task_id).map(|(_, job)| job)
    }

    pub fn get(&self, task_id: &str) -> Option<RunningJob> {
        self.jobs.get(task_id).map(|j| j.clone())
    }

    pub fn list(&self) -> Vec<RunningJob> {
        self.jobs.iter().map(|j| j.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Cancel a run. Returns the job as it was when cancelled.
    pub fn cancel(&self, task_id: &str) -> Option<RunningJob> {
        let job = self.get(task_id)?;
        job.cancel.cancel();
        Some(job)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResult {
    pub task_id: String,
    pub message: String,
    pub killed_pid: Option<u32>,
    pub queue_cancelled: usize,
    pub locks_released: usize,
    pub stopped_contents: usize,
    pub stopped_jobs: usize,
}

/// Stop a task: cancel its run, terminate the child, cancel queue and
/// content rows and release its locks.
pub async fn stop_task(
    db: &Database,
    registry: &JobRegistry,
    tasks_dir: &Path,
    task_id: &str,
) -> Result<StopResult> {
    db.get_task_by_id(task_id)?
        .ok_or_else(|| Error::not_found("Task", task_id))?;

    log::info!("[STOP] Stopping task {}", task_id);

    let mut result = StopResult {
        task_id: task_id.to_string(),
        message: "Task stopped".to_string(),
        ..Default::default()
    };

    let mut log_stage = db.get_queue_row(task_id)?.map(|row| row.stage);

    if let Some(job) = registry.cancel(task_id) {
        log::info!("[STOP] Cancelled running {} job of {}", job.stage, task_id);
        log_stage = Some(job.stage);
        if let Some(pid) = job.pid {
            terminate_process(pid).await;
            result.killed_pid = Some(pid);
        }
    }

    let now = now_str();
    result.queue_cancelled = db.cancel_active(task_id, STOPPED_BY_USER, &now)?;
    result.locks_released = db.release_locks_for_task(task_id)?;
    result.stopped_jobs = db.cancel_derived_content(task_id, "stopped by user", &now)?;
    result.stopped_contents = db.cancel_content(task_id, "stopped by user", &now)?;

    let log_stage = log_stage.unwrap_or(PipelineStage::Script);
    if let Err(e) = append_content_log(tasks_dir, task_id, log_stage, "Task stopped by user") {
        log::warn!("[STOP] Could not write content log for {}: {}", task_id, e);
    }

    log::info!(
        "[STOP] {} stopped: queue={}, locks={}, contents={}",
        task_id,
        result.queue_cancelled,
        result.locks_released,
        result.stopped_contents
    );
    Ok(result)
}

/// Best-effort kill of a process tree
pub async fn terminate_process(pid: u32) {
    let output = if cfg!(windows) {
        tokio::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .output()
            .await
    } else {
        tokio::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .output()
            .await
    };

    match output {
        Ok(out) if out.status.success() => log::info!("[STOP] Terminated pid {}", pid),
        Ok(out) => log::warn!(
            "[STOP] Kill of pid {} exited with {}: {}",
            pid,
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        ),
        Err(e) => log::warn!("[STOP] Could not run kill for pid {}: {}", pid, e),
    }
}
