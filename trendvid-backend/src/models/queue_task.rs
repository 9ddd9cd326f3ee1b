use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{PipelineStage, TaskState};

/// A row of `task_queue`: one per task, `stage` moves forward as the
/// pipeline progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTask {
    pub task_id: String,
    #[serde(rename = "type")]
    pub stage: PipelineStage,
    pub state: TaskState,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: Option<String>,
    pub user_id: String,
    pub error: Option<String>,
    pub metadata: Value,
    pub logs: Vec<String>,
}

/// Partial update for a queue row. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub state: Option<TaskState>,
    pub error: Option<String>,
    pub completed_at: Option<String>,
    pub logs: Option<Vec<String>>,
    pub metadata: Option<Value>,
}

impl TaskUpdate {
    pub fn failed(error: impl Into<String>, completed_at: String) -> Self {
        Self {
            state: Some(TaskState::Failed),
            error: Some(error.into()),
            completed_at: Some(completed_at),
            ..Default::default()
        }
    }

    pub fn state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.error.is_none()
            && self.logs.is_none()
            && self.metadata.is_none()
    }
}

/// Filters for listing the queue
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueFilter {
    pub task_id: Option<String>,
    #[serde(rename = "type")]
    pub stage: Option<PipelineStage>,
    #[serde(rename = "status")]
    pub state: Option<TaskState>,
    pub user_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub waiting: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StageCounts {
    pub fn add(&mut self, state: TaskState, count: u64) {
        match state {
            TaskState::Waiting => self.waiting += count,
            TaskState::Processing => self.processing += count,
            TaskState::Completed => self.completed += count,
            TaskState::Failed => self.failed += count,
            TaskState::Cancelled => {}
        }
    }
}

/// Per-stage counts. Cancelled rows are not counted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub script: StageCounts,
    pub image: StageCounts,
    pub video: StageCounts,
    pub youtube: StageCounts,
}

impl QueueSummary {
    pub fn stage_mut(&mut self, stage: PipelineStage) -> &mut StageCounts {
        match stage {
            PipelineStage::Script => &mut self.script,
            PipelineStage::Image => &mut self.image,
            PipelineStage::Video => &mut self.video,
            PipelineStage::Youtube => &mut self.youtube,
        }
    }
}

/// A row of `task_lock`. One row per stage; empty when unlocked.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLock {
    pub task_type: PipelineStage,
    pub lock_task_id: Option<String>,
    pub locked_at: Option<String>,
    pub worker_pid: Option<i64>,
}

impl TaskLock {
    pub fn is_held(&self) -> bool {
        self.worker_pid.is_some()
    }
}

/// A row of `task_time_log`: one per stage attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTimeLog {
    pub task_id: String,
    pub stage: PipelineStage,
    pub retry_cnt: i64,
    pub start_time: String,
    pub end_time: Option<String>,
}
