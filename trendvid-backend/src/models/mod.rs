mod content;
mod queue_task;
mod stage;
mod task;

pub use content::{Content, ContentSetting, ContentStatus, CreateTaskRequest};
pub use queue_task::{QueueFilter, QueueSummary, QueueTask, StageCounts, StageTimeLog, TaskLock, TaskUpdate};
pub use stage::{PipelineStage, TaskState};
pub use task::Task;
