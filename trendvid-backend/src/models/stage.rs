//! Pipeline stages and queue states.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// One stage of the content pipeline. Stored in `task_queue.type`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PipelineStage {
    Script,
    Image,
    Video,
    Youtube,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 4] = [
        PipelineStage::Script,
        PipelineStage::Image,
        PipelineStage::Video,
        PipelineStage::Youtube,
    ];

    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// The stage that follows this one, `None` after youtube.
    pub fn next(&self) -> Option<PipelineStage> {
        match self {
            PipelineStage::Script => Some(PipelineStage::Image),
            PipelineStage::Image => Some(PipelineStage::Video),
            PipelineStage::Video => Some(PipelineStage::Youtube),
            PipelineStage::Youtube => None,
        }
    }

    pub fn order(&self) -> u8 {
        match self {
            PipelineStage::Script => 1,
            PipelineStage::Image => 2,
            PipelineStage::Video => 3,
            PipelineStage::Youtube => 4,
        }
    }

    /// Human-readable label for logs
    pub fn label(&self) -> &'static str {
        match self {
            PipelineStage::Script => "script generation",
            PipelineStage::Image => "image crawling",
            PipelineStage::Video => "video creation",
            PipelineStage::Youtube => "YouTube upload",
        }
    }
}

/// Status of a queue row. Stored in `task_queue.status`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TaskState {
    Waiting,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Terminal states are only left through an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_stage_chain() {
        assert_eq!(PipelineStage::Script.next(), Some(PipelineStage::Image));
        assert_eq!(PipelineStage::Image.next(), Some(PipelineStage::Video));
        assert_eq!(PipelineStage::Video.next(), Some(PipelineStage::Youtube));
        assert_eq!(PipelineStage::Youtube.next(), None);
    }

    #[test]
    fn test_stage_strings() {
        assert_eq!(PipelineStage::Youtube.as_str(), "youtube");
        assert_eq!(PipelineStage::from_str("IMAGE").unwrap(), PipelineStage::Image);
        assert!(PipelineStage::from_str("schedule").is_err());
        assert_eq!(PipelineStage::Video.to_string(), "video");
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(TaskState::from_str("processing").unwrap(), TaskState::Processing);
        assert_eq!(TaskState::Cancelled.as_str(), "cancelled");
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Waiting.is_terminal());
        assert!(!TaskState::Processing.is_terminal());
    }
}
