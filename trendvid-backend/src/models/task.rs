use serde::{Deserialize, Serialize};

/// A row of `task`: what to produce. Shares its id with content and queue rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub title: String,
    pub prompt_format: Option<String>,
    pub user_id: String,
    pub category: Option<String>,
    pub priority: i64,
    pub created_at: String,
    pub updated_at: String,
}
