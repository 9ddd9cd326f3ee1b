//! On-disk task artifacts
//!
//! Stage scripts write into `{tasks_dir}/{task_id}/`. The retry planner and
//! the health checker read that folder to learn how far a task really got.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::db::time::now_str;
use crate::error::Result;
use crate::models::PipelineStage;

static IMAGE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(scene_.*|\d+)\.(png|jpe?g)$").unwrap());

static TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",(\s*[}\]])").unwrap());

/// What a task folder contains
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskArtifacts {
    pub folder_exists: bool,
    pub has_story: bool,
    pub story_valid: bool,
    pub scene_count: usize,
    pub has_images: bool,
    pub image_count: usize,
    pub has_video: bool,
    pub video_file_name: Option<String>,
    pub has_thumbnail: bool,
}

impl TaskArtifacts {
    /// Inspect `{tasks_dir}/{task_id}`. A missing folder yields an empty report.
    pub fn inspect(tasks_dir: &Path, task_id: &str) -> Self {
        let folder = task_folder(tasks_dir, task_id);
        let Ok(entries) = fs::read_dir(&folder) else {
            return Self::default();
        };

        let mut report = Self {
            folder_exists: true,
            ..Self::default()
        };

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();

        for name in &names {
            let lower = name.to_lowercase();
            if IMAGE_NAME.is_match(name) {
                report.image_count += 1;
            }
            if lower.starts_with("thumbnail.") {
                report.has_thumbnail = true;
            }
            if report.video_file_name.is_none()
                && lower.ends_with(".mp4")
                && !lower.starts_with("scene_")
                && !lower.contains("_audio")
            {
                report.video_file_name = Some(name.clone());
            }
        }

        report.has_images = report.image_count > 0;
        report.has_video = report.video_file_name.is_some();

        let story_path = folder.join("story.json");
        if let Ok(raw) = fs::read_to_string(&story_path) {
            report.has_story = true;
            if let Some(story) = parse_story(&raw) {
                report.scene_count = scene_count(&story);
                report.story_valid = report.scene_count > 0;
            }
        }

        report
    }
}

pub fn task_folder(tasks_dir: &Path, task_id: &str) -> PathBuf {
    tasks_dir.join(task_id)
}

pub fn story_path(tasks_dir: &Path, task_id: &str) -> PathBuf {
    task_folder(tasks_dir, task_id).join("story.json")
}

fn scene_count(story: &Value) -> usize {
    story
        .get("scenes")
        .and_then(|s| s.as_array())
        .map(|s| s.len())
        .unwrap_or(0)
}

/// Parse story.json as written by LLM-backed generators: tolerates a BOM,
/// trailing commas and prose around the JSON object.
pub fn parse_story(raw: &str) -> Option<Value> {
    let text = raw.trim_start_matches('\u{feff}').trim();
    if let Ok(v) = serde_json::from_str::<Value>(text) {
        return Some(v);
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let body = &text[start..=end];
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        return Some(v);
    }

    let cleaned = TRAILING_COMMA.replace_all(body, "$1");
    serde_json::from_str::<Value>(&cleaned).ok()
}

/// Read story.json and return it only when it has at least one scene
pub fn load_valid_story(tasks_dir: &Path, task_id: &str) -> Option<Value> {
    let raw = fs::read_to_string(story_path(tasks_dir, task_id)).ok()?;
    parse_story(&raw).filter(|story| scene_count(story) > 0)
}

/// `{tasks_dir}/{task_id}/{stage}.log`
pub fn content_log_path(tasks_dir: &Path, task_id: &str, stage: PipelineStage) -> PathBuf {
    task_folder(tasks_dir, task_id).join(format!("{}.log", stage))
}

/// Append one timestamped line to the stage log of a task
pub fn append_content_log(
    tasks_dir: &Path,
    task_id: &str,
    stage: PipelineStage,
    line: &str,
) -> Result<()> {
    let path = content_log_path(tasks_dir, task_id, stage);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "[{}] {}", now_str(), line.trim_end())?;
    Ok(())
}
