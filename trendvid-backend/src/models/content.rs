use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Content status values written by the queue, recovery and stop paths
pub struct ContentStatus;

impl ContentStatus {
    pub const DRAFT: &'static str = "draft";
    pub const PENDING: &'static str = "pending";
    pub const SCRIPT: &'static str = "script";
    pub const VIDEO: &'static str = "video";
    pub const PROCESSING: &'static str = "processing";
    pub const COMPLETED: &'static str = "completed";
    pub const FAILED: &'static str = "failed";
    pub const CANCELLED: &'static str = "cancelled";
}

/// Produced artifact record, keyed by the task id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub content_id: String,
    pub user_id: String,
    pub title: String,
    pub status: String,
    pub error: Option<String>,
    pub youtube_url: Option<String>,
    pub youtube_channel: Option<String>,
    pub prompt_format: Option<String>,
    pub product_info: Option<String>,
    pub category: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Content {
    /// A fresh draft record
    pub fn new(content_id: &str, user_id: &str, title: &str, now: &str) -> Self {
        Self {
            content_id: content_id.to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            status: ContentStatus::DRAFT.to_string(),
            error: None,
            youtube_url: None,
            youtube_channel: None,
            prompt_format: None,
            product_info: None,
            category: None,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }
}

/// Generation settings for a content
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSetting {
    pub content_id: String,
    pub script_mode: String,
    pub media_mode: String,
    pub channel: Option<String>,
    pub tts_voice: String,
    pub tts_speed: String,
    pub tags: Option<String>,
    pub priority: i64,
    pub settings: Option<String>,
}

impl ContentSetting {
    pub fn defaults(content_id: &str) -> Self {
        Self {
            content_id: content_id.to_string(),
            script_mode: "chrome".to_string(),
            media_mode: "crawl".to_string(),
            channel: None,
            tts_voice: "ko-KR-SoonBokNeural".to_string(),
            tts_speed: "+0%".to_string(),
            tags: None,
            priority: 0,
            settings: None,
        }
    }

    /// Effective media mode: explicit column, then `mediaMode`/`media_mode`
    /// inside the settings JSON, then `crawl`.
    pub fn effective_media_mode(setting: Option<&ContentSetting>) -> String {
        let Some(setting) = setting else {
            return "crawl".to_string();
        };
        if !setting.media_mode.is_empty() {
            return setting.media_mode.clone();
        }
        setting
            .settings
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|v| {
                v.get("mediaMode")
                    .or_else(|| v.get("media_mode"))
                    .and_then(|m| m.as_str().map(str::to_string))
            })
            .unwrap_or_else(|| "crawl".to_string())
    }
}

/// Request body for creating a task together with its content and settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub title: String,
    pub user_id: String,
    pub prompt_format: Option<String>,
    pub category: Option<String>,
    pub product_info: Option<String>,
    pub youtube_channel: Option<String>,
    pub script_mode: Option<String>,
    pub media_mode: Option<String>,
    pub tts_voice: Option<String>,
    pub priority: Option<i64>,
    pub settings: Option<Value>,
    pub metadata: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_mode_resolution() {
        assert_eq!(ContentSetting::effective_media_mode(None), "crawl");

        let mut setting = ContentSetting::defaults("t1");
        setting.media_mode = "imagefx".to_string();
        assert_eq!(ContentSetting::effective_media_mode(Some(&setting)), "imagefx");

        setting.media_mode = String::new();
        setting.settings = Some(r#"{"media_mode":"dalle"}"#.to_string());
        assert_eq!(ContentSetting::effective_media_mode(Some(&setting)), "dalle");

        setting.settings = Some("not json".to_string());
        assert_eq!(ContentSetting::effective_media_mode(Some(&setting)), "crawl");
    }
}
