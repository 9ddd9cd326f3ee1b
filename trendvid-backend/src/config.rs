use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::models::PipelineStage;

#[derive(Clone, Debug)]
pub struct Config {
    pub secret_key: String,
    pub port: u16,
    pub database_url: String,
    /// Root of the per-task folders (`{tasks_dir}/{task_id}/story.json`, ...)
    pub tasks_dir: PathBuf,
    /// Working directory of the stage scripts
    pub backend_dir: PathBuf,
    pub python_bin: String,
    pub workers_enabled: bool,
    pub poll_interval_secs: u64,
    pub lock_timeout_minutes: i64,
    pub zombie_threshold_minutes: i64,
    /// 0 disables the background health checker
    pub health_check_interval_minutes: u64,
    pub youtube: Option<YoutubeCredentials>,
    pub scripts: StageScripts,
}

#[derive(Clone, Debug)]
pub struct YoutubeCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

/// Stage script paths, relative to `backend_dir`
#[derive(Clone, Debug)]
pub struct StageScripts {
    pub script_generator: String,
    pub image_crawler: String,
    pub video_creator: String,
    pub youtube_uploader: String,
}

impl StageScripts {
    pub fn for_stage(&self, stage: PipelineStage) -> &str {
        match stage {
            PipelineStage::Script => &self.script_generator,
            PipelineStage::Image => &self.image_crawler,
            PipelineStage::Video => &self.video_creator,
            PipelineStage::Youtube => &self.youtube_uploader,
        }
    }
}

impl Default for StageScripts {
    fn default() -> Self {
        Self {
            script_generator: "src/script/generate_script.py".to_string(),
            image_crawler: "src/image_crawler/image_crawler_working.py".to_string(),
            video_creator: "create_video_from_folder.py".to_string(),
            youtube_uploader: "src/youtube/youtube_upload_cli.py".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let secret_key = env::var("SECRET_KEY")
            .map_err(|_| Error::Config("SECRET_KEY must be set".to_string()))?;

        let youtube = match (
            env::var("YOUTUBE_CLIENT_ID"),
            env::var("YOUTUBE_CLIENT_SECRET"),
            env::var("YOUTUBE_REFRESH_TOKEN"),
        ) {
            (Ok(client_id), Ok(client_secret), Ok(refresh_token)) => Some(YoutubeCredentials {
                client_id,
                client_secret,
                refresh_token,
            }),
            _ => None,
        };

        let defaults = StageScripts::default();

        Ok(Self {
            secret_key,
            port: parse_var("PORT", 8080)?,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "./.db/trendvid.db".to_string()),
            tasks_dir: env::var("TASKS_DIR")
                .unwrap_or_else(|_| "../trend-video-backend/tasks".to_string())
                .into(),
            backend_dir: env::var("BACKEND_DIR")
                .unwrap_or_else(|_| "../trend-video-backend".to_string())
                .into(),
            python_bin: env::var("PYTHON_BIN").unwrap_or_else(|_| "python".to_string()),
            workers_enabled: parse_var("WORKERS_ENABLED", true)?,
            poll_interval_secs: parse_var("POLL_INTERVAL_SECS", 5)?,
            lock_timeout_minutes: parse_var("LOCK_TIMEOUT_MINUTES", 60)?,
            zombie_threshold_minutes: parse_var("ZOMBIE_THRESHOLD_MINUTES", 10)?,
            health_check_interval_minutes: parse_var("HEALTH_CHECK_INTERVAL_MINUTES", 5)?,
            youtube,
            scripts: StageScripts {
                script_generator: env::var("SCRIPT_GENERATOR").unwrap_or(defaults.script_generator),
                image_crawler: env::var("IMAGE_CRAWLER").unwrap_or(defaults.image_crawler),
                video_creator: env::var("VIDEO_CREATOR").unwrap_or(defaults.video_creator),
                youtube_uploader: env::var("YOUTUBE_UPLOADER").unwrap_or(defaults.youtube_uploader),
            },
        })
    }

    /// Settings for tests: everything local to `root`, workers off
    #[cfg(test)]
    pub fn for_tests(root: &std::path::Path) -> Self {
        Self {
            secret_key: "test-secret".to_string(),
            port: 0,
            database_url: root.join("test.db").to_string_lossy().into_owned(),
            tasks_dir: root.join("tasks"),
            backend_dir: root.to_path_buf(),
            python_bin: "python".to_string(),
            workers_enabled: false,
            poll_interval_secs: 1,
            lock_timeout_minutes: 60,
            zombie_threshold_minutes: 10,
            health_check_interval_minutes: 0,
            youtube: None,
            scripts: StageScripts::default(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    parse_value(name, env::var(name).ok(), default)
}

fn parse_value<T: FromStr>(name: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} has an invalid value: {}", name, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_defaults_and_errors() {
        assert_eq!(parse_var("TRENDVID_TEST_UNSET_VAR", 42u64).unwrap(), 42);
        assert_eq!(parse_value("PORT", Some(" 9090 ".to_string()), 8080u16).unwrap(), 9090);
        assert!(parse_value::<u16>("PORT", Some("eighty".to_string()), 8080).is_err());
        assert!(!parse_value("WORKERS_ENABLED", Some("false".to_string()), true).unwrap());
    }

    #[test]
    fn test_scripts_per_stage() {
        let scripts = StageScripts::default();
        assert_eq!(scripts.for_stage(PipelineStage::Video), "create_video_from_folder.py");
        assert!(scripts.for_stage(PipelineStage::Youtube).ends_with("youtube_upload_cli.py"));
    }
}
