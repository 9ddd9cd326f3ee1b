//! Stage execution
//!
//! A [`StageRunner`] runs one stage for one task. The default
//! [`CommandRunner`] spawns the stage's Python script and streams its output
//! into the task's stage log.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::artifacts::{append_content_log, load_valid_story, story_path, task_folder};
use crate::config::{Config, StageScripts};
use crate::error::{Error, Result};
use crate::jobs::JobRegistry;
use crate::models::{PipelineStage, QueueTask};
use crate::youtube::TokenRefresher;

const STDERR_TAIL_LINES: usize = 20;

static YOUTUBE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://(?:www\.)?(?:youtube\.com/watch\?v=|youtu\.be/)[A-Za-z0-9_\-]+").unwrap()
});

/// Everything a runner needs to know about the task it is running
#[derive(Debug, Clone)]
pub struct StageContext {
    pub task: QueueTask,
    pub stage: PipelineStage,
    pub title: String,
    pub prompt_format: Option<String>,
    pub media_mode: String,
    pub privacy: String,
    pub cancel: CancellationToken,
}

impl StageContext {
    pub fn task_id(&self) -> &str {
        &self.task.task_id
    }

    pub fn is_longform(&self) -> bool {
        self.prompt_format.as_deref() == Some("longform")
    }
}

#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub lines: usize,
    pub youtube_url: Option<String>,
}

#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, ctx: &StageContext) -> Result<StageOutput>;
}

/// Runs `python <script> <args>` in the backend directory
pub struct CommandRunner {
    python_bin: String,
    backend_dir: PathBuf,
    tasks_dir: PathBuf,
    scripts: StageScripts,
    registry: Arc<JobRegistry>,
    tokens: Option<Arc<TokenRefresher>>,
}

impl CommandRunner {
    pub fn new(
        config: &Config,
        registry: Arc<JobRegistry>,
        tokens: Option<Arc<TokenRefresher>>,
    ) -> Self {
        Self {
            python_bin: config.python_bin.clone(),
            backend_dir: config.backend_dir.clone(),
            tasks_dir: config.tasks_dir.clone(),
            scripts: config.scripts.clone(),
            registry,
            tokens,
        }
    }

    /// Script arguments for the stage, script path first
    pub fn stage_args(&self, ctx: &StageContext) -> Result<Vec<String>> {
        let script = self
            .backend_dir
            .join(self.scripts.for_stage(ctx.stage))
            .to_string_lossy()
            .into_owned();
        let task_id = ctx.task_id().to_string();

        let args = match ctx.stage {
            PipelineStage::Script => vec![
                script,
                task_id,
                ctx.title.clone(),
                ctx.prompt_format.clone().unwrap_or_default(),
            ],
            PipelineStage::Image => {
                if load_valid_story(&self.tasks_dir, &task_id).is_none() {
                    return Err(Error::validation(format!(
                        "story.json missing or has no scenes for {}",
                        task_id
                    )));
                }
                let mut args = vec![
                    script,
                    path_arg(&story_path(&self.tasks_dir, &task_id)),
                    "--output-dir".to_string(),
                    path_arg(&task_folder(&self.tasks_dir, &task_id)),
                    "--aspect-ratio".to_string(),
                    if ctx.is_longform() { "16:9" } else { "9:16" }.to_string(),
                ];
                if ctx.is_longform() {
                    args.push("--use-imagefx".to_string());
                }
                args
            }
            PipelineStage::Video => vec![script, task_id],
            PipelineStage::Youtube => vec![script, task_id, ctx.title.clone(), ctx.privacy.clone()],
        };
        Ok(args)
    }

    fn log_line(&self, ctx: &StageContext, line: &str) {
        if let Err(e) = append_content_log(&self.tasks_dir, ctx.task_id(), ctx.stage, line) {
            log::warn!("[WORKER:{}] Log write failed for {}: {}", ctx.stage, ctx.task_id(), e);
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// One output line without its line ending, invalid UTF-8 replaced
fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

/// The upload script reports a rejected token as an HTTP 401
fn is_auth_failure(line: &str) -> bool {
    line.contains("401") || line.contains("invalid_grant") || line.contains("Unauthorized")
}

/// First YouTube watch URL in a line of output
pub fn extract_youtube_url(line: &str) -> Option<String> {
    YOUTUBE_URL.find(line).map(|m| m.as_str().to_string())
}

#[async_trait]
impl StageRunner for CommandRunner {
    async fn run(&self, ctx: &StageContext) -> Result<StageOutput> {
        let args = self.stage_args(ctx)?;
        let python = which::which(&self.python_bin).unwrap_or_else(|_| PathBuf::from(&self.python_bin));

        let mut cmd = Command::new(&python);
        cmd.args(&args)
            .current_dir(&self.backend_dir)
            .env("PYTHONPATH", &self.backend_dir)
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if ctx.stage == PipelineStage::Youtube {
            if let Some(tokens) = &self.tokens {
                cmd.env("YOUTUBE_ACCESS_TOKEN", tokens.access_token().await?);
            }
        }

        log::info!(
            "[WORKER:{}] {} {}",
            ctx.stage,
            python.display(),
            args.join(" ")
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::process(format!("failed to start {}: {}", python.display(), e)))?;
        self.registry.set_pid(ctx.task_id(), child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::process("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::process("stderr not captured"))?;
        let mut stdout = BufReader::new(stdout);
        let mut stderr = BufReader::new(stderr);
        let (mut out_buf, mut err_buf) = (Vec::new(), Vec::new());

        let mut output = StageOutput::default();
        let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let (mut out_open, mut err_open) = (true, true);

        // Output is decoded lossily: the scripts print in whatever code page
        // the console uses. A broken pipe only closes that stream.
        while out_open || err_open {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(Error::Cancelled(format!("{} stage of {}", ctx.stage, ctx.task_id())));
                }
                read = stdout.read_until(b'\n', &mut out_buf), if out_open => {
                    match read {
                        Ok(0) => out_open = false,
                        Ok(_) => {
                            let line = decode_line(&out_buf);
                            out_buf.clear();
                            output.lines += 1;
                            if output.youtube_url.is_none() {
                                output.youtube_url = extract_youtube_url(&line);
                            }
                            self.log_line(ctx, &line);
                        }
                        Err(e) => {
                            log::warn!("[WORKER:{}] stdout read failed for {}: {}", ctx.stage, ctx.task_id(), e);
                            out_open = false;
                        }
                    }
                }
                read = stderr.read_until(b'\n', &mut err_buf), if err_open => {
                    match read {
                        Ok(0) => err_open = false,
                        Ok(_) => {
                            let line = decode_line(&err_buf);
                            err_buf.clear();
                            self.log_line(ctx, &format!("[stderr] {}", line));
                            if stderr_tail.len() == STDERR_TAIL_LINES {
                                stderr_tail.pop_front();
                            }
                            stderr_tail.push_back(line);
                        }
                        Err(e) => {
                            log::warn!("[WORKER:{}] stderr read failed for {}: {}", ctx.stage, ctx.task_id(), e);
                            err_open = false;
                        }
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(Error::Cancelled(format!("{} stage of {}", ctx.stage, ctx.task_id())));
            }
            status = child.wait() => status?,
        };

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let tail: Vec<String> = stderr_tail.into_iter().collect();

            if ctx.stage == PipelineStage::Youtube && tail.iter().any(|l| is_auth_failure(l)) {
                if let Some(tokens) = &self.tokens {
                    log::warn!("[WORKER:{}] Upload rejected the access token, dropping it", ctx.stage);
                    tokens.invalidate().await;
                }
            }

            return Err(Error::process(format!(
                "{} exited with code {}\n{}",
                ctx.stage.label(),
                code,
                tail.join("\n")
            )));
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(stage: PipelineStage, prompt_format: Option<&str>) -> StageContext {
        StageContext {
            task: QueueTask {
                task_id: "t1".to_string(),
                stage,
                state: crate::models::TaskState::Processing,
                created_at: "2026-01-01T00:00:00Z".to_string(),
                started_at: None,
                completed_at: None,
                updated_at: None,
                user_id: "u1".to_string(),
                error: None,
                metadata: json!({}),
                logs: vec![],
            },
            stage,
            title: "My video".to_string(),
            prompt_format: prompt_format.map(str::to_string),
            media_mode: "crawl".to_string(),
            privacy: "public".to_string(),
            cancel: CancellationToken::new(),
        }
    }

    fn runner(root: &Path) -> CommandRunner {
        CommandRunner::new(&Config::for_tests(root), Arc::new(JobRegistry::new()), None)
    }

    #[test]
    fn test_youtube_url_extraction() {
        assert_eq!(
            extract_youtube_url("Uploaded: https://www.youtube.com/watch?v=abc_123-X done").as_deref(),
            Some("https://www.youtube.com/watch?v=abc_123-X")
        );
        assert_eq!(
            extract_youtube_url("short https://youtu.be/Zz9").as_deref(),
            Some("https://youtu.be/Zz9")
        );
        assert!(extract_youtube_url("no link here").is_none());
    }

    #[test]
    fn test_image_stage_requires_story() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let ctx = context(PipelineStage::Image, Some("longform"));
        assert!(matches!(runner.stage_args(&ctx), Err(Error::Validation(_))));

        let folder = dir.path().join("tasks").join("t1");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("story.json"), r#"{"scenes":[{"text":"a"}]}"#).unwrap();

        let args = runner.stage_args(&ctx).unwrap();
        assert!(args[1].ends_with("story.json"));
        assert!(args.windows(2).any(|w| w[0] == "--aspect-ratio" && w[1] == "16:9"));
        assert_eq!(args.last().map(String::as_str), Some("--use-imagefx"));
    }

    #[test]
    fn test_stage_args_per_stage() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        let script = runner.stage_args(&context(PipelineStage::Script, Some("shortform"))).unwrap();
        assert_eq!(&script[1..], &["t1", "My video", "shortform"]);

        let video = runner.stage_args(&context(PipelineStage::Video, None)).unwrap();
        assert_eq!(&video[1..], &["t1"]);

        let upload = runner.stage_args(&context(PipelineStage::Youtube, None)).unwrap();
        assert_eq!(&upload[1..], &["t1", "My video", "public"]);
    }

    /// Runner whose script stage is `sh <root>/stage.sh` with the given body
    #[cfg(unix)]
    fn shell_runner(root: &Path, body: &str) -> CommandRunner {
        std::fs::write(root.join("stage.sh"), body).unwrap();
        let mut config = Config::for_tests(root);
        config.python_bin = "sh".to_string();
        config.scripts.script_generator = "stage.sh".to_string();
        CommandRunner::new(&config, Arc::new(JobRegistry::new()), None)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_streams_output_into_stage_log() {
        let dir = tempfile::tempdir().unwrap();
        let runner = shell_runner(
            dir.path(),
            "printf 'progress \\377\\376 50%%\\n'\n\
             echo 'Uploaded https://youtu.be/abc123'\n\
             echo 'slow network' >&2\n\
             exit 0\n",
        );

        let output = runner
            .run(&context(PipelineStage::Script, Some("shortform")))
            .await
            .unwrap();
        assert_eq!(output.lines, 2);
        assert_eq!(output.youtube_url.as_deref(), Some("https://youtu.be/abc123"));

        let log = std::fs::read_to_string(dir.path().join("tasks").join("t1").join("script.log")).unwrap();
        assert!(log.contains("progress \u{FFFD}\u{FFFD} 50%"));
        assert!(log.contains("[stderr] slow network"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_exit_code_and_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let runner = shell_runner(dir.path(), "echo 'story.json not found' >&2\nexit 3\n");

        let err = runner
            .run(&context(PipelineStage::Script, None))
            .await
            .unwrap_err();
        match err {
            Error::Process(msg) => {
                assert!(msg.contains("code 3"));
                assert!(msg.contains("story.json not found"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_is_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let runner = shell_runner(dir.path(), "exec sleep 30\n");
        let ctx = context(PipelineStage::Script, None);

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let result = tokio::time::timeout(std::time::Duration::from_secs(10), runner.run(&ctx))
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }

    #[test]
    fn test_decode_line_is_lossy() {
        assert_eq!(decode_line(b"ok\r\n"), "ok");
        assert_eq!(decode_line(b"a\xffb\n"), "a\u{FFFD}b");
        assert!(is_auth_failure("HttpError 401 when requesting upload"));
        assert!(!is_auth_failure("quota exceeded"));
    }
}
