//! Thin wrapper around the `yt-dlp` command-line tool.
//!
//! The server never links against yt-dlp; it only looks at the exit status,
//! stdout and stderr of two invocations: a metadata dump (`-j`) and the actual
//! download into a path we choose. Both runs are bounded by a timeout after
//! which the child is killed.

use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_TOOL, DOWNLOAD_TIMEOUT_SECS, METADATA_TIMEOUT_SECS};
use crate::error::DownloadError;

/// Best separate video and audio streams, falling back to the best muxed one.
pub const FORMAT_SELECTOR: &str = "bestvideo+bestaudio/best";
pub const MERGE_FORMAT: &str = "mp4";
pub const SOCKET_TIMEOUT_SECS: u64 = 30;
const LOG_SNIPPET_CHARS: usize = 200;

/// How to launch the tool and how long each kind of run may take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    pub program: PathBuf,
    /// Arguments placed before every invocation, e.g. `-m yt_dlp` when the
    /// program is a python interpreter.
    pub leading_args: Vec<String>,
    pub metadata_timeout: Duration,
    pub download_timeout: Duration,
    pub socket_timeout_secs: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_TOOL),
            leading_args: Vec::new(),
            metadata_timeout: Duration::from_secs(METADATA_TIMEOUT_SECS),
            download_timeout: Duration::from_secs(DOWNLOAD_TIMEOUT_SECS),
            socket_timeout_secs: SOCKET_TIMEOUT_SECS,
        }
    }
}

impl ToolConfig {
    /// Human readable command prefix for log lines.
    pub fn display(&self) -> String {
        let mut printable = self.program.display().to_string();
        for arg in &self.leading_args {
            printable.push(' ');
            printable.push_str(arg);
        }
        printable
    }

    /// Blocking variant used by the startup checks.
    pub fn std_command(&self) -> std::process::Command {
        let mut command = std::process::Command::new(&self.program);
        command.args(&self.leading_args);
        command
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed while waiting on {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {}s", .timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },
}

/// Captured result of a run that exited on its own.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Best text to show a user when the run failed: stderr, then stdout,
    /// then `fallback`.
    pub fn failure_text(&self, fallback: &str) -> String {
        [self.stderr.trim(), self.stdout.trim()]
            .into_iter()
            .find(|text| !text.is_empty())
            .unwrap_or(fallback)
            .to_string()
    }
}

impl From<std::process::Output> for ToolOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Runs `command` to completion with stdout/stderr captured.
///
/// A non-zero exit is still `Ok`; callers inspect [`ToolOutput::success`].
/// When `timeout` elapses first the child is killed and
/// [`ToolError::TimedOut`] is returned.
pub async fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
) -> Result<ToolOutput, ToolError> {
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|source| ToolError::Spawn {
        program: program.clone(),
        source,
    })?;

    // Dropping the wait future on timeout drops the child, which kills it.
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output.into()),
        Ok(Err(source)) => Err(ToolError::Wait { program, source }),
        Err(_) => {
            warn!(%program, timeout_secs = timeout.as_secs(), "killing timed out process");
            Err(ToolError::TimedOut { program, timeout })
        }
    }
}

/// The handful of `yt-dlp -j` fields the front-end shows.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
}

impl VideoInfo {
    /// Parses the first JSON document printed by `yt-dlp -j`.
    pub fn parse(stdout: &str) -> Result<Self, DownloadError> {
        serde_json::Deserializer::from_str(stdout)
            .into_iter::<VideoInfo>()
            .next()
            .and_then(Result::ok)
            .ok_or(DownloadError::InvalidInfo)
    }

    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or("video")
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration
            .filter(|value| value.is_finite() && *value > 0.0)
            .unwrap_or(0.0)
    }

    pub fn thumbnail(&self) -> &str {
        self.thumbnail.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    config: ToolConfig,
}

impl YtDlp {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.config.program);
        command.args(&self.config.leading_args);
        command
    }

    /// Runs `yt-dlp -j` for `url`. The selector and merge format match
    /// [`YtDlp::download`] so the reported `ext` is the container that will be
    /// written.
    pub async fn fetch_info(&self, url: &str) -> Result<VideoInfo, DownloadError> {
        let mut command = self.command();
        command
            .arg("-j")
            .arg("--no-warnings")
            .arg("--no-playlist")
            .arg("--format")
            .arg(FORMAT_SELECTOR)
            .arg("--merge-output-format")
            .arg(MERGE_FORMAT)
            .arg("--")
            .arg(url);

        let output = run_with_timeout(command, self.config.metadata_timeout)
            .await
            .map_err(DownloadError::from_metadata_run)?;

        if !output.success() {
            let message = output.failure_text("Failed to get video info");
            warn!(%url, status = %output.status, error = %snippet(&message), "metadata lookup failed");
            return Err(DownloadError::MetadataFailed(message));
        }

        let info = VideoInfo::parse(&output.stdout)?;
        info!(
            %url,
            title = info.title(),
            duration = info.duration_secs(),
            "fetched video info"
        );
        Ok(info)
    }

    /// Downloads `url` into exactly `dest`. Leftovers are removed on failure.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<(), DownloadError> {
        let mut command = self.command();
        command
            .arg("--format")
            .arg(FORMAT_SELECTOR)
            .arg("--output")
            .arg(dest)
            .arg("--no-warnings")
            .arg("--socket-timeout")
            .arg(self.config.socket_timeout_secs.to_string())
            .arg("--no-part")
            .arg("--quiet")
            .arg("--merge-output-format")
            .arg(MERGE_FORMAT)
            .arg("--no-playlist")
            .arg("--")
            .arg(url);

        info!(%url, dest = %dest.display(), "starting download");
        let output = match run_with_timeout(command, self.config.download_timeout).await {
            Ok(output) => output,
            Err(err) => {
                discard(dest).await;
                return Err(DownloadError::from_download_run(err));
            }
        };

        debug!(status = %output.status, "download process exited");
        if !output.stderr.trim().is_empty() {
            debug!(stderr = %snippet(&output.stderr), "download stderr");
        }
        if !output.stdout.trim().is_empty() {
            debug!(stdout = %snippet(&output.stdout), "download stdout");
        }

        if !output.success() {
            let message = output.failure_text("Download failed");
            warn!(%url, status = %output.status, error = %snippet(&message), "download failed");
            discard(dest).await;
            return Err(DownloadError::DownloadFailed(message));
        }

        Ok(())
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed leftover file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), %err, "could not remove leftover file"),
    }
}

fn snippet(text: &str) -> String {
    text.trim().chars().take(LOG_SNIPPET_CHARS).collect()
}
