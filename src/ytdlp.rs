//! Thin async wrapper around the yt-dlp command line.
//!
//! The tool is treated as a black box: metadata and playlist listings come
//! back as JSON on stdout, downloads report progress one line at a time, and
//! every failure is described by whatever it printed on stderr.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{MedisError, Result};

/// Prefers H.264/AAC so the merged file plays in every browser.
pub const DOWNLOAD_FORMAT: &str =
    "bestvideo[vcodec^=avc1]+bestaudio[acodec^=mp4a]/best[vcodec^=avc1]/best[ext=mp4]/best";
const PROGRESS_TEMPLATE: &str = "download:%(progress._percent_str)s";
const PROGRESS_BUFFER: usize = 32;
const STDERR_TAIL_LINES: usize = 20;

/// Subset of `--dump-json` output the orchestrator cares about.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Metadata {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

/// One line of a `--flat-playlist --dump-json` listing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PlaylistItem {
    pub url: Option<String>,
    pub id: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadUpdate {
    /// Percent complete, 0 to 100.
    Progress(f64),
    /// Always the last message on the channel.
    Finished(Result<()>),
}

#[async_trait]
pub trait MediaDownloader: Send + Sync {
    async fn get_metadata(&self, url: &str) -> Result<Metadata>;

    async fn get_playlist_items(
        &self,
        url: &str,
        limit: Option<usize>,
    ) -> Result<Vec<PlaylistItem>>;

    /// Starts the download in the background. Progress updates may be dropped
    /// when the consumer lags; the final `Finished` never is.
    fn execute_download(&self, url: &str, output: &Path) -> mpsc::Receiver<DownloadUpdate>;

    async fn version(&self) -> anyhow::Result<String>;

    async fn update(&self) -> anyhow::Result<String>;
}

/// yt-dlp invoked as a child process.
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    cookies_file: PathBuf,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>, cookies_file: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            cookies_file: cookies_file.into(),
        }
    }

    /// Base command with the cookie jar attached when one is present. The
    /// file is looked up on every call so it can be dropped in at runtime.
    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.stdin(Stdio::null());
        if self.cookies_file.is_file() {
            command.arg("--cookies").arg(&self.cookies_file);
        }
        command
    }

    async fn run_to_completion(&self, mut command: Command) -> std::result::Result<String, String> {
        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| format!("failed to run {}: {err}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(if stderr.is_empty() {
                format!("yt-dlp exited with {}", output.status)
            } else {
                stderr
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl MediaDownloader for YtDlp {
    async fn get_metadata(&self, url: &str) -> Result<Metadata> {
        let mut command = self.command();
        command.args(["--dump-json", "--no-playlist", "--", url]);

        let stdout = self
            .run_to_completion(command)
            .await
            .map_err(MedisError::MetadataExtraction)?;
        serde_json::from_str(stdout.trim()).map_err(|err| {
            MedisError::MetadataExtraction(format!("yt-dlp returned invalid JSON: {err}"))
        })
    }

    async fn get_playlist_items(
        &self,
        url: &str,
        limit: Option<usize>,
    ) -> Result<Vec<PlaylistItem>> {
        let mut command = self.command();
        command.args(["--flat-playlist", "--dump-json"]);
        if let Some(limit) = limit {
            command.arg("--playlist-end").arg(limit.to_string());
        }
        command.args(["--", url]);

        let stdout = self
            .run_to_completion(command)
            .await
            .map_err(MedisError::PlaylistFetch)?;
        stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|err| {
                    MedisError::PlaylistFetch(format!("invalid playlist entry: {err}"))
                })
            })
            .collect()
    }

    fn execute_download(&self, url: &str, output: &Path) -> mpsc::Receiver<DownloadUpdate> {
        let mut command = self.command();
        command
            .args(["-f", DOWNLOAD_FORMAT, "-o"])
            .arg(output)
            .args([
                "--no-playlist",
                "--no-part",
                "--merge-output-format",
                "mp4",
                "--newline",
                "--progress-template",
                PROGRESS_TEMPLATE,
                "--",
                url,
            ]);

        let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
        let binary = self.binary.clone();
        tokio::spawn(async move {
            let result = run_download(command, &binary, &tx).await;
            if tx.send(DownloadUpdate::Finished(result)).await.is_err() {
                debug!("download result dropped, receiver gone");
            }
        });
        rx
    }

    async fn version(&self) -> anyhow::Result<String> {
        let mut command = Command::new(&self.binary);
        command.arg("--version");
        let stdout = self
            .run_to_completion(command)
            .await
            .map_err(anyhow::Error::msg)
            .context("querying yt-dlp version")?;
        let version = stdout.trim();
        if version.is_empty() {
            bail!("yt-dlp printed an empty version");
        }
        Ok(version.to_string())
    }

    async fn update(&self) -> anyhow::Result<String> {
        let mut command = Command::new(&self.binary);
        command.arg("--update");
        let stdout = self
            .run_to_completion(command)
            .await
            .map_err(anyhow::Error::msg)
            .context("updating yt-dlp")?;
        Ok(stdout.trim().to_string())
    }
}

async fn run_download(
    mut command: Command,
    binary: &Path,
    progress: &mpsc::Sender<DownloadUpdate>,
) -> Result<()> {
    // Shutting down mid-download must not leave yt-dlp writing into videos/.
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            MedisError::DownloadExecution(format!(
                "failed to start {}: {err}",
                binary.display()
            ))
        })?;

    let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(stderr_tail(stderr)));

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(percent) = parse_progress_line(&line) {
                        // Dropped when the consumer lags.
                        let _ = progress.try_send(DownloadUpdate::Progress(percent));
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "failed to read yt-dlp output");
                    break;
                }
            }
        }
    }

    let status = child.wait().await.map_err(|err| {
        MedisError::DownloadExecution(format!("failed to wait for yt-dlp: {err}"))
    })?;
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    if status.success() {
        return Ok(());
    }
    Err(MedisError::DownloadExecution(if stderr.is_empty() {
        format!("yt-dlp exited with {status}")
    } else {
        stderr
    }))
}

/// Keeps the last few stderr lines; that is where yt-dlp reports failures.
async fn stderr_tail<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n").trim().to_string()
}

/// Understands both the templated `download: 42.0%` lines and yt-dlp's
/// default `[download]  42.0% of ...` output.
pub fn parse_progress_line(line: &str) -> Option<f64> {
    let line = line.trim();
    let token = if let Some(rest) = line.strip_prefix("download:") {
        rest.trim()
    } else if let Some(rest) = line.strip_prefix("[download]") {
        rest.split_whitespace().next()?
    } else {
        return None;
    };
    let percent = token.strip_suffix('%')?.trim().parse::<f64>().ok()?;
    (0.0..=100.0).contains(&percent).then_some(percent)
}
