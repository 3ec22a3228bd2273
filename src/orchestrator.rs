//! Drives jobs from an accepted URL to a persisted video.
//!
//! Exactly one job runs at a time. Each run walks
//! `FETCHING_METADATA -> FETCHING_THUMBNAIL -> DOWNLOADING -> PROCESSING`
//! and always ends in the shared cleanup path, which releases the lane and
//! starts the next queued job.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{MedisError, Result, UNKNOWN_DOWNLOAD_ERROR};
use crate::notifier::{LiveEvent, Notifier, ProgressStage};
use crate::queue::{Job, QueueService};
use crate::security::{is_playlist_url, is_valid_url};
use crate::store::{DEFAULT_HEIGHT, DEFAULT_TITLE, DEFAULT_WIDTH, VideoRecord, VideoRepository};
use crate::thumbnail::{ThumbnailFetcher, thumbnail_filename};
use crate::ytdlp::{DownloadUpdate, MediaDownloader, Metadata};

pub const INVALID_URL_MESSAGE: &str = "URL is invalid or not allowed.";

/// Reply for an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub message: String,
    pub jobs: Vec<Uuid>,
}

#[derive(Clone)]
pub struct Orchestrator {
    downloader: Arc<dyn MediaDownloader>,
    repository: Arc<dyn VideoRepository>,
    queue: Arc<QueueService>,
    notifier: Notifier,
    thumbnails: ThumbnailFetcher,
    videos_dir: PathBuf,
    playlist_limit: Option<usize>,
}

impl Orchestrator {
    pub fn new(
        downloader: Arc<dyn MediaDownloader>,
        repository: Arc<dyn VideoRepository>,
        queue: Arc<QueueService>,
        notifier: Notifier,
        thumbnails: ThumbnailFetcher,
        videos_dir: impl Into<PathBuf>,
        playlist_limit: Option<usize>,
    ) -> Self {
        Self {
            downloader,
            repository,
            queue,
            notifier,
            thumbnails,
            videos_dir: videos_dir.into(),
            playlist_limit,
        }
    }

    pub fn queue(&self) -> &QueueService {
        &self.queue
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Validates and admits a URL. Playlists expand into one job per entry.
    pub async fn submit(&self, raw_url: &str) -> Result<Accepted> {
        let url = raw_url.trim();
        if !is_valid_url(url) {
            return Err(MedisError::validation(INVALID_URL_MESSAGE));
        }
        if is_playlist_url(url) {
            return self.submit_playlist(url).await;
        }

        let job = Job::new(url);
        let id = job.id;
        let started = self.admit(vec![job])?;
        let message = if started.is_some_and(|started| started == id) {
            "Download initiated"
        } else {
            "Download has been added to the queue"
        };
        info!(video_id = %id, url, "{message}");
        Ok(Accepted {
            message: message.to_string(),
            jobs: vec![id],
        })
    }

    async fn submit_playlist(&self, url: &str) -> Result<Accepted> {
        info!(url, limit = ?self.playlist_limit, "expanding playlist");
        let items = self
            .downloader
            .get_playlist_items(url, self.playlist_limit)
            .await
            .map_err(classify_playlist_error)?;

        let jobs: Vec<Job> = items
            .into_iter()
            .filter_map(|item| item.url)
            .filter(|entry| !entry.trim().is_empty())
            .map(Job::new)
            .collect();
        if jobs.is_empty() {
            return Err(MedisError::not_found(
                "Could not find any videos in the provided playlist",
            ));
        }

        let ids: Vec<Uuid> = jobs.iter().map(|job| job.id).collect();
        self.admit(jobs)?;
        Ok(Accepted {
            message: format!("Playlist processed. Added {} videos to the queue", ids.len()),
            jobs: ids,
        })
    }

    /// Enqueues under the queue lock, broadcasts the new counters and starts
    /// the lane if it was idle. Returns the id of the job that was started.
    fn admit(&self, jobs: Vec<Job>) -> Result<Option<Uuid>> {
        let admission = self
            .queue
            .admit(jobs, |stats| self.notifier.update_status(stats))
            .inspect_err(|err| {
                warn!(limit = ?self.queue.max_limit(), "{err}");
            })?;
        let started = admission.started.map(|job| {
            let id = job.id;
            self.spawn_lane(job);
            id
        });
        Ok(started)
    }

    /// Runs `job` and then keeps draining the queue until it is empty.
    fn spawn_lane(&self, job: Job) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut current = job;
            loop {
                this.run_isolated(&current).await;

                let (_, next) = this
                    .queue
                    .release(|stats| this.notifier.update_status(stats));
                let Some((next, stats)) = next else {
                    break;
                };
                info!(video_id = %next.id, queued = stats.queued, "starting next queued download");
                current = next;
            }
        });
    }

    /// Runs the job on its own task so a panic inside it is reported as a
    /// failed job instead of taking the lane down with it.
    async fn run_isolated(&self, job: &Job) {
        let this = self.clone();
        let owned = job.clone();
        if let Err(err) = tokio::spawn(async move { this.run(&owned).await }).await {
            error!(video_id = %job.id, error = %err, "download task aborted");
            self.notifier.publish(LiveEvent::DownloadError {
                message: UNKNOWN_DOWNLOAD_ERROR.to_string(),
                video_id: job.id,
            });
            self.remove_job_files(job.id);
        }
    }

    /// One job, start to terminal state. Never returns an error: failures
    /// are reported to observers and cleaned up here.
    async fn run(&self, job: &Job) {
        info!(video_id = %job.id, url = %job.url, "download started");
        match self.process(job).await {
            Ok(record) => match self.repository.create(&record).await {
                Ok(()) => {
                    info!(video_id = %job.id, title = %record.title, "download complete");
                    self.notifier
                        .publish(LiveEvent::DownloadComplete { video: record });
                }
                Err(err) => {
                    // The file stays on disk until startup reconciliation.
                    let err = MedisError::Persistence(format!("{err:#}"));
                    error!(video_id = %job.id, "{err}");
                    self.notifier.publish(LiveEvent::DownloadError {
                        message: UNKNOWN_DOWNLOAD_ERROR.to_string(),
                        video_id: job.id,
                    });
                }
            },
            Err(err) => {
                error!(video_id = %job.id, error = %err, "download failed");
                self.notifier.publish(LiveEvent::DownloadError {
                    message: err.user_message().to_string(),
                    video_id: job.id,
                });
                self.remove_job_files(job.id);
            }
        }
    }

    async fn process(&self, job: &Job) -> Result<VideoRecord> {
        self.progress(job.id, ProgressStage::FetchingMetadata, "Fetching Video Info", Some(0.0));
        let metadata = self.downloader.get_metadata(&job.url).await?;

        self.progress(job.id, ProgressStage::FetchingThumbnail, "Fetching Thumbnail", None);
        let thumbnail_url = match metadata.thumbnail.as_deref() {
            Some(remote) => self.thumbnails.download(remote, job.id).await,
            None => String::new(),
        };

        let filename = VideoRecord::video_filename(job.id);
        self.download(job, &self.videos_dir.join(&filename)).await?;

        self.progress(job.id, ProgressStage::Processing, "Processing Video", Some(100.0));
        Ok(build_record(job, metadata, filename, thumbnail_url))
    }

    async fn download(&self, job: &Job, output: &Path) -> Result<()> {
        let mut updates = self.downloader.execute_download(&job.url, output);
        while let Some(update) = updates.recv().await {
            match update {
                DownloadUpdate::Progress(percent) => self.progress(
                    job.id,
                    ProgressStage::Downloading,
                    format!("Downloading Video {}%", percent.floor()),
                    Some(percent),
                ),
                DownloadUpdate::Finished(result) => return result,
            }
        }
        Err(MedisError::DownloadExecution(
            "download ended without reporting a result".into(),
        ))
    }

    fn progress(
        &self,
        id: Uuid,
        stage: ProgressStage,
        message: impl Into<String>,
        percent: Option<f64>,
    ) {
        self.notifier
            .publish(LiveEvent::progress(id, stage, message, percent));
    }

    /// Best-effort removal of partial output and of the thumbnail fetched for
    /// a failed job.
    fn remove_job_files(&self, id: Uuid) {
        let prefix = id.to_string();
        match fs::read_dir(&self.videos_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    if entry.file_name().to_string_lossy().starts_with(&prefix)
                        && let Err(err) = fs::remove_file(entry.path())
                    {
                        warn!(path = %entry.path().display(), error = %err, "cleanup failed");
                    }
                }
            }
            Err(err) => {
                warn!(dir = %self.videos_dir.display(), error = %err, "cleanup skipped");
            }
        }

        let thumbnail = self.thumbnails.dir().join(thumbnail_filename(id));
        if thumbnail.exists()
            && let Err(err) = fs::remove_file(&thumbnail)
        {
            warn!(path = %thumbnail.display(), error = %err, "cleanup failed");
        }
    }
}

fn build_record(
    job: &Job,
    metadata: Metadata,
    filename: String,
    thumbnail_url: String,
) -> VideoRecord {
    VideoRecord {
        id: job.id,
        title: metadata
            .title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string()),
        original_url: job.url.clone(),
        filename,
        thumbnail_url,
        created_at: Utc::now(),
        width: metadata.width.filter(|w| *w > 0).unwrap_or(DEFAULT_WIDTH),
        height: metadata.height.filter(|h| *h > 0).unwrap_or(DEFAULT_HEIGHT),
    }
}

fn classify_playlist_error(err: MedisError) -> MedisError {
    let raw = err.to_string();
    error!(error = %raw, "failed to list playlist");
    let lowered = raw.to_lowercase();
    if lowered.contains("sign in") || lowered.contains("private") {
        MedisError::AccessDenied("This playlist is private or requires login".into())
    } else {
        MedisError::PlaylistFetch(
            "Failed to fetch playlist details. The playlist may be empty or invalid".into(),
        )
    }
}
