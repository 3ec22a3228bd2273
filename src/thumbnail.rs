//! Best-effort thumbnail download.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::warn;
use uuid::Uuid;

pub const MAX_THUMBNAIL_BYTES: u64 = 5 * 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn thumbnail_filename(id: Uuid) -> String {
    format!("{id}-thumb.jpg")
}

#[derive(Debug, Clone)]
pub struct ThumbnailFetcher {
    agent: ureq::Agent,
    dir: PathBuf,
}

impl ThumbnailFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("medis/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            agent,
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stores the image as `thumbnails/{id}-thumb.jpg` and returns its public
    /// path, or an empty string when anything goes wrong. Partial files never
    /// survive a failure.
    pub async fn download(&self, remote_url: &str, id: Uuid) -> String {
        if remote_url.trim().is_empty() {
            return String::new();
        }

        let filename = thumbnail_filename(id);
        let dest = self.dir.join(&filename);
        let agent = self.agent.clone();
        let url = remote_url.to_string();
        let target = dest.clone();
        let outcome = tokio::task::spawn_blocking(move || fetch_to_file(&agent, &url, &target))
            .await
            .context("thumbnail task panicked")
            .and_then(|result| result);

        match outcome {
            Ok(()) => format!("/thumbnails/{filename}"),
            Err(err) => {
                warn!(video_id = %id, url = remote_url, error = %err, "thumbnail download failed");
                remove_partial(&dest);
                String::new()
            }
        }
    }
}

fn fetch_to_file(agent: &ureq::Agent, url: &str, dest: &Path) -> Result<()> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("requesting {url}"))?;

    if let Some(declared) = response
        .header("Content-Length")
        .and_then(|value| value.trim().parse::<u64>().ok())
        && declared > MAX_THUMBNAIL_BYTES
    {
        bail!("thumbnail declares {declared} bytes, limit is {MAX_THUMBNAIL_BYTES}");
    }

    let mut reader = response.into_reader().take(MAX_THUMBNAIL_BYTES + 1);
    let mut file =
        File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
    let written = io::copy(&mut reader, &mut file).context("writing thumbnail")?;
    if written > MAX_THUMBNAIL_BYTES {
        bail!("thumbnail exceeds {MAX_THUMBNAIL_BYTES} bytes");
    }
    file.flush()?;
    Ok(())
}

fn remove_partial(path: &Path) {
    if let Err(err) = fs::remove_file(path)
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %err, "failed to remove partial thumbnail");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    pub(crate) const IMAGE_BYTES: &[u8] = b"\xff\xd8\xff\xe0fake-jpeg";

    /// Serves `/image.jpg`, `/broken` (500), `/huge` (declared oversized) and
    /// `/endless` (chunked, no length, oversized).
    pub(crate) async fn spawn_image_server() -> Result<String> {
        let app = Router::new()
            .route("/image.jpg", get(|| async { IMAGE_BYTES }))
            .route(
                "/broken",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            )
            .route(
                "/huge",
                get(|| async { vec![0_u8; MAX_THUMBNAIL_BYTES as usize + 1] }),
            )
            .route(
                "/endless",
                get(|| async {
                    let chunks = (0..6).map(|_| Ok::<_, io::Error>(vec![7_u8; 1024 * 1024]));
                    Body::from_stream(futures::stream::iter(chunks))
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(format!("http://{addr}"))
    }

    #[tokio::test]
    async fn stores_image_and_returns_public_path() -> Result<()> {
        let base = spawn_image_server().await?;
        let temp = tempdir()?;
        let fetcher = ThumbnailFetcher::new(temp.path());
        let id = Uuid::new_v4();

        let path = fetcher.download(&format!("{base}/image.jpg"), id).await;
        assert_eq!(path, format!("/thumbnails/{id}-thumb.jpg"));
        assert_eq!(fs::read(temp.path().join(thumbnail_filename(id)))?, IMAGE_BYTES);
        Ok(())
    }

    #[tokio::test]
    async fn server_error_yields_empty_path() -> Result<()> {
        let base = spawn_image_server().await?;
        let temp = tempdir()?;
        let fetcher = ThumbnailFetcher::new(temp.path());
        let id = Uuid::new_v4();

        assert_eq!(fetcher.download(&format!("{base}/broken"), id).await, "");
        assert!(!temp.path().join(thumbnail_filename(id)).exists());
        Ok(())
    }

    #[tokio::test]
    async fn declared_oversize_is_rejected() -> Result<()> {
        let base = spawn_image_server().await?;
        let temp = tempdir()?;
        let fetcher = ThumbnailFetcher::new(temp.path());
        let id = Uuid::new_v4();

        assert_eq!(fetcher.download(&format!("{base}/huge"), id).await, "");
        assert!(!temp.path().join(thumbnail_filename(id)).exists());
        Ok(())
    }

    #[tokio::test]
    async fn streamed_oversize_is_rejected_and_partial_removed() -> Result<()> {
        let base = spawn_image_server().await?;
        let temp = tempdir()?;
        let fetcher = ThumbnailFetcher::new(temp.path());
        let id = Uuid::new_v4();

        assert_eq!(fetcher.download(&format!("{base}/endless"), id).await, "");
        assert!(!temp.path().join(thumbnail_filename(id)).exists());
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_host_and_empty_url_yield_empty_path() -> Result<()> {
        let temp = tempdir()?;
        let fetcher = ThumbnailFetcher::new(temp.path());

        assert_eq!(fetcher.download("", Uuid::new_v4()).await, "");
        assert_eq!(
            fetcher
                .download("http://127.0.0.1:9/nothing.jpg", Uuid::new_v4())
                .await,
            ""
        );
        Ok(())
    }
}
