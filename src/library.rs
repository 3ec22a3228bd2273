//! User-facing operations on the stored library: listing, deletion and the
//! startup sweep that removes files no record points at.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::StoragePaths;
use crate::error::{MedisError, Result};
use crate::notifier::{LiveEvent, Notifier};
use crate::store::{VideoRecord, VideoRepository};

const DELETE_FAILED: &str = "Failed to delete video due to a server error";

#[derive(Clone)]
pub struct Library {
    repository: Arc<dyn VideoRepository>,
    notifier: Notifier,
    paths: StoragePaths,
}

impl Library {
    pub fn new(repository: Arc<dyn VideoRepository>, notifier: Notifier, paths: StoragePaths) -> Self {
        Self {
            repository,
            notifier,
            paths,
        }
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    pub async fn list(&self) -> anyhow::Result<Vec<VideoRecord>> {
        self.repository.find_all().await
    }

    pub async fn find(&self, id: Uuid) -> anyhow::Result<Option<VideoRecord>> {
        self.repository.find_by_id(id).await
    }

    /// Removes the files first, then the row, then tells observers. An
    /// unknown id touches nothing.
    pub async fn delete_video(&self, id: Uuid) -> Result<()> {
        let record = self
            .repository
            .find_by_id(id)
            .await
            .map_err(|err| persistence_failure(id, err))?
            .ok_or_else(|| MedisError::not_found("Video not found"))?;

        let mut files = Vec::new();
        if let Some(name) = file_component(&record.filename) {
            files.push(self.paths.videos.join(name));
        }
        if let Some(name) = file_component(&record.thumbnail_url) {
            files.push(self.paths.thumbnails.join(name));
        }
        for path in files {
            remove_if_present(&path).map_err(|err| {
                error!(video_id = %id, path = %path.display(), error = %err, "failed to delete file");
                MedisError::Persistence(DELETE_FAILED.into())
            })?;
        }

        let removed = self
            .repository
            .delete(id)
            .await
            .map_err(|err| persistence_failure(id, err))?;
        if !removed {
            return Err(MedisError::not_found("Video not found"));
        }

        info!(video_id = %id, title = %record.title, "video deleted");
        self.notifier.publish(LiveEvent::VideoDeleted { video_id: id });
        Ok(())
    }

    /// Deletes every file in `videos/` and `thumbnails/` that no record
    /// references. Returns how many files were removed.
    pub async fn reconcile_orphans(&self) -> anyhow::Result<usize> {
        let records = self
            .repository
            .find_all()
            .await
            .context("listing videos for reconciliation")?;
        let referenced: HashSet<String> = records
            .iter()
            .flat_map(|record| [record.filename.as_str(), record.thumbnail_url.as_str()])
            .filter_map(file_component)
            .map(str::to_string)
            .collect();

        let mut removed = 0;
        for dir in [&self.paths.videos, &self.paths.thumbnails] {
            for entry in WalkDir::new(dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
            {
                let name = entry.file_name().to_string_lossy();
                if referenced.contains(name.as_ref()) {
                    continue;
                }
                info!(path = %entry.path().display(), "removing orphaned file");
                fs::remove_file(entry.path())
                    .with_context(|| format!("removing {}", entry.path().display()))?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "orphaned files cleaned up");
        } else {
            info!("no orphaned files found");
        }
        Ok(removed)
    }
}

/// Last path component of a stored filename or public URL path. Empty values
/// and traversal components yield `None`.
fn file_component(value: &str) -> Option<&str> {
    let name = value.rsplit('/').next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn persistence_failure(id: Uuid, err: anyhow::Error) -> MedisError {
    error!(video_id = %id, error = %format!("{err:#}"), "library update failed");
    MedisError::Persistence(DELETE_FAILED.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VideoStore;
    use crate::store::tests::sample_video;
    use tempfile::{TempDir, tempdir};

    async fn library() -> anyhow::Result<(TempDir, Library, Arc<VideoStore>, Notifier)> {
        let temp = tempdir()?;
        let paths = StoragePaths::for_root(temp.path());
        paths.prepare()?;
        let store = Arc::new(VideoStore::open(&paths.database).await?);
        let notifier = Notifier::new();
        let library = Library::new(store.clone(), notifier.clone(), paths);
        Ok((temp, library, store, notifier))
    }

    fn snapshot(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn deleting_removes_files_row_and_notifies() -> anyhow::Result<()> {
        let (_temp, library, store, notifier) = library().await?;
        let record = sample_video(Uuid::new_v4());
        store.create(&record).await?;
        let video_path = library.paths().videos.join(&record.filename);
        let thumb_path = library
            .paths()
            .thumbnails
            .join(format!("{}-thumb.jpg", record.id));
        fs::write(&video_path, b"mp4")?;
        fs::write(&thumb_path, b"jpg")?;
        let mut sub = notifier.subscribe();
        sub.events.try_recv()?;

        library.delete_video(record.id).await?;

        assert!(!video_path.exists());
        assert!(!thumb_path.exists());
        assert!(store.find_by_id(record.id).await?.is_none());
        assert_eq!(
            sub.events.try_recv()?,
            LiveEvent::VideoDeleted {
                video_id: record.id
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn deleting_tolerates_missing_files() -> anyhow::Result<()> {
        let (_temp, library, store, _notifier) = library().await?;
        let mut record = sample_video(Uuid::new_v4());
        record.thumbnail_url = String::new();
        store.create(&record).await?;

        library.delete_video(record.id).await?;
        assert!(store.find_all().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn deleting_unknown_id_is_not_found_and_touches_nothing() -> anyhow::Result<()> {
        let (_temp, library, store, notifier) = library().await?;
        let kept = sample_video(Uuid::new_v4());
        store.create(&kept).await?;
        fs::write(library.paths().videos.join(&kept.filename), b"mp4")?;
        fs::write(library.paths().videos.join("stray.mp4"), b"mp4")?;
        let before = snapshot(&library.paths().videos);
        let mut sub = notifier.subscribe();
        sub.events.try_recv()?;

        let err = library.delete_video(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err, MedisError::not_found("Video not found"));
        assert_eq!(snapshot(&library.paths().videos), before);
        assert_eq!(store.find_all().await?.len(), 1);
        assert!(sub.events.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn reconciliation_removes_only_unreferenced_files() -> anyhow::Result<()> {
        let (_temp, library, store, _notifier) = library().await?;
        let record = sample_video(Uuid::new_v4());
        store.create(&record).await?;
        let paths = library.paths().clone();
        fs::write(paths.videos.join(&record.filename), b"mp4")?;
        fs::write(paths.thumbnails.join(format!("{}-thumb.jpg", record.id)), b"jpg")?;
        let orphan = Uuid::new_v4();
        fs::write(paths.videos.join(format!("{orphan}.mp4")), b"mp4")?;
        fs::write(paths.videos.join(format!("{orphan}.f137.mp4")), b"part")?;
        fs::write(paths.thumbnails.join(format!("{orphan}-thumb.jpg")), b"jpg")?;

        assert_eq!(library.reconcile_orphans().await?, 3);
        assert_eq!(snapshot(&paths.videos), vec![record.filename.clone()]);
        assert_eq!(
            snapshot(&paths.thumbnails),
            vec![format!("{}-thumb.jpg", record.id)]
        );
        assert!(paths.database.exists());

        assert_eq!(library.reconcile_orphans().await?, 0);
        Ok(())
    }

    #[test]
    fn file_component_strips_paths() {
        assert_eq!(file_component("/thumbnails/a-thumb.jpg"), Some("a-thumb.jpg"));
        assert_eq!(file_component("a.mp4"), Some("a.mp4"));
        assert_eq!(file_component(""), None);
        assert_eq!(file_component("/thumbnails/.."), None);
    }
}
