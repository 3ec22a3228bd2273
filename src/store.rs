//! Persistence for finished downloads.
//!
//! One row per video in the `videos` table. The orchestrator only ever
//! inserts; rows disappear through explicit library deletion.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_TITLE: &str = "Untitled Video";
pub const DEFAULT_WIDTH: i64 = 1280;
pub const DEFAULT_HEIGHT: i64 = 720;

/// A downloaded video as stored in the database and exposed to the API.
///
/// `id` is the id of the job that produced the file, so the file on disk is
/// always `{id}.mp4`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub id: Uuid,
    pub title: String,
    pub original_url: String,
    pub filename: String,
    /// Public path of the stored thumbnail, empty when none was fetched.
    #[serde(default)]
    pub thumbnail_url: String,
    pub created_at: DateTime<Utc>,
    pub width: i64,
    pub height: i64,
}

impl VideoRecord {
    pub fn video_filename(id: Uuid) -> String {
        format!("{id}.mp4")
    }
}

/// Storage seam used by the orchestrator and the library service.
#[async_trait]
pub trait VideoRepository: Send + Sync {
    async fn create(&self, record: &VideoRecord) -> Result<()>;

    /// Every record, newest first.
    async fn find_all(&self) -> Result<Vec<VideoRecord>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<VideoRecord>>;

    /// Returns whether a row was removed.
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            originalUrl TEXT NOT NULL,
            filename TEXT NOT NULL,
            thumbnailUrl TEXT,
            createdAt TEXT NOT NULL,
            width INTEGER,
            height INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_videos_createdAt ON videos (createdAt);
        "#,
    )
    .await?;
    Ok(())
}

/// libsql-backed repository.
#[derive(Clone)]
pub struct VideoStore {
    conn: Connection,
}

impl std::fmt::Debug for VideoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoStore").finish_non_exhaustive()
    }
}

impl VideoStore {
    /// Opens (and if necessary creates) the database and ensures the schema
    /// exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening database {}", path.display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl VideoRepository for VideoStore {
    async fn create(&self, record: &VideoRecord) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO videos (
                    id, title, originalUrl, filename, thumbnailUrl, createdAt, width, height
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    record.id.to_string(),
                    record.title.as_str(),
                    record.original_url.as_str(),
                    record.filename.as_str(),
                    record.thumbnail_url.as_str(),
                    record.created_at.to_rfc3339(),
                    record.width,
                    record.height,
                ],
            )
            .await
            .with_context(|| format!("inserting video {}", record.id))?;
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<VideoRecord>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, title, originalUrl, filename, thumbnailUrl, createdAt, width, height
                FROM videos
                ORDER BY createdAt DESC, rowid DESC
                "#,
            )
            .await?;

        let mut rows = stmt.query(params![]).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_video_record(&row)?);
        }
        Ok(records)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<VideoRecord>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, title, originalUrl, filename, thumbnailUrl, createdAt, width, height
                FROM videos
                WHERE id = ?1
                "#,
            )
            .await?;

        let mut rows = stmt.query([id.to_string()]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM videos WHERE id = ?1", [id.to_string()])
            .await
            .with_context(|| format!("deleting video {id}"))?;
        Ok(changed > 0)
    }
}

/// Column order must match the SELECT statements above.
fn row_to_video_record(row: &Row) -> Result<VideoRecord> {
    let id: String = row.get(0)?;
    let created_at: String = row.get(5)?;
    let thumbnail_url: Option<String> = row.get(4)?;
    let width: Option<i64> = row.get(6)?;
    let height: Option<i64> = row.get(7)?;

    Ok(VideoRecord {
        id: Uuid::parse_str(&id).with_context(|| format!("parsing stored id {id}"))?,
        title: row.get(1)?,
        original_url: row.get(2)?,
        filename: row.get(3)?,
        thumbnail_url: thumbnail_url.unwrap_or_default(),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .with_context(|| format!("parsing stored timestamp {created_at}"))?
            .with_timezone(&Utc),
        width: width.unwrap_or(DEFAULT_WIDTH),
        height: height.unwrap_or(DEFAULT_HEIGHT),
    })
}
