//! Fan-out of live events to every connected observer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::queue::QueueStats;
use crate::store::VideoRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressStage {
    FetchingMetadata,
    FetchingThumbnail,
    Downloading,
    Processing,
}

/// Wire format of the live channel. Every message carries a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LiveEvent {
    #[serde(rename_all = "camelCase")]
    Status {
        active_downloads: usize,
        queue_size: usize,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        stage: ProgressStage,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<f64>,
        video_id: Uuid,
    },
    DownloadComplete { video: VideoRecord },
    #[serde(rename_all = "camelCase")]
    DownloadError { message: String, video_id: Uuid },
    #[serde(rename_all = "camelCase")]
    VideoDeleted { video_id: Uuid },
}

impl LiveEvent {
    pub fn status(stats: QueueStats) -> Self {
        Self::Status {
            active_downloads: stats.active,
            queue_size: stats.queued,
        }
    }

    pub fn progress(
        video_id: Uuid,
        stage: ProgressStage,
        message: impl Into<String>,
        percent: Option<f64>,
    ) -> Self {
        Self::Progress {
            stage,
            message: message.into(),
            percent,
            video_id,
        }
    }
}

type Sink = mpsc::UnboundedSender<LiveEvent>;

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    sinks: HashMap<u64, Sink>,
    status: QueueStats,
}

/// A registered observer. The receiver yields every event published after
/// registration, starting with the current status.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::UnboundedReceiver<LiveEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct Notifier {
    inner: Arc<Mutex<Registry>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.inner.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        // Cannot fail: the receiver is still in our hands.
        let _ = tx.send(LiveEvent::status(registry.status));
        registry.sinks.insert(id, tx);
        debug!(observer = id, total = registry.sinks.len(), "observer connected");
        Subscription { id, events: rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut registry = self.inner.lock();
        if registry.sinks.remove(&id).is_some() {
            debug!(observer = id, total = registry.sinks.len(), "observer disconnected");
        }
    }

    /// Delivers `event` to every sink. Sinks whose receiver is gone are
    /// dropped on the spot.
    pub fn publish(&self, event: LiveEvent) {
        let mut registry = self.inner.lock();
        registry.sinks.retain(|id, sink| {
            let delivered = sink.send(event.clone()).is_ok();
            if !delivered {
                debug!(observer = *id, "dropping closed observer");
            }
            delivered
        });
    }

    /// Records the latest counters and broadcasts them.
    pub fn update_status(&self, stats: QueueStats) {
        self.inner.lock().status = stats;
        self.publish(LiveEvent::status(stats));
    }

    pub fn current_status(&self) -> QueueStats {
        self.inner.lock().status
    }

    pub fn observer_count(&self) -> usize {
        self.inner.lock().sinks.len()
    }
}
