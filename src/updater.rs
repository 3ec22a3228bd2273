//! Periodic `yt-dlp --update`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::ytdlp::MediaDownloader;

pub const FIRST_CHECK_DELAY: Duration = Duration::from_secs(60);
pub const CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Starts the background updater: first run after `first_delay`, then every
/// `interval`. Failures are logged and the schedule continues.
pub fn spawn(
    downloader: Arc<dyn MediaDownloader>,
    first_delay: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    info!("yt-dlp auto-update is enabled");
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + first_delay;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            check_for_update(downloader.as_ref()).await;
        }
    })
}

pub async fn check_for_update(downloader: &dyn MediaDownloader) {
    info!("checking for yt-dlp updates");
    let current = downloader
        .version()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    match downloader.update().await {
        Ok(output) if output.contains("up to date") => {
            info!(version = %current, "yt-dlp is already at the latest version");
        }
        Ok(output) => info!(details = %output, "yt-dlp updated"),
        Err(err) => warn!(error = %format!("{err:#}"), "yt-dlp update failed"),
    }
}
