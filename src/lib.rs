#![forbid(unsafe_code)]

//! Core of the MEDIS media-download manager: the single-lane job queue, the
//! download orchestrator that drives yt-dlp, the live notifier, and the
//! library persistence those pieces feed.

pub mod config;
pub mod error;
pub mod library;
pub mod logging;
pub mod notifier;
pub mod orchestrator;
pub mod queue;
pub mod security;
pub mod store;
pub mod thumbnail;
pub mod updater;
pub mod ytdlp;
