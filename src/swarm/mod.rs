mod action;
mod chunk;
mod config;
mod error;
mod leecher;
mod registry;
mod seeder;
mod storage;
mod tracker;
mod wire;

#[cfg(test)]
mod testutil;

use std::time::Duration;

use log::info;

pub use config::{LeecherConfig, SeederConfig, TrackerConfig};
use error::Result;
pub use leecher::{DownloadReport, DownloadStatus};
use seeder::Seeder;
use tracker::Tracker;

pub const TRACKER_PORT: u16 = 6020;
pub const SEEDER_PORT: u16 = 7000;

/// Protocol-wide chunk size; every peer must agree on it.
pub const CHUNK_SIZE: u64 = 512;

/// Largest single socket write when streaming a chunk.
const WRITE_SLICE: usize = 8 * 1024;
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
/// A chunk plus its kind byte must fit in one frame.
const MAX_CHUNK_SIZE: u64 = MAX_FRAME_LEN as u64 - 1;
const MAX_DATAGRAM: usize = 65_507;
const MAX_SEEDERS_PER_REPLY: usize = 30;
const MAX_TOTAL_CHUNKS: u64 = 1 << 26;
const QUOTA_EXHAUSTED: &str = "quota exhausted";

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const REANNOUNCE_EVERY: u32 = 3;
const SEEDER_TTL: Duration = Duration::from_secs(90);
const MAX_SESSIONS: usize = 64;

pub async fn run_tracker(config: TrackerConfig) -> Result<()> {
    let tracker = Tracker::bind(&config).await?;
    tracker.run().await
}

pub async fn run_seeder(config: SeederConfig) -> Result<()> {
    let seeder = Seeder::bind(config).await?;
    info!(
        "Sharing {} as {} chunks",
        seeder.file_key(),
        seeder.total_chunks()
    );
    seeder.run().await
}

pub async fn run_leecher(config: LeecherConfig, file: &str) -> Result<DownloadReport> {
    leecher::download(&config, file).await
}
