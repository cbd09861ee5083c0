use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use super::error::{Result, SwarmError};
use super::{
    CHUNK_SIZE, CONNECT_ATTEMPTS, CONNECT_TIMEOUT, DISCOVERY_TIMEOUT, HEARTBEAT_INTERVAL,
    MAX_CHUNK_SIZE, MAX_SESSIONS, READ_TIMEOUT, REANNOUNCE_EVERY, RETRY_DELAY, SEEDER_PORT, SEEDER_TTL,
    TRACKER_PORT,
};

/// How many chunks a seeder hands out over a single connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeedingQuota {
    Unlimited,
    PerConnection(u64),
}

impl SeedingQuota {
    pub fn allows(&self, served: u64) -> bool {
        match self {
            SeedingQuota::Unlimited => true,
            SeedingQuota::PerConnection(limit) => served < *limit,
        }
    }
}

/// Chunks must be non-empty and small enough to travel in one frame.
fn check_chunk_size(chunk_size: u64) -> Result<()> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(SwarmError::InvalidConfig(format!(
            "chunk size {} outside 1..={}",
            chunk_size, MAX_CHUNK_SIZE
        )));
    }
    Ok(())
}

impl From<Option<u64>> for SeedingQuota {
    fn from(limit: Option<u64>) -> Self {
        limit.map_or(SeedingQuota::Unlimited, SeedingQuota::PerConnection)
    }
}

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    pub bind: SocketAddr,
    /// Records not refreshed within this window are dropped.
    pub seeder_ttl: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], TRACKER_PORT)),
            seeder_ttl: SEEDER_TTL,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SeederConfig {
    pub path: PathBuf,
    /// Name the file is shared under. Defaults to the file name of `path`.
    pub file_key: Option<String>,
    pub bind: SocketAddr,
    pub tracker: SocketAddr,
    /// Port announced to the tracker when it differs from the bound one
    /// (e.g. when binding port 0).
    pub advertise_port: Option<u16>,
    pub chunk_size: u64,
    pub quota: SeedingQuota,
    pub max_sessions: usize,
    pub read_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Every Nth heartbeat repeats the full registration.
    pub reannounce_every: u32,
}

impl Default for SeederConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            file_key: None,
            bind: SocketAddr::from(([0, 0, 0, 0], SEEDER_PORT)),
            tracker: SocketAddr::from(([127, 0, 0, 1], TRACKER_PORT)),
            advertise_port: None,
            chunk_size: CHUNK_SIZE,
            quota: SeedingQuota::Unlimited,
            max_sessions: MAX_SESSIONS,
            read_timeout: READ_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reannounce_every: REANNOUNCE_EVERY,
        }
    }
}

impl SeederConfig {
    pub fn validate(&self) -> Result<()> {
        check_chunk_size(self.chunk_size)
    }
}

#[derive(Clone, Debug)]
pub struct LeecherConfig {
    pub tracker: SocketAddr,
    pub download_dir: PathBuf,
    /// Overrides `<download_dir>/downloaded_<file>`.
    pub output: Option<PathBuf>,
    pub chunk_size: u64,
    pub discovery_timeout: Duration,
    pub connect_attempts: u32,
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
    pub read_timeout: Duration,
}

impl Default for LeecherConfig {
    fn default() -> Self {
        Self {
            tracker: SocketAddr::from(([127, 0, 0, 1], TRACKER_PORT)),
            download_dir: PathBuf::from("."),
            output: None,
            chunk_size: CHUNK_SIZE,
            discovery_timeout: DISCOVERY_TIMEOUT,
            connect_attempts: CONNECT_ATTEMPTS,
            connect_timeout: CONNECT_TIMEOUT,
            retry_delay: RETRY_DELAY,
            read_timeout: READ_TIMEOUT,
        }
    }
}

impl LeecherConfig {
    pub fn validate(&self) -> Result<()> {
        check_chunk_size(self.chunk_size)
    }

    pub fn output_path(&self, file: &str) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| self.download_dir.join(format!("downloaded_{}", file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_counts_served_chunks() {
        let quota = SeedingQuota::PerConnection(2);
        assert!(quota.allows(0));
        assert!(quota.allows(1));
        assert!(!quota.allows(2));
        assert!(SeedingQuota::Unlimited.allows(u64::MAX));
        assert_eq!(SeedingQuota::from(None), SeedingQuota::Unlimited);
    }

    #[test]
    fn chunk_size_must_fit_a_frame() {
        let mut seeder = SeederConfig::default();
        assert!(seeder.validate().is_ok());
        seeder.chunk_size = 0;
        assert!(matches!(seeder.validate(), Err(SwarmError::InvalidConfig(_))));

        let mut leecher = LeecherConfig::default();
        leecher.chunk_size = MAX_CHUNK_SIZE;
        assert!(leecher.validate().is_ok());
        leecher.chunk_size = MAX_CHUNK_SIZE + 1;
        assert!(matches!(leecher.validate(), Err(SwarmError::InvalidConfig(_))));
        leecher.chunk_size = 0;
        assert!(leecher.validate().is_err());
    }

    #[test]
    fn default_reannounce_lands_within_ttl() {
        let seeder = SeederConfig::default();
        let period = seeder.heartbeat_interval * seeder.reannounce_every;
        assert!(period <= TrackerConfig::default().seeder_ttl);
    }

    #[test]
    fn default_output_is_prefixed() {
        let config = LeecherConfig {
            download_dir: PathBuf::from("/tmp/dl"),
            ..Default::default()
        };
        assert_eq!(
            config.output_path("sample.txt"),
            PathBuf::from("/tmp/dl/downloaded_sample.txt")
        );
    }
}
