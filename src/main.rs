mod swarm;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, warn};

use swarm::{
    run_leecher, run_seeder, run_tracker, DownloadStatus, LeecherConfig, SeederConfig,
    TrackerConfig, CHUNK_SIZE, SEEDER_PORT, TRACKER_PORT,
};

#[derive(Parser)]
#[command(version, about = "Tracker, seeder and leecher for chunked file sharing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the UDP tracker
    Tracker {
        #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], TRACKER_PORT)))]
        bind: SocketAddr,
        /// Forget seeders silent for this many seconds
        #[arg(long, default_value_t = 90)]
        ttl_secs: u64,
    },
    /// Share one file
    Seed {
        path: PathBuf,
        /// Share under this name instead of the file name
        #[arg(long)]
        key: Option<String>,
        #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], SEEDER_PORT)))]
        bind: SocketAddr,
        #[arg(long, default_value_t = SocketAddr::from(([127, 0, 0, 1], TRACKER_PORT)))]
        tracker: SocketAddr,
        #[arg(long)]
        advertise_port: Option<u16>,
        #[arg(long, default_value_t = CHUNK_SIZE)]
        chunk_size: u64,
        /// Most chunks served per connection
        #[arg(long)]
        quota: Option<u64>,
        #[arg(long, default_value_t = 64)]
        max_sessions: usize,
        #[arg(long, default_value_t = 30)]
        heartbeat_secs: u64,
    },
    /// Download a file
    Leech {
        file: String,
        #[arg(long, default_value_t = SocketAddr::from(([127, 0, 0, 1], TRACKER_PORT)))]
        tracker: SocketAddr,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = CHUNK_SIZE)]
        chunk_size: u64,
        #[arg(long, default_value_t = 30)]
        discovery_timeout_secs: u64,
        #[arg(long, default_value_t = 3)]
        attempts: u32,
        #[arg(long, default_value_t = 2000)]
        retry_delay_ms: u64,
        #[arg(long, default_value_t = 30)]
        read_timeout_secs: u64,
    },
}

#[tokio::main(worker_threads = 4)]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Tracker { bind, ttl_secs } => {
            run_tracker(TrackerConfig {
                bind,
                seeder_ttl: Duration::from_secs(ttl_secs),
            })
            .await
        }
        Command::Seed {
            path,
            key,
            bind,
            tracker,
            advertise_port,
            chunk_size,
            quota,
            max_sessions,
            heartbeat_secs,
        } => {
            run_seeder(SeederConfig {
                path,
                file_key: key,
                bind,
                tracker,
                advertise_port,
                chunk_size,
                quota: quota.into(),
                max_sessions,
                heartbeat_interval: Duration::from_secs(heartbeat_secs),
                ..Default::default()
            })
            .await
        }
        Command::Leech {
            file,
            tracker,
            dir,
            output,
            chunk_size,
            discovery_timeout_secs,
            attempts,
            retry_delay_ms,
            read_timeout_secs,
        } => {
            let config = LeecherConfig {
                tracker,
                download_dir: dir,
                output,
                chunk_size,
                discovery_timeout: Duration::from_secs(discovery_timeout_secs),
                connect_attempts: attempts,
                retry_delay: Duration::from_millis(retry_delay_ms),
                read_timeout: Duration::from_secs(read_timeout_secs),
                ..Default::default()
            };
            match run_leecher(config, &file).await {
                Ok(report) if report.status == DownloadStatus::Complete => Ok(()),
                Ok(report) => {
                    warn!(
                        "{} is incomplete ({:?}): {} of {} chunks",
                        report.output.display(),
                        report.status,
                        report.chunks_retrieved,
                        report.total_chunks
                    );
                    return ExitCode::from(2);
                }
                Err(err) => Err(err),
            }
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if err.is_retryable() {
                error!("{} (transient, try again)", err);
            } else {
                error!("{}", err);
            }
            ExitCode::FAILURE
        }
    }
}
