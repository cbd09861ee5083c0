use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bit_vec::BitVec;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use super::action::{PeerCommand, PeerReply, SeederInfo};
use super::config::LeecherConfig;
use super::error::{Result, SwarmError};
use super::storage::ChunkWriter;
use super::tracker::request_seeders;
use super::wire::{read_frame, send_command, FrameError};
use super::{MAX_TOTAL_CHUNKS, QUOTA_EXHAUSTED};

/// Why a download stopped short of the whole file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartialCause {
    /// The last seeder tried refused further chunks under its quota.
    SeedingQuota,
    /// The last seeder tried failed (connection, timeout, bad reply).
    Failure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadStatus {
    Complete,
    Partial(PartialCause),
}

#[derive(Debug)]
pub struct DownloadReport {
    pub file: String,
    pub output: PathBuf,
    pub total_chunks: u64,
    pub chunks_retrieved: u64,
    pub bytes: u64,
    pub status: DownloadStatus,
}

/// State of one download. Chunks are fetched strictly in order, so the
/// retrieved set is always a prefix and `next_chunk` is its length.
pub struct DownloadSession {
    file: String,
    candidates: Vec<SeederInfo>,
    retrieved: BitVec,
    total_chunks: Option<u64>,
    next_chunk: u64,
}

impl DownloadSession {
    /// Candidates advertising more chunks go first; the sort is stable so
    /// tracker order breaks ties.
    pub fn new(file: &str, mut candidates: Vec<SeederInfo>) -> DownloadSession {
        candidates.sort_by(|a, b| b.chunks.cmp(&a.chunks));
        DownloadSession {
            file: file.to_string(),
            candidates,
            retrieved: BitVec::new(),
            total_chunks: None,
            next_chunk: 0,
        }
    }

    pub fn candidates(&self) -> &[SeederInfo] {
        &self.candidates
    }

    pub fn is_complete(&self) -> bool {
        self.total_chunks == Some(self.next_chunk)
    }

    pub fn chunks_retrieved(&self) -> u64 {
        self.retrieved.iter().filter(|b| *b).count() as u64
    }

    /// Pins the chunk count on first contact; later seeders must agree.
    fn agree_on_total(&mut self, reported: u64, chunk_size: u64) -> Result<u64> {
        match self.total_chunks {
            Some(total) if total == reported => Ok(total),
            Some(total) => Err(SwarmError::violation(format!(
                "seeder reports {} chunks, expected {}",
                reported, total
            ))),
            None => {
                if reported == 0
                    || reported > MAX_TOTAL_CHUNKS
                    || reported.checked_mul(chunk_size).is_none()
                {
                    return Err(SwarmError::violation(format!(
                        "implausible chunk count {}",
                        reported
                    )));
                }
                self.total_chunks = Some(reported);
                self.retrieved = BitVec::from_elem(reported as usize, false);
                Ok(reported)
            }
        }
    }

    fn mark_retrieved(&mut self, chunk_id: u64) {
        self.retrieved.set(chunk_id as usize, true);
        self.next_chunk = chunk_id + 1;
    }
}

/// How a single seeder's turn ended without an error.
enum SeederTurn {
    Finished,
    QuotaReached,
}

/// Discover seeders for `file` and download it.
pub async fn download(config: &LeecherConfig, file: &str) -> Result<DownloadReport> {
    check_output(config, file)?;
    let seeders = request_seeders(config.tracker, file, config.discovery_timeout).await?;
    info!("Tracker lists {} seeders for {}", seeders.len(), file);
    download_from(config, file, seeders).await
}

fn check_output(config: &LeecherConfig, file: &str) -> Result<()> {
    config.validate()?;
    let output = resolve(&config.output_path(file)).map_err(SwarmError::Storage)?;
    let original = resolve(&config.download_dir.join(file)).map_err(SwarmError::Storage)?;
    if output == original {
        return Err(SwarmError::Storage(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("refusing to write over the original name {}", file),
        )));
    }
    Ok(())
}

/// Absolute form of `path` with links and `..` resolved as far as the
/// filesystem allows: the whole path if it exists, else its parent.
fn resolve(path: &Path) -> std::io::Result<PathBuf> {
    if let Ok(path) = path.canonicalize() {
        return Ok(path);
    }
    let path = std::path::absolute(path)?;
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(parent) => Ok(parent.join(name)),
            Err(_) => Ok(path),
        },
        _ => Ok(path),
    }
}

/// Download `file` from an explicit candidate list. A seeder that drops out
/// after making progress is reconnected; one that fails outright is skipped
/// for the next candidate. Chunks already retrieved are kept either way.
pub async fn download_from(config: &LeecherConfig, file: &str, candidates: Vec<SeederInfo>) -> Result<DownloadReport> {
    check_output(config, file)?;
    if candidates.is_empty() {
        return Err(SwarmError::NoSeedersAvailable);
    }
    let output = config.output_path(file);
    let mut session = DownloadSession::new(file, candidates);
    let mut writer = ChunkWriter::new(&output, config.chunk_size);
    let mut last_stop = PartialCause::Failure;

    for seeder in session.candidates().to_vec() {
        if session.is_complete() {
            break;
        }
        let mut reconnects = 0;
        loop {
            let resumed_at = session.next_chunk;
            match fetch_from(config, seeder.addr, &mut session, &mut writer).await {
                Ok(SeederTurn::Finished) => break,
                Ok(SeederTurn::QuotaReached) => {
                    info!(
                        "{} stopped serving {} after its quota ({} of {:?} chunks so far)",
                        seeder.addr, session.file, session.next_chunk, session.total_chunks
                    );
                    last_stop = PartialCause::SeedingQuota;
                    break;
                }
                Err(SwarmError::Storage(err)) => return Err(SwarmError::Storage(err)),
                Err(err)
                    if err.is_retryable()
                        && session.next_chunk > resumed_at
                        && reconnects < config.connect_attempts =>
                {
                    reconnects += 1;
                    warn!(
                        "Lost {} at chunk {} of {}: {}; reconnecting",
                        seeder.addr, session.next_chunk, session.file, err
                    );
                    sleep(config.retry_delay).await;
                }
                Err(err) => {
                    warn!("Giving up on {} for {}: {}", seeder.addr, session.file, err);
                    last_stop = PartialCause::Failure;
                    break;
                }
            }
        }
    }

    let Some(total_chunks) = session.total_chunks.filter(|_| session.next_chunk > 0) else {
        return Err(SwarmError::SeedersExhausted(session.candidates.len()));
    };
    let bytes = writer.finish().await?;
    let status = if session.is_complete() {
        DownloadStatus::Complete
    } else {
        DownloadStatus::Partial(last_stop)
    };
    let report = DownloadReport {
        file: session.file.clone(),
        output,
        total_chunks,
        chunks_retrieved: session.chunks_retrieved(),
        bytes,
        status,
    };
    info!(
        "{} -> {}: {} of {} chunks, {} bytes, {:?}",
        report.file,
        report.output.display(),
        report.chunks_retrieved,
        report.total_chunks,
        report.bytes,
        report.status
    );
    Ok(report)
}

async fn connect_with_retries(config: &LeecherConfig, addr: SocketAddr) -> Result<TcpStream> {
    let attempts = config.connect_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match timeout(config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                info!("Connected to seeder {}", addr);
                return Ok(stream);
            }
            Ok(Err(err)) => last_error = err.to_string(),
            Err(_) => last_error = "connect timed out".to_string(),
        }
        warn!("Attempt {}/{} to reach {} failed: {}", attempt, attempts, addr, last_error);
        if attempt < attempts {
            sleep(config.retry_delay).await;
        }
    }
    Err(SwarmError::ConnectionFailure(format!(
        "{} unreachable after {} attempts: {}",
        addr, attempts, last_error
    )))
}

async fn request(stream: &mut TcpStream, command: PeerCommand, read_timeout: Duration, chunk_id: Option<u64>) -> Result<PeerReply> {
    send_command(stream, &command, read_timeout)
        .await
        .map_err(SwarmError::connection)?;
    let frame = match read_frame(stream, read_timeout).await {
        Ok(frame) => frame,
        Err(FrameError::Closed) => return Err(SwarmError::connection("seeder closed the connection")),
        Err(FrameError::TimedOut) => return Err(SwarmError::connection("seeder stopped answering")),
        Err(FrameError::Truncated { expected, received }) => {
            return Err(match chunk_id {
                Some(chunk_id) => SwarmError::PartialChunk {
                    chunk_id,
                    expected,
                    received,
                },
                None => SwarmError::connection("reply cut short"),
            })
        }
        Err(FrameError::Oversized(len)) => {
            return Err(SwarmError::violation(format!("reply frame of {} bytes", len)))
        }
        Err(FrameError::Io(err)) => return Err(SwarmError::connection(err)),
    };
    PeerReply::from_frame(frame).ok_or_else(|| SwarmError::violation("unrecognised reply"))
}

/// One seeder's turn: agree on the chunk count, then pull chunks from
/// `next_chunk` on, one request in flight.
async fn fetch_from(
    config: &LeecherConfig,
    addr: SocketAddr,
    session: &mut DownloadSession,
    writer: &mut ChunkWriter,
) -> Result<SeederTurn> {
    let mut stream = connect_with_retries(config, addr).await?;
    let count_request = PeerCommand::GetChunkCount {
        file: session.file.clone(),
    };
    let total = match request(&mut stream, count_request, config.read_timeout, None).await? {
        PeerReply::ChunkCount(reported) => session.agree_on_total(reported, config.chunk_size)?,
        PeerReply::Error(reason) => return Err(SwarmError::ProtocolViolation(reason)),
        PeerReply::Chunk(_) => return Err(SwarmError::violation("chunk sent instead of count")),
    };
    debug!("{} has {} chunks of {}", addr, total, session.file);

    while session.next_chunk < total {
        let chunk_id = session.next_chunk;
        let command = PeerCommand::GetChunk {
            file: session.file.clone(),
            chunk_id,
        };
        match request(&mut stream, command, config.read_timeout, Some(chunk_id)).await? {
            PeerReply::Chunk(block) => {
                check_chunk_len(chunk_id, total, config.chunk_size, block.len())?;
                writer.write_chunk(chunk_id, &block).await?;
                session.mark_retrieved(chunk_id);
                debug!("Chunk {}/{} from {}", chunk_id + 1, total, addr);
            }
            PeerReply::Error(reason) if reason == QUOTA_EXHAUSTED => {
                return Ok(SeederTurn::QuotaReached);
            }
            PeerReply::Error(reason) => return Err(SwarmError::ProtocolViolation(reason)),
            PeerReply::ChunkCount(_) => return Err(SwarmError::violation("count sent instead of chunk")),
        }
    }

    let _ = send_command(&mut stream, &PeerCommand::Done, config.read_timeout).await;
    Ok(SeederTurn::Finished)
}

/// Every chunk but the last must be full; none may be oversized.
fn check_chunk_len(chunk_id: u64, total: u64, chunk_size: u64, len: usize) -> Result<()> {
    let expected = chunk_size as usize;
    if len > expected {
        return Err(SwarmError::violation(format!(
            "chunk {} has {} bytes, more than {}",
            chunk_id, len, expected
        )));
    }
    if chunk_id + 1 < total && len < expected {
        return Err(SwarmError::PartialChunk {
            chunk_id,
            expected,
            received: len,
        });
    }
    Ok(())
}
