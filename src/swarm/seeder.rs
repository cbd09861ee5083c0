use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::select;
use tokio::sync::Semaphore;
use tokio::time::interval;

use super::action::{PeerCommand, PeerReply, TrackerMessage};
use super::chunk::{chunk_range, total_chunks};
use super::config::{SeedingQuota, SeederConfig};
use super::error::{Result, SwarmError};
use super::tracker::{announce, any_local};
use super::wire::{read_frame, send_reply, FrameError, KIND_COMMAND};
use super::QUOTA_EXHAUSTED;

/// The one file a seeder shares. Immutable once the seeder is bound.
#[derive(Debug)]
struct SharedFile {
    path: PathBuf,
    key: String,
    size: u64,
    chunk_size: u64,
    total_chunks: u64,
}

/// How a seeding session ended.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
    ClosedByPeer,
    ClosedOnDone,
    QuotaExhausted,
    Rejected(String),
    IdleTimeout,
}

pub struct Seeder {
    listener: TcpListener,
    shared: Arc<SharedFile>,
    config: SeederConfig,
    sessions: Arc<Semaphore>,
}

impl Seeder {
    pub async fn bind(config: SeederConfig) -> Result<Seeder> {
        config.validate()?;
        let metadata = tokio::fs::metadata(&config.path)
            .await
            .map_err(SwarmError::Storage)?;
        let key = match &config.file_key {
            Some(key) => key.clone(),
            None => config
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    SwarmError::Storage(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("{} has no file name", config.path.display()),
                    ))
                })?,
        };
        let shared = SharedFile {
            path: config.path.clone(),
            key,
            size: metadata.len(),
            chunk_size: config.chunk_size,
            total_chunks: total_chunks(metadata.len(), config.chunk_size),
        };
        let listener = TcpListener::bind(config.bind).await?;
        Ok(Seeder {
            listener,
            shared: Arc::new(shared),
            sessions: Arc::new(Semaphore::new(config.max_sessions.max(1))),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn file_key(&self) -> &str {
        &self.shared.key
    }

    pub fn total_chunks(&self) -> u64 {
        self.shared.total_chunks
    }

    fn advertised_port(&self) -> Result<u16> {
        match self.config.advertise_port {
            Some(port) => Ok(port),
            None => Ok(self.local_addr()?.port()),
        }
    }

    /// Registers with the tracker and then serves until the task is dropped.
    pub async fn run(self) -> Result<()> {
        let socket = UdpSocket::bind(any_local(self.config.tracker)).await?;
        let port = self.advertised_port()?;
        register(&socket, &self.config, &self.shared, port).await;
        info!(
            "Seeding {} ({} bytes, {} chunks) on {}",
            self.shared.key,
            self.shared.size,
            self.shared.total_chunks,
            self.local_addr()?
        );
        select! {
            result = self.accept_loop() => result,
            _ = heartbeat(&socket, &self.config, &self.shared, port) => Ok(()),
        }
    }

    async fn accept_loop(&self) -> Result<()> {
        loop {
            let permit = match self.sessions.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!("Accept failed: {}", err);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            info!("Accepted connection from {}", peer);
            let shared = self.shared.clone();
            let quota = self.config.quota;
            let read_timeout = self.config.read_timeout;
            tokio::spawn(async move {
                let _permit = permit;
                match run_session(stream, &shared, quota, read_timeout).await {
                    Ok(SessionEnd::Rejected(reason)) => {
                        warn!("Closed session with {}: {}", peer, reason)
                    }
                    Ok(end) => info!("Session with {} ended: {:?}", peer, end),
                    Err(err) => warn!("Session with {} failed: {}", peer, err),
                }
            });
        }
    }
}

async fn register(socket: &UdpSocket, config: &SeederConfig, shared: &SharedFile, port: u16) {
    let messages = [
        TrackerMessage::RegisterSeeder {
            file: shared.key.clone(),
            port,
        },
        TrackerMessage::ChunkCount {
            file: shared.key.clone(),
            port,
            chunks: shared.total_chunks,
        },
    ];
    for message in &messages {
        if let Err(err) = announce(socket, config.tracker, message, config.read_timeout).await {
            warn!("Failed to register with tracker {}: {}", config.tracker, err);
            return;
        }
    }
    info!("Registered {} with tracker {}", shared.key, config.tracker);
}

async fn heartbeat(socket: &UdpSocket, config: &SeederConfig, shared: &SharedFile, port: u16) {
    let mut ticker = interval(config.heartbeat_interval.max(Duration::from_millis(100)));
    ticker.tick().await;
    let mut beats: u32 = 0;
    loop {
        ticker.tick().await;
        beats = beats.wrapping_add(1);
        if config.reannounce_every > 0 && beats % config.reannounce_every == 0 {
            register(socket, config, shared, port).await;
            continue;
        }
        let alive = TrackerMessage::Alive {
            file: shared.key.clone(),
            port,
        };
        if let Err(err) = announce(socket, config.tracker, &alive, config.read_timeout).await {
            warn!("Heartbeat to {} failed: {}", config.tracker, err);
        }
    }
}

async fn reject(stream: &mut TcpStream, reason: String, io_timeout: Duration) -> SessionEnd {
    let _ = send_reply(stream, &PeerReply::Error(reason.clone()), io_timeout).await;
    SessionEnd::Rejected(reason)
}

/// Command loop for one connection. Each session reads through its own file
/// handle.
async fn run_session(
    mut stream: TcpStream,
    shared: &SharedFile,
    quota: SeedingQuota,
    read_timeout: Duration,
) -> Result<SessionEnd> {
    let mut file = match File::open(&shared.path).await {
        Ok(file) => file,
        Err(err) => {
            let _ = send_reply(&mut stream, &PeerReply::Error("file unavailable".to_string()), read_timeout).await;
            return Err(SwarmError::Storage(err));
        }
    };
    let mut served: u64 = 0;
    loop {
        let frame = match read_frame(&mut stream, read_timeout).await {
            Ok(frame) => frame,
            Err(FrameError::Closed) => return Ok(SessionEnd::ClosedByPeer),
            Err(FrameError::TimedOut) => return Ok(SessionEnd::IdleTimeout),
            Err(FrameError::Io(err)) => return Err(SwarmError::connection(err)),
            Err(err) => {
                return Ok(reject(&mut stream, format!("malformed frame: {:?}", err), read_timeout).await)
            }
        };
        let command = match frame.kind {
            KIND_COMMAND => std::str::from_utf8(&frame.payload)
                .ok()
                .and_then(PeerCommand::parse),
            _ => None,
        };
        let Some(command) = command else {
            return Ok(reject(&mut stream, "malformed command".to_string(), read_timeout).await);
        };
        if let Some(file) = command.file().filter(|file| *file != shared.key) {
            let reason = format!("unknown file {}", file);
            return Ok(reject(&mut stream, reason, read_timeout).await);
        }
        match command {
            PeerCommand::GetChunkCount { .. } => {
                send_reply(&mut stream, &PeerReply::ChunkCount(shared.total_chunks), read_timeout)
                    .await
                    .map_err(SwarmError::connection)?;
                debug!("Sent chunk count {}", shared.total_chunks);
            }
            PeerCommand::GetChunk { chunk_id, .. } => {
                if !quota.allows(served) {
                    let _ = send_reply(
                        &mut stream,
                        &PeerReply::Error(QUOTA_EXHAUSTED.to_string()),
                        read_timeout,
                    )
                    .await;
                    return Ok(SessionEnd::QuotaExhausted);
                }
                let Some(range) = chunk_range(chunk_id, shared.chunk_size, shared.size) else {
                    let reason = format!("chunk {} out of range 0..{}", chunk_id, shared.total_chunks);
                    return Ok(reject(&mut stream, reason, read_timeout).await);
                };
                let chunk = match read_chunk(&mut file, range.start, (range.end - range.start) as usize).await {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = send_reply(&mut stream, &PeerReply::Error("read failed".to_string()), read_timeout).await;
                        return Err(SwarmError::Storage(err));
                    }
                };
                send_reply(&mut stream, &PeerReply::Chunk(chunk), read_timeout)
                    .await
                    .map_err(SwarmError::connection)?;
                served += 1;
                debug!("Sent chunk {}", chunk_id);
            }
            PeerCommand::Done => return Ok(SessionEnd::ClosedOnDone),
        }
    }
}

async fn read_chunk(file: &mut File, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    let mut chunk = vec![0u8; len];
    file.seek(SeekFrom::Start(offset)).await?;
    file.read_exact(&mut chunk).await?;
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::testutil::{random_bytes, write_shared};
    use crate::swarm::wire::{read_frame, send_command};

    const T: Duration = Duration::from_secs(2);

    struct Fixture {
        addr: SocketAddr,
        tracker: UdpSocket,
        contents: Vec<u8>,
    }

    async fn start_seeder(len: usize, chunk_size: u64, quota: SeedingQuota) -> Fixture {
        let contents = random_bytes(len);
        let path = write_shared("sample.txt", &contents);
        let tracker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = SeederConfig {
            path,
            bind: "127.0.0.1:0".parse().unwrap(),
            tracker: tracker.local_addr().unwrap(),
            chunk_size,
            quota,
            ..Default::default()
        };
        let seeder = Seeder::bind(config).await.unwrap();
        let addr = seeder.local_addr().unwrap();
        tokio::spawn(seeder.run());
        Fixture {
            addr,
            tracker,
            contents,
        }
    }

    async fn ask(stream: &mut TcpStream, command: PeerCommand) -> Option<PeerReply> {
        send_command(stream, &command, T).await.unwrap();
        read_frame(stream, T).await.ok().and_then(PeerReply::from_frame)
    }

    fn get_chunk(chunk_id: u64) -> PeerCommand {
        PeerCommand::GetChunk {
            file: "sample.txt".to_string(),
            chunk_id,
        }
    }

    #[tokio::test]
    async fn bind_rejects_unusable_chunk_size() {
        let path = write_shared("sample.txt", b"abc");
        for chunk_size in [0, crate::swarm::MAX_CHUNK_SIZE + 1] {
            let config = SeederConfig {
                path: path.clone(),
                bind: "127.0.0.1:0".parse().unwrap(),
                chunk_size,
                ..Default::default()
            };
            let result = Seeder::bind(config).await;
            assert!(matches!(result, Err(SwarmError::InvalidConfig(_))));
        }
    }

    #[tokio::test]
    async fn registers_with_tracker_on_start() {
        let fixture = start_seeder(1300, 512, SeedingQuota::Unlimited).await;
        let mut buf = [0u8; 512];
        let mut received = vec![];
        for _ in 0..2 {
            let (len, _) = tokio::time::timeout(T, fixture.tracker.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            received.push(TrackerMessage::parse(std::str::from_utf8(&buf[..len]).unwrap()).unwrap());
        }
        let port = fixture.addr.port();
        assert_eq!(
            received,
            vec![
                TrackerMessage::RegisterSeeder {
                    file: "sample.txt".to_string(),
                    port
                },
                TrackerMessage::ChunkCount {
                    file: "sample.txt".to_string(),
                    port,
                    chunks: 3
                },
            ]
        );
    }

    #[tokio::test]
    async fn chunks_reassemble_to_the_original() {
        let fixture = start_seeder(20_000, 4096, SeedingQuota::Unlimited).await;
        let mut stream = TcpStream::connect(fixture.addr).await.unwrap();
        let count = match ask(
            &mut stream,
            PeerCommand::GetChunkCount {
                file: "sample.txt".to_string(),
            },
        )
        .await
        {
            Some(PeerReply::ChunkCount(count)) => count,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(count, 5);

        let mut rebuilt = vec![];
        for id in 0..count {
            match ask(&mut stream, get_chunk(id)).await {
                Some(PeerReply::Chunk(bytes)) => rebuilt.extend(bytes),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(rebuilt, fixture.contents);

        send_command(&mut stream, &PeerCommand::Done, T).await.unwrap();
        assert!(matches!(read_frame(&mut stream, T).await, Err(FrameError::Closed)));
    }

    #[tokio::test]
    async fn empty_file_serves_one_empty_chunk() {
        let fixture = start_seeder(0, 512, SeedingQuota::Unlimited).await;
        let mut stream = TcpStream::connect(fixture.addr).await.unwrap();
        assert_eq!(ask(&mut stream, get_chunk(0)).await, Some(PeerReply::Chunk(vec![])));
    }

    #[tokio::test]
    async fn out_of_range_chunk_is_an_error_and_closes() {
        let fixture = start_seeder(1000, 512, SeedingQuota::Unlimited).await;
        let mut stream = TcpStream::connect(fixture.addr).await.unwrap();
        match ask(&mut stream, get_chunk(2)).await {
            Some(PeerReply::Error(reason)) => assert!(reason.contains("out of range")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(read_frame(&mut stream, T).await, Err(FrameError::Closed)));
    }

    #[tokio::test]
    async fn wrong_file_is_rejected() {
        let fixture = start_seeder(1000, 512, SeedingQuota::Unlimited).await;
        let mut stream = TcpStream::connect(fixture.addr).await.unwrap();
        let reply = ask(
            &mut stream,
            PeerCommand::GetChunkCount {
                file: "other.txt".to_string(),
            },
        )
        .await;
        assert_eq!(reply, Some(PeerReply::Error("unknown file other.txt".to_string())));
    }

    #[tokio::test]
    async fn quota_ends_session_after_limit() {
        let fixture = start_seeder(4096, 512, SeedingQuota::PerConnection(2)).await;
        let mut stream = TcpStream::connect(fixture.addr).await.unwrap();
        for id in 0..2 {
            assert!(matches!(ask(&mut stream, get_chunk(id)).await, Some(PeerReply::Chunk(_))));
        }
        assert_eq!(
            ask(&mut stream, get_chunk(2)).await,
            Some(PeerReply::Error("quota exhausted".to_string()))
        );
        assert!(matches!(read_frame(&mut stream, T).await, Err(FrameError::Closed)));

        // a fresh connection gets a fresh quota
        let mut stream = TcpStream::connect(fixture.addr).await.unwrap();
        assert!(matches!(ask(&mut stream, get_chunk(3)).await, Some(PeerReply::Chunk(_))));
    }

    #[tokio::test]
    async fn sessions_do_not_interfere() {
        let fixture = start_seeder(8192, 1024, SeedingQuota::Unlimited).await;
        let mut tasks = vec![];
        for order in [vec![0u64, 7, 3], vec![7u64, 0, 5]] {
            let addr = fixture.addr;
            let contents = fixture.contents.clone();
            tasks.push(tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                for id in order {
                    let start = id as usize * 1024;
                    match ask(&mut stream, get_chunk(id)).await {
                        Some(PeerReply::Chunk(bytes)) => {
                            assert_eq!(bytes.as_slice(), &contents[start..start + 1024])
                        }
                        other => panic!("unexpected {:?}", other),
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }
}
