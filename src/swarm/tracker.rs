use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

use super::action::{RegistryAction, SeederInfo, TrackerMessage, TrackerReply};
use super::config::TrackerConfig;
use super::error::{Result, SwarmError};
use super::registry::RegistryHandle;
use super::{MAX_DATAGRAM, MAX_SEEDERS_PER_REPLY};

/// UDP tracker. Fire-and-forget: nothing but discovery requests gets a reply.
pub struct Tracker {
    socket: Arc<UdpSocket>,
    registry: RegistryHandle,
}

impl Tracker {
    pub async fn bind(config: &TrackerConfig) -> Result<Tracker> {
        let socket = UdpSocket::bind(config.bind).await?;
        Ok(Tracker {
            socket: Arc::new(socket),
            registry: RegistryHandle::new(config.seeder_ttl),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        info!("Tracker listening on {}", self.local_addr()?);
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    // ICMP port-unreachable surfaces here on some platforms
                    warn!("Tracker receive failed: {}", err);
                    continue;
                }
            };
            self.dispatch(&buf[..len], from).await;
        }
    }

    /// Mutations go to the registry in arrival order; lookups are answered
    /// on their own task.
    async fn dispatch(&self, datagram: &[u8], from: SocketAddr) {
        let Some(message) = std::str::from_utf8(datagram).ok().and_then(TrackerMessage::parse) else {
            debug!("Dropping malformed datagram from {}", from);
            return;
        };
        let ip = from.ip();
        let action = match message {
            TrackerMessage::RegisterSeeder { file, port } => RegistryAction::Register { file, port },
            TrackerMessage::ChunkCount { file, port, chunks } => {
                RegistryAction::ChunkCount { file, port, chunks }
            }
            TrackerMessage::LegacyChunkCount { chunks } => RegistryAction::LegacyChunkCount { chunks },
            TrackerMessage::Alive { file, port } => RegistryAction::Alive { file, port },
            TrackerMessage::RequestSeeders { file } => {
                let socket = self.socket.clone();
                let registry = self.registry.clone();
                tokio::spawn(async move {
                    answer_lookup(&socket, &registry, file, from).await;
                });
                return;
            }
        };
        self.registry.apply(ip, action).await;
    }
}

async fn answer_lookup(socket: &UdpSocket, registry: &RegistryHandle, file: String, from: SocketAddr) {
    let seeders: Vec<SeederInfo> = registry
        .lookup(from.ip(), file.clone())
        .await
        .into_iter()
        .take(MAX_SEEDERS_PER_REPLY)
        .collect();
    info!("{} asked for {}: {} seeders", from, file, seeders.len());
    let reply = TrackerReply::Seeders(seeders).encode();
    if let Err(err) = socket.send_to(reply.as_bytes(), from).await {
        warn!("Could not answer {}: {}", from, err);
    }
}

/// An unbound local address of the same family as `remote`.
pub(crate) fn any_local(remote: SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

pub async fn announce(socket: &UdpSocket, tracker: SocketAddr, message: &TrackerMessage, io_timeout: Duration) -> Result<()> {
    let text = message.encode();
    timeout(io_timeout, socket.send_to(text.as_bytes(), tracker))
        .await
        .map_err(|_| SwarmError::connection("tracker send timed out"))?
        .map_err(SwarmError::connection)?;
    debug!("Sent {:?} to tracker {}", text, tracker);
    Ok(())
}

/// Asks the tracker who seeds `file`. A single attempt: no reply within
/// `deadline` is a `DiscoveryTimeout`.
pub async fn request_seeders(tracker: SocketAddr, file: &str, deadline: Duration) -> Result<Vec<SeederInfo>> {
    let socket = UdpSocket::bind(any_local(tracker)).await?;
    let request = TrackerMessage::RequestSeeders {
        file: file.to_string(),
    };
    announce(&socket, tracker, &request, deadline).await?;

    let expires = Instant::now() + deadline;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = tokio::time::timeout_at(expires, socket.recv_from(&mut buf))
            .await
            .map_err(|_| SwarmError::DiscoveryTimeout)?
            .map_err(SwarmError::connection)?;
        if from != tracker {
            debug!("Ignoring datagram from {} while waiting on tracker", from);
            continue;
        }
        let text = String::from_utf8_lossy(&buf[..len]);
        return match TrackerReply::parse(&text) {
            Some(TrackerReply::Seeders(seeders)) => Ok(seeders),
            Some(TrackerReply::NoSeeders) => Err(SwarmError::NoSeedersAvailable),
            None => Err(SwarmError::violation(format!("bad tracker reply {:?}", text))),
        };
    }
}
