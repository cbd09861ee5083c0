use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use log::{debug, info};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;

use super::action::{RegistryAction, RegistryMessage, SeederInfo};

#[derive(Clone, Debug)]
pub struct SeederRecord {
    pub addr: SocketAddr,
    pub file: String,
    pub chunks: u64,
    pub registered_at: Instant,
    pub last_seen: Instant,
}

/// File key to seeders, in registration order. At most one record per
/// (address, file).
#[derive(Default)]
pub struct Registry {
    files: HashMap<String, Vec<SeederRecord>>,
    latest: HashMap<IpAddr, (String, u16)>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Returns `true` when the record is new. Re-registering only refreshes
    /// `last_seen`; the reported chunk count is kept.
    pub fn register(&mut self, addr: SocketAddr, file: &str, now: Instant) -> bool {
        self.latest.insert(addr.ip(), (file.to_string(), addr.port()));
        let records = self.files.entry(file.to_string()).or_default();
        if let Some(record) = records.iter_mut().find(|r| r.addr == addr) {
            record.last_seen = now;
            return false;
        }
        records.push(SeederRecord {
            addr,
            file: file.to_string(),
            chunks: 0,
            registered_at: now,
            last_seen: now,
        });
        true
    }

    fn record_mut(&mut self, addr: SocketAddr, file: &str) -> Option<&mut SeederRecord> {
        self.files
            .get_mut(file)?
            .iter_mut()
            .find(|r| r.addr == addr)
    }

    pub fn set_chunk_count(&mut self, addr: SocketAddr, file: &str, chunks: u64) -> bool {
        match self.record_mut(addr, file) {
            Some(record) => {
                record.chunks = chunks;
                true
            }
            None => false,
        }
    }

    /// Applies a chunk count to whatever `ip` registered last.
    pub fn set_latest_chunk_count(&mut self, ip: IpAddr, chunks: u64) -> bool {
        let Some((file, port)) = self.latest.get(&ip).cloned() else {
            return false;
        };
        self.set_chunk_count(SocketAddr::new(ip, port), &file, chunks)
    }

    pub fn touch(&mut self, addr: SocketAddr, file: &str, now: Instant) -> bool {
        match self.record_mut(addr, file) {
            Some(record) => {
                record.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Drops every record not seen within `ttl` of `now`.
    pub fn evict_stale(&mut self, now: Instant, ttl: Duration) -> usize {
        let mut evicted = 0;
        self.files.retain(|_, records| {
            records.retain(|r| {
                let alive = now.saturating_duration_since(r.last_seen) <= ttl;
                if !alive {
                    info!(
                        "Evicting stale seeder {} for {} (registered {}s ago)",
                        r.addr,
                        r.file,
                        now.saturating_duration_since(r.registered_at).as_secs()
                    );
                    evicted += 1;
                }
                alive
            });
            !records.is_empty()
        });
        let files = &self.files;
        self.latest.retain(|ip, (file, port)| {
            files
                .get(file)
                .is_some_and(|records| records.iter().any(|r| r.addr == SocketAddr::new(*ip, *port)))
        });
        evicted
    }

    pub fn seeders(&self, file: &str) -> Vec<SeederInfo> {
        self.files
            .get(file)
            .map(|records| {
                records
                    .iter()
                    .map(|r| SeederInfo {
                        addr: r.addr,
                        chunks: r.chunks,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len_for(&self, file: &str) -> usize {
        self.files.get(file).map_or(0, Vec::len)
    }
}

#[derive(Clone)]
pub struct RegistryHandle {
    pub sender: mpsc::Sender<RegistryMessage>,
}

impl RegistryHandle {
    pub fn new(ttl: Duration) -> RegistryHandle {
        let (sender, receiver) = mpsc::channel(1000);
        let actor = RegistryActor {
            receiver,
            registry: Registry::new(),
            ttl,
        };
        tokio::spawn(async move {
            run_registry_actor(actor).await;
        });
        RegistryHandle { sender }
    }

    pub async fn apply(&self, ip: IpAddr, action: RegistryAction) {
        let _ = self.sender.send(RegistryMessage { ip, action }).await;
    }

    pub async fn lookup(&self, ip: IpAddr, file: String) -> Vec<SeederInfo> {
        let (sender, receiver) = oneshot::channel();
        self.apply(ip, RegistryAction::Lookup { file, sender }).await;
        receiver.await.unwrap_or_default()
    }
}

struct RegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    registry: Registry,
    ttl: Duration,
}

async fn run_registry_actor(mut actor: RegistryActor) {
    let mut sweep_interval = interval(actor.ttl.max(Duration::from_secs(1)));
    loop {
        select! {
            message = actor.receiver.recv() => {
                let Some(message) = message else {
                    break;
                };
                handle_message(&mut actor, message);
            }
            _ = sweep_interval.tick() => {
                let evicted = actor.registry.evict_stale(Instant::now(), actor.ttl);
                if evicted > 0 {
                    debug!("Sweep evicted {} seeders", evicted);
                }
            }
        }
    }
}

fn handle_message(actor: &mut RegistryActor, message: RegistryMessage) {
    let now = Instant::now();
    let registry = &mut actor.registry;
    match message.action {
        RegistryAction::Register { file, port } => {
            let addr = SocketAddr::new(message.ip, port);
            if registry.register(addr, &file, now) {
                info!(
                    "Seeder {} registered for {} ({} known)",
                    addr,
                    file,
                    registry.len_for(&file)
                );
            } else {
                debug!("Seeder {} re-registered for {}", addr, file);
            }
        }
        RegistryAction::ChunkCount { file, port, chunks } => {
            let addr = SocketAddr::new(message.ip, port);
            if registry.set_chunk_count(addr, &file, chunks) {
                info!("Seeder {} has {} chunks of {}", addr, chunks, file);
            } else {
                debug!("Chunk count from unregistered seeder {} for {}", addr, file);
            }
        }
        RegistryAction::LegacyChunkCount { chunks } => {
            if !registry.set_latest_chunk_count(message.ip, chunks) {
                debug!("Chunk count from {} with no prior registration", message.ip);
            }
        }
        RegistryAction::Alive { file, port } => {
            let addr = SocketAddr::new(message.ip, port);
            if !registry.touch(addr, &file, now) {
                debug!("Heartbeat from unknown seeder {} for {}", addr, file);
            }
        }
        RegistryAction::Lookup { file, sender } => {
            registry.evict_stale(now, actor.ttl);
            let _ = sender.send(registry.seeders(&file));
        }
    }
}
