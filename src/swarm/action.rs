use std::net::{IpAddr, SocketAddr};

use tokio::sync::oneshot;

/// Datagrams understood by the tracker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackerMessage {
    RegisterSeeder { file: String, port: u16 },
    ChunkCount { file: String, port: u16, chunks: u64 },
    /// Pre-keyed form: applies to the sender's most recent registration.
    LegacyChunkCount { chunks: u64 },
    RequestSeeders { file: String },
    Alive { file: String, port: u16 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackerReply {
    Seeders(Vec<SeederInfo>),
    NoSeeders,
}

/// One entry of a discovery reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeederInfo {
    pub addr: SocketAddr,
    /// Advertised by the seeder; a scheduling hint only.
    pub chunks: u64,
}

/// Commands a leecher sends over a seeder session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerCommand {
    GetChunkCount { file: String },
    GetChunk { file: String, chunk_id: u64 },
    Done,
}

impl PeerCommand {
    /// The file key a command refers to, if any.
    pub fn file(&self) -> Option<&str> {
        match self {
            PeerCommand::GetChunkCount { file } | PeerCommand::GetChunk { file, .. } => Some(file),
            PeerCommand::Done => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerReply {
    ChunkCount(u64),
    Chunk(Vec<u8>),
    Error(String),
}

pub struct RegistryMessage {
    pub ip: IpAddr,
    pub action: RegistryAction,
}

pub enum RegistryAction {
    Register { file: String, port: u16 },
    ChunkCount { file: String, port: u16, chunks: u64 },
    LegacyChunkCount { chunks: u64 },
    Alive { file: String, port: u16 },
    Lookup {
        file: String,
        sender: oneshot::Sender<Vec<SeederInfo>>,
    },
}
