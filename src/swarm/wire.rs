//! Text encoding of tracker datagrams and the framed seeder session protocol.
//!
//! Tracker messages are one datagram each, space separated. Seeder sessions
//! exchange frames of `u32` big-endian length, `u8` kind and payload, where
//! the length counts the kind byte. File keys are form-urlencoded on the wire
//! so that keys containing spaces survive tokenizing.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::action::{PeerCommand, PeerReply, SeederInfo, TrackerMessage, TrackerReply};
use super::{MAX_FRAME_LEN, WRITE_SLICE};

pub const KIND_COMMAND: u8 = 0;
pub const KIND_CHUNK_COUNT: u8 = 1;
pub const KIND_CHUNK: u8 = 2;
pub const KIND_ERROR: u8 = 3;

pub fn encode_key(key: &str) -> String {
    url::form_urlencoded::byte_serialize(key.as_bytes()).collect()
}

pub fn decode_key(token: &str) -> Option<String> {
    if token.is_empty() || token.contains(['=', '&']) {
        return None;
    }
    url::form_urlencoded::parse(token.as_bytes())
        .next()
        .map(|(key, _)| key.into_owned())
        .filter(|key| !key.is_empty())
}

impl TrackerMessage {
    pub fn encode(&self) -> String {
        match self {
            TrackerMessage::RegisterSeeder { file, port } => {
                format!("REGISTER_SEEDER {} {}", encode_key(file), port)
            }
            TrackerMessage::ChunkCount { file, port, chunks } => {
                format!("CHUNK_COUNT {} {} {}", encode_key(file), port, chunks)
            }
            TrackerMessage::LegacyChunkCount { chunks } => format!("CHUNK_COUNT {}", chunks),
            TrackerMessage::RequestSeeders { file } => {
                format!("REQUEST_SEEDERS {}", encode_key(file))
            }
            TrackerMessage::Alive { file, port } => format!("ALIVE {} {}", encode_key(file), port),
        }
    }

    /// Returns `None` for anything malformed; the tracker drops those silently.
    pub fn parse(text: &str) -> Option<TrackerMessage> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        match tokens.as_slice() {
            ["REGISTER_SEEDER", file, port] => Some(TrackerMessage::RegisterSeeder {
                file: decode_key(file)?,
                port: port.parse().ok()?,
            }),
            ["CHUNK_COUNT", file, port, chunks] => Some(TrackerMessage::ChunkCount {
                file: decode_key(file)?,
                port: port.parse().ok()?,
                chunks: chunks.parse().ok()?,
            }),
            ["CHUNK_COUNT", chunks] => Some(TrackerMessage::LegacyChunkCount {
                chunks: chunks.parse().ok()?,
            }),
            ["REQUEST_SEEDERS", file] => Some(TrackerMessage::RequestSeeders {
                file: decode_key(file)?,
            }),
            ["ALIVE", file, port] => Some(TrackerMessage::Alive {
                file: decode_key(file)?,
                port: port.parse().ok()?,
            }),
            _ => None,
        }
    }
}

impl TrackerReply {
    pub fn encode(&self) -> String {
        match self {
            TrackerReply::Seeders(seeders) if !seeders.is_empty() => {
                let entries: Vec<String> = seeders
                    .iter()
                    .map(|s| format!("{}:{}", s.addr, s.chunks))
                    .collect();
                format!("SEEDERS {}", entries.join(" "))
            }
            _ => "NO_SEEDERS".to_string(),
        }
    }

    pub fn parse(text: &str) -> Option<TrackerReply> {
        let mut tokens = text.split_whitespace();
        match tokens.next()? {
            "NO_SEEDERS" => Some(TrackerReply::NoSeeders),
            "SEEDERS" => {
                let seeders = tokens.map(parse_seeder).collect::<Option<Vec<_>>>()?;
                if seeders.is_empty() {
                    Some(TrackerReply::NoSeeders)
                } else {
                    Some(TrackerReply::Seeders(seeders))
                }
            }
            _ => None,
        }
    }
}

fn parse_seeder(token: &str) -> Option<SeederInfo> {
    if let Some((addr, chunks)) = token.rsplit_once(':') {
        if let (Ok(addr), Ok(chunks)) = (addr.parse::<SocketAddr>(), chunks.parse::<u64>()) {
            return Some(SeederInfo { addr, chunks });
        }
    }
    // bare `ip:port`, no chunk hint
    token
        .parse::<SocketAddr>()
        .ok()
        .map(|addr| SeederInfo { addr, chunks: 0 })
}

impl PeerCommand {
    pub fn encode(&self) -> String {
        match self {
            PeerCommand::GetChunkCount { file } => format!("GET_CHUNK_COUNT {}", encode_key(file)),
            PeerCommand::GetChunk { file, chunk_id } => {
                format!("GET_CHUNK {} {}", encode_key(file), chunk_id)
            }
            PeerCommand::Done => "DONE".to_string(),
        }
    }

    pub fn parse(text: &str) -> Option<PeerCommand> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        match tokens.as_slice() {
            ["GET_CHUNK_COUNT", file] => Some(PeerCommand::GetChunkCount {
                file: decode_key(file)?,
            }),
            ["GET_CHUNK", file, id] => Some(PeerCommand::GetChunk {
                file: decode_key(file)?,
                chunk_id: id.parse().ok()?,
            }),
            ["DONE"] => Some(PeerCommand::Done),
            _ => None,
        }
    }
}

impl PeerReply {
    pub fn kind(&self) -> u8 {
        match self {
            PeerReply::ChunkCount(_) => KIND_CHUNK_COUNT,
            PeerReply::Chunk(_) => KIND_CHUNK,
            PeerReply::Error(_) => KIND_ERROR,
        }
    }

    pub fn from_frame(frame: Frame) -> Option<PeerReply> {
        match frame.kind {
            KIND_CHUNK_COUNT => std::str::from_utf8(&frame.payload)
                .ok()?
                .trim()
                .parse()
                .ok()
                .map(PeerReply::ChunkCount),
            KIND_CHUNK => Some(PeerReply::Chunk(frame.payload)),
            KIND_ERROR => {
                let text = String::from_utf8_lossy(&frame.payload);
                let reason = text.strip_prefix("ERROR").unwrap_or(&text).trim();
                Some(PeerReply::Error(reason.to_string()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum FrameError {
    /// The peer closed the stream before a new frame started.
    Closed,
    TimedOut,
    Truncated { expected: usize, received: usize },
    Oversized(usize),
    Io(io::Error),
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        FrameError::Io(err)
    }
}

/// Reads until `buf` is full or the stream ends. Each read carries its own
/// deadline.
async fn read_full<R>(reader: &mut R, buf: &mut [u8], io_timeout: Duration) -> Result<usize, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = timeout(io_timeout, reader.read(&mut buf[filled..]))
            .await
            .map_err(|_| FrameError::TimedOut)??;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

pub async fn read_frame<R>(reader: &mut R, io_timeout: Duration) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    match read_full(reader, &mut header, io_timeout).await? {
        0 => return Err(FrameError::Closed),
        5 => {}
        n => {
            return Err(FrameError::Truncated {
                expected: header.len(),
                received: n,
            })
        }
    }
    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if length == 0 || length > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(length));
    }
    let mut payload = vec![0u8; length - 1];
    let received = read_full(reader, &mut payload, io_timeout).await?;
    if received < payload.len() {
        return Err(FrameError::Truncated {
            expected: payload.len(),
            received,
        });
    }
    Ok(Frame {
        kind: header[4],
        payload,
    })
}

/// Writes one frame, pushing the payload in slices of at most `WRITE_SLICE`
/// bytes. A write that accepts zero bytes aborts the frame.
pub async fn write_frame<W>(writer: &mut W, kind: u8, payload: &[u8], io_timeout: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() + 1 > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", payload.len() + 1),
        ));
    }
    let mut header = [0u8; 5];
    header[..4].copy_from_slice(&(payload.len() as u32 + 1).to_be_bytes());
    header[4] = kind;
    with_deadline(io_timeout, writer.write_all(&header)).await?;

    let mut written = 0;
    while written < payload.len() {
        let end = std::cmp::min(written + WRITE_SLICE, payload.len());
        let n = with_deadline(io_timeout, writer.write(&payload[written..end])).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "peer stopped accepting bytes",
            ));
        }
        written += n;
    }
    with_deadline(io_timeout, writer.flush()).await
}

async fn with_deadline<T>(
    io_timeout: Duration,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> io::Result<T> {
    timeout(io_timeout, fut)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
}

pub async fn send_command<W>(writer: &mut W, command: &PeerCommand, io_timeout: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, KIND_COMMAND, command.encode().as_bytes(), io_timeout).await
}

pub async fn send_reply<W>(writer: &mut W, reply: &PeerReply, io_timeout: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match reply {
        PeerReply::ChunkCount(count) => {
            write_frame(writer, reply.kind(), count.to_string().as_bytes(), io_timeout).await
        }
        PeerReply::Chunk(bytes) => write_frame(writer, reply.kind(), bytes, io_timeout).await,
        PeerReply::Error(reason) => {
            let text = format!("ERROR {}", reason);
            write_frame(writer, reply.kind(), text.as_bytes(), io_timeout).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(1);

    #[test]
    fn keys_with_spaces_survive_tokenizing() {
        let msg = TrackerMessage::RegisterSeeder {
            file: "my holiday photos.tar".to_string(),
            port: 7000,
        };
        let text = msg.encode();
        assert_eq!(text.split_whitespace().count(), 3);
        assert_eq!(TrackerMessage::parse(&text), Some(msg));
    }

    #[test]
    fn plain_keys_are_unchanged() {
        assert_eq!(
            TrackerMessage::parse("REQUEST_SEEDERS sample.txt"),
            Some(TrackerMessage::RequestSeeders {
                file: "sample.txt".to_string()
            })
        );
    }

    #[test]
    fn malformed_tracker_messages_are_rejected() {
        for text in [
            "",
            "REGISTER_SEEDER sample.txt",
            "REGISTER_SEEDER sample.txt 70000",
            "REGISTER_SEEDER sample.txt -1",
            "REGISTER_SEEDER sample.txt 7000 extra",
            "CHUNK_COUNT many",
            "ALIVE sample.txt",
            "HELLO",
            "REQUEST_SEEDERS a=b",
        ] {
            assert_eq!(TrackerMessage::parse(text), None, "{:?}", text);
        }
    }

    #[test]
    fn chunk_count_forms() {
        assert_eq!(
            TrackerMessage::parse("CHUNK_COUNT sample.txt 7000 12"),
            Some(TrackerMessage::ChunkCount {
                file: "sample.txt".to_string(),
                port: 7000,
                chunks: 12
            })
        );
        assert_eq!(
            TrackerMessage::parse("CHUNK_COUNT 12"),
            Some(TrackerMessage::LegacyChunkCount { chunks: 12 })
        );
    }

    #[test]
    fn seeders_reply_keeps_order_and_hints() {
        let reply = TrackerReply::Seeders(vec![
            SeederInfo {
                addr: "10.0.0.2:7000".parse().unwrap(),
                chunks: 4,
            },
            SeederInfo {
                addr: "[::1]:7001".parse().unwrap(),
                chunks: 0,
            },
        ]);
        let text = reply.encode();
        assert_eq!(text, "SEEDERS 10.0.0.2:7000:4 [::1]:7001:0");
        assert_eq!(TrackerReply::parse(&text), Some(reply));
    }

    #[test]
    fn bare_address_entries_are_accepted() {
        assert_eq!(
            TrackerReply::parse("SEEDERS 10.0.0.2:7000"),
            Some(TrackerReply::Seeders(vec![SeederInfo {
                addr: "10.0.0.2:7000".parse().unwrap(),
                chunks: 0
            }]))
        );
        assert_eq!(TrackerReply::parse("SEEDERS"), Some(TrackerReply::NoSeeders));
        assert_eq!(TrackerReply::parse("SEEDERS nonsense"), None);
        assert_eq!(TrackerReply::Seeders(vec![]).encode(), "NO_SEEDERS");
    }

    #[test]
    fn peer_commands_parse() {
        assert_eq!(
            PeerCommand::parse("GET_CHUNK sample.txt 3"),
            Some(PeerCommand::GetChunk {
                file: "sample.txt".to_string(),
                chunk_id: 3
            })
        );
        assert_eq!(PeerCommand::parse("DONE"), Some(PeerCommand::Done));
        assert_eq!(PeerCommand::parse("GET_CHUNK sample.txt"), None);
        assert_eq!(PeerCommand::parse("GET_CHUNK sample.txt -3"), None);
    }

    #[tokio::test]
    async fn large_payload_is_framed_intact() {
        let payload: Vec<u8> = (0..WRITE_SLICE * 3 + 17).map(|i| (i % 251) as u8).collect();
        let (mut client, mut server) = tokio::io::duplex(1024);
        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            write_frame(&mut client, KIND_CHUNK, &sent, T).await.unwrap();
        });
        let frame = read_frame(&mut server, T).await.unwrap();
        writer.await.unwrap();
        assert_eq!(frame.kind, KIND_CHUNK);
        assert_eq!(frame.payload, payload);
    }

    #[tokio::test]
    async fn closed_and_truncated_streams_are_distinguished() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(matches!(read_frame(&mut server, T).await, Err(FrameError::Closed)));

        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 11, KIND_CHUNK, 1, 2, 3]).await.unwrap();
        drop(client);
        match read_frame(&mut server, T).await {
            Err(FrameError::Truncated { expected, received }) => {
                assert_eq!(expected, 10);
                assert_eq!(received, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (_client, mut server) = tokio::io::duplex(64);
        let result = read_frame(&mut server, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(FrameError::TimedOut)));
    }

    #[tokio::test]
    async fn error_reply_carries_reason() {
        let (mut client, mut server) = tokio::io::duplex(256);
        send_reply(&mut client, &PeerReply::Error("quota exhausted".to_string()), T)
            .await
            .unwrap();
        let frame = read_frame(&mut server, T).await.unwrap();
        assert_eq!(
            PeerReply::from_frame(frame),
            Some(PeerReply::Error("quota exhausted".to_string()))
        );
    }
}
