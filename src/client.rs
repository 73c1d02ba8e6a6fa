use std::{
    fmt,
    sync::{Arc, atomic::{AtomicU64, Ordering}}
};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::server::Stream;

/// Permission level of an authenticated client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Unable to do anything
    None,
    /// Able to push metadata for a mount
    Meta,
    /// Able to be a source on a mount
    Source,
    /// Can do anything
    Admin
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AudioFormat {
    Mp3,
    Ogg,
    Unknown
}

impl AudioFormat {
    pub fn from_content_type(content_type: &[u8]) -> Self {
        match content_type {
            b"audio/mpeg" => AudioFormat::Mp3,
            b"audio/ogg" | b"application/ogg" => AudioFormat::Ogg,
            _ => AudioFormat::Unknown
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Ogg => "application/ogg",
            AudioFormat::Unknown => "application/octet-stream"
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioFormat::Mp3 => write!(f, "MP3"),
            AudioFormat::Ogg => write!(f, "OGG"),
            AudioFormat::Unknown => write!(f, "unknown")
        }
    }
}

/// Identifies a logical source client across separate requests.
///
/// The source stream and its metadata updates arrive on distinct
/// connections, so we collect as many stable identifiers as possible and
/// bundle them here. See [`ClientId::fingerprint`] for how two requests
/// are matched to each other.
#[derive(Debug, Clone)]
pub struct ClientId {
    /// Name given by the client, might be empty
    pub name: String,
    /// Password given by the client, might be empty
    pub pass: String,
    /// Permission level granted during authentication
    pub perm: Permission,
    /// Useragent used by the client
    pub agent: Option<String>,
    /// `ip:port` couple of the client
    pub addr: String,
    /// Mountpoint requested
    pub mount: String,
    /// Audio data format announced by the client
    pub format: AudioFormat
}

/// 64-bit FNV-1a hash correlating requests of one logical client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64  = 0x100000001b3;

impl ClientId {
    /// Hashes name, password, mount and the port-less address, in that
    /// order. Port and useragent are deliberately left out: they differ
    /// between the SOURCE connection and a later metadata request from
    /// the same client.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hash = FNV_OFFSET;
        for part in [
            self.name.as_bytes(),
            self.pass.as_bytes(),
            self.mount.as_bytes(),
            crate::utils::strip_port(&self.addr).as_bytes()
        ] {
            for byte in part {
                hash ^= *byte as u64;
                hash  = hash.wrapping_mul(FNV_PRIME);
            }
        }
        Fingerprint(hash)
    }
}

/// Identity of one admitted source connection.
///
/// Fingerprints collide when a client reconnects with the same
/// credentials from the same IP; the token never does, making it the
/// "same socket" comparison while the fingerprint stays the
/// "same logical user" one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceToken(u64);

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

impl SourceToken {
    pub fn next() -> Self {
        SourceToken(TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A connected source client and its hijacked socket.
pub struct Source {
    pub token: SourceToken,
    pub id: Arc<ClientId>,
    /// Last metadata received for this client, kept so a standby
    /// promotion can replay it upstream
    pub metadata: String,
    /// The hijacked socket, taken by the reader task on admission
    pub stream: Option<Stream>,
    /// Dropping this tells the reader task to hang up
    pub kill: Option<oneshot::Sender<()>>
}

impl Source {
    pub fn new(stream: Stream, id: ClientId) -> Self {
        Source {
            token: SourceToken::next(),
            id: Arc::new(id),
            metadata: String::new(),
            stream: Some(stream),
            kill: None
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}@{}", self.token, self.id.name, self.id.addr)
    }
}

/// A chunk of audio read by a source reader.
pub struct DataFrame {
    pub data: Vec<u8>,
    pub mount: String,
    pub token: SourceToken
}

/// A read failure, terminating its reader.
pub struct ErrFrame {
    pub err: std::io::Error,
    pub mount: String,
    pub token: SourceToken
}

/// Metadata in flight to the engine.
pub struct MetaPack {
    pub data: String,
    pub id: Arc<ClientId>,
    /// False until the pack went through the settle delay once
    pub seen: bool
}
