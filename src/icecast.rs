use std::{sync::Arc, time::Duration};
use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    net::TcpStream,
    io::{AsyncBufReadExt, AsyncWriteExt, BufStream},
    time::timeout
};
use tracing::debug;

use crate::{
    client::AudioFormat,
    config::{UpstreamProtocol, UpstreamSettings},
    utils::basic_auth
};

/// Errors coming out of an upstream sink.
///
/// Only [`SinkError::Insane`] and [`SinkError::OutOfMemory`] are fatal:
/// they mean engine state went bad and the supervisor must rebuild it.
/// Everything else is local to the current packet or request.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink driven in an impossible state")]
    Insane,
    #[error("sink ran out of memory")]
    OutOfMemory,
    #[error("upstream rejected the request with status {0}")]
    Rejected(u16),
    #[error("metadata is unsupported for this stream format")]
    Unsupported,
    #[error("transport failed: {0}")]
    Transport(#[from] std::io::Error)
}

impl SinkError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SinkError::Insane | SinkError::OutOfMemory)
    }
}

/// Mount-specific settings applied before the first open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkOptions {
    pub mount: String,
    pub format: AudioFormat
}

/// One connection to the upstream icecast server, serving one mount.
///
/// `send` with a [`SinkError::Transport`] result means the packet was
/// ditched and the sink must be closed; the next packet will reconnect.
#[async_trait]
pub trait UpstreamSink: Send {
    /// Must be called once before the first `open`
    fn apply_options(&mut self, options: SinkOptions);
    fn connected(&self) -> bool;
    async fn open(&mut self) -> Result<(), SinkError>;
    /// Always safe to call, also on a sink that never opened
    async fn close(&mut self) -> Result<(), SinkError>;
    async fn send(&mut self, data: &[u8]) -> Result<(), SinkError>;
    async fn send_metadata(&mut self, metadata: &str) -> Result<(), SinkError>;
}

/// Creates one sink per mount; swapped for a recording mock in tests
pub trait SinkFactory: Send + Sync {
    fn create(&self) -> Box<dyn UpstreamSink>;
}

pub struct IcecastSink {
    settings: Arc<UpstreamSettings>,
    options: Option<SinkOptions>,
    stream: Option<BufStream<TcpStream>>
}

impl IcecastSink {
    pub fn new(settings: Arc<UpstreamSettings>) -> Self {
        IcecastSink {
            settings,
            options: None,
            stream: None
        }
    }

    async fn read_status(stream: &mut BufStream<TcpStream>) -> Result<u16, SinkError> {
        let mut line = String::new();
        stream.read_line(&mut line).await?;

        // A status line is either `HTTP/1.x <code> <reason>` or the
        // bare `OK`/`OK2` of the legacy protocols
        let legacy = line.trim_end();
        if legacy.eq("OK") || legacy.eq("OK2") || legacy.starts_with("ICY 200") {
            return Ok(200);
        }

        let code = line
            .split_whitespace()
            .nth(1)
            .and_then(|v| v.parse::<u16>().ok());

        match code {
            Some(v) => Ok(v),
            None => Err(SinkError::Transport(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upstream sent an unparsable status line"
            )))
        }
    }

    /// Drain response headers up to the empty line so the connection is
    /// positioned for raw audio writes
    async fn drain_headers(stream: &mut BufStream<TcpStream>) -> Result<(), SinkError> {
        let mut read = 0usize;
        loop {
            let mut line = String::new();
            let n = stream.read_line(&mut line).await?;
            read += n;
            if n == 0 || line.eq("\r\n") || line.eq("\n") {
                return Ok(());
            }
            if read > 8192 {
                return Err(SinkError::Transport(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "upstream response headers too long"
                )));
            }
        }
    }

    fn directory_headers(&self, prefix: &str) -> String {
        let mut headers = format!("{}name: {}\r\n{}public: {}\r\n",
            prefix, self.settings.name,
            prefix, self.settings.public as usize
        );
        if let Some(url) = self.settings.url.as_ref() {
            headers.push_str(&format!("{}url: {}\r\n", prefix, url));
        }
        if let Some(genre) = self.settings.genre.as_ref() {
            headers.push_str(&format!("{}genre: {}\r\n", prefix, genre));
        }
        if let Some(description) = self.settings.description.as_ref() {
            headers.push_str(&format!("{}description: {}\r\n", prefix, description));
        }
        headers
    }

    async fn handshake(&self, options: &SinkOptions) -> Result<BufStream<TcpStream>, SinkError> {
        let stream     = TcpStream::connect((self.settings.host.as_str(), self.settings.port)).await?;
        let mut stream = BufStream::new(stream);

        match self.settings.protocol {
            UpstreamProtocol::Http => {
                stream.write_all(format!("SOURCE {} HTTP/1.0\r\n\
Authorization: Basic {}\r\n\
Host: {}:{}\r\n\
User-Agent: {}\r\n\
Content-Type: {}\r\n\
{}\r\n",
                    options.mount,
                    basic_auth(&self.settings.user, &self.settings.pass),
                    self.settings.host, self.settings.port,
                    self.settings.agent,
                    options.format.content_type(),
                    self.directory_headers("ice-")
                ).as_bytes()).await?;
            },
            UpstreamProtocol::Xaudiocast => {
                stream.write_all(format!("SOURCE {} {}\r\n\
x-audiocast-mount: {}\r\n\
{}\r\n",
                    self.settings.pass, options.mount,
                    options.mount,
                    self.directory_headers("x-audiocast-")
                ).as_bytes()).await?;
            },
            UpstreamProtocol::Icy => {
                stream.write_all(format!("{}\r\n\
{}content-type: {}\r\n\r\n",
                    self.settings.pass,
                    self.directory_headers("icy-"),
                    options.format.content_type()
                ).as_bytes()).await?;
            }
        }
        stream.flush().await?;

        match Self::read_status(&mut stream).await? {
            200 => (),
            code => return Err(SinkError::Rejected(code))
        }
        if let UpstreamProtocol::Http = self.settings.protocol {
            Self::drain_headers(&mut stream).await?;
        }

        Ok(stream)
    }

    /// Metadata updates ride a separate short-lived request, the same
    /// way libshout does it for MP3 streams
    async fn updinfo(&self, options: &SinkOptions, metadata: &str) -> Result<(), SinkError> {
        let stream     = TcpStream::connect((self.settings.host.as_str(), self.settings.port)).await?;
        let mut stream = BufStream::new(stream);

        stream.write_all(format!("GET /admin/metadata?mode=updinfo&mount={}&song={} HTTP/1.0\r\n\
Authorization: Basic {}\r\n\
Host: {}:{}\r\n\
User-Agent: {}\r\n\r\n",
            urlencoding::encode(&options.mount),
            urlencoding::encode(metadata),
            basic_auth(&self.settings.user, &self.settings.pass),
            self.settings.host, self.settings.port,
            self.settings.agent
        ).as_bytes()).await?;
        stream.flush().await?;

        match Self::read_status(&mut stream).await? {
            200 => Ok(()),
            code => Err(SinkError::Rejected(code))
        }
    }
}

#[async_trait]
impl UpstreamSink for IcecastSink {
    fn apply_options(&mut self, options: SinkOptions) {
        self.options = Some(options);
    }

    fn connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn open(&mut self) -> Result<(), SinkError> {
        if self.stream.is_some() {
            // Callers must guard with `connected`, an open sink can't
            // be opened twice
            return Err(SinkError::Insane);
        }
        let options = match self.options.as_ref() {
            Some(v) => v,
            None => return Err(SinkError::Insane)
        };

        let wait    = Duration::from_millis(self.settings.timeout);
        let stream  = match timeout(wait, self.handshake(options)).await {
            Ok(v) => v?,
            Err(e) => return Err(SinkError::Transport(e.into()))
        };

        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Closing upstream connection reported: {}", e);
            }
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let stream = match self.stream.as_mut() {
            Some(v) => v,
            None => return Err(SinkError::Transport(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "send on a closed sink"
            )))
        };

        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn send_metadata(&mut self, metadata: &str) -> Result<(), SinkError> {
        let options = match self.options.as_ref() {
            Some(v) => v,
            None => return Err(SinkError::Insane)
        };
        if !matches!(options.format, AudioFormat::Mp3) {
            // Icecast only takes out of band metadata for mp3
            return Err(SinkError::Unsupported);
        }

        let wait = Duration::from_millis(self.settings.timeout);
        match timeout(wait, self.updinfo(options, metadata)).await {
            Ok(v) => v,
            Err(e) => Err(SinkError::Transport(e.into()))
        }
    }
}

pub struct IcecastSinkFactory {
    settings: Arc<UpstreamSettings>
}

impl IcecastSinkFactory {
    pub fn new(settings: UpstreamSettings) -> Self {
        IcecastSinkFactory { settings: Arc::new(settings) }
    }
}

impl SinkFactory for IcecastSinkFactory {
    fn create(&self) -> Box<dyn UpstreamSink> {
        Box::new(IcecastSink::new(self.settings.clone()))
    }
}
