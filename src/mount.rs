use std::collections::VecDeque;
use hashbrown::HashMap;
use tracing::{error, info};

use crate::{
    client::{Fingerprint, Source, SourceToken},
    icecast::{SinkError, UpstreamSink}
};

/// State of one mountpoint: every connected source, which of them is
/// live, who waits in line, and the upstream connection.
///
/// Nothing in here is synchronized. The engine task is the only one
/// allowed to touch a mount.
pub struct Mount {
    pub name: String,
    pub sink: Box<dyn UpstreamSink>,
    /// All connected sources keyed by their connection token
    sources: HashMap<SourceToken, Source>,
    /// Fingerprint index into `sources` for metadata correlation.
    /// Colliding fingerprints overwrite each other; the worst case is
    /// metadata landing on a neighbor until its next update
    by_fingerprint: HashMap<Fingerprint, SourceToken>,
    /// FIFO queue of standby sources waiting to go live
    standby: VecDeque<SourceToken>,
    queue_limit: usize,
    /// The source whose audio currently reaches the upstream, None only
    /// while the mount waits for collection
    pub live: Option<SourceToken>
}

impl Mount {
    pub fn new(name: String, sink: Box<dyn UpstreamSink>, queue_limit: usize) -> Self {
        Mount {
            name,
            sink,
            sources: HashMap::new(),
            by_fingerprint: HashMap::new(),
            standby: VecDeque::new(),
            queue_limit,
            live: None
        }
    }

    pub fn insert(&mut self, source: Source) {
        self.by_fingerprint.insert(source.id.fingerprint(), source.token);
        self.sources.insert(source.token, source);
    }

    /// Takes a source out of both indices and the standby queue
    pub fn remove(&mut self, token: SourceToken) -> Option<Source> {
        let source = self.sources.remove(&token)?;
        if self.by_fingerprint.get(&source.id.fingerprint()) == Some(&token) {
            self.by_fingerprint.remove(&source.id.fingerprint());
        }
        self.standby.retain(|queued| *queued != token);
        Some(source)
    }

    pub fn get(&self, token: SourceToken) -> Option<&Source> {
        self.sources.get(&token)
    }

    pub fn by_fingerprint(&self, fingerprint: Fingerprint) -> Option<&Source> {
        self.sources.get(self.by_fingerprint.get(&fingerprint)?)
    }

    pub fn by_fingerprint_mut(&mut self, fingerprint: Fingerprint) -> Option<&mut Source> {
        self.sources.get_mut(self.by_fingerprint.get(&fingerprint)?)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn live_fingerprint(&self) -> Option<Fingerprint> {
        self.live
            .and_then(|token| self.sources.get(&token))
            .map(|source| source.id.fingerprint())
    }

    /// Queues a source for promotion, refusing duplicates and anything
    /// past the configured limit
    pub fn enqueue_standby(&mut self, token: SourceToken) -> bool {
        if self.standby.len() >= self.queue_limit {
            return false;
        }
        if self.standby.contains(&token) {
            return true;
        }
        self.standby.push_back(token);
        true
    }

    /// Pops the oldest standby still connected to this mount. Tokens of
    /// sources that left in the meantime are skipped.
    pub fn next_standby(&mut self) -> Option<SourceToken> {
        while let Some(token) = self.standby.pop_front() {
            if self.sources.contains_key(&token) {
                return Some(token);
            }
        }
        None
    }

    /// Sends one audio packet upstream.
    ///
    /// This is the only place that manages the upstream connection. It
    /// checks the connection on every packet and reconnects when it is
    /// down; when the connection dies between the check and the send,
    /// the packet is ditched and the next call reconnects.
    ///
    /// A fatal sink error is handed back to the caller, everything else
    /// is resolved here by dropping the packet.
    pub async fn forward(&mut self, data: &[u8]) -> Result<(), SinkError> {
        if !self.sink.connected() {
            // Close first to be sure of no lingering connections
            _ = self.sink.close().await;

            info!("icecast connect: {}", self.name);
            if let Err(e) = self.sink.open().await {
                error!("icecast error: {} ({})", self.name, e);
                // Ditch the data and retry on the next packet
                return Ok(());
            }
        }

        match self.sink.send(data).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                // Network trouble, ditch the current packet; the next
                // one will reconnect
                error!("icecast error: {} ({})", self.name, e);
                _ = self.sink.close().await;
                Ok(())
            }
        }
    }
}
