use std::{sync::Arc, time::Duration};
use hashbrown::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::{
    client::{AudioFormat, DataFrame, ErrFrame, Fingerprint, MetaPack, Source, SourceToken},
    config::Limits,
    hooks::SourceHandler,
    icecast::{SinkFactory, SinkOptions},
    mount::Mount,
    stream
};

/// Delay before a freshly received metadata pack goes upstream.
/// Sources usually push metadata right behind their first audio bytes;
/// packs arriving within the window coalesce into one upstream update.
const METADATA_SETTLE: Duration = Duration::from_secs(1);

/// Cadence at which metadata stashed for not-yet-existing mounts is
/// thrown away
const STASH_TTL: Duration = Duration::from_secs(5);

/// Window an empty mount keeps its upstream connection, so two sources
/// swapping each other out with a small overlap reuse it
const COLLECT_GRACE: Duration = Duration::from_secs(5);

/// Write ends of the engine channels held by producers.
///
/// These go stale when the supervisor swaps the engine out; producers
/// must re-fetch them from the [`crate::supervisor::EngineHandle`] per
/// request instead of keeping a copy.
#[derive(Clone)]
pub struct EngineSenders {
    pub admit: mpsc::Sender<Source>,
    pub meta: mpsc::Sender<MetaPack>
}

/// The source multiplexer: a single task owning every mount.
///
/// All mutation of mount state happens inside `process_events`, one
/// event at a time. Everything else in the process talks to it through
/// the bounded channels created in [`Engine::new`].
pub struct Engine {
    mounts: HashMap<String, Mount>,
    /// Metadata received before its source connected, keyed by client
    /// fingerprint
    meta_stash: HashMap<Fingerprint, String>,
    limits: Limits,
    sinks: Arc<dyn SinkFactory>,
    handler: Arc<dyn SourceHandler>,

    admit_rx: mpsc::Receiver<Source>,
    data_rx: mpsc::Receiver<DataFrame>,
    err_rx: mpsc::Receiver<ErrFrame>,
    meta_rx: mpsc::Receiver<MetaPack>,
    collect_rx: mpsc::Receiver<String>,

    data_tx: mpsc::Sender<DataFrame>,
    err_tx: mpsc::Sender<ErrFrame>,
    meta_tx: mpsc::Sender<MetaPack>,
    collect_tx: mpsc::Sender<String>
}

impl Engine {
    pub fn new(limits: Limits, sinks: Arc<dyn SinkFactory>,
               handler: Arc<dyn SourceHandler>) -> (Self, EngineSenders) {
        let (admit_tx, admit_rx)     = mpsc::channel(limits.admit_channel);
        let (data_tx, data_rx)       = mpsc::channel(limits.data_channel);
        let (err_tx, err_rx)         = mpsc::channel(limits.error_channel);
        let (meta_tx, meta_rx)       = mpsc::channel(limits.meta_channel);
        let (collect_tx, collect_rx) = mpsc::channel(limits.collect_channel);

        let senders = EngineSenders {
            admit: admit_tx,
            meta: meta_tx.clone()
        };

        (Engine {
            mounts: HashMap::new(),
            meta_stash: HashMap::new(),
            limits,
            sinks,
            handler,
            admit_rx,
            data_rx,
            err_rx,
            meta_rx,
            collect_rx,
            data_tx,
            err_tx,
            meta_tx,
            collect_tx
        },
        senders)
    }

    /// The event loop. Runs until torn down, or panics on a fatal sink
    /// error for the supervisor to restart.
    pub async fn process_events(mut self) {
        let mut stash_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + STASH_TTL,
            STASH_TTL
        );

        loop {
            tokio::select! {
                Some(frame) = self.data_rx.recv() => self.handle_data(frame).await,
                Some(frame) = self.err_rx.recv() => self.handle_error(frame),
                Some(source) = self.admit_rx.recv() => self.handle_admit(source),
                Some(mount) = self.collect_rx.recv() => self.handle_collect(mount).await,
                Some(pack) = self.meta_rx.recv() => self.handle_meta(pack).await,
                // Old entries must not outlive their source by much, so
                // the whole stash is replaced on a fixed cadence
                _ = stash_tick.tick() => self.meta_stash = HashMap::new()
            }
        }
    }

    /// Places a new source under its mount, creating the mount on first
    /// admission
    fn handle_admit(&mut self, mut source: Source) {
        let name  = source.id.mount.clone();
        let token = source.token;
        let id    = source.id.clone();

        info!("new client on {}: {} @ {}", name, id.name, id.addr);

        let (kill_tx, kill_rx) = oneshot::channel();
        source.kill = Some(kill_tx);
        let sock = match source.stream.take() {
            Some(v) => v,
            None => {
                warn!("Admission for {} came without a socket", name);
                return;
            }
        };

        if self.mounts.contains_key(&name) {
            let mount = self.mounts.get_mut(&name).expect("mount looked up above");
            mount.insert(source);
            if !mount.enqueue_standby(token) {
                error!("error adding client on {}: {} @ {} (standby queue full)",
                    name, id.name, id.addr);
                self.remove_source(&name, token);
                return;
            }
            self.handler.on_connect(&name, &id);
            // A mount sitting in its collection grace window has no
            // live client; the newcomer takes over right away
            if self.mounts.get(&name).is_some_and(|mount| mount.live.is_none()) {
                self.promote_next(&name);
            }
        } else {
            info!("new mount: {}", name);

            let mut sink = self.sinks.create();
            let format   = match id.format {
                AudioFormat::Unknown => AudioFormat::Mp3,
                format => format
            };
            sink.apply_options(SinkOptions { mount: name.clone(), format });

            let mut mount = Mount::new(name.clone(), sink, self.limits.queue_limit);
            mount.live    = Some(token);

            // The client may have sent metadata before connecting;
            // replay it through the meta channel so the fresh-metadata
            // path stays the only one talking to the upstream
            if let Some(data) = self.meta_stash.get(&id.fingerprint()) {
                let pack = MetaPack { data: data.clone(), id: id.clone(), seen: false };
                if self.meta_tx.try_send(pack).is_err() {
                    warn!("Meta channel full, stashed metadata for {} dropped", name);
                }
            }

            mount.insert(source);
            self.mounts.insert(name.clone(), mount);

            self.handler.on_connect(&name, &id);
            self.handler.on_live(&name, &id);
        }

        // Only now is the client fully prepared, start reading
        stream::spawn_reader(
            sock, name, token,
            self.data_tx.clone(), self.err_tx.clone(),
            kill_rx,
            Duration::from_millis(self.limits.source_timeout),
            self.limits.buffer_size
        );
    }

    /// Forwards audio of the live source, drops everyone else's
    async fn handle_data(&mut self, frame: DataFrame) {
        let Some(mount) = self.mounts.get_mut(&frame.mount) else {
            // Mount already collected, ditch the data
            return;
        };

        // Token comparison: a reconnecting client with an identical
        // fingerprint must not hijack the forwarding
        if mount.live != Some(frame.token) {
            return;
        }

        if let Err(e) = mount.forward(&frame.data).await {
            // Insane or out of memory means engine state can no longer
            // be trusted; the supervisor restarts us from scratch
            panic!("fatal upstream failure on {}: {}", frame.mount, e);
        }
    }

    fn handle_error(&mut self, frame: ErrFrame) {
        if let Some(source) = self.mounts.get(&frame.mount).and_then(|mount| mount.get(frame.token)) {
            info!("remove client on {}: {} (reason: {})", frame.mount, source, frame.err);
        }
        self.remove_source(&frame.mount, frame.token);
    }

    /// Routes metadata to the source it belongs to, correlated by
    /// fingerprint since it arrives on a connection of its own
    async fn handle_meta(&mut self, pack: MetaPack) {
        let fingerprint = pack.id.fingerprint();

        info!("metadata on {} ({}): {}", pack.id.mount, fingerprint, pack.data);

        let Some(mount) = self.mounts.get_mut(&pack.id.mount) else {
            // No mount under that name yet; its source may be a moment
            // behind this request
            info!("metadata stored: {}", pack.data);
            self.meta_stash.insert(fingerprint, pack.data);
            return;
        };

        if mount.live_fingerprint() != Some(fingerprint) {
            // One of the standby clients. Keep the metadata on it for
            // the moment it goes live
            match mount.by_fingerprint_mut(fingerprint) {
                Some(source) => {
                    source.metadata = pack.data.clone();
                    let id = source.id.clone();
                    self.handler.on_metadata(&pack.id.mount, &id, &pack.data);
                },
                None => info!("metadata discarded: {}", pack.data)
            }
            return;
        }

        let id = match mount.by_fingerprint_mut(fingerprint) {
            Some(source) => {
                source.metadata = pack.data.clone();
                source.id.clone()
            },
            // The live client vanished between the two lookups
            None => return
        };

        if pack.seen {
            // Second pass: the pack settled for a second, send it
            if let Err(e) = mount.sink.send_metadata(&pack.data).await {
                info!("metadata delivery on {} failed: {}", pack.id.mount, e);
            }
        } else {
            // The metadata is already verified good here, no reason to
            // hold the handler back for the settle window
            self.handler.on_metadata(&pack.id.mount, &id, &pack.data);

            let meta_tx = self.meta_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(METADATA_SETTLE).await;
                _ = meta_tx.send(MetaPack { seen: true, ..pack }).await;
            });
        }
    }

    /// Finalizes teardown of a mount that went empty a grace window ago
    async fn handle_collect(&mut self, name: String) {
        info!("collecting mount: {}", name);

        match self.mounts.get(&name) {
            None => return,
            Some(mount) if !mount.is_empty() => {
                // The mount got a new client while waiting
                info!("collection aborted: {}", name);
                return;
            },
            Some(_) => ()
        }

        if let Some(mut mount) = self.mounts.remove(&name) {
            info!("icecast disconnect: {}", name);
            if let Err(e) = mount.sink.close().await {
                warn!("Closing upstream for {} failed: {}", name, e);
            }
        }

        info!("collection finished: {}", name);
    }

    /// Takes a source out of its mount: hand the live slot to the next
    /// standby, drop both indices, hang up the socket, and put an empty
    /// mount up for collection.
    fn remove_source(&mut self, mount_name: &str, token: SourceToken) {
        let Some(mount) = self.mounts.get_mut(mount_name) else {
            // A late frame for a mount that is already gone
            return;
        };

        if mount.live == Some(token) {
            self.promote_next(mount_name);
        }

        let Some(mount) = self.mounts.get_mut(mount_name) else { return };
        if let Some(mut source) = mount.remove(token) {
            if mount.live == Some(token) {
                // No standby took over
                mount.live = None;
            }
            if let Some(kill) = source.kill.take() {
                // The reader owns the socket; this makes it hang up and
                // exit. A source that never got a reader still holds
                // its socket and closes it when dropped below
                _ = kill.send(());
            }
            // The connection is down by now, which the handlers are
            // allowed to rely on
            self.handler.on_disconnect(mount_name, &source.id);
        }

        let Some(mount) = self.mounts.get(mount_name) else { return };
        if mount.is_empty() {
            // Don't collect right away: two sources commonly overlap or
            // swap each other out within a small delay, and the grace
            // window lets them reuse the upstream connection
            let collect_tx = self.collect_tx.clone();
            let name       = mount_name.to_owned();
            tokio::spawn(async move {
                tokio::time::sleep(COLLECT_GRACE).await;
                _ = collect_tx.send(name).await;
            });
        }
    }

    /// Moves the oldest still-connected standby into the live slot and
    /// replays its stored metadata upstream
    fn promote_next(&mut self, mount_name: &str) {
        let Some(mount) = self.mounts.get_mut(mount_name) else { return };

        let Some(next) = mount.next_standby() else { return };

        let old_id = mount.live
            .and_then(|token| mount.get(token))
            .map(|source| source.id.clone());

        mount.live = Some(next);

        let Some(new) = mount.get(next) else { return };
        let new_id    = new.id.clone();
        let pack      = MetaPack {
            data: new.metadata.clone(),
            id: new.id.clone(),
            seen: false
        };

        info!("switch client on {}: {} @ {}", mount_name, new_id.name, new_id.addr);

        if let Some(old) = old_id {
            self.handler.on_unlive(mount_name, &old);
        }
        self.handler.on_live(mount_name, &new_id);

        // The new live client brings its own track info; push it
        // through the meta channel like any fresh update
        if self.meta_tx.try_send(pack).is_err() {
            warn!("Meta channel full, metadata of promoted client on {} dropped", mount_name);
        }
    }
}
