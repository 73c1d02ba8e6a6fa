use std::{sync::{Arc, atomic::{AtomicUsize, Ordering}}, net::SocketAddr};
use chrono::{DateTime, Local};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet, io::{AsyncRead, AsyncWrite, BufStream}, sync::Semaphore
};
use tracing::{info, error};

use crate::{
    config::ServerSettings,
    connection,
    hooks::MountRoster,
    icecast::IcecastSinkFactory,
    supervisor::{self, EngineHandle}
};

pub trait Socket: Send + Sync + AsyncRead + AsyncWrite + Unpin {}
impl Socket for BufStream<TcpStream> {}
// In-memory pipes stand in for client sockets in the test suite
impl Socket for tokio::io::DuplexStream {}
pub type Stream = Box<dyn Socket>;

/// Struct holding all info related to the proxy instance
pub struct Server {
    pub config: ServerSettings,
    /// Handle to the supervised engine, re-fetched per request since a
    /// restart swaps the channels behind it
    pub engine: Arc<EngineHandle>,
    /// Admin view over connected sources, fed by engine callbacks
    pub roster: Arc<MountRoster>,
    /// Semaphore intended to cap concurrent connections to the proxy
    pub max_clients: Arc<Semaphore>,
    pub stats: ServerStats
}

pub struct ServerStats {
    /// Proxy startup time as a utc timestamp
    pub start_time: i64,
    /// Number of connections since startup (accumulating counter)
    /// This includes number of failed connections (max clients reached, invalid request, ... etc)
    pub connections: AtomicUsize,
    /// Number of connections made by source clients (accumulating counter)
    pub source_connections: AtomicUsize,
    /// Number of accepted metadata update requests (accumulating counter)
    pub metadata_requests: AtomicUsize,
    /// Number of connections made to the admin api (accumulating counter)
    pub admin_connections: AtomicUsize
}

impl ServerStats {
    pub fn new(start_time: i64) -> Self {
        Self {
            start_time,
            connections: AtomicUsize::new(0),
            source_connections: AtomicUsize::new(0),
            metadata_requests: AtomicUsize::new(0),
            admin_connections: AtomicUsize::new(0)
        }
    }
}

/// A client session
pub struct ClientSession {
    /// Is this an admin address
    pub admin_addr: bool,
    /// Server info
    pub server: Arc<Server>,
    /// Socket of this client session
    pub stream: Stream,
    /// Address of our peer
    pub addr: SocketAddr
}

async fn accept_connections(serv: Arc<Server>, listener: TcpListener, admin_addr: bool) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let serv_clone = serv.clone();
                tokio::spawn(async move {
                    serv_clone.stats.connections.fetch_add(1, Ordering::Relaxed);
                    // Here we are trying to acquire the semaphore before handling connection
                    // If we can't, we already hit the max number of clients allowed and we can't
                    // do nothing
                    let sem = serv_clone.max_clients.clone();
                    let aq  = sem.try_acquire();
                    if let Ok(_guard) = aq {
                        connection::handle(ClientSession {
                            admin_addr,
                            server: serv_clone,
                            // Use bufferer for socket to reduce syscalls we make
                            stream: Box::new(BufStream::new(stream)),
                            addr
                        }).await;
                    }
                });
            },
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn bind(addr: SocketAddr) -> TcpListener {
    match TcpListener::bind(addr).await {
        Ok(v) => {
            info!("Listening on {}", addr);
            v
        },
        Err(e) => {
            error!("Binding to {} failed: {}", addr, e);
            std::process::exit(1);
        }
    }
}

pub async fn listener(config: ServerSettings) {
    let start_time = chrono::offset::Utc::now();

    let roster = Arc::new(MountRoster::new());
    let sinks  = Arc::new(IcecastSinkFactory::new(config.upstream.clone()));
    let engine = supervisor::start(config.limits.clone(), sinks, roster.clone());

    let serv = Arc::new(Server {
        max_clients: Arc::new(Semaphore::new(config.limits.clients)),
        engine,
        roster,
        stats: ServerStats::new(start_time.timestamp()),
        config
    });

    let mut set = JoinSet::new();

    if serv.config.admin_access.enabled {
        let listener = bind(serv.config.admin_access.address.bind).await;
        set.spawn(accept_connections(serv.clone(), listener, true));
    }

    if serv.config.address.is_empty() {
        error!("At least one listening address must be specified in config file!");
        return;
    }

    for addr in &serv.config.address {
        let listener = bind(addr.bind).await;
        set.spawn(accept_connections(serv.clone(), listener, false));
    }

    {
        let local: DateTime<Local> = DateTime::from(start_time);
        info!("Proxy started on {}", local);
    }

    set.join_next().await;
    error!("A listener abrubtly exited, shutting down server");
    std::process::exit(1);
}
