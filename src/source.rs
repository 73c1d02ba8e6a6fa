use std::sync::atomic::Ordering;
use anyhow::Result;
use tracing::{error, info};

use crate::{
    auth,
    client::{ClientId, Permission, Source},
    request::SourceRequest,
    response,
    server::ClientSession
};

/// Admits a source client.
///
/// After authentication the connection gets its `200 OK` and stops
/// being an HTTP socket: ownership moves to the engine, which decides
/// whether the client goes live or waits in the standby queue. A later
/// rejection (full queue) can no longer be reported to the peer, it
/// just sees its connection drop.
pub async fn handle(mut session: ClientSession, req: SourceRequest) -> Result<()> {
    session.server.stats.source_connections.fetch_add(1, Ordering::Relaxed);

    let perm = auth::authenticate(&session.server.config, req.auth.as_ref(), &req.mountpoint).await;
    if perm < Permission::Source {
        response::authentication_needed(&mut session.stream, &session.server.config.info.id).await?;
        info!("Source request for {} from {} with wrong authentication", req.mountpoint, session.addr);
        return Ok(());
    }

    // The hijack point: from here on the socket carries raw audio
    response::ok_200(&mut session.stream, &session.server.config.info.id).await?;

    let (name, pass) = req.auth.unwrap_or_default();
    let id = ClientId {
        name,
        pass,
        perm,
        agent: req.agent,
        addr: req.addr,
        mount: req.mountpoint,
        format: req.format
    };

    let admit  = session.server.engine.senders().await.admit;
    let source = Source::new(session.stream, id);
    if let Err(e) = admit.send(source).await {
        // Engine is mid restart and the 200 already went out; nothing
        // left to do but hang up
        error!("Admission for {} failed, engine unavailable", e.0.id.mount);
    }

    Ok(())
}
