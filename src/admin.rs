use std::sync::{Arc, atomic::Ordering};
use anyhow::Result;
use serde_json::json;
use tracing::info;

use crate::{
    auth,
    client::{AudioFormat, ClientId, MetaPack, Permission},
    request::AdminRequest,
    response,
    server::ClientSession,
    utils
};

/// `/admin/metadata?mode=updinfo&mount=<m>&song=<s>`
///
/// Metadata rides its own HTTP request, so all we can pass the engine
/// is a ClientId rebuilt from the request; the engine correlates it to
/// a source connection by fingerprint.
async fn update_metadata(session: &mut ClientSession, req: AdminRequest) -> Result<()> {
    let (mount, song) = match utils::get_queries_val_for_keys(&["mode", "mount", "song"], &req.queries).as_slice() {
        &[Some(mode), Some(mount), Some(song)] => {
            if !mode.eq("updinfo") {
                response::bad_request(&mut session.stream, &session.server.config.info.id,
                    "Metadata update request only supports updinfo mode").await?;
                return Ok(());
            }
            (mount.to_owned(), song.to_owned())
        },
        _ => {
            response::bad_request(&mut session.stream, &session.server.config.info.id,
                "Metadata update request need valid queries").await?;
            return Ok(());
        }
    };

    let perm = auth::authenticate(&session.server.config, req.auth.as_ref(), &mount).await;
    if perm < Permission::Meta {
        response::authentication_needed(&mut session.stream, &session.server.config.info.id).await?;
        return Ok(());
    }

    let (name, pass) = req.auth.unwrap_or_default();
    let id = ClientId {
        name,
        pass,
        perm,
        agent: None,
        addr: req.addr,
        mount: mount.clone(),
        format: AudioFormat::Unknown
    };

    let meta = session.server.engine.senders().await.meta;
    let pack = MetaPack { data: song, id: Arc::new(id), seen: false };
    if meta.send(pack).await.is_err() {
        response::service_unavailable(&mut session.stream, &session.server.config.info.id).await?;
        return Ok(());
    }

    session.server.stats.metadata_requests.fetch_add(1, Ordering::Relaxed);
    response::ok_200(&mut session.stream, &session.server.config.info.id).await?;
    info!("Pushed metadata update for {}", mount);

    Ok(())
}

async fn list_clients(session: &mut ClientSession, req: AdminRequest) -> Result<()> {
    let perm = auth::authenticate(&session.server.config, req.auth.as_ref(), "").await;
    if perm < Permission::Admin {
        response::authentication_needed(&mut session.stream, &session.server.config.info.id).await?;
        return Ok(());
    }

    let mount = match utils::get_queries_val_for_keys(&["mount"], &req.queries).as_slice() {
        [Some(mount)] => *mount,
        _ => {
            response::bad_request(&mut session.stream, &session.server.config.info.id,
                "Mount not specified").await?;
            return Ok(());
        }
    };

    // Live client sits at index 0 of the roster
    match session.server.roster.snapshot(mount) {
        Some(clients) => {
            let resp = json!({
                "mount": mount,
                "clients": clients
            });
            match serde_json::to_vec(&resp) {
                Ok(v) => response::ok_200_json_body(&mut session.stream, &session.server.config.info.id, &v).await?,
                Err(_) => response::internal_error(&mut session.stream, &session.server.config.info.id).await?
            }
        },
        None => {
            response::bad_request(&mut session.stream, &session.server.config.info.id,
                "Invalid mountpoint").await?;
        }
    }

    Ok(())
}

async fn server_stats(session: &mut ClientSession, req: AdminRequest) -> Result<()> {
    let perm = auth::authenticate(&session.server.config, req.auth.as_ref(), "").await;
    if perm < Permission::Admin {
        response::authentication_needed(&mut session.stream, &session.server.config.info.id).await?;
        return Ok(());
    }

    let stats = &session.server.stats;
    let resp  = json!({
        "start_time": stats.start_time,
        "connections": stats.connections.load(Ordering::Relaxed),
        "source_connections": stats.source_connections.load(Ordering::Relaxed),
        "metadata_requests": stats.metadata_requests.load(Ordering::Relaxed),
        "admin_connections": stats.admin_connections.load(Ordering::Relaxed),
        "mounts": session.server.roster.mounts()
    });

    match serde_json::to_vec(&resp) {
        Ok(v) => response::ok_200_json_body(&mut session.stream, &session.server.config.info.id, &v).await?,
        Err(_) => response::internal_error(&mut session.stream, &session.server.config.info.id).await?
    }

    Ok(())
}

pub async fn handle_request(mut session: ClientSession, req: AdminRequest) -> Result<()> {
    session.server.stats.admin_connections.fetch_add(1, Ordering::Relaxed);

    // Handling /admin requests
    // In each path we must first check identity before proceeding todo anything
    match req.path.as_str() {
        // Update metadata for a source
        "/admin/metadata" => update_metadata(&mut session, req).await?,
        // Fetch connected sources of a mount with the live one first
        "/admin/listclients" => list_clients(&mut session, req).await?,
        // Proxy-wide counters
        "/admin/stats" => server_stats(&mut session, req).await?,
        _ => response::not_found(&mut session.stream, &session.server.config.info.id).await?
    }

    Ok(())
}
