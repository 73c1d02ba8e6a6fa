use std::time::Duration;
use anyhow::Result;
use httparse::Status;
use tokio::io::AsyncReadExt;

use crate::{
    client::AudioFormat,
    server::{ClientSession, Stream},
    utils::{self, get_basic_auth, get_header, Query}
};

pub enum RequestType {
    Source(SourceRequest),
    Admin(AdminRequest)
}

pub struct SourceRequest {
    pub mountpoint: String,
    pub auth: Option<(String, String)>,
    pub format: AudioFormat,
    pub agent: Option<String>,
    /// Effective peer address, `ip:port`
    pub addr: String
}

pub struct AdminRequest {
    pub path: String,
    pub queries: Vec<Query>,
    pub auth: Option<(String, String)>,
    pub addr: String
}

async fn read_request_header(stream: &mut Stream, buf: &mut Vec<u8>, max_len: usize) -> Result<()> {
    let mut byte = [ 0; 1 ];
    while buf.windows(4).last() != Some(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(read) => if read > 0 {
                buf.push(byte[0]);
                if buf.len() > max_len {
                    // Stop any potential attack
                    return Err(anyhow::Error::msg("Header is too big"));
                }
            } else {
                // Here we already read whole header
                break;
            }
            Err(e) => return Err(anyhow::Error::from(e))
        }
    }

    Ok(())
}

/// Peer address as the engine should see it, honoring a reverse proxy's
/// `X-Forwarded-For` when the config says so. Identity correlation runs
/// on this address, so it must come out identical for a client's source
/// connection and its metadata requests.
fn client_addr(session: &ClientSession, headers: &[httparse::Header<'_>]) -> String {
    if session.server.config.misc.check_forwardedfor {
        if let Some(forwarded) = get_header("X-Forwarded-For", headers) {
            if let Ok(forwarded) = std::str::from_utf8(forwarded) {
                let ip = forwarded.split(',').next().unwrap_or(forwarded).trim();
                return format!("{}:{}", ip, session.addr.port());
            }
        }
    }
    session.addr.to_string()
}

/// Reads and classifies one request.
///
/// Everything needed later is copied out of the header buffer here, so
/// callers get owned request structs instead of borrows into it.
pub async fn read_request(session: &mut ClientSession) -> Result<RequestType> {
    // We first read header using predefined timeout
    let mut headers_buf = Vec::new();
    tokio::time::timeout(
        Duration::from_millis(session.server.config.limits.header_timeout),
        read_request_header(&mut session.stream, &mut headers_buf, session.server.config.limits.http_max_len)
    ).await??;

    // Now we parse the headers
    // We can guess number of headers by counting \r\n occurences - 2
    // One is for first line of headers then another at the end of headers
    let occurences  = headers_buf
        .windows(2)
        .filter(|x| x.eq(b"\r\n"))
        .count();
    if occurences <= 2 {
        // Avoid empty headers attack
        return Err(anyhow::Error::msg("Received empty header"));
    }
    let mut headers = vec![ httparse::EMPTY_HEADER; occurences - 2 ];
    let mut req     = httparse::Request::new(&mut headers);
    if req.parse(&headers_buf)? == Status::Partial {
        return Err(anyhow::Error::msg("Received an incomplete request"));
    }

    if !req.headers.first().is_some_and(|x| !x.name.is_empty()) {
        // Httparse may parse faulty headers (ie. one without value)
        // without sanity checks
        // doing it here
        return Err(anyhow::Error::msg("Parsed invalid headers"));
    }

    let method = match req.method {
        Some(v) => v,
        None => return Err(anyhow::Error::msg("Request header has no method"))
    };

    let path = match req.path {
        Some(v) => v,
        None => return Err(anyhow::Error::msg("Request header has no path"))
    };

    let queries = utils::get_queries(path);
    let path    = utils::clean_path(path);
    let addr    = client_addr(session, req.headers);

    // Now we check request made by user
    match method {
        // ICECAST protocol info: https://gist.github.com/ePirat/adc3b8ba00d85b7e3870
        "PUT" | "SOURCE" => {
            let auth   = get_basic_auth(req.headers)?;
            let format = match get_header("Content-Type", req.headers) {
                Some(v) => AudioFormat::from_content_type(v),
                None => AudioFormat::Unknown
            };
            let agent  = get_header("User-Agent", req.headers)
                .and_then(|v| std::str::from_utf8(v).ok())
                .map(str::to_owned);

            Ok(RequestType::Source(SourceRequest {
                mountpoint: path,
                auth,
                format,
                agent,
                addr
            }))
        },
        "GET" => {
            if !path.starts_with("/admin/") {
                // Listeners connect to the upstream icecast, never to
                // the proxy
                return Err(anyhow::Error::msg("Unknewn path wanted by client"));
            }

            if !session.admin_addr {
                // If this is not an admin interface we properly block this request
                return Err(anyhow::Error::msg("Attempt to access admin api from public interface"));
            }

            let auth = get_basic_auth(req.headers)?;
            // Warning!! Don't forget to check user && pass are empty
            if let Some((u, p)) = auth.as_ref() {
                if u.is_empty() || p.is_empty() {
                    return Err(anyhow::Error::msg("Empty Basic authentication"));
                }
            }

            let p = path.split('?').collect::<Vec<&str>>();
            Ok(RequestType::Admin(AdminRequest { path: p[0].to_owned(), queries, auth, addr }))
        },
        _ => Err(anyhow::Error::msg("Unknewn method sent by user"))
    }
}
