use tracing::info;

use crate::{
    admin,
    request::{read_request, RequestType},
    response,
    server::ClientSession,
    source
};

pub async fn handle(mut session: ClientSession) {
    let req = match read_request(&mut session).await {
        Ok(v) => v,
        Err(e) => {
            response::method_not_allowed(&mut session.stream, &session.server.config.info.id).await.ok();
            info!("Request coming from {} couldn't be handled: {}", session.addr, e);
            return;
        }
    };

    match req {
        RequestType::Source(v) => source::handle(session, v).await,
        RequestType::Admin(v) => admin::handle_request(session, v).await
    }.ok();
}
