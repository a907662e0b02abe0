use std::sync::Arc;

use actix_web::error::ErrorBadRequest;
use actix_web::web::{self, Json};
use actix_web::{HttpResponse, Result, get, route};
use codocs_auth::{DocumentAccess, TokenVerifier};
use codocs_session::RoomId;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::WS_SERVER_HANDLE;
use crate::ws::JoinError;
use crate::ws::handler;

#[route("/health", method = "GET")]
pub async fn health_endpoint() -> Result<Json<Value>> {
    log::info!("Healthy");
    Ok(Json(json!({"healthy": true})))
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    access_token: Option<String>,
    document_id: Option<String>,
}

#[get("/ws")]
pub async fn websocket(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    query: web::Query<ConnectRequest>,
    verifier: web::Data<TokenVerifier>,
    access: web::Data<Arc<dyn DocumentAccess>>,
) -> Result<HttpResponse, actix_web::Error> {
    // both handshake parameters must be present and the document id numeric;
    // otherwise the connection is rejected before any side effects occur
    let access_token = query.access_token.clone();
    let document_id = query
        .document_id
        .as_deref()
        .and_then(|id| id.parse::<RoomId>().ok());

    let (Some(access_token), Some(document_id)) = (access_token, document_id) else {
        log::info!("Rejecting connection: {}", JoinError::MalformedJoinRequest);
        return Err(ErrorBadRequest(JoinError::MalformedJoinRequest));
    };

    let ws_server = WS_SERVER_HANDLE.read().await.as_ref().unwrap().clone();
    let (res, session, msg_stream) = actix_ws::handle(&req, stream)?;

    // spawn websocket handler (and don't await it) so that the response is returned immediately
    actix_web::rt::spawn(handler::handle_ws(
        ws_server,
        verifier.get_ref().clone(),
        access.get_ref().clone(),
        session,
        msg_stream,
        access_token,
        document_id,
    ));

    Ok(res)
}
