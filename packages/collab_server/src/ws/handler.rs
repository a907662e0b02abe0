//! Websocket connection handler for collaborating editors.
//!
//! This module implements the per-connection lifecycle: the join sequence
//! (authenticate, authorize, register, announce), the main message loop
//! that relays edits and delivers room broadcasts, heartbeats, and graceful
//! connection shutdown. A transport disconnect that arrives while the join
//! sequence is still in flight cancels it before any registry mutation
//! commits.

#![allow(clippy::future_not_send)]

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use actix_ws::Message;
use codocs_auth::{DocumentAccess, TokenVerifier};
use codocs_session::{ConnId, RoomId};
use futures_util::{
    StreamExt as _,
    future::{Either, select},
};
use tokio::{pin, sync::mpsc, time::interval};

use crate::ws::{JoinError, server::CollabServerHandle};

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a websocket connection's full lifecycle.
///
/// Runs the join sequence first; if the client disconnects before it
/// completes, no room side effects remain. Once joined, the function
/// relays inbound edits through the server, delivers room broadcasts back
/// to the client, and maintains connection health via heartbeats until the
/// connection is closed by either side or times out.
#[allow(clippy::too_many_lines, clippy::cognitive_complexity)]
pub async fn handle_ws(
    ws_server: CollabServerHandle,
    verifier: TokenVerifier,
    access: Arc<dyn DocumentAccess>,
    mut session: actix_ws::Session,
    mut msg_stream: actix_ws::MessageStream,
    access_token: String,
    document_id: RoomId,
) {
    log::debug!("Connected");

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();

    let conn_id = ws_server.connect(conn_tx).await;

    log::debug!("Connection id: {conn_id}");

    let joined = join_with_cancellation(
        &ws_server,
        &verifier,
        &*access,
        conn_id,
        &access_token,
        document_id,
        &mut session,
        &mut msg_stream,
    )
    .await;

    match joined {
        Some(Ok(room_id)) => {
            log::debug!("Connection {conn_id} joined room {room_id}");
        }
        Some(Err(err)) => {
            log::info!("Join failed for connection {conn_id}: {err}");
            ws_server.disconnect(conn_id).await;
            let _ = session.close(None).await;
            return;
        }
        None => {
            log::debug!("Connection {conn_id} closed before join completed");
            ws_server.disconnect(conn_id).await;
            let _ = session.close(None).await;
            return;
        }
    }

    let mut last_heartbeat = Instant::now();
    let mut interval = interval(HEARTBEAT_INTERVAL);

    let close_reason = loop {
        // most of the futures we process need to be stack-pinned to work with select()

        let tick = interval.tick();
        pin!(tick);

        let msg_rx = conn_rx.recv();
        pin!(msg_rx);

        let messages = select(msg_stream.next(), msg_rx);
        pin!(messages);

        match select(messages, tick).await {
            // commands & messages received from client
            Either::Left((Either::Left((Some(Ok(msg)), _)), _)) => match msg {
                Message::Ping(bytes) => {
                    log::trace!("Received ping");
                    last_heartbeat = Instant::now();
                    session.pong(&bytes).await.unwrap();
                }

                Message::Pong(_) => {
                    last_heartbeat = Instant::now();
                }

                Message::Text(text) => {
                    last_heartbeat = Instant::now();
                    let text: &str = text.as_ref();
                    ws_server.send_message(conn_id, text).await;
                }

                Message::Binary(bytes) => {
                    last_heartbeat = Instant::now();
                    match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            ws_server.send_message(conn_id, text).await;
                        }
                        Err(e) => {
                            log::warn!("unexpected binary message: {e:?}");
                        }
                    }
                }

                Message::Close(reason) => break reason,

                _ => {
                    break None;
                }
            },

            // client WebSocket stream error
            Either::Left((Either::Left((Some(Err(err)), _)), _)) => {
                log::error!("WebSocket stream error: {err}");
                break None;
            }

            // client WebSocket stream ended
            Either::Left((Either::Left((None, _)), _)) => {
                log::debug!("WebSocket stream ended");
                break None;
            }

            // messages received from other room participants
            Either::Left((Either::Right((Some(ws_msg), _)), _)) => {
                if let Err(err) = session.text(ws_msg).await {
                    log::error!("Failed to send text message to conn_id={conn_id}: {err:?}");
                }
            }

            // all connection's message senders were dropped
            Either::Left((Either::Right((None, _)), _)) => unreachable!(
                "all connection message senders were dropped; collab server may have panicked"
            ),

            // heartbeat internal tick
            Either::Right((_inst, _)) => {
                // if no heartbeat ping/pong received recently, close the connection
                if Instant::now().duration_since(last_heartbeat) > CLIENT_TIMEOUT {
                    log::info!(
                        "client has not sent heartbeat in over {CLIENT_TIMEOUT:?}; disconnecting"
                    );
                    break None;
                }

                // send heartbeat ping
                let _ = session.ping(b"").await;
            }
        }
    };

    log::debug!("handle_ws: disconnecting connection");
    ws_server.disconnect(conn_id).await;

    // attempt to close connection gracefully
    log::debug!("handle_ws: closing connection");
    let _ = session.close(close_reason).await;
}

/// Run the join sequence, aborting it if the client goes away first.
///
/// Returns `None` when the transport closed or errored before the join
/// completed. Frames other than ping arriving before the join has
/// committed are dropped; the client has not been acknowledged yet.
#[allow(clippy::too_many_arguments)]
async fn join_with_cancellation(
    ws_server: &CollabServerHandle,
    verifier: &TokenVerifier,
    access: &dyn DocumentAccess,
    conn_id: ConnId,
    access_token: &str,
    document_id: RoomId,
    session: &mut actix_ws::Session,
    msg_stream: &mut actix_ws::MessageStream,
) -> Option<Result<RoomId, JoinError>> {
    let join = join_room(
        ws_server,
        verifier,
        access,
        conn_id,
        access_token,
        document_id,
    );
    pin!(join);

    loop {
        match select(join.as_mut(), msg_stream.next()).await {
            Either::Left((result, _)) => break Some(result),

            Either::Right((Some(Ok(Message::Ping(bytes))), _)) => {
                session.pong(&bytes).await.unwrap();
            }

            Either::Right((Some(Ok(Message::Close(_))), _)) | Either::Right((None, _)) => {
                break None;
            }

            Either::Right((Some(Ok(msg)), _)) => {
                log::debug!("Dropping message received before join completed: {msg:?}");
            }

            Either::Right((Some(Err(err)), _)) => {
                log::error!("WebSocket stream error during join: {err}");
                break None;
            }
        }
    }
}

/// The join sequence: authenticate, authorize, register, announce.
async fn join_room(
    ws_server: &CollabServerHandle,
    verifier: &TokenVerifier,
    access: &dyn DocumentAccess,
    conn_id: ConnId,
    access_token: &str,
    document_id: RoomId,
) -> Result<RoomId, JoinError> {
    let identity = verifier
        .verify(access_token)
        .map_err(|_| JoinError::Unauthenticated)?;

    let document = access
        .can_access(identity.user_id, document_id)
        .await?
        .ok_or(JoinError::Forbidden)?;

    ws_server.join(conn_id, identity, document.id).await
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use codocs_auth::{DocumentHandle, DocumentLookupError};
    use codocs_session::Registry;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::ws::server::CollabServer;

    const SECRET: &str = "test-secret";

    /// Grants or denies everything, or fails outright.
    struct StubAccess(Result<Option<DocumentHandle>, ()>);

    #[async_trait::async_trait]
    impl DocumentAccess for StubAccess {
        async fn can_access(
            &self,
            _user_id: u64,
            document_id: u64,
        ) -> Result<Option<DocumentHandle>, DocumentLookupError> {
            match &self.0 {
                Ok(Some(_)) => Ok(Some(DocumentHandle { id: document_id })),
                Ok(None) => Ok(None),
                Err(()) => Err(DocumentLookupError::UnexpectedStatus(500)),
            }
        }
    }

    fn token(secret: &str) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();

        encode(
            &Header::default(),
            &json!({"id": 10, "email": "a@x.com", "exp": now + 3600}),
            &EncodingKey::from_secret(secret.as_ref()),
        )
        .unwrap()
    }

    async fn connect() -> (Arc<Registry>, CollabServerHandle, ConnId) {
        let registry = Arc::new(Registry::new());
        let (server, handle) = CollabServer::new(registry.clone());
        tokio::spawn(server.run());

        // delivery is best-effort, so the receiving half can be dropped
        let (conn_tx, _conn_rx) = unbounded_channel();
        let conn_id = handle.connect(conn_tx).await;

        (registry, handle, conn_id)
    }

    #[test_log::test(tokio::test)]
    async fn valid_token_and_granted_access_joins_the_room() {
        let (registry, handle, conn_id) = connect().await;
        let verifier = TokenVerifier::new(SECRET);
        let access = StubAccess(Ok(Some(DocumentHandle { id: 42 })));

        let room_id = join_room(&handle, &verifier, &access, conn_id, &token(SECRET), 42)
            .await
            .unwrap();

        assert_eq!(room_id, 42);
        assert_eq!(registry.members(42), vec!["a@x.com"]);
    }

    #[test_log::test(tokio::test)]
    async fn bad_token_never_reaches_the_registry() {
        let (registry, handle, conn_id) = connect().await;
        let verifier = TokenVerifier::new(SECRET);
        let access = StubAccess(Ok(Some(DocumentHandle { id: 42 })));

        let result = join_room(&handle, &verifier, &access, conn_id, "not-a-jwt", 42).await;

        assert!(matches!(result, Err(JoinError::Unauthenticated)));
        assert!(registry.is_empty(42));
    }

    #[test_log::test(tokio::test)]
    async fn denied_access_never_reaches_the_registry() {
        let (registry, handle, conn_id) = connect().await;
        let verifier = TokenVerifier::new(SECRET);
        let access = StubAccess(Ok(None));

        let result = join_room(&handle, &verifier, &access, conn_id, &token(SECRET), 42).await;

        assert!(matches!(result, Err(JoinError::Forbidden)));
        assert!(registry.is_empty(42));
    }

    #[test_log::test(tokio::test)]
    async fn lookup_failure_never_reaches_the_registry() {
        let (registry, handle, conn_id) = connect().await;
        let verifier = TokenVerifier::new(SECRET);
        let access = StubAccess(Err(()));

        let result = join_room(&handle, &verifier, &access, conn_id, &token(SECRET), 42).await;

        assert!(matches!(result, Err(JoinError::DocumentLookupFailed(_))));
        assert!(registry.is_empty(42));
    }
}
