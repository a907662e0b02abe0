//! A multi-room collaboration server.
//!
//! Contains the logic of how connections are registered into document rooms
//! plus presence and relay broadcasting. Call and spawn
//! [`run`](CollabServer::run) to start processing commands.

use std::{
    collections::BTreeMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use codocs_session::{ConnId, Identity, Registry, RoomId};
use codocs_ws::{WebsocketContext, WebsocketSendError, WebsocketSender, announce_presence};
use serde_json::Value;
use strum_macros::AsRefStr;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::ws::{JoinError, Msg};

/// A command received by the [`CollabServer`].
#[derive(Debug, AsRefStr)]
pub enum Command {
    /// Registers a new websocket connection.
    Connect {
        /// Channel sender for messages to this connection.
        conn_tx: mpsc::UnboundedSender<Msg>,
        /// Channel to send back the assigned connection ID.
        res_tx: oneshot::Sender<ConnId>,
    },

    /// Registers a connection into a document room and announces presence.
    Join {
        /// Connection ID to register.
        conn_id: ConnId,
        /// The identity the connection authenticated with.
        identity: Identity,
        /// The document to join.
        document_id: RoomId,
        /// Channel to send back the join result.
        res_tx: oneshot::Sender<Result<RoomId, JoinError>>,
    },

    /// Removes a websocket connection.
    Disconnect {
        /// Connection ID to disconnect.
        conn: ConnId,
    },

    /// Processes an incoming message from a connection.
    Message {
        /// The received message.
        msg: Msg,
        /// Connection ID that sent the message.
        conn: ConnId,
        /// Channel to signal completion.
        res_tx: oneshot::Sender<()>,
    },
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Errors that can occur when processing an inbound message.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The connection has not joined a room
    #[error("Connection {0} has not joined a room")]
    NotJoined(ConnId),
    /// The message was not valid JSON
    #[error("Invalid payload: '{0}' ({1})")]
    InvalidPayload(String, String),
    /// The message failed to process
    #[error(transparent)]
    Process(#[from] codocs_ws::WebsocketMessageError),
}

/// A multi-room collaboration server.
///
/// Commands are processed sequentially, so registry mutations and the
/// presence announcements they trigger are serialized, and messages from
/// one sender are relayed in the order they arrived.
#[derive(Debug)]
pub struct CollabServer {
    /// Map of connection IDs to their message senders.
    connections: BTreeMap<ConnId, mpsc::UnboundedSender<Msg>>,

    /// Presence state for all document rooms.
    registry: Arc<Registry>,

    /// Next connection ID to assign.
    next_conn_id: AtomicU64,

    /// Tracks total number of live connections.
    visitor_count: Arc<AtomicUsize>,

    /// Command receiver.
    cmd_rx: flume::Receiver<Command>,

    token: CancellationToken,
}

impl CollabServer {
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> (Self, CollabServerHandle) {
        let (cmd_tx, cmd_rx) = flume::unbounded();
        let token = CancellationToken::new();
        let handle = CollabServerHandle {
            cmd_tx,
            token: token.clone(),
        };

        (
            Self {
                connections: BTreeMap::new(),
                registry,
                next_conn_id: AtomicU64::new(1),
                visitor_count: Arc::new(AtomicUsize::new(0)),
                cmd_rx,
                token,
            },
            handle,
        )
    }

    /// Send message directly to the user.
    fn send_message_to(&self, id: ConnId, msg: impl Into<String>) {
        if let Some(sender) = self.connections.get(&id) {
            // errors if client disconnected abruptly and hasn't been timed-out yet
            let _ = sender.send(msg.into());
        }
    }

    /// Register new transport session and assign unique ID to it.
    fn connect(&mut self, tx: mpsc::UnboundedSender<Msg>) -> ConnId {
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        self.connections.insert(id, tx);

        let count = self.visitor_count.fetch_add(1, Ordering::SeqCst);
        log::debug!("Someone connected {id}; visitor count: {}", count + 1);

        id
    }

    /// Register a connection into a document room and announce the updated
    /// presence to the whole room, including the new member.
    async fn join(
        &mut self,
        conn_id: ConnId,
        identity: Identity,
        document_id: RoomId,
    ) -> Result<RoomId, JoinError> {
        // the transport may have disconnected while authentication was still
        // in flight; joining then would leave a ghost member
        if !self.connections.contains_key(&conn_id) {
            return Err(JoinError::ConnectionClosed);
        }

        let room_id = self.registry.register(conn_id, identity, document_id)?;

        log::info!("Connection {conn_id} joined room {room_id}");

        if let Err(err) = announce_presence(&self.registry, &*self, room_id).await {
            log::error!("Failed to announce presence for room {room_id}: {err:?}");
        }

        Ok(room_id)
    }

    /// Unregister a connection and, if it had joined a room, announce the
    /// updated presence to the remaining members.
    async fn disconnect(&mut self, conn_id: ConnId) {
        let count = self.visitor_count.fetch_sub(1, Ordering::SeqCst);
        log::debug!("Someone disconnected {conn_id}; visitor count: {}", count - 1);

        // remove sender
        self.connections.remove(&conn_id);

        if let Some(room_id) = self.registry.deregister(conn_id) {
            log::info!("Connection {conn_id} left room {room_id}");

            if let Err(err) = announce_presence(&self.registry, &*self, room_id).await {
                log::error!("Failed to announce presence for room {room_id}: {err:?}");
            }
        }
    }

    async fn on_message(&self, conn_id: ConnId, msg: Msg) -> Result<(), MessageError> {
        let room_id = self
            .registry
            .room_of(conn_id)
            .ok_or(MessageError::NotJoined(conn_id))?;

        let body = serde_json::from_str::<Value>(&msg)
            .map_err(|e| MessageError::InvalidPayload(msg, e.to_string()))?;

        let context = WebsocketContext { conn_id, room_id };

        codocs_ws::process_message(body, &context, self).await?;

        Ok(())
    }

    async fn process_command(&mut self, cmd: Command) {
        log::debug!("process_command: cmd={cmd}");

        match cmd {
            Command::Connect { conn_tx, res_tx } => {
                let conn_id = self.connect(conn_tx);
                if res_tx.send(conn_id).is_err() {
                    log::error!("Failed to send connection ID {conn_id}");
                }
            }

            Command::Join {
                conn_id,
                identity,
                document_id,
                res_tx,
            } => {
                let response = self.join(conn_id, identity, document_id).await;
                if res_tx.send(response).is_err() {
                    log::error!("Failed to send join response for {conn_id}");
                }
            }

            Command::Disconnect { conn } => {
                self.disconnect(conn).await;
            }

            Command::Message { conn, msg, res_tx } => {
                if let Err(error) = self.on_message(conn, msg).await {
                    log::error!("Failed to process message from {conn}: {error:?}");
                }
                let _ = res_tx.send(());
            }
        }
    }

    pub async fn run(mut self) -> io::Result<()> {
        let token = self.token.clone();
        let cmd_rx = self.cmd_rx.clone();

        while let Ok(Ok(cmd)) = tokio::select!(
            () = token.cancelled() => {
                log::debug!("CollabServer was cancelled");
                Err(io::Error::new(io::ErrorKind::Interrupted, "Cancelled"))
            }
            cmd = cmd_rx.recv_async() => { Ok(cmd) }
        ) {
            self.process_command(cmd).await;
        }

        log::debug!("Stopped CollabServer");

        Ok(())
    }
}

#[async_trait::async_trait]
impl WebsocketSender for CollabServer {
    async fn send(&self, conn_id: ConnId, data: &str) -> Result<(), WebsocketSendError> {
        self.send_message_to(conn_id, data);
        Ok(())
    }

    async fn send_room(&self, room_id: RoomId, data: &str) -> Result<(), WebsocketSendError> {
        for conn_id in self.registry.member_ids(room_id) {
            self.send_message_to(conn_id, data);
        }
        Ok(())
    }

    async fn send_room_except(
        &self,
        room_id: RoomId,
        conn_id: ConnId,
        data: &str,
    ) -> Result<(), WebsocketSendError> {
        for member_id in self.registry.member_ids(room_id) {
            if member_id != conn_id {
                self.send_message_to(member_id, data);
            }
        }
        Ok(())
    }
}

/// Handle and command sender for the collaboration server.
///
/// Reduces boilerplate of setting up response channels in websocket
/// handlers.
#[derive(Debug, Clone)]
pub struct CollabServerHandle {
    cmd_tx: flume::Sender<Command>,
    token: CancellationToken,
}

impl CollabServerHandle {
    /// Register client message sender and obtain connection ID.
    pub async fn connect(&self, conn_tx: mpsc::UnboundedSender<Msg>) -> ConnId {
        let (res_tx, res_rx) = oneshot::channel();

        // unwrap: collab server should not have been dropped
        self.cmd_tx
            .send_async(Command::Connect { conn_tx, res_tx })
            .await
            .unwrap();

        // unwrap: collab server does not drop our response channel
        res_rx.await.unwrap()
    }

    /// Register a connection into a document room.
    ///
    /// # Errors
    ///
    /// * [`JoinError::AlreadyJoined`] if the connection already has a room
    /// * [`JoinError::ConnectionClosed`] if the connection disconnected
    ///   before the join could commit
    pub async fn join(
        &self,
        conn_id: ConnId,
        identity: Identity,
        document_id: RoomId,
    ) -> Result<RoomId, JoinError> {
        let (res_tx, res_rx) = oneshot::channel();

        if let Err(e) = self
            .cmd_tx
            .send_async(Command::Join {
                conn_id,
                identity,
                document_id,
                res_tx,
            })
            .await
        {
            log::error!("Failed to send Join command: {e:?}");
            return Err(JoinError::ConnectionClosed);
        }

        res_rx.await.unwrap_or(Err(JoinError::ConnectionClosed))
    }

    /// Relay an inbound message from a connection through the server.
    pub async fn send_message(&self, conn: ConnId, msg: impl Into<String> + Send) {
        let (res_tx, res_rx) = oneshot::channel();

        if let Err(e) = self
            .cmd_tx
            .send_async(Command::Message {
                msg: msg.into(),
                conn,
                res_tx,
            })
            .await
        {
            log::error!("Failed to send Message command: {e:?}");
            return;
        }

        let _ = res_rx.await;
    }

    /// Unregister message sender and announce the departure to the
    /// connection's room.
    pub async fn disconnect(&self, conn: ConnId) {
        if let Err(e) = self.cmd_tx.send_async(Command::Disconnect { conn }).await {
            log::error!("Failed to send Disconnect command: {e:?}");
        }
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    use super::*;

    struct TestClient {
        conn_id: ConnId,
        rx: UnboundedReceiver<Msg>,
    }

    impl TestClient {
        async fn connect(handle: &CollabServerHandle) -> Self {
            let (tx, rx) = unbounded_channel();
            let conn_id = handle.connect(tx).await;
            Self { conn_id, rx }
        }

        async fn recv(&mut self) -> Value {
            serde_json::from_str(&self.rx.recv().await.unwrap()).unwrap()
        }

        fn try_recv(&mut self) -> Option<Value> {
            self.rx
                .try_recv()
                .ok()
                .map(|msg| serde_json::from_str(&msg).unwrap())
        }
    }

    fn start() -> (Arc<Registry>, CollabServerHandle) {
        let registry = Arc::new(Registry::new());
        let (server, handle) = CollabServer::new(registry.clone());
        tokio::spawn(server.run());
        (registry, handle)
    }

    #[test_log::test(tokio::test)]
    async fn join_announces_presence_to_the_whole_room() {
        let (_registry, handle) = start();

        let mut a = TestClient::connect(&handle).await;
        handle
            .join(a.conn_id, Identity::new(10, "a@x.com"), 42)
            .await
            .unwrap();

        let update = a.recv().await;
        assert_eq!(update["type"], "CURRENT_USERS_UPDATE");
        assert_eq!(update["payload"], json!(["a@x.com"]));

        let mut b = TestClient::connect(&handle).await;
        handle
            .join(b.conn_id, Identity::new(11, "b@x.com"), 42)
            .await
            .unwrap();

        assert_eq!(a.recv().await["payload"], json!(["a@x.com", "b@x.com"]));
        assert_eq!(b.recv().await["payload"], json!(["a@x.com", "b@x.com"]));
    }

    #[test_log::test(tokio::test)]
    async fn changes_are_relayed_to_everyone_but_the_sender() {
        let (_registry, handle) = start();

        let mut a = TestClient::connect(&handle).await;
        let mut b = TestClient::connect(&handle).await;
        handle
            .join(a.conn_id, Identity::new(10, "a@x.com"), 42)
            .await
            .unwrap();
        handle
            .join(b.conn_id, Identity::new(11, "b@x.com"), 42)
            .await
            .unwrap();

        // drain the presence updates
        a.recv().await;
        a.recv().await;
        b.recv().await;

        handle
            .send_message(
                a.conn_id,
                json!({"type": "SEND_CHANGES", "payload": {"op": "insert"}}).to_string(),
            )
            .await;

        let relayed = b.recv().await;
        assert_eq!(relayed["type"], "RECEIVE_CHANGES");
        assert_eq!(relayed["payload"], json!({"op": "insert"}));

        assert_eq!(a.try_recv(), None);
    }

    #[test_log::test(tokio::test)]
    async fn relay_never_crosses_rooms() {
        let (_registry, handle) = start();

        let mut a = TestClient::connect(&handle).await;
        let mut other = TestClient::connect(&handle).await;
        handle
            .join(a.conn_id, Identity::new(10, "a@x.com"), 42)
            .await
            .unwrap();
        handle
            .join(other.conn_id, Identity::new(12, "c@y.com"), 43)
            .await
            .unwrap();

        a.recv().await;
        other.recv().await;

        handle
            .send_message(
                a.conn_id,
                json!({"type": "SEND_CHANGES", "payload": {"op": "insert"}}).to_string(),
            )
            .await;

        assert_eq!(other.try_recv(), None);
    }

    #[test_log::test(tokio::test)]
    async fn disconnect_announces_presence_to_remaining_members() {
        let (registry, handle) = start();

        let mut a = TestClient::connect(&handle).await;
        let b = TestClient::connect(&handle).await;
        handle
            .join(a.conn_id, Identity::new(10, "a@x.com"), 42)
            .await
            .unwrap();
        handle
            .join(b.conn_id, Identity::new(11, "b@x.com"), 42)
            .await
            .unwrap();

        a.recv().await;
        a.recv().await;

        handle.disconnect(b.conn_id).await;

        assert_eq!(a.recv().await["payload"], json!(["a@x.com"]));
        assert_eq!(registry.connection_count(42), 1);
    }

    #[test_log::test(tokio::test)]
    async fn disconnect_before_join_commits_leaves_no_ghost_member() {
        let (registry, handle) = start();

        let a = TestClient::connect(&handle).await;
        handle.disconnect(a.conn_id).await;

        let result = handle
            .join(a.conn_id, Identity::new(10, "a@x.com"), 42)
            .await;

        assert!(matches!(result, Err(JoinError::ConnectionClosed)));
        assert!(registry.is_empty(42));
    }

    #[test_log::test(tokio::test)]
    async fn disconnect_without_join_announces_nothing() {
        let (registry, handle) = start();

        let mut a = TestClient::connect(&handle).await;
        let other = TestClient::connect(&handle).await;
        handle
            .join(a.conn_id, Identity::new(10, "a@x.com"), 42)
            .await
            .unwrap();
        a.recv().await;

        handle.disconnect(other.conn_id).await;

        // force a full trip through the command loop
        handle
            .send_message(a.conn_id, json!({"type": "PING"}).to_string())
            .await;

        assert_eq!(a.try_recv(), None);
        assert_eq!(registry.connection_count(42), 1);
    }

    #[test_log::test(tokio::test)]
    async fn joining_twice_is_rejected() {
        let (registry, handle) = start();

        let mut a = TestClient::connect(&handle).await;
        handle
            .join(a.conn_id, Identity::new(10, "a@x.com"), 42)
            .await
            .unwrap();
        a.recv().await;

        let result = handle
            .join(a.conn_id, Identity::new(10, "a@x.com"), 42)
            .await;

        assert!(matches!(result, Err(JoinError::AlreadyJoined(_))));
        assert_eq!(registry.connection_count(42), 1);
        assert_eq!(a.try_recv(), None);
    }

    #[test_log::test(tokio::test)]
    async fn message_from_connection_without_room_is_dropped() {
        let (_registry, handle) = start();

        let mut a = TestClient::connect(&handle).await;
        let b = TestClient::connect(&handle).await;
        handle
            .join(a.conn_id, Identity::new(10, "a@x.com"), 42)
            .await
            .unwrap();
        a.recv().await;

        handle
            .send_message(
                b.conn_id,
                json!({"type": "SEND_CHANGES", "payload": {"op": "insert"}}).to_string(),
            )
            .await;

        assert_eq!(a.try_recv(), None);
    }
}
