//! Room broadcast logic and websocket message processing.
//!
//! Messages are delivered through the [`WebsocketSender`] seam so the
//! broadcast logic stays independent of the transport. The registry is
//! consulted at send time, so presence payloads always reflect committed
//! membership state.

use core::fmt;

use async_trait::async_trait;
use codocs_session::{ConnId, Registry, RoomId};
use serde_json::Value;
use thiserror::Error;

use crate::models::{
    CurrentUsersUpdatePayload, InboundPayload, OutboundPayload, ReceiveChangesPayload,
};

/// Response for websocket operations.
#[derive(Debug, PartialEq, Eq)]
pub struct Response {
    /// HTTP-style status code indicating operation result.
    pub status_code: u16,
    /// Response message body.
    pub body: String,
}

/// Context for a websocket connection that has joined a room.
#[derive(Clone, Debug)]
pub struct WebsocketContext {
    /// Unique identifier for this connection.
    pub conn_id: ConnId,
    /// The document room this connection is a member of.
    pub room_id: RoomId,
}

/// Errors that can occur when sending websocket messages.
#[derive(Debug, Error)]
pub enum WebsocketSendError {
    /// Unknown error with details
    #[error("Unknown: {0}")]
    Unknown(String),
    /// JSON serialization/deserialization error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Trait for delivering messages to websocket connections.
///
/// Delivery is best-effort: implementations must isolate per-recipient
/// failures so that one closing transport never aborts delivery to the
/// remaining members of a room, and must preserve per-sender message order.
#[async_trait]
pub trait WebsocketSender: Send + Sync {
    /// Sends a message to a specific connection.
    ///
    /// # Errors
    ///
    /// * If the websocket message fails to send
    async fn send(&self, conn_id: ConnId, data: &str) -> Result<(), WebsocketSendError>;

    /// Sends a message to every member of a room.
    ///
    /// # Errors
    ///
    /// * If the websocket message fails to send
    async fn send_room(&self, room_id: RoomId, data: &str) -> Result<(), WebsocketSendError>;

    /// Sends a message to every member of a room except one connection.
    ///
    /// # Errors
    ///
    /// * If the websocket message fails to send
    async fn send_room_except(
        &self,
        room_id: RoomId,
        conn_id: ConnId,
        data: &str,
    ) -> Result<(), WebsocketSendError>;
}

impl fmt::Debug for dyn WebsocketSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{WebsocketSender}}")
    }
}

/// Errors that can occur when processing a websocket message.
#[derive(Debug, Error)]
pub enum WebsocketMessageError {
    /// Message type is not recognized or invalid
    #[error("Invalid message type")]
    InvalidMessageType,
    /// Failed to deliver the resulting messages
    #[error(transparent)]
    Send(#[from] WebsocketSendError),
    /// JSON serialization/deserialization error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Processes an incoming websocket message from a joined connection.
///
/// # Errors
///
/// * If the message fails to parse or process
pub async fn process_message(
    body: Value,
    context: &WebsocketContext,
    sender: &impl WebsocketSender,
) -> Result<Response, WebsocketMessageError> {
    let payload: InboundPayload = serde_json::from_value(body).map_err(|e| {
        log::error!("Invalid message type: {e:?}");
        WebsocketMessageError::InvalidMessageType
    })?;

    message(sender, payload, context).await
}

/// Routes a parsed websocket message to its appropriate handler.
///
/// # Errors
///
/// * If the message fails to process
pub async fn message(
    sender: &impl WebsocketSender,
    message: InboundPayload,
    context: &WebsocketContext,
) -> Result<Response, WebsocketMessageError> {
    let message_type = message.as_ref().to_string();
    log::debug!(
        "Received message type {message_type} from {}: {message:?}",
        context.conn_id
    );

    match message {
        InboundPayload::Ping(_) => {
            log::trace!("Ping");
        }
        InboundPayload::SendChanges(payload) => {
            relay_changes(sender, context, payload.payload).await?;
        }
    }

    log::debug!(
        "Successfully processed message type {message_type} from {}",
        context.conn_id
    );
    Ok(Response {
        status_code: 200,
        body: "Received".into(),
    })
}

/// Broadcasts the current member list of a room to every member.
///
/// Must be called only after the registry mutation that changed membership
/// has committed; the snapshot is computed here, never cached.
///
/// # Errors
///
/// * If the json fails to serialize
/// * If the ws message fails to broadcast
pub async fn announce_presence(
    registry: &Registry,
    sender: &impl WebsocketSender,
    room_id: RoomId,
) -> Result<(), WebsocketSendError> {
    let members = registry.members(room_id);

    log::debug!(
        "Announcing presence for room {room_id}: {} member(s)",
        members.len()
    );

    let users_json = serde_json::to_value(OutboundPayload::CurrentUsersUpdate(
        CurrentUsersUpdatePayload { payload: members },
    ))?
    .to_string();

    sender.send_room(room_id, &users_json).await
}

/// Relays an opaque edit payload to every member of the sender's room
/// except the sender itself.
///
/// # Errors
///
/// * If the json fails to serialize
/// * If the ws message fails to broadcast
pub async fn relay_changes(
    sender: &impl WebsocketSender,
    context: &WebsocketContext,
    changes: Value,
) -> Result<(), WebsocketSendError> {
    let changes_json = serde_json::to_value(OutboundPayload::ReceiveChanges(
        ReceiveChangesPayload { payload: changes },
    ))?
    .to_string();

    sender
        .send_room_except(context.room_id, context.conn_id, &changes_json)
        .await
}
