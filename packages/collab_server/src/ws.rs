//! Websocket server and connection handling.
//!
//! This module coordinates the live collaboration sessions: the join
//! sequence (authenticate, authorize, register, announce), presence
//! announcements, and relaying edit payloads between the members of a
//! document room.

use codocs_auth::DocumentLookupError;
use codocs_session::RegisterError;
use thiserror::Error;

pub mod handler;
pub mod server;

/// Message type for websocket communication.
///
/// All websocket messages are transmitted as JSON-encoded strings.
pub type Msg = String;

/// Errors that can occur during the join sequence.
///
/// Every variant is terminal for the connection: the coordinator never
/// retries a failed join, and no registry side effects remain after one.
#[derive(Debug, Error)]
pub enum JoinError {
    /// The handshake was missing the credential or the document id
    #[error("Malformed join request")]
    MalformedJoinRequest,
    /// Credential verification failed
    #[error("Unauthenticated")]
    Unauthenticated,
    /// The verified user may not open the requested document
    #[error("Forbidden")]
    Forbidden,
    /// The backend resolving the document failed
    #[error("Document lookup failed: {0}")]
    DocumentLookupFailed(#[from] DocumentLookupError),
    /// The connection is already a member of a room
    #[error(transparent)]
    AlreadyJoined(#[from] RegisterError),
    /// The transport disconnected before the join could commit
    #[error("Connection closed before join completed")]
    ConnectionClosed,
}
