#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]

//! In-memory registry of live collaboration sessions.
//!
//! The registry is the single source of truth for presence: it maps each live
//! connection to the identity it authenticated with and the document room it
//! joined, and each room to its current member set. The transport layer is
//! referenced only by opaque connection id.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock},
};

use thiserror::Error;

/// Connection ID type for identifying live transport sessions.
///
/// Assigned by the transport layer when a client connects and never reused.
pub type ConnId = u64;

/// Room ID type. Rooms are keyed by the document being edited.
pub type RoomId = u64;

/// The identity a connection authenticated with.
///
/// Produced once by credential verification at join time and immutable for
/// the life of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Subject id of the verified user.
    pub user_id: u64,
    /// Display label shown in presence lists (the user's email).
    pub label: String,
}

impl Identity {
    #[must_use]
    pub fn new(user_id: u64, label: impl Into<String>) -> Self {
        Self {
            user_id,
            label: label.into(),
        }
    }
}

/// Errors that can occur when registering a connection into a room.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    /// The connection is already a member of a room. Callers must deregister
    /// before joining again, including when rejoining the same document.
    #[error("Connection {conn_id} already joined room {room_id}")]
    AlreadyJoined {
        /// The connection that attempted to join.
        conn_id: ConnId,
        /// The room it is already a member of.
        room_id: RoomId,
    },
}

/// Member state of a single room.
#[derive(Debug, Default)]
struct Room {
    members: BTreeMap<ConnId, Identity>,
}

/// Registry of rooms and the connections present in them.
///
/// Mutations to a room's member set are linearized by a per-room lock, so
/// unrelated rooms never contend beyond the brief map access needed to find
/// or create the room entry. The cross-room `connections` map enforces the
/// invariant that a connection is a member of at most one room.
#[derive(Debug, Default)]
pub struct Registry {
    /// Map of room ids to their member state.
    rooms: RwLock<BTreeMap<RoomId, Arc<Mutex<Room>>>>,
    /// Map of connection ids to the room they are registered in.
    connections: RwLock<BTreeMap<ConnId, RoomId>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection into a room, creating the room if absent.
    ///
    /// The cross-room `connections` lock is held only to reserve the
    /// `conn -> room` entry; the member insert happens under the room's own
    /// lock, so in-flight mutations on other rooms are never blocked.
    ///
    /// # Errors
    ///
    /// * [`RegisterError::AlreadyJoined`] if the connection is already a
    ///   member of any room
    pub fn register(
        &self,
        conn_id: ConnId,
        identity: Identity,
        room_id: RoomId,
    ) -> Result<RoomId, RegisterError> {
        {
            let mut connections = self.connections.write().unwrap();

            if let Some(&existing) = connections.get(&conn_id) {
                return Err(RegisterError::AlreadyJoined {
                    conn_id,
                    room_id: existing,
                });
            }

            connections.insert(conn_id, room_id);
        }

        // the room lock must be taken before the map guard drops, or a racing
        // empty-room removal could orphan the entry between the two; mutating
        // an existing room only needs the shared guard
        let rooms = self.rooms.read().unwrap();
        if let Some(room) = rooms.get(&room_id).cloned() {
            let mut members = room.lock().unwrap();
            drop(rooms);
            members.members.insert(conn_id, identity);
        } else {
            drop(rooms);
            let mut rooms = self.rooms.write().unwrap();
            let room = rooms.entry(room_id).or_default().clone();
            let mut members = room.lock().unwrap();
            drop(rooms);
            members.members.insert(conn_id, identity);
        }

        log::debug!("Registered connection {conn_id} into room {room_id}");

        Ok(room_id)
    }

    /// Remove a connection from its room, dropping the room when it becomes
    /// empty.
    ///
    /// Returns the affected room id so the caller can re-announce presence,
    /// or `None` if the connection had no room. Idempotent: deregistering an
    /// already-removed connection is a no-op, which matters because an
    /// explicit leave can race the transport-level disconnect.
    pub fn deregister(&self, conn_id: ConnId) -> Option<RoomId> {
        let room_id = self.connections.write().unwrap().remove(&conn_id)?;

        let emptied = self.room(room_id).is_some_and(|room| {
            let mut room = room.lock().unwrap();
            room.members.remove(&conn_id);
            room.members.is_empty()
        });

        // empty rooms carry no state forward; re-check under the write lock
        // since a new member may have registered in the meantime
        if emptied {
            let mut rooms = self.rooms.write().unwrap();
            if let Some(room) = rooms.get(&room_id).cloned()
                && room.lock().unwrap().members.is_empty()
            {
                rooms.remove(&room_id);
            }
        }

        log::debug!("Deregistered connection {conn_id} from room {room_id}");

        Some(room_id)
    }

    /// Point-in-time snapshot of the member labels of a room.
    ///
    /// Not a live view. Callers must re-request to observe later joins and
    /// leaves. An absent room yields an empty list.
    #[must_use]
    pub fn members(&self, room_id: RoomId) -> Vec<String> {
        self.snapshot(room_id)
            .into_iter()
            .map(|(_, label)| label)
            .collect()
    }

    /// Point-in-time snapshot of `(connection id, label)` pairs for a room.
    ///
    /// Computed under the room lock, so it never observes a torn member set.
    #[must_use]
    pub fn snapshot(&self, room_id: RoomId) -> Vec<(ConnId, String)> {
        self.room(room_id).map_or_else(Vec::new, |room| {
            room.lock()
                .unwrap()
                .members
                .iter()
                .map(|(conn_id, identity)| (*conn_id, identity.label.clone()))
                .collect()
        })
    }

    /// Connection ids currently present in a room.
    #[must_use]
    pub fn member_ids(&self, room_id: RoomId) -> Vec<ConnId> {
        self.room(room_id).map_or_else(Vec::new, |room| {
            room.lock().unwrap().members.keys().copied().collect()
        })
    }

    /// Whether a room has no members. Absent rooms are empty.
    #[must_use]
    pub fn is_empty(&self, room_id: RoomId) -> bool {
        self.room(room_id)
            .is_none_or(|room| room.lock().unwrap().members.is_empty())
    }

    /// Number of connections currently present in a room.
    #[must_use]
    pub fn connection_count(&self, room_id: RoomId) -> usize {
        self.room(room_id)
            .map_or(0, |room| room.lock().unwrap().members.len())
    }

    /// The room a connection is registered in, if any.
    #[must_use]
    pub fn room_of(&self, conn_id: ConnId) -> Option<RoomId> {
        self.connections.read().unwrap().get(&conn_id).copied()
    }

    fn room(&self, room_id: RoomId) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().unwrap().get(&room_id).cloned()
    }
}
