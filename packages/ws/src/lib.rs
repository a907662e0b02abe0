#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]

//! Websocket message handling for Codocs.
//!
//! This crate provides the wire model exchanged with collaborating editors
//! and the room broadcast logic built on top of it. It handles relaying
//! opaque edit payloads between the members of a document room and
//! announcing presence snapshots when membership changes.
//!
//! # Main Components
//!
//! * [`WebsocketSender`] - Trait for delivering messages to connections
//! * [`process_message`] - Processes an incoming websocket message
//! * [`announce_presence`] - Broadcasts the current member list of a room
//! * [`models`] - Message payload types for inbound and outbound communication

mod ws;

pub use ws::*;

pub mod models;
