//! # room-relay
//!
//! A room-partitioned WebSocket relay. Clients join a named room guarded by a
//! shared password, then exchange room-wide broadcasts (`share`) and directed
//! whispers. The server keeps each room's roster in sync and reaps silent
//! connections with a ping/pong heartbeat.
//!
//! The [`client`] module provides a reconnecting client for the same protocol.

pub mod client;
pub mod config;
pub mod server;
pub mod utils;
