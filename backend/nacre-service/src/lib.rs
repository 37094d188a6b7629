//! nacre: a live-feed relay.
//!
//! TCP producers stream raw bytes into a feed; browsers follow the feed over a
//! WebSocket or fetch its history as plain text.

pub mod admission;
pub mod config;
pub mod error;
pub mod hub;
pub mod logging;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod tcp;
pub mod templates;
pub mod websocket;
