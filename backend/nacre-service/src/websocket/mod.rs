//! WebSocket peer bridge.
//!
//! Protocol: after the upgrade the client sends exactly one text frame holding
//! the feed id. The server answers with binary frames carrying raw feed chunks,
//! pings periodically, and closes with one of the codes below.

use actix_ws::CloseCode;
use std::time::Duration;

mod peer;

pub use self::peer::{serve_peer, Peer};

/// Feed ended because its producer went away.
pub const CLOSE_FEED_ENDED: CloseCode = CloseCode::Normal;
/// Server shutdown or peer teardown.
pub const CLOSE_GOING_AWAY: CloseCode = CloseCode::Away;
/// Store failure while subscribing.
pub const CLOSE_INTERNAL: CloseCode = CloseCode::Error;
pub const CLOSE_NOT_FOUND: CloseCode = CloseCode::Other(4404);
pub const CLOSE_TOO_MANY_PEERS: CloseCode = CloseCode::Other(4429);

#[derive(Debug, Clone)]
pub struct PeerSettings {
    /// Largest inbound frame accepted from a consumer.
    pub max_frame_size: usize,
    /// Bound on a single outbound frame write.
    pub write_deadline: Duration,
    /// The peer is dropped if no pong arrives within this window.
    pub pong_deadline: Duration,
    pub ping_period: Duration,
    /// Time allowed for the subscribe frame after the upgrade.
    pub handshake_deadline: Duration,
}

impl Default for PeerSettings {
    fn default() -> Self {
        let pong_deadline = Duration::from_secs(8);
        Self {
            max_frame_size: 256,
            write_deadline: Duration::from_secs(10),
            pong_deadline,
            ping_period: Duration::from_secs(5),
            handshake_deadline: pong_deadline,
        }
    }
}
