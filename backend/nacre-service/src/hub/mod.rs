//! Feed hub: the store-backed pub/sub layer between producers and peers.
//!
//! A feed is an append-only, bounded sequence of byte chunks. Producers append with
//! [`Hub::push`]; consumers either snapshot the whole history with [`Hub::get_all`]
//! or tail it with [`Hub::listen`], which replays history and then follows new
//! entries until the producer goes away or the caller cancels.
//!
//! Producer liveness is a separate short-lived record per feed, refreshed by the
//! TCP heartbeat and consulted by tailers between blocking reads.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod memory;
pub mod redis;
mod tail;

pub use self::memory::InMemoryHub;
pub use self::redis::RedisHub;

/// Receiving half of a tailing subscription. Closed when the tail ends.
pub type FeedReceiver = mpsc::Receiver<Bytes>;

/// Hub handle shared by the TCP server and the HTTP workers.
pub type SharedHub = Arc<dyn Hub>;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("store error: {0}")]
    Store(#[from] ::redis::RedisError),

    #[error("malformed stream entry {entry_id}: {reason}")]
    MalformedEntry { entry_id: String, reason: String },
}

/// Whether a feed's producer is still attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    Disconnected,
    /// The store held a liveness value nacre did not write.
    Unknown,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Connected => "CONNECTED",
            ClientState::Disconnected => "DISCONNECTED",
            ClientState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECTED" => ClientState::Connected,
            "DISCONNECTED" => ClientState::Disconnected,
            _ => ClientState::Unknown,
        })
    }
}

/// Tunables shared by every hub adapter.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Upper bound on retained entries per feed (trim is approximate on Redis).
    pub max_stream_len: usize,
    /// Feed history expires this long after the last push.
    pub stream_ttl: Duration,
    /// How long one tail read parks waiting for new entries.
    pub block_timeout: Duration,
    /// Lifetime of a liveness record between heartbeats.
    pub client_ttl: Duration,
    /// Buffered chunks per tailing subscription.
    pub channel_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            max_stream_len: 1_000,
            stream_ttl: Duration::from_secs(24 * 60 * 60),
            block_timeout: Duration::from_secs(5),
            client_ttl: Duration::from_secs(15),
            channel_capacity: 64,
        }
    }
}

/// Capability set the TCP and WebSocket layers depend on.
#[async_trait]
pub trait Hub: Send + Sync + 'static {
    /// True iff the store holds unexpired history for `id`.
    async fn feed_exists(&self, id: &str) -> Result<bool, HubError>;

    /// Append one entry, trim to the configured length and refresh the feed TTL
    /// in a single store round trip.
    async fn push(&self, id: &str, data: Bytes) -> Result<(), HubError>;

    /// Replay the feed from the beginning, then follow it.
    ///
    /// The returned channel closes once the producer's liveness record is gone,
    /// the store fails, `cancel` fires, or the receiver is dropped.
    async fn listen(&self, id: &str, cancel: CancellationToken) -> Result<FeedReceiver, HubError>;

    /// Full history snapshot, oldest first. Empty for unknown feeds.
    async fn get_all(&self, id: &str) -> Result<Vec<Bytes>, HubError>;

    /// Absent or expired liveness records read as [`ClientState::Disconnected`].
    async fn client_state(&self, id: &str) -> Result<ClientState, HubError>;

    /// Set or refresh the producer liveness record.
    async fn client_connected(&self, id: &str) -> Result<(), HubError>;

    /// Clear the liveness record. Clearing an absent record succeeds.
    async fn client_disconnected(&self, id: &str) -> Result<(), HubError>;

    /// Cheap reachability probe for readiness checks.
    async fn health_check(&self) -> Result<(), HubError>;
}

pub(crate) fn stream_key(id: &str) -> String {
    format!("nacre:feed:{}", id)
}

pub(crate) fn client_key(id: &str) -> String {
    format!("nacre:client:{}", id)
}
