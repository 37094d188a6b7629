//! TCP ingestion: every accepted connection becomes the producer of a new feed.
//!
//! Per connection: admit by origin, announce the feed URL, then relay socket
//! reads into the hub while a heartbeat keeps the producer's liveness record
//! fresh. Cleanup runs on every exit path.

use crate::admission::AdmissionController;
use crate::hub::SharedHub;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const REJECTION_MESSAGE: &[u8] = b"Too many connections from your address, try again later\n";

#[derive(Debug, Clone)]
pub struct TcpSettings {
    pub read_buffer_size: usize,
    pub heartbeat_interval: Duration,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TcpServerError {
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Banner written to a freshly admitted producer.
pub fn banner(base_url: &str, feed_id: &str) -> String {
    format!("Connected to nacre\n{}\n", feed_url(base_url, feed_id))
}

pub fn feed_url(base_url: &str, feed_id: &str) -> String {
    format!("{}/feed/{}", base_url.trim_end_matches('/'), feed_id)
}

/// Why a producer's streaming phase ended.
#[derive(Debug, Clone, Copy)]
enum StreamEnd {
    AnnounceFailed,
    Eof,
    ReadFailed,
    PushFailed,
    Cancelled,
}

impl StreamEnd {
    fn as_str(self) -> &'static str {
        match self {
            StreamEnd::AnnounceFailed => "banner write failed",
            StreamEnd::Eof => "eof",
            StreamEnd::ReadFailed => "read error",
            StreamEnd::PushFailed => "push failed",
            StreamEnd::Cancelled => "shutdown",
        }
    }
}

struct Shared {
    base_url: String,
    hub: SharedHub,
    admission: Arc<AdmissionController>,
    settings: TcpSettings,
}

pub struct TcpIngestServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl TcpIngestServer {
    pub async fn bind(
        addr: &str,
        base_url: impl Into<String>,
        hub: SharedHub,
        admission: Arc<AdmissionController>,
        settings: TcpSettings,
    ) -> Result<Self, TcpServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TcpServerError::Bind {
                address: addr.to_string(),
                source: e,
            })?;

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                base_url: base_url.into(),
                hub,
                admission,
                settings,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TcpServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept producers until `cancel` fires, then wait for every open
    /// connection to finish its cleanup.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), TcpServerError> {
        let tracker = TaskTracker::new();
        info!(address = %self.local_addr()?, "TCP ingestion listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = self.shared.clone();
                        let conn_cancel = cancel.child_token();
                        tracker.spawn(async move {
                            shared.handle_connection(stream, peer, conn_cancel).await;
                        });
                    }
                    Err(e) => {
                        // Transient accept errors (EMFILE, resets) must not kill the server.
                        warn!(error = %e, "accept error");
                    }
                }
            }
        }

        drop(self.listener);
        tracker.close();
        info!(open = tracker.len(), "TCP ingestion draining connections");
        tracker.wait().await;
        info!("TCP ingestion stopped");
        Ok(())
    }
}

impl Shared {
    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) {
        let origin = peer.ip().to_string();
        if !self.admission.try_acquire_producer(&origin) {
            info!(origin = %origin, "producer rejected: too many connections");
            let _ = stream.write_all(REJECTION_MESSAGE).await;
            let _ = stream.shutdown().await;
            return;
        }

        let feed_id = Uuid::new_v4().to_string();
        info!(origin = %origin, feed_id = %feed_id, "producer admitted");

        // Liveness must be set before anyone can learn the feed URL.
        if let Err(e) = self.hub.client_connected(&feed_id).await {
            warn!(feed_id = %feed_id, error = %e, "failed to mark producer live");
        }

        let mut heartbeat = None;
        let end = match self.announce(&mut stream, &feed_id, &cancel).await {
            Ok(()) => {
                let beat = cancel.child_token();
                heartbeat = Some((beat.clone(), self.spawn_heartbeat(&feed_id, beat)));
                self.relay(&mut stream, &feed_id, &cancel).await
            }
            Err(e) => {
                debug!(feed_id = %feed_id, error = %e, "banner write failed");
                StreamEnd::AnnounceFailed
            }
        };

        // Stop the heartbeat before clearing liveness so it cannot be re-set.
        if let Some((beat, handle)) = heartbeat {
            beat.cancel();
            let _ = handle.await;
        }
        if let Err(e) = self.hub.client_disconnected(&feed_id).await {
            warn!(feed_id = %feed_id, error = %e, "failed to clear producer liveness");
        }
        self.admission.release_producer(&origin);
        let _ = stream.shutdown().await;

        info!(origin = %origin, feed_id = %feed_id, reason = end.as_str(), "producer closed");
    }

    async fn announce(
        &self,
        stream: &mut TcpStream,
        feed_id: &str,
        cancel: &CancellationToken,
    ) -> std::io::Result<()> {
        let banner = banner(&self.base_url, feed_id);
        tokio::select! {
            _ = cancel.cancelled() => Err(std::io::ErrorKind::Interrupted.into()),
            res = stream.write_all(banner.as_bytes()) => res,
        }
    }

    fn spawn_heartbeat(&self, feed_id: &str, stop: CancellationToken) -> JoinHandle<()> {
        let hub = self.hub.clone();
        let feed_id = feed_id.to_string();
        let period = self.settings.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = hub.client_connected(&feed_id).await {
                            warn!(feed_id = %feed_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        })
    }

    async fn relay(
        &self,
        stream: &mut TcpStream,
        feed_id: &str,
        cancel: &CancellationToken,
    ) -> StreamEnd {
        let mut buf = vec![0u8; self.settings.read_buffer_size.max(1)];
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                read = stream.read(&mut buf) => read,
            };
            let n = match read {
                Ok(0) => return StreamEnd::Eof,
                Ok(n) => n,
                Err(e) => {
                    debug!(feed_id = %feed_id, error = %e, "producer read failed");
                    return StreamEnd::ReadFailed;
                }
            };
            if let Err(e) = self.hub.push(feed_id, Bytes::copy_from_slice(&buf[..n])).await {
                warn!(feed_id = %feed_id, error = %e, "push failed");
                return StreamEnd::PushFailed;
            }
        }
    }
}
