//! Long-poll tailing loop shared by the hub adapters.
//!
//! Liveness is checked between blocking reads, never inside them, so a tailer
//! whose producer disappeared is released within one block timeout.

use super::{ClientState, FeedReceiver, HubError};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Store-specific reads a tail needs. One instance is owned by one tail task.
#[async_trait]
pub(crate) trait TailSource: Send + 'static {
    type Cursor: Send + Sync;

    /// Position before the first entry.
    fn origin(&self) -> Self::Cursor;

    /// Entries after `cursor`, without waiting.
    async fn read_after(&mut self, cursor: &Self::Cursor)
        -> Result<Vec<(Self::Cursor, Bytes)>, HubError>;

    /// Entries after `cursor`, waiting up to `timeout` for the first one.
    /// An empty batch means the wait elapsed.
    async fn wait_after(
        &mut self,
        cursor: &Self::Cursor,
        timeout: Duration,
    ) -> Result<Vec<(Self::Cursor, Bytes)>, HubError>;

    async fn client_state(&mut self) -> Result<ClientState, HubError>;
}

enum Delivery {
    Continue,
    Stop,
}

/// Spawn the tail task and hand back its receiving end.
pub(crate) fn spawn_tail<S: TailSource>(
    feed_id: String,
    source: S,
    block_timeout: Duration,
    capacity: usize,
    cancel: CancellationToken,
) -> FeedReceiver {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        let reason = run_tail(source, &tx, block_timeout, &cancel).await;
        debug!(feed_id = %feed_id, reason, "feed tail finished");
        // Dropping `tx` here closes the receiver on every exit path.
    });
    rx
}

async fn run_tail<S: TailSource>(
    mut source: S,
    tx: &mpsc::Sender<Bytes>,
    block_timeout: Duration,
    cancel: &CancellationToken,
) -> &'static str {
    let mut cursor = source.origin();

    // Catch-up: everything already in the stream.
    let history = tokio::select! {
        _ = cancel.cancelled() => return "cancelled",
        _ = tx.closed() => return "receiver dropped",
        res = source.read_after(&cursor) => res,
    };
    match history {
        Ok(entries) => {
            if let Delivery::Stop = deliver(entries, &mut cursor, tx, cancel).await {
                return "delivery stopped";
            }
        }
        Err(e) => {
            warn!(error = %e, "initial feed read failed");
            return "store error";
        }
    }

    loop {
        let state = tokio::select! {
            _ = cancel.cancelled() => return "cancelled",
            res = source.client_state() => res,
        };
        match state {
            Ok(ClientState::Disconnected) => {
                // Pick up whatever the producer appended right before it left.
                let rest = tokio::select! {
                    _ = cancel.cancelled() => return "cancelled",
                    _ = tx.closed() => return "receiver dropped",
                    res = source.read_after(&cursor) => res,
                };
                return match rest {
                    Ok(entries) => match deliver(entries, &mut cursor, tx, cancel).await {
                        Delivery::Continue => "producer disconnected",
                        Delivery::Stop => "delivery stopped",
                    },
                    Err(e) => {
                        warn!(error = %e, "final feed read failed");
                        "store error"
                    }
                };
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "liveness check failed");
                return "store error";
            }
        }

        let batch = tokio::select! {
            _ = cancel.cancelled() => return "cancelled",
            _ = tx.closed() => return "receiver dropped",
            res = source.wait_after(&cursor, block_timeout) => res,
        };
        match batch {
            Ok(entries) if entries.is_empty() => continue,
            Ok(entries) => {
                if let Delivery::Stop = deliver(entries, &mut cursor, tx, cancel).await {
                    return "delivery stopped";
                }
            }
            Err(e) => {
                warn!(error = %e, "blocking feed read failed");
                return "store error";
            }
        }
    }
}

async fn deliver<C>(
    entries: Vec<(C, Bytes)>,
    cursor: &mut C,
    tx: &mpsc::Sender<Bytes>,
    cancel: &CancellationToken,
) -> Delivery {
    for (position, data) in entries {
        tokio::select! {
            _ = cancel.cancelled() => return Delivery::Stop,
            sent = tx.send(data) => {
                if sent.is_err() {
                    return Delivery::Stop;
                }
            }
        }
        *cursor = position;
    }
    Delivery::Continue
}
