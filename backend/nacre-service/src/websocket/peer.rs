use super::{
    PeerSettings, CLOSE_FEED_ENDED, CLOSE_GOING_AWAY, CLOSE_INTERNAL, CLOSE_NOT_FOUND,
    CLOSE_TOO_MANY_PEERS,
};
use crate::admission::AdmissionController;
use crate::hub::SharedHub;
use actix_ws::{CloseCode, CloseReason, Message, MessageStream, Session};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drive one upgraded consumer connection from handshake to release.
///
/// `shutdown` is the server-wide token; cancelling it makes the peer close
/// with going-away.
pub async fn serve_peer(
    session: Session,
    mut messages: MessageStream,
    hub: SharedHub,
    admission: Arc<AdmissionController>,
    settings: PeerSettings,
    shutdown: CancellationToken,
) {
    let Some(feed_id) = read_subscription(&mut messages, &settings).await else {
        // Protocol violation: drop the connection without a close handshake.
        return;
    };

    match hub.feed_exists(&feed_id).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(feed_id = %feed_id, "peer asked for unknown feed");
            close(session, CLOSE_NOT_FOUND, "feed not found", &settings).await;
            return;
        }
        Err(e) => {
            warn!(feed_id = %feed_id, error = %e, "feed lookup failed");
            close(session, CLOSE_INTERNAL, "internal error", &settings).await;
            return;
        }
    }

    if !admission.try_acquire_peer(&feed_id) {
        info!(feed_id = %feed_id, "peer rejected: too many peers");
        close(session, CLOSE_TOO_MANY_PEERS, "too many peers", &settings).await;
        return;
    }

    info!(feed_id = %feed_id, "peer subscribed");
    let peer = Peer {
        feed_id,
        hub,
        settings,
    };
    peer.run(session, messages, shutdown.child_token()).await;

    admission.release_peer(&peer.feed_id);
    info!(feed_id = %peer.feed_id, "peer released");
}

/// Wait for the subscribe frame. `None` means the client broke protocol or
/// never sent it.
async fn read_subscription(messages: &mut MessageStream, settings: &PeerSettings) -> Option<String> {
    match timeout(settings.handshake_deadline, messages.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => {
            let feed_id = text.trim();
            if feed_id.is_empty() {
                debug!("empty subscribe frame");
                None
            } else {
                Some(feed_id.to_string())
            }
        }
        Ok(Some(Ok(other))) => {
            debug!(frame = ?other, "first frame was not a text subscribe frame");
            None
        }
        Ok(Some(Err(e))) => {
            debug!(error = %e, "protocol error before subscribe");
            None
        }
        Ok(None) => None,
        Err(_) => {
            debug!("subscribe frame deadline elapsed");
            None
        }
    }
}

async fn close(session: Session, code: CloseCode, description: &str, settings: &PeerSettings) {
    let reason = CloseReason {
        code,
        description: Some(description.to_string()),
    };
    let _ = timeout(settings.write_deadline, session.close(Some(reason))).await;
}

/// One consumer connection bound to one feed.
pub struct Peer {
    feed_id: String,
    hub: SharedHub,
    settings: PeerSettings,
}

impl Peer {
    pub fn feed_id(&self) -> &str {
        &self.feed_id
    }

    /// Run the read and write loops until both have stopped. Whichever exits
    /// first cancels `cancel`, which brings the other one down.
    pub async fn run(&self, session: Session, messages: MessageStream, cancel: CancellationToken) {
        let read = self.read_loop(session.clone(), messages, cancel.clone());
        let write = self.write_loop(session, cancel);
        tokio::join!(read, write);
    }

    /// Drains inbound frames to answer pings and observe client close. Frame
    /// content is ignored.
    async fn read_loop(
        &self,
        mut session: Session,
        mut messages: MessageStream,
        cancel: CancellationToken,
    ) {
        let _teardown = cancel.clone().drop_guard();
        let deadline = sleep(self.settings.pong_deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = &mut deadline => {
                    debug!(feed_id = %self.feed_id, "pong deadline elapsed");
                    return;
                }
                msg = messages.next() => match msg {
                    Some(Ok(Message::Ping(bytes))) => {
                        if session.pong(&bytes).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        deadline.as_mut().reset(Instant::now() + self.settings.pong_deadline);
                    }
                    Some(Ok(Message::Close(reason))) => {
                        debug!(feed_id = %self.feed_id, reason = ?reason, "peer closed");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(feed_id = %self.feed_id, error = %e, "peer read failed");
                        return;
                    }
                    None => return,
                }
            }
        }
    }

    /// Forwards feed chunks as binary frames and keeps the connection alive
    /// with pings.
    async fn write_loop(&self, mut session: Session, cancel: CancellationToken) {
        let _teardown = cancel.clone().drop_guard();

        let mut feed = match self.hub.listen(&self.feed_id, cancel.child_token()).await {
            Ok(feed) => feed,
            Err(e) => {
                warn!(feed_id = %self.feed_id, error = %e, "subscribe failed");
                close(session, CLOSE_INTERNAL, "internal error", &self.settings).await;
                return;
            }
        };

        let period = self.settings.ping_period;
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = self.settings.write_deadline;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    close(session, CLOSE_GOING_AWAY, "going away", &self.settings).await;
                    return;
                }
                chunk = feed.recv() => match chunk {
                    Some(data) => {
                        if !matches!(timeout(deadline, session.binary(data)).await, Ok(Ok(()))) {
                            debug!(feed_id = %self.feed_id, "binary write failed or timed out");
                            return;
                        }
                    }
                    None => {
                        close(session, CLOSE_FEED_ENDED, "feed ended", &self.settings).await;
                        return;
                    }
                },
                _ = ping.tick() => {
                    if !matches!(timeout(deadline, session.ping(b"")).await, Ok(Ok(()))) {
                        debug!(feed_id = %self.feed_id, "ping write failed or timed out");
                        return;
                    }
                }
            }
        }
    }
}
