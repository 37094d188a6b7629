//! Process-local hub used by tests and single-node development runs.
//!
//! Mirrors the Redis adapter's observable behaviour: exact trimming, TTL refreshed
//! on every push, lazily expired feeds and liveness records.

use super::tail::{spawn_tail, TailSource};
use super::{ClientState, FeedReceiver, Hub, HubError, HubSettings};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Minimum spacing between full sweeps of expired feeds and liveness records.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct InMemoryHub {
    state: Arc<Mutex<MemoryState>>,
    settings: HubSettings,
}

#[derive(Default)]
struct MemoryState {
    feeds: HashMap<String, FeedLog>,
    clients: HashMap<String, Instant>,
    /// Wake-ups for tails parked on a feed, which may not exist yet.
    waiters: HashMap<String, Arc<Notify>>,
    next_sweep: Option<Instant>,
}

struct FeedLog {
    entries: VecDeque<(u64, Bytes)>,
    next_seq: u64,
    expires_at: Instant,
}

impl MemoryState {
    /// Drop every expired feed and liveness record, including ones no caller
    /// will touch again.
    fn sweep(&mut self, now: Instant) {
        if self.next_sweep.is_some_and(|at| at > now) {
            return;
        }
        self.feeds.retain(|_, feed| feed.expires_at > now);
        self.clients.retain(|_, expires_at| *expires_at > now);
        self.next_sweep = Some(now + SWEEP_INTERVAL);
    }

    /// Live feed for `id`, purging it first if its TTL has lapsed.
    fn feed(&mut self, id: &str, now: Instant) -> Option<&mut FeedLog> {
        if self.feeds.get(id).is_some_and(|f| f.expires_at <= now) {
            self.feeds.remove(id);
        }
        self.feeds.get_mut(id)
    }

    fn client_state(&mut self, id: &str, now: Instant) -> ClientState {
        match self.clients.get(id) {
            Some(expires_at) if *expires_at > now => ClientState::Connected,
            Some(_) => {
                self.clients.remove(id);
                ClientState::Disconnected
            }
            None => ClientState::Disconnected,
        }
    }

    fn entries_after(&mut self, id: &str, cursor: u64, now: Instant) -> Vec<(u64, Bytes)> {
        match self.feed(id, now) {
            Some(feed) => feed
                .entries
                .iter()
                .filter(|(seq, _)| *seq > cursor)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}

impl InMemoryHub {
    pub fn new(settings: HubSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            settings,
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Number of feeds currently holding unexpired history.
    pub fn feed_count(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock();
        state.feeds.values().filter(|f| f.expires_at > now).count()
    }

    fn register_waiter(&self, id: &str) -> Arc<Notify> {
        let mut state = self.state.lock();
        state
            .waiters
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

#[async_trait]
impl Hub for InMemoryHub {
    async fn feed_exists(&self, id: &str) -> Result<bool, HubError> {
        let mut state = self.state.lock();
        Ok(state.feed(id, Instant::now()).is_some())
    }

    async fn push(&self, id: &str, data: Bytes) -> Result<(), HubError> {
        let now = Instant::now();
        let waiter = {
            let mut state = self.state.lock();
            state.sweep(now);
            // Touch first so an expired log is replaced rather than extended.
            state.feed(id, now);
            let feed = state.feeds.entry(id.to_string()).or_insert_with(|| FeedLog {
                entries: VecDeque::new(),
                next_seq: 1,
                expires_at: now,
            });
            feed.entries.push_back((feed.next_seq, data));
            feed.next_seq += 1;
            while feed.entries.len() > self.settings.max_stream_len {
                feed.entries.pop_front();
            }
            feed.expires_at = now + self.settings.stream_ttl;
            state.waiters.get(id).cloned()
        };
        if let Some(waiter) = waiter {
            waiter.notify_waiters();
        }
        Ok(())
    }

    async fn listen(&self, id: &str, cancel: CancellationToken) -> Result<FeedReceiver, HubError> {
        let source = MemoryTail {
            hub: self.clone(),
            feed_id: id.to_string(),
            waiter: self.register_waiter(id),
        };
        Ok(spawn_tail(
            id.to_string(),
            source,
            self.settings.block_timeout,
            self.settings.channel_capacity,
            cancel,
        ))
    }

    async fn get_all(&self, id: &str) -> Result<Vec<Bytes>, HubError> {
        let mut state = self.state.lock();
        Ok(state
            .entries_after(id, 0, Instant::now())
            .into_iter()
            .map(|(_, data)| data)
            .collect())
    }

    async fn client_state(&self, id: &str) -> Result<ClientState, HubError> {
        Ok(self.state.lock().client_state(id, Instant::now()))
    }

    async fn client_connected(&self, id: &str) -> Result<(), HubError> {
        let expires_at = Instant::now() + self.settings.client_ttl;
        self.state.lock().clients.insert(id.to_string(), expires_at);
        Ok(())
    }

    async fn client_disconnected(&self, id: &str) -> Result<(), HubError> {
        self.state.lock().clients.remove(id);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), HubError> {
        Ok(())
    }
}

struct MemoryTail {
    hub: InMemoryHub,
    feed_id: String,
    waiter: Arc<Notify>,
}

impl Drop for MemoryTail {
    fn drop(&mut self) {
        let mut state = self.hub.state.lock();
        // The map holds one reference and this tail another.
        if Arc::strong_count(&self.waiter) <= 2 {
            state.waiters.remove(&self.feed_id);
        }
    }
}

#[async_trait]
impl TailSource for MemoryTail {
    type Cursor = u64;

    fn origin(&self) -> u64 {
        0
    }

    async fn read_after(&mut self, cursor: &u64) -> Result<Vec<(u64, Bytes)>, HubError> {
        let mut state = self.hub.state.lock();
        Ok(state.entries_after(&self.feed_id, *cursor, Instant::now()))
    }

    async fn wait_after(
        &mut self,
        cursor: &u64,
        timeout: Duration,
    ) -> Result<Vec<(u64, Bytes)>, HubError> {
        let waiter = self.waiter.clone();
        let notified = waiter.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let ready = self.read_after(cursor).await?;
        if !ready.is_empty() {
            return Ok(ready);
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        self.read_after(cursor).await
    }

    async fn client_state(&mut self) -> Result<ClientState, HubError> {
        self.hub.client_state(&self.feed_id).await
    }
}
