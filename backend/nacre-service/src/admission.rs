//! In-process admission control.
//!
//! Two independent key spaces: producers keyed by network origin and peers keyed
//! by feed id. Each key owns a bounded counter created on first use. Limits are
//! local to this process; several instances behind a balancer each enforce their
//! own ceilings, so global limits have to be applied upstream.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    pub max_producers_per_origin: usize,
    pub max_peers_per_feed: usize,
    pub reclaim_period: Duration,
    /// Releases a key space must accumulate before its map is rebuilt.
    pub reclaim_high_water: u64,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            max_producers_per_origin: 5,
            max_peers_per_feed: 3,
            reclaim_period: Duration::from_secs(30),
            reclaim_high_water: 10_000,
        }
    }
}

/// Bounded counter for one key.
#[derive(Debug)]
struct SlotPool {
    in_use: usize,
    capacity: usize,
}

impl SlotPool {
    fn try_take(&mut self) -> bool {
        if self.in_use < self.capacity {
            self.in_use += 1;
            true
        } else {
            false
        }
    }

    fn give_back(&mut self) -> bool {
        match self.in_use.checked_sub(1) {
            Some(left) => {
                self.in_use = left;
                true
            }
            None => false,
        }
    }
}

/// One key space. Guarded by its own mutex so producer and peer traffic never
/// contend with each other.
#[derive(Debug)]
struct SlotTable {
    kind: &'static str,
    capacity: usize,
    pools: HashMap<String, SlotPool>,
    released_since_reclaim: u64,
}

impl SlotTable {
    fn new(kind: &'static str, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            pools: HashMap::new(),
            released_since_reclaim: 0,
        }
    }

    fn try_acquire(&mut self, key: &str) -> bool {
        let capacity = self.capacity;
        self.pools
            .entry(key.to_string())
            .or_insert_with(|| SlotPool { in_use: 0, capacity })
            .try_take()
    }

    fn release(&mut self, key: &str) -> bool {
        let Some(pool) = self.pools.get_mut(key) else {
            panic!("admission: tried to release {} {key} without acquire", self.kind);
        };
        self.released_since_reclaim += 1;
        if pool.give_back() {
            true
        } else {
            warn!(kind = self.kind, key = %key, "release with no outstanding slots");
            false
        }
    }

    /// Rebuild the map so storage left behind by churned keys is returned to
    /// the allocator. Every pool moves over as it is, idle or not.
    fn reclaim(&mut self, high_water: u64) -> Option<usize> {
        if self.released_since_reclaim < high_water {
            return None;
        }
        let mut fresh = HashMap::with_capacity(self.pools.len());
        fresh.extend(self.pools.drain());
        self.pools = fresh;
        self.released_since_reclaim = 0;
        Some(self.pools.len())
    }
}

/// Gatekeeper consulted by the TCP server before allocating a feed and by the
/// peer bridge before subscribing.
pub struct AdmissionController {
    producers: Arc<Mutex<SlotTable>>,
    peers: Arc<Mutex<SlotTable>>,
    shutdown: CancellationToken,
    reclaimer: Mutex<Option<JoinHandle<()>>>,
}

impl AdmissionController {
    /// Build the controller and start its reclamation task on the current runtime.
    pub fn new(settings: AdmissionSettings) -> Self {
        let producers = Arc::new(Mutex::new(SlotTable::new(
            "producer",
            settings.max_producers_per_origin,
        )));
        let peers = Arc::new(Mutex::new(SlotTable::new("peer", settings.max_peers_per_feed)));
        let shutdown = CancellationToken::new();

        let reclaimer = tokio::spawn(reclaim_loop(
            vec![producers.clone(), peers.clone()],
            settings.reclaim_period,
            settings.reclaim_high_water,
            shutdown.clone(),
        ));

        Self {
            producers,
            peers,
            shutdown,
            reclaimer: Mutex::new(Some(reclaimer)),
        }
    }

    pub fn try_acquire_producer(&self, origin: &str) -> bool {
        self.producers.lock().try_acquire(origin)
    }

    /// Panics if `origin` never acquired a producer slot.
    pub fn release_producer(&self, origin: &str) -> bool {
        self.release(&self.producers, origin)
    }

    pub fn try_acquire_peer(&self, feed_id: &str) -> bool {
        self.peers.lock().try_acquire(feed_id)
    }

    /// Panics if `feed_id` never acquired a peer slot.
    pub fn release_peer(&self, feed_id: &str) -> bool {
        self.release(&self.peers, feed_id)
    }

    fn release(&self, table: &Mutex<SlotTable>, key: &str) -> bool {
        let mut table = table.lock();
        let released = table.release(key);
        // After shutdown the slot is still returned, but callers learn the
        // hand-off did not complete normally.
        released && !self.shutdown.is_cancelled()
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop the reclamation task and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.reclaimer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "admission reclaimer ended abnormally");
            }
            info!("admission controller stopped");
        }
    }
}

impl Drop for AdmissionController {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn reclaim_loop(
    tables: Vec<Arc<Mutex<SlotTable>>>,
    period: Duration,
    high_water: u64,
    shutdown: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                for table in &tables {
                    let mut table = table.lock();
                    if let Some(pools) = table.reclaim(high_water) {
                        debug!(kind = table.kind, pools, "admission map reclaimed");
                    }
                }
            }
        }
    }
}
