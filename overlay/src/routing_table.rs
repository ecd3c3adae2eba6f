//! 256-bucket Kademlia routing table keyed by log-distance from the local
//! [`NodeId`].
//!
//! Bucket shape and the live/replacement split are modeled after
//! `KademliaTable`/`Contact` in the ethrex networking stack, restructured
//! around `parking_lot::Mutex` (bounded hold times: every operation here is
//! O(K)) rather than the actor mailbox the original uses.

use enr::{log_distance, xor, Enr, NodeId};
use ethereum_types::U256;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

pub const NUM_BUCKETS: usize = 256;

/// A single known peer. Entries are values, not pointers — other components
/// (pending-call table, versions cache) reference peers by `NodeId` and
/// re-read the table rather than holding a reference into it.
#[derive(Debug, Clone)]
pub struct Entry {
    pub enr: Enr,
    pub node_id: NodeId,
    pub last_seen: Instant,
    pub added_at: Instant,
    pub failed_pings: u32,
    /// Successful revalidations minus failed pings, a minimal reward/penalize
    /// counter. Not consulted by eviction (`failed_pings` alone drives that,
    /// per spec §4.B) — this is a read-only hook a peer-selection policy
    /// above this crate can weight `closest()` candidates by.
    pub score: i32,
}

impl Entry {
    fn fresh(enr: Enr, node_id: NodeId) -> Self {
        let now = Instant::now();
        Self {
            enr,
            node_id,
            last_seen: now,
            added_at: now,
            failed_pings: 0,
            score: 0,
        }
    }

    fn reward(&mut self) {
        self.score = self.score.saturating_add(1);
    }

    fn penalize(&mut self) {
        self.score = self.score.saturating_sub(1);
    }
}

#[derive(Debug, Default)]
struct Bucket {
    /// Ordered least-recently-seen first; `seen()` pushes to the back.
    live: Vec<Entry>,
    /// Ordered most-recently-seen first; head is the promotion candidate.
    replacements: Vec<Entry>,
}

/// Outcome of a `seen()` call, useful to callers that want to log or test
/// against it without re-deriving it from table state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeenOutcome {
    InsertedLive,
    Refreshed,
    InsertedReplacement,
    RefreshedReplacement,
    RejectedOwnId,
}

pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    replacement_capacity: usize,
    eviction_threshold: u32,
    buckets: Mutex<Vec<Bucket>>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize, replacement_capacity: usize, eviction_threshold: u32) -> Self {
        let mut buckets = Vec::with_capacity(NUM_BUCKETS);
        buckets.resize_with(NUM_BUCKETS, Bucket::default);
        Self {
            local_id,
            k,
            replacement_capacity,
            eviction_threshold,
            buckets: Mutex::new(buckets),
        }
    }

    fn bucket_index(&self, node_id: &NodeId) -> Option<usize> {
        let distance = log_distance(&self.local_id, node_id);
        if distance == 256 {
            None
        } else {
            Some(distance as usize)
        }
    }

    /// Observed liveness of a peer. Inserts at the tail of the live list if
    /// the bucket has room; otherwise offers it to the replacement list
    /// (most-recently-seen at the head).
    pub fn seen(&self, enr: &Enr) -> SeenOutcome {
        let node_id = match enr.node_id() {
            Ok(id) => id,
            Err(_) => return SeenOutcome::RejectedOwnId,
        };
        let Some(idx) = self.bucket_index(&node_id) else {
            return SeenOutcome::RejectedOwnId;
        };

        let mut buckets = self.buckets.lock();
        let bucket = &mut buckets[idx];

        if let Some(pos) = bucket.live.iter().position(|e| e.node_id == node_id) {
            let mut entry = bucket.live.remove(pos);
            entry.enr = enr.clone();
            entry.last_seen = Instant::now();
            entry.failed_pings = 0;
            bucket.live.push(entry);
            return SeenOutcome::Refreshed;
        }

        if let Some(pos) = bucket.replacements.iter().position(|e| e.node_id == node_id) {
            let mut entry = bucket.replacements.remove(pos);
            entry.enr = enr.clone();
            entry.last_seen = Instant::now();
            bucket.replacements.insert(0, entry);
            return SeenOutcome::RefreshedReplacement;
        }

        let entry = Entry::fresh(enr.clone(), node_id);
        if bucket.live.len() < self.k {
            bucket.live.push(entry);
            SeenOutcome::InsertedLive
        } else {
            bucket.replacements.insert(0, entry);
            bucket.replacements.truncate(self.replacement_capacity);
            SeenOutcome::InsertedReplacement
        }
    }

    /// Increments the failure counter; evicts after `eviction_threshold`
    /// consecutive failures and promotes the head of the replacement list.
    pub fn on_ping_failure(&self, node_id: &NodeId) {
        let Some(idx) = self.bucket_index(node_id) else {
            return;
        };
        let mut buckets = self.buckets.lock();
        let bucket = &mut buckets[idx];
        let Some(pos) = bucket.live.iter().position(|e| &e.node_id == node_id) else {
            return;
        };
        bucket.live[pos].failed_pings += 1;
        bucket.live[pos].penalize();
        if bucket.live[pos].failed_pings >= self.eviction_threshold {
            bucket.live.remove(pos);
            if !bucket.replacements.is_empty() {
                let promoted = bucket.replacements.remove(0);
                bucket.live.push(promoted);
            }
        }
    }

    /// Moves a successfully-pinged entry to the tail (most-recently-seen)
    /// without altering its ENR, used by the revalidation loop.
    pub fn mark_revalidated(&self, node_id: &NodeId) {
        let Some(idx) = self.bucket_index(node_id) else {
            return;
        };
        let mut buckets = self.buckets.lock();
        let bucket = &mut buckets[idx];
        if let Some(pos) = bucket.live.iter().position(|e| &e.node_id == node_id) {
            let mut entry = bucket.live.remove(pos);
            entry.last_seen = Instant::now();
            entry.failed_pings = 0;
            entry.reward();
            bucket.live.push(entry);
        }
    }

    /// Current reward/penalize counter for a live entry, the minimal
    /// peer-scoring hook (`SPEC_FULL.md` §3) above this crate can read.
    pub fn score(&self, node_id: &NodeId) -> Option<i32> {
        let idx = self.bucket_index(node_id)?;
        self.buckets.lock()[idx].live.iter().find(|e| &e.node_id == node_id).map(|e| e.score)
    }

    /// The `k` entries with smallest XOR distance to `target`, ties broken
    /// by smaller NodeId.
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<Entry> {
        let buckets = self.buckets.lock();
        let mut all: Vec<&Entry> = buckets.iter().flat_map(|b| b.live.iter()).collect();
        all.sort_by(|a, b| {
            let da = xor(&a.node_id, target);
            let db = xor(&b.node_id, target);
            da.cmp(&db).then_with(|| a.node_id.cmp(&b.node_id))
        });
        all.into_iter().take(k).cloned().collect()
    }

    /// Entries whose log-distance to the local node lies in `distances`,
    /// capped at `limit`. Used to answer FINDNODES.
    pub fn neighbors_at_distances(&self, distances: &[u16], limit: usize) -> Vec<Entry> {
        let buckets = self.buckets.lock();
        let mut out = Vec::new();
        for &d in distances {
            if let Some(bucket) = buckets.get(d as usize) {
                out.extend(bucket.live.iter().cloned());
                if out.len() >= limit {
                    break;
                }
            }
        }
        out.truncate(limit);
        out
    }

    /// Picks a random occupied bucket and returns its least-recently-seen
    /// live entry, the revalidation loop's candidate to PING.
    pub fn pick_revalidation_candidate(&self) -> Option<NodeId> {
        let buckets = self.buckets.lock();
        let occupied: Vec<usize> = buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.live.is_empty())
            .map(|(i, _)| i)
            .collect();
        if occupied.is_empty() {
            return None;
        }
        let idx = occupied[rand::random::<usize>() % occupied.len()];
        buckets[idx].live.first().map(|e| e.node_id)
    }

    /// A random target whose log-distance from `local_id` falls in an
    /// occupied bucket's range, used for background refreshes.
    pub fn refresh_target(&self) -> Option<NodeId> {
        let buckets = self.buckets.lock();
        let occupied: Vec<usize> = buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.live.is_empty())
            .map(|(i, _)| i)
            .collect();
        if occupied.is_empty() {
            return None;
        }
        let idx = occupied[rand::random::<usize>() % occupied.len()];
        Some(self.local_id.random_at_distance(idx as u16))
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().iter().map(|b| b.live.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        let Some(idx) = self.bucket_index(node_id) else {
            return false;
        };
        self.buckets.lock()[idx]
            .live
            .iter()
            .any(|e| &e.node_id == node_id)
    }
}

/// Runs the revalidation loop until cancelled: every `interval`, pick one
/// bucket at random and PING its least-recently-validated entry. Never holds
/// the table lock across the network round-trip — the lock is acquired only
/// to pick the candidate and again to record the outcome.
pub async fn run_revalidation_loop<F, Fut>(
    table: std::sync::Arc<RoutingTable>,
    interval: Duration,
    mut ping: F,
) where
    F: FnMut(NodeId) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let Some(candidate) = table.pick_revalidation_candidate() else {
            continue;
        };
        if ping(candidate).await {
            table.mark_revalidated(&candidate);
        } else {
            table.on_ping_failure(&candidate);
        }
    }
}

/// Runs the periodic bucket-refresh loop until cancelled: every `interval`,
/// picks a random target within an occupied bucket's distance range
/// (`refresh_target`) and hands it to `find_node`, so buckets stay populated
/// even without organic lookup traffic.
pub async fn run_refresh_loop<F, Fut>(
    table: std::sync::Arc<RoutingTable>,
    interval: Duration,
    mut find_node: F,
) where
    F: FnMut(NodeId) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let Some(target) = table.refresh_target() else {
            continue;
        };
        find_node(target).await;
    }
}

pub fn radius_contains(local: &NodeId, radius: U256, id: &NodeId) -> bool {
    enr::within_radius(local, radius, id)
}
