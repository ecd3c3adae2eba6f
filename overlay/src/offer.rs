//! Produces an ACCEPT for an incoming OFFER: per-key first-match decisions
//! (§4.F), rate limiting, the transferring-keys cache, and the bounded
//! local content queue the "already busy" check probes non-blockingly.

use crate::error::{OverlayError, Result};
use crate::storage::{ContentKeyValidator, ContentStore};
use crate::wire::AcceptCode;
use enr::NodeId;
use ethereum_types::U256;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bounded set of content keys currently inbound on a stream (§3). Entries
/// expire on stream completion ([`OfferArbiter::release`]) or `ttl`,
/// whichever comes first — a stream that never closes cleanly (peer
/// vanished mid-transfer) must not pin a key forever.
pub struct TransferringKeys {
    inner: Mutex<HashMap<Vec<u8>, Instant>>,
    ttl: Duration,
}

impl TransferringKeys {
    pub fn new(ttl: Duration) -> Self {
        Self { inner: Mutex::new(HashMap::new()), ttl }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.prune();
        self.inner.lock().contains_key(key)
    }

    pub fn insert(&self, key: Vec<u8>) {
        self.inner.lock().insert(key, Instant::now());
    }

    pub fn release(&self, key: &[u8]) {
        self.inner.lock().remove(key);
    }

    fn prune(&self) {
        let ttl = self.ttl;
        self.inner.lock().retain(|_, inserted_at| inserted_at.elapsed() < ttl);
    }
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-peer token bucket gating inbound OFFER acceptance (§5).
pub struct RateLimiter {
    buckets: Mutex<HashMap<NodeId, TokenBucket>>,
    capacity: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self { buckets: Mutex::new(HashMap::new()), capacity: capacity as f64, refill_per_sec: refill_per_sec as f64 }
    }

    pub fn try_acquire(&self, peer: &NodeId) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(*peer)
            .or_insert_with(|| TokenBucket { tokens: self.capacity, last_refill: Instant::now() });
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = Instant::now();
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Bound on the local content-offer queue; `has_room`/`try_reserve` is the
/// "non-blocking probe" §5 calls for — the arbiter never suspends on it.
pub struct ContentQueue {
    capacity: usize,
    len: AtomicUsize,
}

impl ContentQueue {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, len: AtomicUsize::new(0) }
    }

    pub fn has_room(&self) -> bool {
        self.len.load(Ordering::Acquire) < self.capacity
    }

    pub fn try_reserve(&self) -> bool {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.capacity).then_some(n + 1))
            .is_ok()
    }

    pub fn release(&self) {
        self.len.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)).ok();
    }
}

/// Version-agnostic decision produced for one OFFER: a reserved stream id
/// and a code per input key, in input order.
pub struct OfferDecision {
    pub connection_id: u16,
    pub codes: Vec<AcceptCode>,
}

pub struct OfferArbiter {
    local_id: NodeId,
    store: Arc<dyn ContentStore>,
    key_validator: Arc<dyn ContentKeyValidator>,
    transferring: Arc<TransferringKeys>,
    rate_limiter: RateLimiter,
    content_queue: ContentQueue,
}

impl OfferArbiter {
    pub fn new(
        local_id: NodeId,
        store: Arc<dyn ContentStore>,
        key_validator: Arc<dyn ContentKeyValidator>,
        transferring: Arc<TransferringKeys>,
        rate_limiter: RateLimiter,
        content_queue: ContentQueue,
    ) -> Self {
        Self { local_id, store, key_validator, transferring, rate_limiter, content_queue }
    }

    pub fn transferring_keys(&self) -> &Arc<TransferringKeys> {
        &self.transferring
    }

    /// Evaluates the OFFER's keys against the first-match table in §4.F.
    /// On success, every `Accepted` key has already been inserted into the
    /// transferring-keys cache and counted against the content queue before
    /// this returns (invariant 5 in §8).
    pub async fn arbitrate(&self, peer: &NodeId, content_keys: &[Vec<u8>]) -> Result<OfferDecision> {
        let connection_id = reserve_connection_id();

        if !self.rate_limiter.try_acquire(peer) {
            return Ok(OfferDecision { connection_id, codes: vec![AcceptCode::RateLimited; content_keys.len()] });
        }
        if !self.content_queue.has_room() {
            return Ok(OfferDecision { connection_id, codes: vec![AcceptCode::RateLimited; content_keys.len()] });
        }

        let radius = self.store.radius();
        let mut accepted_keys: Vec<Vec<u8>> = Vec::new();
        let mut codes = Vec::with_capacity(content_keys.len());

        for key in content_keys {
            let content_id = match self.key_validator.content_id(key) {
                Some(id) => id,
                None => {
                    for accepted in &accepted_keys {
                        self.release(accepted);
                    }
                    return Err(OverlayError::NilContentKey);
                }
            };

            let code = self.decide(peer, key, &content_id, radius).await?;
            if code == AcceptCode::Accepted {
                accepted_keys.push(key.clone());
            }
            codes.push(code);
        }

        Ok(OfferDecision { connection_id, codes })
    }

    async fn decide(&self, peer: &NodeId, key: &[u8], content_id: &enr::NodeId, radius: U256) -> Result<AcceptCode> {
        if !enr::within_radius(&self.local_id, radius, content_id) {
            return Ok(AcceptCode::NotWithinRadius);
        }
        let stored = self
            .store
            .get(key, content_id)
            .await
            .map_err(|e| OverlayError::Transport { peer: *peer, reason: e.to_string() })?;
        if stored.is_some() {
            return Ok(AcceptCode::AlreadyStored);
        }
        if self.transferring.contains(key) {
            return Ok(AcceptCode::InboundTransferInProgress);
        }
        if !self.content_queue.try_reserve() {
            return Ok(AcceptCode::RateLimited);
        }
        self.transferring.insert(key.to_vec());
        Ok(AcceptCode::Accepted)
    }

    /// Released when a stream completes (or its short timeout expires),
    /// freeing both the transferring-keys slot and the content queue slot
    /// reserved in [`Self::arbitrate`].
    pub fn release(&self, key: &[u8]) {
        self.transferring.release(key);
        self.content_queue.release();
    }
}

fn reserve_connection_id() -> u16 {
    rand::random()
}
