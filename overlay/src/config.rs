use enr::NodeId;
use std::time::Duration;

/// Immutable node identity and tuning knobs, threaded explicitly through
/// every component. There is no mutable global state in this crate; anything
/// that needs the local identity or a constant takes a `&OverlayConfig`.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub local_id: NodeId,
    /// Protocol versions this node supports, highest first is not required;
    /// `[0, 1]` means both v0 and v1 are understood.
    pub local_versions: Vec<u8>,

    /// Bucket capacity (K).
    pub k: usize,
    /// Replacement list capacity (R).
    pub replacement_capacity: usize,
    /// Lookup parallelism (α).
    pub alpha: usize,
    /// Peers OFFERed to on a successful local insert (N).
    pub gossip_fanout: usize,
    /// Consecutive PING failures before eviction.
    pub eviction_threshold: u32,

    /// Revalidation loop period, T_reval.
    pub revalidation_interval: Duration,
    /// Bucket-refresh loop period: how often a random target is looked up
    /// in each occupied bucket's distance range to keep it populated.
    pub bucket_refresh_interval: Duration,
    /// Default per-call timeout, T_call, for PING/FINDNODES/FINDCONTENT/OFFER.
    pub call_timeout: Duration,
    /// Timeout for FINDCONTENT calls that open a stream.
    pub stream_call_timeout: Duration,
    /// Overall deadline for one lookup.
    pub lookup_timeout: Duration,

    /// Inbound OFFER token-bucket capacity per peer.
    pub offer_rate_limit_capacity: u32,
    /// Token bucket refill rate, tokens/second.
    pub offer_rate_limit_refill_per_sec: u32,
    /// Advisory bound on the transferring-keys cache, not enforced by
    /// [`crate::offer::TransferringKeys`] itself (that cache evicts by TTL
    /// only — see DESIGN.md's "Open Question decisions" for why). A
    /// content-type layer that wants a hard cap checks this value against
    /// the arbiter's own bookkeeping before calling `arbitrate`.
    pub max_transferring_keys: usize,
    /// Bound on the local content-offer queue the arbiter checks first.
    pub content_queue_capacity: usize,
}

impl OverlayConfig {
    pub fn new(local_id: NodeId, local_versions: Vec<u8>) -> Self {
        Self {
            local_id,
            local_versions,
            k: 16,
            replacement_capacity: 10,
            alpha: 3,
            gossip_fanout: 4,
            eviction_threshold: 4,
            revalidation_interval: Duration::from_secs(5),
            bucket_refresh_interval: Duration::from_secs(3600),
            call_timeout: Duration::from_millis(500),
            stream_call_timeout: Duration::from_secs(4),
            lookup_timeout: Duration::from_secs(10),
            offer_rate_limit_capacity: 50,
            offer_rate_limit_refill_per_sec: 10,
            max_transferring_keys: 1024,
            content_queue_capacity: 1024,
        }
    }
}
