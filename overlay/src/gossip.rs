//! Proactive OFFER to the K closest known peers within radius upon a local
//! content insertion (§4.I) — the incentive/replication mechanism that
//! complements the lookup engine's re-advertise-to-closest.

use crate::config::OverlayConfig;
use crate::dispatcher::Dispatcher;
use crate::radius_cache::RadiusCache;
use crate::routing_table::RoutingTable;
use crate::storage::ContentId;
use crate::transport::Transport;
use crate::wire::{Message, OfferMessage};
use enr::within_radius;
use std::sync::Arc;
use tracing::debug;

pub struct GossipEngine<T: Transport> {
    dispatcher: Arc<Dispatcher<T>>,
    table: Arc<RoutingTable>,
    radius_cache: Arc<RadiusCache>,
    config: Arc<OverlayConfig>,
}

impl<T: Transport + 'static> GossipEngine<T> {
    pub fn new(
        dispatcher: Arc<Dispatcher<T>>,
        table: Arc<RoutingTable>,
        radius_cache: Arc<RadiusCache>,
        config: Arc<OverlayConfig>,
    ) -> Self {
        Self { dispatcher, table, radius_cache, config }
    }

    /// Called after a successful local `put(key, value)`. OFFERs to up to
    /// `gossip_fanout` of the `k` closest known peers whose advertised
    /// radius (learned from PING/PONG custom payloads) covers `content_id`.
    /// Fire-and-forget: gossip never blocks the caller on a peer's reply.
    pub async fn advertise(&self, content_key: Vec<u8>, content_id: ContentId) {
        let closest = self.table.closest(&content_id, self.config.k);
        let mut offered = 0usize;

        for entry in closest {
            if offered >= self.config.gossip_fanout {
                break;
            }
            let Some(radius) = self.radius_cache.get(&entry.node_id) else {
                continue;
            };
            if !within_radius(&entry.node_id, radius, &content_id) {
                continue;
            }

            let dispatcher = self.dispatcher.clone();
            let enr = entry.enr.clone();
            let key = content_key.clone();
            let timeout = self.config.call_timeout;
            let peer = entry.node_id;
            tokio::spawn(async move {
                let req = Message::Offer(OfferMessage { content_keys: vec![key] });
                if let Err(e) = dispatcher.call(&enr, req, timeout).await {
                    debug!(peer = %peer, error = %e, "gossip OFFER failed");
                }
            });
            offered += 1;
        }
    }
}
