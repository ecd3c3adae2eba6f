//! The overlay protocol engine core: a Kademlia-like routing table paired
//! with an OFFER/ACCEPT content-distribution protocol over a
//! caller-supplied reliable-datagram transport.
//!
//! This crate is the engine, not a node binary — it has no JSON-RPC
//! surface, no metrics, no CLI, and no concrete content-type handlers
//! (history/state/beacon). Those are built on top of [`OverlayNode`] by a
//! collaborator that supplies a [`Transport`], a [`ContentStore`], and a
//! [`ContentKeyValidator`].

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gossip;
pub mod lookup;
pub mod offer;
pub mod radius_cache;
pub mod routing_table;
pub mod storage;
pub mod stream;
pub mod transport;
pub mod versions;
pub mod wire;

pub use config::OverlayConfig;
pub use dispatcher::Dispatcher;
pub use error::{OverlayError, Result};
pub use gossip::GossipEngine;
pub use lookup::{ContentLookupResult, LookupCancellation, LookupEngine};
pub use offer::{ContentQueue, OfferArbiter, RateLimiter, TransferringKeys};
pub use radius_cache::RadiusCache;
pub use routing_table::RoutingTable;
pub use storage::{ContentId, ContentKeyValidator, ContentStore, StoreError};
pub use transport::{BoxedStream, InboundFrame, ReliableStream, Transport, TransportError};
pub use versions::VersionsCache;
pub use wire::{AcceptCode, Message};

use enr::Enr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Wires the routing table, dispatcher, lookup engine, and gossip engine
/// together behind the single immutable [`OverlayConfig`] (§9: "global
/// state... form a single immutable configuration record threaded
/// explicitly through components").
pub struct OverlayNode<T: Transport> {
    pub config: Arc<OverlayConfig>,
    pub table: Arc<RoutingTable>,
    pub versions: Arc<VersionsCache>,
    pub radius_cache: Arc<RadiusCache>,
    pub dispatcher: Arc<Dispatcher<T>>,
    pub lookup: LookupEngine<T>,
    pub gossip: GossipEngine<T>,
}

impl<T: Transport + 'static> OverlayNode<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OverlayConfig,
        local_enr: Enr,
        transport: Arc<T>,
        store: Arc<dyn ContentStore>,
        key_validator: Arc<dyn ContentKeyValidator>,
    ) -> Self {
        let config = Arc::new(config);
        let table = Arc::new(RoutingTable::new(
            config.local_id,
            config.k,
            config.replacement_capacity,
            config.eviction_threshold,
        ));
        let versions = Arc::new(VersionsCache::new());
        let radius_cache = Arc::new(RadiusCache::new());
        let transferring = Arc::new(TransferringKeys::new(config.call_timeout * 4));
        let arbiter = Arc::new(OfferArbiter::new(
            config.local_id,
            store.clone(),
            key_validator.clone(),
            transferring,
            RateLimiter::new(config.offer_rate_limit_capacity, config.offer_rate_limit_refill_per_sec),
            ContentQueue::new(config.content_queue_capacity),
        ));

        let dispatcher = Dispatcher::new(
            config.clone(),
            local_enr,
            transport.clone(),
            table.clone(),
            versions.clone(),
            store,
            key_validator,
            arbiter,
            radius_cache.clone(),
        );

        let lookup = LookupEngine::new(dispatcher.clone(), transport, config.local_id);
        let gossip = GossipEngine::new(dispatcher.clone(), table.clone(), radius_cache.clone(), config.clone());

        Self { config, table, versions, radius_cache, dispatcher, lookup, gossip }
    }

    /// Performs the self-lookup bootstrap sweep (§4.B): `seen()`s every seed
    /// ENR, then runs a node lookup for the local `NodeId` to pull in their
    /// neighbors.
    pub async fn bootstrap(&self, seeds: &[Enr]) {
        for seed in seeds {
            self.table.seen(seed);
        }
        info!(seeds = seeds.len(), "bootstrapping routing table via self-lookup");
        let _ = self
            .lookup
            .find_node(&self.table, self.config.local_id, LookupCancellation::new())
            .await;
    }

    /// Spawns the inbound-frame drain loop and the background revalidation
    /// and bucket-refresh loops. All run until the returned handles are
    /// aborted or the `inbound` channel closes.
    pub fn spawn_background_tasks(self: &Arc<Self>, inbound: mpsc::Receiver<InboundFrame>) -> BackgroundTasks {
        let dispatcher = self.dispatcher.clone();
        let inbound_task = tokio::spawn(async move { dispatcher.run(inbound).await });

        let table = self.table.clone();
        let dispatcher = self.dispatcher.clone();
        let interval = self.config.revalidation_interval;
        let revalidation_task = tokio::spawn(async move {
            let table_for_loop = table.clone();
            routing_table::run_revalidation_loop(table, interval, move |node_id| {
                let dispatcher = dispatcher.clone();
                let table = table_for_loop.clone();
                async move {
                    let Some(entry) = table.closest(&node_id, 1).into_iter().find(|e| e.node_id == node_id) else {
                        return false;
                    };
                    let ok = dispatcher.ping(&entry.enr).await;
                    if !ok {
                        debug!(peer = %node_id, "revalidation ping failed");
                    }
                    ok
                }
            })
            .await;
        });

        let table = self.table.clone();
        let lookup = self.lookup.clone();
        let interval = self.config.bucket_refresh_interval;
        let refresh_task = tokio::spawn(async move {
            let table_for_loop = table.clone();
            routing_table::run_refresh_loop(table, interval, move |target| {
                let lookup = lookup.clone();
                let table = table_for_loop.clone();
                async move {
                    let _ = lookup.find_node(&table, target, LookupCancellation::new()).await;
                }
            })
            .await;
        });

        BackgroundTasks { inbound_task, revalidation_task, refresh_task }
    }
}

/// Join handles for the three background loops an [`OverlayNode`] spawns.
pub struct BackgroundTasks {
    pub inbound_task: tokio::task::JoinHandle<()>,
    pub revalidation_task: tokio::task::JoinHandle<()>,
    pub refresh_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTasks {
    pub fn abort(&self) {
        self.inbound_task.abort();
        self.revalidation_task.abort();
        self.refresh_task.abort();
    }
}
