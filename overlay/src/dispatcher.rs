//! Correlates outgoing calls with inbound replies, demultiplexes inbound
//! requests to the right handler, and folds timeouts/transport failures
//! back into the routing table as peer failures (§4.E).

use crate::config::OverlayConfig;
use crate::error::{OverlayError, Result};
use crate::offer::OfferArbiter;
use crate::radius_cache::{decode_radius_payload, encode_radius_payload, RadiusCache};
use crate::routing_table::RoutingTable;
use crate::storage::{ContentKeyValidator, ContentStore};
use crate::transport::{InboundFrame, Transport};
use crate::versions::VersionsCache;
use crate::wire::{self, Content, FindContentMessage, FindNodesMessage, Message, NodesMessage, OfferMessage};
use bytes::Bytes;
use enr::{Enr, NodeId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

struct PendingCall {
    reply: oneshot::Sender<Message>,
}

/// Removes a pending-call entry on drop, whichever way the call ends —
/// normal completion, timeout, or the owning task being aborted outright
/// (e.g. a cancelled lookup). Without this, a call whose future is dropped
/// mid-flight (never reaching the `remove` in [`Dispatcher::call`]) would
/// leave a zombie entry in the table forever, violating §3's "an entry
/// exists only while the call is in flight".
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<(NodeId, u64), PendingCall>>,
    key: (NodeId, u64),
    disarmed: bool,
}

impl<'a> PendingGuard<'a> {
    fn disarm(mut self) {
        self.disarmed = true;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.disarmed {
            self.pending.lock().remove(&self.key);
        }
    }
}

/// Single-writer/many-reader local ENR: mutated only by ENR sequence bumps
/// elsewhere in the node, read on every PONG.
pub struct Dispatcher<T: Transport> {
    config: Arc<OverlayConfig>,
    local_enr: RwLock<Enr>,
    transport: Arc<T>,
    table: Arc<RoutingTable>,
    versions: Arc<VersionsCache>,
    store: Arc<dyn ContentStore>,
    key_validator: Arc<dyn ContentKeyValidator>,
    arbiter: Arc<OfferArbiter>,
    radius_cache: Arc<RadiusCache>,
    pending: Mutex<HashMap<(NodeId, u64), PendingCall>>,
    next_request_id: AtomicU64,
}

impl<T: Transport + 'static> Dispatcher<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<OverlayConfig>,
        local_enr: Enr,
        transport: Arc<T>,
        table: Arc<RoutingTable>,
        versions: Arc<VersionsCache>,
        store: Arc<dyn ContentStore>,
        key_validator: Arc<dyn ContentKeyValidator>,
        arbiter: Arc<OfferArbiter>,
        radius_cache: Arc<RadiusCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            local_enr: RwLock::new(local_enr),
            transport,
            table,
            versions,
            store,
            key_validator,
            arbiter,
            radius_cache,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        })
    }

    pub fn set_local_enr(&self, enr: Enr) {
        *self.local_enr.write() = enr;
    }

    /// Allocates a request id, records a pending entry, transmits via the
    /// transport, and awaits a matching inbound reply or timer expiry.
    /// Timeouts and transport failures both report a peer failure to the
    /// routing table.
    pub async fn call(&self, peer: &Enr, req: Message, timeout: Duration) -> Result<Message> {
        let peer_id = peer
            .node_id()
            .map_err(|e| OverlayError::Malformed { peer: NodeId::new([0u8; 32]), reason: e.to_string() })?;
        let version = self.versions.negotiate(&self.config.local_versions, peer)?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        let key = (peer_id, request_id);
        self.pending.lock().insert(key, PendingCall { reply: tx });
        let guard = PendingGuard { pending: &self.pending, key, disarmed: false };

        let bytes = wire::encode_message(&req, version);

        if let Err(e) = self.transport.send_request(peer, request_id, Bytes::from(bytes)).await {
            drop(guard);
            self.table.on_ping_failure(&peer_id);
            return Err(OverlayError::Transport { peer: peer_id, reason: e.to_string() });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => {
                // `complete_pending` already removed the entry to hand us the
                // reply sender; nothing left for the guard to clean up.
                guard.disarm();
                Ok(resp)
            }
            Ok(Err(_)) => {
                guard.disarm();
                self.table.on_ping_failure(&peer_id);
                Err(OverlayError::Transport { peer: peer_id, reason: "reply channel dropped".into() })
            }
            Err(_) => {
                drop(guard);
                self.table.on_ping_failure(&peer_id);
                Err(OverlayError::Timeout { peer: peer_id })
            }
        }
    }

    /// Drains the transport's inbound frame sequence until the channel
    /// closes. Each frame is handled on its own task so a slow OFFER
    /// arbitration never blocks a concurrent PING reply.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundFrame>) {
        while let Some(frame) = inbound.recv().await {
            let dispatcher = self.clone();
            tokio::spawn(async move { dispatcher.handle_inbound(frame).await });
        }
    }

    async fn handle_inbound(&self, frame: InboundFrame) {
        let peer_id = match frame.peer.node_id() {
            Ok(id) => id,
            Err(e) => {
                debug!(error = %e, "dropping inbound frame from an ENR with no valid node id");
                return;
            }
        };

        if frame.is_response {
            self.complete_pending(peer_id, frame.request_id, &frame.bytes, &frame.peer).await;
            return;
        }

        let version = match self.versions.negotiate(&self.config.local_versions, &frame.peer) {
            Ok(v) => v,
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "dropping inbound request: no common protocol version");
                return;
            }
        };

        let message = match wire::decode_message(&frame.bytes, version) {
            Ok(m) => m,
            Err(e) => {
                debug!(peer = %peer_id, error = %e, "dropping malformed inbound frame");
                return;
            }
        };

        if let Err(e) = self.handle_request(peer_id, &frame.peer, frame.request_id, message, version).await {
            warn!(peer = %peer_id, error = %e, "failed to answer inbound request");
        }
    }

    async fn complete_pending(&self, peer_id: NodeId, request_id: u64, bytes: &Bytes, peer_enr: &Enr) {
        let pending = self.pending.lock().remove(&(peer_id, request_id));
        let Some(pending) = pending else {
            debug!(peer = %peer_id, request_id, "reply for an unknown or already-completed call");
            return;
        };
        let version = self.versions.negotiate(&self.config.local_versions, peer_enr).unwrap_or(0);
        match wire::decode_message(bytes, version) {
            Ok(message) => {
                let _ = pending.reply.send(message);
            }
            Err(e) => debug!(peer = %peer_id, error = %e, "malformed reply dropped"),
        }
    }

    /// Inbound demux: PING -> PONG + `seen`, FINDNODES -> NODES,
    /// FINDCONTENT -> local content or closest ENRs, OFFER -> arbiter -> ACCEPT.
    async fn handle_request(
        &self,
        peer_id: NodeId,
        peer_enr: &Enr,
        request_id: u64,
        message: Message,
        version: u8,
    ) -> Result<()> {
        self.table.seen(peer_enr);

        let response = match message {
            Message::Ping(ping) => {
                if let Some(radius) = decode_radius_payload(&ping.custom_payload) {
                    self.radius_cache.record(peer_id, radius);
                }
                Message::Pong(wire::PongMessage {
                    enr_seq: self.local_enr.read().seq(),
                    custom_payload: encode_radius_payload(self.store.radius()),
                })
            }
            Message::FindNodes(FindNodesMessage { distances }) => {
                let limit = self.config.k * distances.len().max(1);
                let entries = self.table.neighbors_at_distances(&distances, limit);
                let enrs = entries.iter().map(|e| e.enr.encode()).collect::<Vec<_>>();
                Message::Nodes(NodesMessage { total: 1, enrs })
            }
            Message::FindContent(FindContentMessage { content_key }) => {
                let content_id = self.key_validator.content_id(&content_key).ok_or(OverlayError::NilContentKey)?;
                match self.store.get(&content_key, &content_id).await {
                    Ok(Some(value)) => Message::Content(Content::Raw(value.to_vec())),
                    Ok(None) => self.closest_enrs_content(&content_id),
                    Err(e) => {
                        debug!(peer = %peer_id, error = %e, "storage lookup failed, falling back to closest ENRs");
                        self.closest_enrs_content(&content_id)
                    }
                }
            }
            Message::Offer(OfferMessage { content_keys }) => {
                let decision = self.arbiter.arbitrate(&peer_id, &content_keys).await?;
                Message::Accept(wire::Accept { connection_id: decision.connection_id, codes: decision.codes })
            }
            other => {
                return Err(OverlayError::Malformed {
                    peer: peer_id,
                    reason: format!("{other:?} is not a valid inbound request"),
                })
            }
        };

        let bytes = wire::encode_message(&response, version);
        self.transport
            .send_response(peer_enr, request_id, Bytes::from(bytes))
            .await
            .map_err(|e| OverlayError::Transport { peer: peer_id, reason: e.to_string() })
    }

    /// PINGs `peer`, advertising the local radius in the custom payload and
    /// recording the peer's own advertised radius from the PONG reply (§6:
    /// radius advertisement rides the PING/PONG custom payload both ways).
    /// Used by the revalidation loop; returns `true` on a well-formed PONG.
    pub async fn ping(&self, peer: &Enr) -> bool {
        let peer_id = match peer.node_id() {
            Ok(id) => id,
            Err(_) => return false,
        };
        let req = Message::Ping(wire::PingMessage {
            enr_seq: self.local_enr.read().seq(),
            custom_payload: encode_radius_payload(self.store.radius()),
        });
        match self.call(peer, req, self.config.call_timeout).await {
            Ok(Message::Pong(pong)) => {
                if let Some(radius) = decode_radius_payload(&pong.custom_payload) {
                    self.radius_cache.record(peer_id, radius);
                }
                true
            }
            Ok(_) | Err(_) => false,
        }
    }

    /// The highest protocol version in common with `peer`, per the cached
    /// negotiation in [`VersionsCache`]. Callers outside the dispatcher (the
    /// lookup engine's stream fetch) use this to pick the matching wire/
    /// stream framing instead of assuming the latest version.
    pub fn negotiated_version(&self, peer: &Enr) -> Result<u8> {
        self.versions.negotiate(&self.config.local_versions, peer)
    }

    fn closest_enrs_content(&self, content_id: &NodeId) -> Message {
        let closest = self.table.closest(content_id, self.config.k);
        Message::Content(Content::Enrs(closest.iter().map(|e| e.enr.encode()).collect()))
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn arbiter(&self) -> &Arc<OfferArbiter> {
        &self.arbiter
    }

    pub fn config(&self) -> &Arc<OverlayConfig> {
        &self.config
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offer::{ContentQueue, OfferArbiter, RateLimiter, TransferringKeys};
    use crate::storage::{ContentKeyValidator, ContentStore, StoreError};
    use async_trait::async_trait;
    use enr::EnrBuilder;
    use ethereum_types::U256;
    use secp256k1::SecretKey;
    use std::net::{IpAddr, Ipv4Addr};

    struct NullStore;
    #[async_trait]
    impl ContentStore for NullStore {
        async fn get(&self, _key: &[u8], _id: &NodeId) -> std::result::Result<Option<Bytes>, StoreError> {
            Ok(None)
        }
        async fn put(&self, _key: &[u8], _id: NodeId, _value: Bytes) -> std::result::Result<(), StoreError> {
            Ok(())
        }
        fn radius(&self) -> U256 {
            U256::from(42u64)
        }
    }

    struct IdentityKeyValidator;
    impl ContentKeyValidator for IdentityKeyValidator {
        fn content_id(&self, key: &[u8]) -> Option<NodeId> {
            let mut bytes = [0u8; 32];
            let n = key.len().min(32);
            bytes[..n].copy_from_slice(&key[..n]);
            Some(NodeId::new(bytes))
        }
    }

    /// Never answers — every call it carries times out.
    struct SilentTransport;
    #[async_trait]
    impl Transport for SilentTransport {
        async fn send_request(&self, _peer: &Enr, _request_id: u64, _bytes: Bytes) -> std::result::Result<(), crate::transport::TransportError> {
            Ok(())
        }
        async fn send_response(&self, _peer: &Enr, _request_id: u64, _bytes: Bytes) -> std::result::Result<(), crate::transport::TransportError> {
            Ok(())
        }
        async fn open_stream(&self, _peer: &Enr, _connection_id: u16) -> std::result::Result<crate::transport::BoxedStream, crate::transport::TransportError> {
            Err(crate::transport::TransportError::Stream("unused".into()))
        }
        async fn accept_stream(&self, _connection_id: u16) -> std::result::Result<crate::transport::BoxedStream, crate::transport::TransportError> {
            Err(crate::transport::TransportError::Stream("unused".into()))
        }
    }

    fn peer_enr(seed: u8) -> Enr {
        let key = SecretKey::from_slice(&[seed; 32]).unwrap();
        EnrBuilder::new()
            .ip(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))
            .udp_port(9000 + seed as u16)
            .protocol_versions(&[1])
            .unwrap()
            .build(&key)
            .unwrap()
    }

    async fn test_dispatcher<TT: Transport + 'static>(transport: Arc<TT>) -> Arc<Dispatcher<TT>> {
        let local_id = NodeId::new([0u8; 32]);
        let config = Arc::new(OverlayConfig::new(local_id, vec![1]));
        let table = Arc::new(RoutingTable::new(local_id, config.k, config.replacement_capacity, config.eviction_threshold));
        let versions = Arc::new(VersionsCache::new());
        let radius_cache = Arc::new(RadiusCache::new());
        let arbiter = Arc::new(OfferArbiter::new(
            local_id,
            Arc::new(NullStore),
            Arc::new(IdentityKeyValidator),
            Arc::new(TransferringKeys::new(Duration::from_secs(30))),
            RateLimiter::new(50, 10),
            ContentQueue::new(1024),
        ));
        Dispatcher::new(
            config,
            peer_enr(0),
            transport,
            table,
            versions,
            Arc::new(NullStore),
            Arc::new(IdentityKeyValidator),
            arbiter,
            radius_cache,
        )
    }

    #[tokio::test]
    async fn timed_out_call_removes_its_pending_entry() {
        let dispatcher = test_dispatcher(Arc::new(SilentTransport)).await;
        let peer = peer_enr(1);
        let err = dispatcher
            .call(&peer, Message::Ping(wire::PingMessage { enr_seq: 1, custom_payload: vec![] }), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::Timeout { .. }));
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn transport_send_failure_removes_its_pending_entry() {
        struct FailingTransport;
        #[async_trait]
        impl Transport for FailingTransport {
            async fn send_request(&self, _peer: &Enr, _request_id: u64, _bytes: Bytes) -> std::result::Result<(), crate::transport::TransportError> {
                Err(crate::transport::TransportError::Send("no route".into()))
            }
            async fn send_response(&self, _peer: &Enr, _request_id: u64, _bytes: Bytes) -> std::result::Result<(), crate::transport::TransportError> {
                Ok(())
            }
            async fn open_stream(&self, _peer: &Enr, _connection_id: u16) -> std::result::Result<crate::transport::BoxedStream, crate::transport::TransportError> {
                Err(crate::transport::TransportError::Stream("unused".into()))
            }
            async fn accept_stream(&self, _connection_id: u16) -> std::result::Result<crate::transport::BoxedStream, crate::transport::TransportError> {
                Err(crate::transport::TransportError::Stream("unused".into()))
            }
        }

        let dispatcher = test_dispatcher(Arc::new(FailingTransport)).await;

        let peer = peer_enr(1);
        let err = dispatcher
            .call(&peer, Message::Ping(wire::PingMessage { enr_seq: 1, custom_payload: vec![] }), Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::Transport { .. }));
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn ping_advertises_local_radius_and_records_peer_radius_from_pong() {
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundFrame>(4);

        struct EchoingRadiusTransport {
            inbound_tx: mpsc::Sender<InboundFrame>,
            peer_radius: U256,
        }
        #[async_trait]
        impl Transport for EchoingRadiusTransport {
            async fn send_request(&self, peer: &Enr, request_id: u64, bytes: Bytes) -> std::result::Result<(), crate::transport::TransportError> {
                let Message::Ping(ping) = wire::decode_message(&bytes, 1).unwrap() else {
                    panic!("expected a PING");
                };
                assert_eq!(decode_radius_payload(&ping.custom_payload), Some(U256::from(42u64)));
                let pong = Message::Pong(wire::PongMessage { enr_seq: 1, custom_payload: encode_radius_payload(self.peer_radius) });
                let encoded = wire::encode_message(&pong, 1);
                let tx = self.inbound_tx.clone();
                let peer = peer.clone();
                tokio::spawn(async move {
                    let _ = tx.send(InboundFrame { peer, request_id, is_response: true, bytes: Bytes::from(encoded) }).await;
                });
                Ok(())
            }
            async fn send_response(&self, _peer: &Enr, _request_id: u64, _bytes: Bytes) -> std::result::Result<(), crate::transport::TransportError> {
                Ok(())
            }
            async fn open_stream(&self, _peer: &Enr, _connection_id: u16) -> std::result::Result<crate::transport::BoxedStream, crate::transport::TransportError> {
                Err(crate::transport::TransportError::Stream("unused".into()))
            }
            async fn accept_stream(&self, _connection_id: u16) -> std::result::Result<crate::transport::BoxedStream, crate::transport::TransportError> {
                Err(crate::transport::TransportError::Stream("unused".into()))
            }
        }

        let transport = Arc::new(EchoingRadiusTransport { inbound_tx, peer_radius: U256::from(777u64) });
        let dispatcher = test_dispatcher(transport).await;
        let _drain = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                while let Some(frame) = inbound_rx.recv().await {
                    dispatcher.handle_inbound(frame).await;
                }
            }
        });

        let peer = peer_enr(1);
        let peer_id = peer.node_id().unwrap();
        let ok = dispatcher.ping(&peer).await;
        assert!(ok);
        assert_eq!(dispatcher.radius_cache.get(&peer_id), Some(U256::from(777u64)));
    }

}
