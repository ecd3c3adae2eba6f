//! Tracks each peer's most recently advertised radius, observed from the
//! custom payload of PING/PONG exchanges (§6: "radius advertisement is
//! carried in the PING/PONG custom payload per the wire spec"). The gossip
//! engine reads this to decide which of the K closest peers actually cover
//! a content id before OFFERing to them.

use enr::NodeId;
use ethereum_types::U256;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
pub struct RadiusCache {
    radii: RwLock<HashMap<NodeId, U256>>,
}

impl RadiusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, peer: NodeId, radius: U256) {
        self.radii.write().insert(peer, radius);
    }

    pub fn get(&self, peer: &NodeId) -> Option<U256> {
        self.radii.read().get(peer).copied()
    }
}

/// Fixed 32-byte big-endian encoding of a radius, carried as the PING/PONG
/// custom payload.
pub fn encode_radius_payload(radius: U256) -> Vec<u8> {
    let mut buf = [0u8; 32];
    radius.to_big_endian(&mut buf);
    buf.to_vec()
}

pub fn decode_radius_payload(bytes: &[u8]) -> Option<U256> {
    if bytes.len() != 32 {
        return None;
    }
    Some(U256::from_big_endian(bytes))
}
