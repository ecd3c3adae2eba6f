//! Per-peer highest-common protocol version, cached by [`NodeId`] and
//! invalidated when a higher ENR sequence is observed.

use crate::error::{OverlayError, Result};
use enr::{Enr, NodeId};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct CachedVersion {
    version: u8,
    enr_seq: u64,
}

/// `NodeId -> u8`. A version is cached only once [`negotiate`] succeeds — the
/// historic source wrote the cache entry before checking the intersection
/// result; that write-before-check is not reproduced here (see DESIGN.md).
#[derive(Default)]
pub struct VersionsCache {
    entries: Mutex<HashMap<NodeId, CachedVersion>>,
}

impl VersionsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `max(intersection(local_versions, peer's pv entry))`. A missing `pv`
    /// key is treated as "this peer only speaks the lowest version we
    /// support" rather than an error. An empty intersection, and the
    /// degenerate case of an empty `local_versions`, are both
    /// [`OverlayError::UnsupportedVersion`].
    pub fn negotiate(&self, local_versions: &[u8], peer_enr: &Enr) -> Result<u8> {
        let peer_id = peer_enr
            .node_id()
            .map_err(|e| OverlayError::Malformed { peer: NodeId::new([0u8; 32]), reason: e.to_string() })?;
        let seq = peer_enr.seq();

        if let Some(cached) = self.entries.lock().get(&peer_id).copied() {
            if cached.enr_seq >= seq {
                return Ok(cached.version);
            }
        }

        let peer_versions = peer_enr.protocol_versions();
        let version = if peer_versions.is_empty() {
            *local_versions.first().ok_or(OverlayError::UnsupportedVersion { peer: peer_id })?
        } else {
            local_versions
                .iter()
                .filter(|v| peer_versions.contains(v))
                .max()
                .copied()
                .ok_or(OverlayError::UnsupportedVersion { peer: peer_id })?
        };

        self.entries.lock().insert(peer_id, CachedVersion { version, enr_seq: seq });
        Ok(version)
    }

    pub fn cached(&self, peer_id: &NodeId) -> Option<u8> {
        self.entries.lock().get(peer_id).map(|c| c.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;

    fn enr_with_versions(seq: u64, versions: Option<&[u8]>) -> Enr {
        let key = SecretKey::from_slice(&[3u8; 32]).unwrap();
        let mut builder = enr::EnrBuilder::new().seq(seq);
        if let Some(v) = versions {
            builder = builder.protocol_versions(v).unwrap();
        }
        builder.build(&key).unwrap()
    }

    #[test]
    fn negotiates_highest_common_version() {
        let cache = VersionsCache::new();
        let peer = enr_with_versions(1, Some(&[0, 1, 2]));
        assert_eq!(cache.negotiate(&[0, 1], &peer).unwrap(), 1);
    }

    #[test]
    fn missing_pv_key_negotiates_lowest_local_version() {
        let cache = VersionsCache::new();
        let peer = enr_with_versions(1, None);
        assert_eq!(cache.negotiate(&[0, 1], &peer).unwrap(), 0);
    }

    #[test]
    fn empty_intersection_is_unsupported_version() {
        let cache = VersionsCache::new();
        let peer = enr_with_versions(1, Some(&[5]));
        assert!(matches!(
            cache.negotiate(&[0, 1], &peer),
            Err(OverlayError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn cache_invalidated_by_higher_enr_seq() {
        let cache = VersionsCache::new();
        let peer_v1 = enr_with_versions(1, Some(&[0, 1]));
        assert_eq!(cache.negotiate(&[0, 1], &peer_v1).unwrap(), 1);

        let peer_v2 = enr_with_versions(2, Some(&[0]));
        assert_eq!(cache.negotiate(&[0, 1], &peer_v2).unwrap(), 0);
    }

    #[test]
    fn failed_negotiation_does_not_populate_cache() {
        let cache = VersionsCache::new();
        let peer = enr_with_versions(1, Some(&[5]));
        assert!(cache.negotiate(&[0, 1], &peer).is_err());
        assert!(cache.cached(&peer.node_id().unwrap()).is_none());
    }

    #[test]
    fn empty_local_versions_is_unsupported_version_not_a_panic() {
        let cache = VersionsCache::new();
        let peer = enr_with_versions(1, None);
        assert!(matches!(
            cache.negotiate(&[], &peer),
            Err(OverlayError::UnsupportedVersion { .. })
        ));
    }
}
