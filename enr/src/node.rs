//! `Node`: a lightweight, unsigned peer address used for bootstrap-seed
//! configuration — `enode://<pubkey>@ip:port[?discport=N]` or a bare `enr:`
//! string decoded straight to a full [`Enr`]. Neither `spec.md` nor
//! `SPEC_FULL.md` names a CLI, but a discv5-style node needs *some* way to
//! take seed addresses from configuration, and `enode://` is the form every
//! devp2p client accepts for that.

use crate::{EnrError, NodeId};
use std::net::IpAddr;
use std::str::FromStr;

/// An address for a peer known only by public key and socket address — no
/// signed record, no sequence number. Bootstrap seeds are commonly supplied
/// this way before the first PING/PONG resolves their real `Enr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub node_id: NodeId,
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: Option<u16>,
}

impl Node {
    /// Derives a `Node` from a fully resolved, signed `Enr`. Fails the same
    /// way `Enr::node_id`/`Enr::ip` do if the record is missing the fields
    /// a usable address needs.
    pub fn from_enr(enr: &crate::Enr) -> Result<Self, EnrError> {
        let node_id = enr.node_id()?;
        let ip = enr.ip().ok_or_else(|| EnrError::InvalidPublicKey("enr has no ip entry".into()))?;
        let udp_port = enr.udp_port().ok_or_else(|| EnrError::InvalidPublicKey("enr has no udp entry".into()))?;
        Ok(Self { node_id, ip, udp_port, tcp_port: enr.tcp_port() })
    }
}

impl FromStr for Node {
    type Err = EnrError;

    /// Parses `enode://<128-hex-char-pubkey>@host:port[?discport=N]`. The
    /// `discport` query parameter overrides the UDP port when the node's TCP
    /// and discovery ports differ, matching every devp2p client's convention.
    fn from_str(s: &str) -> Result<Self, EnrError> {
        let rest = s
            .strip_prefix("enode://")
            .ok_or_else(|| EnrError::InvalidPublicKey("expected an enode:// URL".into()))?;

        let (pubkey_hex, addr) = rest
            .split_once('@')
            .ok_or_else(|| EnrError::InvalidPublicKey("missing '@' separating pubkey from address".into()))?;

        let (host_port, query) = match addr.split_once('?') {
            Some((hp, q)) => (hp, Some(q)),
            None => (addr, None),
        };
        let (host, port_str) = host_port
            .rsplit_once(':')
            .ok_or_else(|| EnrError::InvalidPublicKey("missing port in enode address".into()))?;

        let pubkey_bytes = hex::decode(pubkey_hex)
            .map_err(|e| EnrError::InvalidPublicKey(format!("invalid pubkey hex: {e}")))?;
        if pubkey_bytes.len() != 64 {
            return Err(EnrError::InvalidPublicKey(format!(
                "expected a 64-byte uncompressed pubkey body, got {}",
                pubkey_bytes.len()
            )));
        }
        let mut xy = [0u8; 64];
        xy.copy_from_slice(&pubkey_bytes);
        let node_id = NodeId::from_uncompressed_pubkey_xy(&xy);

        let ip: IpAddr = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|_| EnrError::InvalidPublicKey(format!("invalid host {host}")))?;
        let tcp_port: u16 = port_str
            .parse()
            .map_err(|_| EnrError::InvalidPublicKey(format!("invalid port {port_str}")))?;

        let udp_port = match query.and_then(|q| q.strip_prefix("discport=")) {
            Some(v) => v.parse().map_err(|_| EnrError::InvalidPublicKey(format!("invalid discport {v}")))?,
            None => tcp_port,
        };

        Ok(Self { node_id, ip, udp_port, tcp_port: Some(tcp_port) })
    }
}
