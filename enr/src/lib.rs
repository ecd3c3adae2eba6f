//! Ethereum Node Record (ENR), restricted to the v4 (secp256k1) identity
//! scheme used by the Portal Network overlay protocol.
//!
//! Reference: [EIP-778](https://eips.ethereum.org/EIPS/eip-778).
//!
//! This crate keeps the shape of a handwritten ENR implementation — a signed
//! map of string keys to opaque RLP values, re-signed on every mutation — but
//! drops the multi-scheme (secp256k1/ed25519/rsa) public key dispatch in
//! favor of the single secp256k1 scheme the v4 identity scheme actually uses.

mod distance;
mod error;
mod node;
mod node_id;

pub use distance::{log_distance, within_radius, xor};
pub use error::EnrError;
pub use node::Node;
pub use node_id::NodeId;

use rlp::{DecoderError, Rlp, RlpStream};
use secp256k1::{ecdsa::Signature, Message, PublicKey, SecretKey, SECP256K1};
use sha3::{Digest, Keccak256};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Maximum encoded size of an ENR record, per EIP-778.
pub const MAX_ENR_SIZE: usize = 300;
/// Maximum number of protocol versions carried in the `pv` entry.
pub const MAX_PROTOCOL_VERSIONS: usize = 8;

const KEY_ID: &str = "id";
const KEY_IP: &str = "ip";
const KEY_IP6: &str = "ip6";
const KEY_TCP: &str = "tcp";
const KEY_UDP: &str = "udp";
const KEY_SECP256K1: &str = "secp256k1";
/// Custom entry read by the overlay engine's version negotiator: an ordered
/// list of protocol versions this node supports, encoded as raw bytes (one
/// byte per version number).
const KEY_PROTOCOL_VERSIONS: &str = "pv";

/// A signed, versioned Ethereum Node Record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enr {
    seq: u64,
    content: BTreeMap<String, Vec<u8>>,
    signature: Vec<u8>,
}

impl Enr {
    /// RLP-encodes `[seq, k1, v1, k2, v2, ...]` with keys in sorted (BTreeMap)
    /// order. This is exactly the payload that gets signed, per EIP-778.
    fn signed_content(&self) -> Vec<u8> {
        let mut stream = RlpStream::new();
        stream.begin_list(self.content.len() * 2 + 1);
        stream.append(&self.seq);
        for (k, v) in &self.content {
            stream.append(k);
            stream.append(v);
        }
        stream.drain()
    }

    fn signing_digest(&self) -> [u8; 32] {
        Keccak256::digest(self.signed_content()).into()
    }

    fn sign(&mut self, signer: &SecretKey) -> Result<(), EnrError> {
        let digest = self.signing_digest();
        let msg = Message::from_digest_slice(&digest).map_err(|_| EnrError::SigningError)?;
        let sig = SECP256K1.sign_ecdsa(&msg, signer);
        self.signature = sig.serialize_compact().to_vec();
        Ok(())
    }

    /// Verifies the record's signature against its own embedded public key.
    pub fn verify(&self) -> Result<(), EnrError> {
        let pubkey = self.public_key()?;
        let digest = self.signing_digest();
        let msg = Message::from_digest_slice(&digest).map_err(|_| EnrError::InvalidSignature)?;
        let sig = Signature::from_compact(&self.signature).map_err(|_| EnrError::InvalidSignature)?;
        SECP256K1
            .verify_ecdsa(&msg, &sig, &pubkey)
            .map_err(|_| EnrError::InvalidSignature)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn public_key(&self) -> Result<PublicKey, EnrError> {
        let bytes = self
            .content
            .get(KEY_SECP256K1)
            .ok_or(EnrError::MissingPublicKey)?;
        PublicKey::from_slice(bytes).map_err(|e| EnrError::InvalidPublicKey(e.to_string()))
    }

    /// `keccak256` of the uncompressed public key (sans the `0x04` prefix
    /// byte), matching devp2p's definition of a node id since discv4.
    pub fn node_id(&self) -> Result<NodeId, EnrError> {
        let pubkey = self.public_key()?;
        let uncompressed = pubkey.serialize_uncompressed();
        let mut xy = [0u8; 64];
        xy.copy_from_slice(&uncompressed[1..]);
        Ok(NodeId::from_uncompressed_pubkey_xy(&xy))
    }

    pub fn id(&self) -> Option<&str> {
        self.content
            .get(KEY_ID)
            .map(|bytes| std::str::from_utf8(bytes).unwrap_or_default())
    }

    pub fn ip(&self) -> Option<IpAddr> {
        if let Some(bytes) = self.content.get(KEY_IP) {
            if bytes.len() == 4 {
                let mut b = [0u8; 4];
                b.copy_from_slice(bytes);
                return Some(IpAddr::V4(Ipv4Addr::from(b)));
            }
        }
        if let Some(bytes) = self.content.get(KEY_IP6) {
            if bytes.len() == 16 {
                let mut b = [0u8; 16];
                b.copy_from_slice(bytes);
                return Some(IpAddr::V6(Ipv6Addr::from(b)));
            }
        }
        None
    }

    fn port_entry(&self, key: &str) -> Option<u16> {
        let bytes = self.content.get(key)?;
        if bytes.is_empty() || bytes.len() > 2 {
            return None;
        }
        let mut buf = [0u8; 2];
        buf[2 - bytes.len()..].copy_from_slice(bytes);
        Some(u16::from_be_bytes(buf))
    }

    pub fn tcp_port(&self) -> Option<u16> {
        self.port_entry(KEY_TCP)
    }

    pub fn udp_port(&self) -> Option<u16> {
        self.port_entry(KEY_UDP)
    }

    /// Reads the `pv` (protocol-versions) entry. Returns an empty vector when
    /// absent, per spec: the peer is then treated as supporting version 0.
    pub fn protocol_versions(&self) -> Vec<u8> {
        self.content
            .get(KEY_PROTOCOL_VERSIONS)
            .cloned()
            .unwrap_or_default()
    }

    /// Updates the `pv` entry in place, bumps `seq`, and re-signs.
    pub fn set_protocol_versions(
        &mut self,
        versions: &[u8],
        signer: &SecretKey,
    ) -> Result<(), EnrError> {
        if versions.len() > MAX_PROTOCOL_VERSIONS {
            return Err(EnrError::TooManyVersions);
        }
        self.content
            .insert(KEY_PROTOCOL_VERSIONS.to_string(), versions.to_vec());
        self.seq += 1;
        self.sign(signer)?;
        self.check_size()
    }

    pub fn set_socket(
        &mut self,
        ip: IpAddr,
        udp_port: u16,
        tcp_port: u16,
        signer: &SecretKey,
    ) -> Result<(), EnrError> {
        match ip {
            IpAddr::V4(v4) => {
                self.content.insert(KEY_IP.to_string(), v4.octets().to_vec());
                self.content.remove(KEY_IP6);
            }
            IpAddr::V6(v6) => {
                self.content.insert(KEY_IP6.to_string(), v6.octets().to_vec());
                self.content.remove(KEY_IP);
            }
        }
        self.content
            .insert(KEY_UDP.to_string(), udp_port.to_be_bytes().to_vec());
        self.content
            .insert(KEY_TCP.to_string(), tcp_port.to_be_bytes().to_vec());
        self.seq += 1;
        self.sign(signer)?;
        self.check_size()
    }

    fn check_size(&self) -> Result<(), EnrError> {
        if self.signed_content().len() + self.signature.len() + 8 > MAX_ENR_SIZE {
            return Err(EnrError::ExceedsMaxSize);
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new();
        stream.begin_list(self.content.len() * 2 + 2);
        stream.append(&self.signature);
        stream.append(&self.seq);
        for (k, v) in &self.content {
            stream.append(k);
            stream.append(v);
        }
        stream.drain()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnrError> {
        let rlp = Rlp::new(bytes);
        if !rlp.is_list() {
            return Err(EnrError::Rlp(DecoderError::RlpExpectedToBeList));
        }
        let mut items = rlp.iter();
        let signature: Vec<u8> = items
            .next()
            .ok_or(DecoderError::RlpIncorrectListLen)?
            .as_val()?;
        let seq: u64 = items
            .next()
            .ok_or(DecoderError::RlpIncorrectListLen)?
            .as_val()?;

        let mut content = BTreeMap::new();
        loop {
            let key_rlp = match items.next() {
                Some(k) => k,
                None => break,
            };
            let value_rlp = items.next().ok_or(DecoderError::RlpIncorrectListLen)?;
            let key: Vec<u8> = key_rlp.as_val()?;
            let value: Vec<u8> = value_rlp.as_val()?;
            content.insert(String::from_utf8_lossy(&key).into_owned(), value);
        }

        let enr = Enr {
            seq,
            content,
            signature,
        };
        enr.verify()?;
        Ok(enr)
    }

    pub fn to_base64(&self) -> String {
        let encoded = self.encode();
        format!("enr:{}", base64_url_encode(&encoded))
    }
}

/// Builds and signs a new [`Enr`].
#[derive(Default)]
pub struct EnrBuilder {
    seq: u64,
    content: BTreeMap<String, Vec<u8>>,
}

impl EnrBuilder {
    pub fn new() -> Self {
        Self {
            seq: 1,
            content: BTreeMap::new(),
        }
    }

    pub fn seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn ip(mut self, ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => {
                self.content.insert(KEY_IP.to_string(), v4.octets().to_vec());
            }
            IpAddr::V6(v6) => {
                self.content.insert(KEY_IP6.to_string(), v6.octets().to_vec());
            }
        }
        self
    }

    pub fn tcp_port(mut self, port: u16) -> Self {
        self.content.insert(KEY_TCP.to_string(), port.to_be_bytes().to_vec());
        self
    }

    pub fn udp_port(mut self, port: u16) -> Self {
        self.content.insert(KEY_UDP.to_string(), port.to_be_bytes().to_vec());
        self
    }

    pub fn protocol_versions(mut self, versions: &[u8]) -> Result<Self, EnrError> {
        if versions.len() > MAX_PROTOCOL_VERSIONS {
            return Err(EnrError::TooManyVersions);
        }
        self.content
            .insert(KEY_PROTOCOL_VERSIONS.to_string(), versions.to_vec());
        Ok(self)
    }

    pub fn add_value(mut self, key: &str, value: Vec<u8>) -> Self {
        self.content.insert(key.to_string(), value);
        self
    }

    pub fn build(mut self, signer: &SecretKey) -> Result<Enr, EnrError> {
        self.content.insert(KEY_ID.to_string(), b"v4".to_vec());
        let public_key = PublicKey::from_secret_key(SECP256K1, signer);
        self.content
            .insert(KEY_SECP256K1.to_string(), public_key.serialize().to_vec());

        let mut enr = Enr {
            seq: self.seq,
            content: self.content,
            signature: Vec::new(),
        };
        enr.sign(signer)?;
        enr.check_size()?;
        Ok(enr)
    }
}

/// Unpadded base64url, the encoding `enr:` URLs use.
fn base64_url_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    let mut out = String::with_capacity((bytes.len() * 4).div_ceil(3));
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = *chunk.get(1).unwrap_or(&0) as u32;
        let b2 = *chunk.get(2).unwrap_or(&0) as u32;
        let n = (b0 << 16) | (b1 << 8) | b2;
        out.push(ALPHABET[(n >> 18 & 0x3f) as usize] as char);
        out.push(ALPHABET[(n >> 12 & 0x3f) as usize] as char);
        if chunk.len() > 1 {
            out.push(ALPHABET[(n >> 6 & 0x3f) as usize] as char);
        }
        if chunk.len() > 2 {
            out.push(ALPHABET[(n & 0x3f) as usize] as char);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn secret_key() -> SecretKey {
        SecretKey::from_slice(&[7u8; 32]).unwrap()
    }

    #[test]
    fn build_sign_and_verify_roundtrip() {
        let key = secret_key();
        let enr = EnrBuilder::new()
            .seq(1)
            .ip(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))
            .udp_port(9000)
            .tcp_port(9000)
            .protocol_versions(&[0, 1])
            .unwrap()
            .build(&key)
            .unwrap();

        assert!(enr.verify().is_ok());
        assert_eq!(enr.id(), Some("v4"));
        assert_eq!(enr.ip(), Some(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert_eq!(enr.udp_port(), Some(9000));
        assert_eq!(enr.protocol_versions(), vec![0, 1]);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let key = secret_key();
        let enr = EnrBuilder::new()
            .ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
            .udp_port(30303)
            .build(&key)
            .unwrap();

        let encoded = enr.encode();
        let decoded = Enr::decode(&encoded).unwrap();
        assert_eq!(decoded, enr);
        assert_eq!(decoded.node_id().unwrap(), enr.node_id().unwrap());
    }

    #[test]
    fn missing_pv_key_is_empty() {
        let key = secret_key();
        let enr = EnrBuilder::new().build(&key).unwrap();
        assert!(enr.protocol_versions().is_empty());
    }

    #[test]
    fn tampered_record_fails_verification() {
        let key = secret_key();
        let mut enr = EnrBuilder::new().build(&key).unwrap();
        enr.content.insert("ip".to_string(), vec![1, 2, 3, 4]);
        assert!(enr.verify().is_err());
    }

    #[test]
    fn seq_increments_on_mutation() {
        let key = secret_key();
        let mut enr = EnrBuilder::new().seq(1).build(&key).unwrap();
        enr.set_protocol_versions(&[0, 1, 2], &key).unwrap();
        assert_eq!(enr.seq(), 2);
        assert_eq!(enr.protocol_versions(), vec![0, 1, 2]);
    }

    #[test]
    fn too_many_protocol_versions_rejected() {
        let key = secret_key();
        let err = EnrBuilder::new().protocol_versions(&[0; 9]);
        assert!(err.is_err());
        let _ = key;
    }
}
