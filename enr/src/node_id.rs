use ethereum_types::{H256, U256};
use std::fmt;

/// 256-bit opaque identifier derived from a peer's [`crate::Enr`].
///
/// Equality and hashing are by raw bytes; ordering is by unsigned big-endian
/// integer interpretation, matching the "smaller NodeId lexicographically"
/// tie-break rule used throughout the routing table and lookup engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub H256);

impl NodeId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(H256(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(H256::from_slice(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn as_fixed_bytes(&self) -> &[u8; 32] {
        &self.0.0
    }

    /// Computes the node-id of an uncompressed secp256k1 public key (64 bytes,
    /// X||Y without the leading `0x04` prefix), i.e. `keccak256(pubkey)`.
    /// This is the same definition devp2p has used since discv4.
    pub fn from_uncompressed_pubkey_xy(xy: &[u8; 64]) -> Self {
        use sha3::{Digest, Keccak256};
        let digest = Keccak256::digest(xy);
        Self(H256::from_slice(&digest))
    }

    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(H256(bytes))
    }

    /// A random NodeId whose log-distance to `self` is exactly `distance`
    /// (valid bucket range `0..=255`; values `>= 256` return `self` unchanged,
    /// since there is no bucket for the zero distance).
    pub fn random_at_distance(&self, distance: u16) -> Self {
        if distance >= 256 {
            return *self;
        }
        let mut bytes = self.0.0;
        let d = distance as usize;
        let byte_idx = 31 - d / 8;
        let bit_idx = d % 8;
        // Flip the bit that sets the log-distance, then randomize the lower bits.
        bytes[byte_idx] ^= 1 << bit_idx;
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        for b in bytes.iter_mut().skip(byte_idx + 1) {
            *b = rng.next_u32() as u8;
        }
        Self(H256(bytes))
    }

    pub fn as_u256(&self) -> U256 {
        U256::from_big_endian(self.0.as_bytes())
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<H256> for NodeId {
    fn from(value: H256) -> Self {
        Self(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0.as_bytes()))
    }
}
