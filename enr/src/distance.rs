//! XOR-metric distance algebra shared by the routing table and lookup engine.

use crate::NodeId;
use ethereum_types::U256;

/// `XOR(a, b)` interpreted as a 256-bit unsigned integer.
pub fn xor(a: &NodeId, b: &NodeId) -> U256 {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a.as_fixed_bytes()[i] ^ b.as_fixed_bytes()[i];
    }
    U256::from_big_endian(&out)
}

/// `⌊log2(xor(a, b))⌋`, i.e. the index of the highest set bit. Returns `256`
/// when `a == b`, since there is no bucket for the zero distance.
pub fn log_distance(a: &NodeId, b: &NodeId) -> u16 {
    let distance = xor(a, b);
    if distance.is_zero() {
        return 256;
    }
    (distance.bits() - 1) as u16
}

/// `xor(local, id) <= radius`.
pub fn within_radius(local: &NodeId, radius: U256, id: &NodeId) -> bool {
    xor(local, id) <= radius
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_distance_of_identical_ids_is_256() {
        let id = NodeId::new([0x42; 32]);
        assert_eq!(log_distance(&id, &id), 256);
    }

    #[test]
    fn log_distance_of_adjacent_ids_is_zero() {
        let mut bytes = [0u8; 32];
        let a = NodeId::new(bytes);
        bytes[31] = 1;
        let b = NodeId::new(bytes);
        assert_eq!(log_distance(&a, &b), 0);
    }

    #[test]
    fn log_distance_of_far_ids_is_255() {
        let a = NodeId::new([0x00; 32]);
        let mut far = [0x00; 32];
        far[0] = 0x80;
        let b = NodeId::new(far);
        assert_eq!(log_distance(&a, &b), 255);
    }

    #[test]
    fn within_radius_respects_boundary() {
        let local = NodeId::new([0x00; 32]);
        let mut id_bytes = [0x00; 32];
        id_bytes[31] = 0x0f;
        let id = NodeId::new(id_bytes);
        assert!(within_radius(&local, U256::from(0x0f), &id));
        assert!(!within_radius(&local, U256::from(0x0e), &id));
    }
}
