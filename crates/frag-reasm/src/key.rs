//! Group keys: the identity of one original (pre-fragmentation) datagram.

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Fixed seeds for the default bucket hasher. Placement must be reproducible
/// across runs so that sweep order and collision behaviour are stable.
const SEEDS: [u64; 4] = [
    0x9e37_79b9_7f4a_7c15,
    0xc2b2_ae3d_27d4_eb4f,
    0x1656_67b1_9e37_79f9,
    0x27d4_eb2f_1656_67c5,
];

/// Default hasher used to place keys into buckets.
pub fn default_hash_state() -> ahash::RandomState {
    ahash::RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3])
}

/// Compute the two bucket signatures for `key`.
///
/// One 64-bit hash is split into two 32-bit halves; each half addresses one
/// candidate bucket.
#[inline]
pub fn signatures<K: Hash, S: BuildHasher>(state: &S, key: &K) -> (u32, u32) {
    let h = state.hash_one(key);
    (h as u32, (h >> 32) as u32)
}

/// Source address, destination address, datagram identification and protocol.
///
/// IPv4 identifications are 16 bits wide and are widened losslessly; IPv6
/// fragment headers carry a 32-bit identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub id: u32,
    pub proto: u8,
}

impl GroupKey {
    pub fn v4(src: Ipv4Addr, dst: Ipv4Addr, id: u16, proto: u8) -> Self {
        Self {
            src: IpAddr::V4(src),
            dst: IpAddr::V4(dst),
            id: id as u32,
            proto,
        }
    }

    pub fn v6(src: Ipv6Addr, dst: Ipv6Addr, id: u32, next_header: u8) -> Self {
        Self {
            src: IpAddr::V6(src),
            dst: IpAddr::V6(dst),
            id,
            proto: next_header,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.src.is_ipv4()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{} id={:#x} proto={}", self.src, self.dst, self.id, self.proto)
    }
}
