//! Deterministic synthetic fragment traffic.
//!
//! Each flow is a fixed (src, dst) pair; every fourth flow is IPv6. A datagram
//! gets the flow's next identification, a random length, and a payload that is
//! a pure function of its key and byte position, so the receiving side can
//! verify a reassembled datagram without keeping a copy.

use frag_reasm::{Fragment, GroupKey};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::config::TrafficConfig;

const PROTO_UDP: u8 = 17;

struct Flow {
    src: std::net::IpAddr,
    dst: std::net::IpAddr,
    next_id: u32,
}

pub struct TrafficGen {
    cfg: TrafficConfig,
    rng: StdRng,
    flows: Vec<Flow>,
    /// Payload bytes per non-terminal fragment, a multiple of 8.
    chunk: u32,
    pub datagrams: u64,
    pub fragments: u64,
    pub lost: u64,
    pub duplicated: u64,
}

impl TrafficGen {
    pub fn new(cfg: &TrafficConfig) -> Self {
        let flows = (0..cfg.flows).map(flow_addrs).collect();
        Self {
            cfg: cfg.clone(),
            rng: StdRng::seed_from_u64(cfg.seed),
            flows,
            chunk: (cfg.mtu & !7).max(8),
            datagrams: 0,
            fragments: 0,
            lost: 0,
            duplicated: 0,
        }
    }

    /// Fragments for the next datagram, in the order they should be sent.
    /// Loss and duplication are already applied.
    pub fn next_datagram(&mut self) -> (GroupKey, Vec<Fragment<Vec<u8>>>) {
        let flow_idx = self.rng.gen_range(0..self.flows.len());
        let flow = &mut self.flows[flow_idx];
        let mut key = GroupKey { src: flow.src, dst: flow.dst, id: flow.next_id, proto: PROTO_UDP };
        flow.next_id = flow.next_id.wrapping_add(1);
        if key.is_ipv4() {
            // 16-bit identification field
            key.id &= 0xffff;
            flow.next_id &= 0xffff;
        }

        let total = self
            .rng
            .gen_range(self.cfg.datagram_len_min..=self.cfg.datagram_len_max);
        let mut frags = fragment(&key, total, self.chunk);
        self.datagrams += 1;

        if self.cfg.reorder {
            frags.shuffle(&mut self.rng);
        }

        let mut out = Vec::with_capacity(frags.len());
        for f in frags {
            if self.cfg.loss_pct > 0.0 && self.rng.gen_bool(self.cfg.loss_pct / 100.0) {
                self.lost += 1;
                continue;
            }
            if self.cfg.duplicate_pct > 0.0 && self.rng.gen_bool(self.cfg.duplicate_pct / 100.0) {
                self.duplicated += 1;
                out.push(f.clone());
            }
            out.push(f);
        }
        self.fragments += out.len() as u64;
        (key, out)
    }
}

fn flow_addrs(i: u32) -> Flow {
    let [_, a, b, c] = i.to_be_bytes();
    if i % 4 == 3 {
        Flow {
            src: Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, (i >> 16) as u16, i as u16).into(),
            dst: Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1).into(),
            next_id: 0,
        }
    } else {
        Flow {
            src: Ipv4Addr::new(10, a, b, c).into(),
            dst: Ipv4Addr::new(192, 168, 0, 1).into(),
            next_id: 0,
        }
    }
}

/// Split a `total`-byte datagram into `chunk`-sized fragments.
pub fn fragment(key: &GroupKey, total: u32, chunk: u32) -> Vec<Fragment<Vec<u8>>> {
    let mut frags = Vec::with_capacity(total.div_ceil(chunk) as usize);
    let mut offset = 0u32;
    while offset < total {
        let len = chunk.min(total - offset);
        frags.push(Fragment {
            offset,
            len,
            more_fragments: offset + len < total,
            buf: (offset..offset + len).map(|i| payload_byte(key, i)).collect(),
        });
        offset += len;
    }
    frags
}

/// Expected payload of the datagram identified by `key`.
pub fn expected_payload(key: &GroupKey, total: u32) -> Vec<u8> {
    (0..total).map(|i| payload_byte(key, i)).collect()
}

#[inline]
fn payload_byte(key: &GroupKey, pos: u32) -> u8 {
    let seed = key.id.wrapping_mul(0x9e37_79b9) ^ (key.proto as u32);
    (seed.wrapping_add(pos.wrapping_mul(31)) >> 3) as u8
}
