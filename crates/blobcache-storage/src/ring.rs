//! Consistent hashing over shard slots
//!
//! Each slot contributes 1000 virtual nodes placed by MD5 of a fixed label,
//! keys land on the first node at or past their FNV-1a position. Enough
//! virtual nodes keep the per-slot spread under a few percent, and resizing
//! the slot count only moves the expected fraction of keys.

const VIRTUAL_NODES: usize = 1000;

#[derive(Clone, Copy, Debug)]
struct VirtualNode {
    pos: u64,
    slot: usize,
}

/// Immutable key → slot mapping; build once, share freely
pub struct HashRing {
    nodes: Vec<VirtualNode>,
}

impl HashRing {
    /// Build a ring mapping keys onto `[0, slots)`
    #[must_use]
    pub fn new(slots: usize) -> Self {
        let mut nodes = Vec::with_capacity(slots * VIRTUAL_NODES);
        for slot in 0..slots {
            for v in 0..VIRTUAL_NODES {
                let digest = md5::compute(format!("hash-{slot}-{v}"));
                let pos = u64::from_be_bytes(digest.0[..8].try_into().unwrap());
                nodes.push(VirtualNode { pos, slot });
            }
        }
        nodes.sort_unstable_by_key(|n| n.pos);
        Self { nodes }
    }

    /// Slot owning `key`
    #[must_use]
    pub fn get(&self, key: &str) -> usize {
        let h = fnv1a_64(key.as_bytes());
        let i = self.nodes.partition_point(|n| n.pos < h);
        if i == self.nodes.len() {
            self.nodes[0].slot
        } else {
            self.nodes[i].slot
        }
    }

    /// Number of virtual nodes on the ring
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// 64-bit FNV-1a
fn fnv1a_64(data: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for &b in data {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
