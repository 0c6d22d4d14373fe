// src/core/cluster/vnodes.rs

//! The immutable virtual-node snapshot: a consistent-hash ring mapping
//! object ids to replica-holding nodes, published through a shared handle.

use crate::core::cluster::node::{Node, NodeId};
use murmur3::murmur3_x64_128;
use parking_lot::RwLock;
use std::io::Cursor;
use std::sync::Arc;

/// One placement token on the ring, owned by a node of the snapshot's
/// membership.
#[derive(Debug, Clone, Copy)]
struct Vnode {
    token: u64,
    node: u16,
}

/// An immutable mapping from object id to replica nodes, derived from one
/// membership. Never mutated after construction; replaced wholesale when
/// the membership changes.
#[derive(Debug)]
pub struct VnodeSnapshot {
    nodes: Vec<Node>,
    ring: Vec<Vnode>,
    nr_zones: usize,
}

fn node_token(id: &NodeId, index: u16) -> u64 {
    let mut buf = [0u8; 20];
    buf[..16].copy_from_slice(&id.addr_octets());
    buf[16..18].copy_from_slice(&id.port.to_be_bytes());
    buf[18..20].copy_from_slice(&index.to_be_bytes());
    murmur3_x64_128(&mut Cursor::new(&buf[..]), 0).unwrap() as u64
}

fn oid_token(oid: u64) -> u64 {
    murmur3_x64_128(&mut Cursor::new(oid.to_be_bytes()), 0).unwrap() as u64
}

impl VnodeSnapshot {
    /// Builds a snapshot from a sorted membership. Each data-carrying node
    /// contributes `nr_vnodes` tokens; gateways contribute none.
    pub fn build(nodes: &[Node]) -> Arc<Self> {
        let mut ring = Vec::new();
        for (i, node) in nodes.iter().enumerate() {
            for v in 0..node.nr_vnodes {
                ring.push(Vnode {
                    token: node_token(&node.id, v),
                    node: i as u16,
                });
            }
        }
        ring.sort_unstable_by_key(|v| v.token);

        let mut zones: Vec<u32> = nodes
            .iter()
            .filter(|n| !n.is_gateway())
            .map(|n| n.zone)
            .collect();
        zones.sort_unstable();
        zones.dedup();

        Arc::new(Self {
            nodes: nodes.to_vec(),
            ring,
            nr_zones: zones.len(),
        })
    }

    /// The membership this snapshot was derived from.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Count of distinct failure domains among data-carrying nodes.
    pub fn nr_zones(&self) -> usize {
        self.nr_zones
    }

    /// The redundancy the cluster can actually provide: replicas must span
    /// distinct zones, so the zone count caps the configured copies.
    pub fn effective_copies(&self, configured: usize) -> usize {
        configured.min(self.nr_zones)
    }

    /// Returns the ordered replica set for an object: walk the ring from
    /// the object's token, skipping vnodes whose owner is already chosen,
    /// until `n_copies` distinct nodes are collected (or the ring runs out
    /// of distinct nodes).
    pub fn locate(&self, oid: u64, n_copies: usize) -> Vec<Node> {
        if self.ring.is_empty() || n_copies == 0 {
            return Vec::new();
        }

        let target = oid_token(oid);
        let start = self.ring.partition_point(|v| v.token < target);
        let mut picked: Vec<u16> = Vec::with_capacity(n_copies);
        let mut result = Vec::with_capacity(n_copies);
        for off in 0..self.ring.len() {
            let vnode = &self.ring[(start + off) % self.ring.len()];
            if picked.contains(&vnode.node) {
                continue;
            }
            picked.push(vnode.node);
            result.push(self.nodes[vnode.node as usize]);
            if result.len() == n_copies {
                break;
            }
        }
        result
    }
}

/// The publication slot for the current snapshot. Publishing stores the
/// new `Arc` before the slot's reference to the previous one is dropped;
/// readers that acquired the old snapshot keep it alive until their clone
/// drops. The slot's own clone keeps the published refcount at one or
/// more at all times.
#[derive(Debug)]
pub struct SnapshotHandle {
    slot: RwLock<Arc<VnodeSnapshot>>,
}

impl SnapshotHandle {
    pub fn new(initial: Arc<VnodeSnapshot>) -> Self {
        Self {
            slot: RwLock::new(initial),
        }
    }

    /// Acquires the current snapshot. Hold the returned `Arc` across any
    /// suspension point that must observe a stable placement.
    pub fn current(&self) -> Arc<VnodeSnapshot> {
        self.slot.read().clone()
    }

    /// Publishes a rebuilt snapshot. Only the event serializer calls this.
    pub fn publish(&self, next: Arc<VnodeSnapshot>) {
        *self.slot.write() = next;
    }
}
