// src/core/cluster/node.rs

//! Node identity, the stable membership ordering, and the fixed wire record
//! shared by the join handshake and the epoch log.

use crate::core::FlockError;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Size in bytes of one encoded node record: 16 address bytes, port, zone,
/// vnode weight. Integers are big-endian.
pub const NODE_WIRE_LEN: usize = 24;

/// A node's identity: address and port. Zone and vnode weight are
/// attributes carried alongside, not part of the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub addr: IpAddr,
    pub port: u16,
}

impl NodeId {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// The 16-byte address form used for ordering, hashing, and the wire.
    /// IPv4 addresses map into the IPv6 space so mixed clusters order
    /// consistently on every node.
    pub fn addr_octets(&self) -> [u8; 16] {
        match self.addr {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr_octets()
            .cmp(&other.addr_octets())
            .then_with(|| self.port.cmp(&other.port))
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// One member of the cluster. A node with `nr_vnodes == 0` is a gateway:
/// it routes requests but stores no data and spans no zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub zone: u32,
    pub nr_vnodes: u16,
}

impl Node {
    pub fn new(addr: IpAddr, port: u16, zone: u32, nr_vnodes: u16) -> Self {
        Self {
            id: NodeId::new(addr, port),
            zone,
            nr_vnodes,
        }
    }

    pub fn is_gateway(&self) -> bool {
        self.nr_vnodes == 0
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.id.addr_octets());
        buf.put_u16(self.id.port);
        buf.put_u32(self.zone);
        buf.put_u16(self.nr_vnodes);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, FlockError> {
        if buf.remaining() < NODE_WIRE_LEN {
            return Err(FlockError::TruncatedMessage);
        }
        let mut octets = [0u8; 16];
        buf.copy_to_slice(&mut octets);
        let v6 = Ipv6Addr::from(octets);
        let addr = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        let port = buf.get_u16();
        let zone = buf.get_u32();
        let nr_vnodes = buf.get_u16();
        Ok(Self {
            id: NodeId::new(addr, port),
            zone,
            nr_vnodes,
        })
    }

    /// Decodes a packed array of `count` node records.
    pub fn decode_list(buf: &mut impl Buf, count: usize) -> Result<Vec<Node>, FlockError> {
        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            nodes.push(Node::decode(buf)?);
        }
        Ok(nodes)
    }
}

// The membership ordering: identity first, attributes as tie-breakers so
// that Ord stays consistent with the derived Eq.
impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id
            .cmp(&other.id)
            .then_with(|| self.zone.cmp(&other.zone))
            .then_with(|| self.nr_vnodes.cmp(&other.nr_vnodes))
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Sorts a node list into the canonical membership order.
pub fn sort_nodes(nodes: &mut [Node]) {
    nodes.sort_unstable();
}

/// Returns a sorted copy with `node` inserted, keeping the list free of
/// duplicate identities.
pub fn with_node(nodes: &[Node], node: Node) -> Vec<Node> {
    let mut out: Vec<Node> = nodes.iter().filter(|n| n.id != node.id).copied().collect();
    out.push(node);
    sort_nodes(&mut out);
    out
}

/// Returns a sorted copy with the identity of `id` removed.
pub fn without_node(nodes: &[Node], id: &NodeId) -> Vec<Node> {
    let mut out: Vec<Node> = nodes.iter().filter(|n| &n.id != id).copied().collect();
    sort_nodes(&mut out);
    out
}
