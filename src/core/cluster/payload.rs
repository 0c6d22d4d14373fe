// src/core/cluster/payload.rs

//! Bit-exact wire payloads carried opaquely by the group driver: the join
//! handshake message and the notify envelope for cluster-wide operations.
//!
//! Layouts are contractual across daemon versions; every integer is
//! big-endian and every field is hand-placed. Do not reorder.

use crate::core::FlockError;
use crate::core::cluster::admission::JoinVerdict;
use crate::core::cluster::node::{NODE_WIRE_LEN, Node};
use crate::core::cluster::state::ClusterStatus;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Version of the join handshake and notify layouts.
pub const PROTO_VER: u8 = 1;

/// Fixed length of the store-name field in the join message.
pub const STORE_LEN: usize = 16;

/// Join message header length; the node array follows immediately.
pub const JOIN_HEADER_LEN: usize = 45;

/// Request header: proto_ver u8 | opcode u8 | flags u16 | epoch u32 |
/// data_length u32.
pub const REQ_HEADER_LEN: usize = 12;

/// Response header: request header fields plus result u32.
pub const RSP_HEADER_LEN: usize = 16;

/// The join handshake message, used in both directions: a joiner's claim
/// (`nodes` carries its cached membership) and the cluster's response
/// (`leave_nodes` carries the leave list on mastership transfer). Only one
/// of the two arrays is non-empty in a given message; they alias the same
/// trailing bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinMessage {
    pub nr_copies: u8,
    pub cluster_flags: u16,
    pub cluster_status: ClusterStatus,
    pub epoch: u32,
    pub ctime: u64,
    /// Wire code of the admission verdict; see `admission::result_code`.
    pub result: u32,
    pub inc_epoch: bool,
    pub store: String,
    pub nodes: Vec<Node>,
    pub leave_nodes: Vec<Node>,
}

impl JoinMessage {
    pub fn verdict(&self) -> Result<JoinVerdict, FlockError> {
        JoinVerdict::from_wire(self.result)
    }

    pub fn encode(&self) -> Result<Bytes, FlockError> {
        if !self.nodes.is_empty() && !self.leave_nodes.is_empty() {
            return Err(FlockError::Internal(
                "join message cannot carry both a node list and a leave list".into(),
            ));
        }
        if self.store.len() > STORE_LEN {
            return Err(FlockError::Internal(format!(
                "store name '{}' exceeds {} bytes",
                self.store, STORE_LEN
            )));
        }

        let trailing = self.nodes.len().max(self.leave_nodes.len());
        let mut buf = BytesMut::with_capacity(JOIN_HEADER_LEN + trailing * NODE_WIRE_LEN);
        buf.put_u8(PROTO_VER);
        buf.put_u8(self.nr_copies);
        buf.put_u16(self.nodes.len() as u16);
        buf.put_u16(self.leave_nodes.len() as u16);
        buf.put_u16(self.cluster_flags);
        buf.put_u32(self.cluster_status.to_wire());
        buf.put_u32(self.epoch);
        buf.put_u64(self.ctime);
        buf.put_u32(self.result);
        buf.put_u8(self.inc_epoch as u8);
        let mut store = [0u8; STORE_LEN];
        store[..self.store.len()].copy_from_slice(self.store.as_bytes());
        buf.put_slice(&store);

        for node in self.nodes.iter().chain(&self.leave_nodes) {
            node.encode(&mut buf);
        }
        Ok(buf.freeze())
    }

    pub fn decode(raw: &[u8]) -> Result<Self, FlockError> {
        let mut buf = raw;
        if buf.remaining() < JOIN_HEADER_LEN {
            return Err(FlockError::TruncatedMessage);
        }
        let proto_ver = buf.get_u8();
        if proto_ver != PROTO_VER {
            return Err(FlockError::VersionMismatch(proto_ver));
        }
        let nr_copies = buf.get_u8();
        let nr_nodes = buf.get_u16() as usize;
        let nr_leave_nodes = buf.get_u16() as usize;
        if nr_nodes != 0 && nr_leave_nodes != 0 {
            return Err(FlockError::MalformedMessage(
                "join message carries both a node list and a leave list".into(),
            ));
        }
        let cluster_flags = buf.get_u16();
        let cluster_status = ClusterStatus::from_wire(buf.get_u32())?;
        let epoch = buf.get_u32();
        let ctime = buf.get_u64();
        let result = buf.get_u32();
        let inc_epoch = buf.get_u8() != 0;
        let mut store_raw = [0u8; STORE_LEN];
        buf.copy_to_slice(&mut store_raw);
        let store_end = store_raw
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(STORE_LEN);
        let store = std::str::from_utf8(&store_raw[..store_end])
            .map_err(|_| FlockError::MalformedMessage("store name is not UTF-8".into()))?
            .to_string();

        let trailing = nr_nodes.max(nr_leave_nodes);
        let list = Node::decode_list(&mut buf, trailing)?;
        let (nodes, leave_nodes) = if nr_leave_nodes > 0 {
            (Vec::new(), list)
        } else {
            (list, Vec::new())
        };

        Ok(Self {
            nr_copies,
            cluster_flags,
            cluster_status,
            epoch,
            ctime,
            result,
            inc_epoch,
            store,
            nodes,
            leave_nodes,
        })
    }
}

/// Header of a cluster-wide operation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqHeader {
    pub opcode: u8,
    pub flags: u16,
    pub epoch: u32,
    pub data_length: u32,
}

impl ReqHeader {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(PROTO_VER);
        buf.put_u8(self.opcode);
        buf.put_u16(self.flags);
        buf.put_u32(self.epoch);
        buf.put_u32(self.data_length);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, FlockError> {
        if buf.remaining() < REQ_HEADER_LEN {
            return Err(FlockError::TruncatedMessage);
        }
        let proto_ver = buf.get_u8();
        if proto_ver != PROTO_VER {
            return Err(FlockError::VersionMismatch(proto_ver));
        }
        Ok(Self {
            opcode: buf.get_u8(),
            flags: buf.get_u16(),
            epoch: buf.get_u32(),
            data_length: buf.get_u32(),
        })
    }
}

/// Header of a cluster-wide operation response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RspHeader {
    pub opcode: u8,
    pub flags: u16,
    pub epoch: u32,
    pub data_length: u32,
    pub result: u32,
}

impl RspHeader {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(PROTO_VER);
        buf.put_u8(self.opcode);
        buf.put_u16(self.flags);
        buf.put_u32(self.epoch);
        buf.put_u32(self.data_length);
        buf.put_u32(self.result);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, FlockError> {
        if buf.remaining() < RSP_HEADER_LEN {
            return Err(FlockError::TruncatedMessage);
        }
        let proto_ver = buf.get_u8();
        if proto_ver != PROTO_VER {
            return Err(FlockError::VersionMismatch(proto_ver));
        }
        Ok(Self {
            opcode: buf.get_u8(),
            flags: buf.get_u16(),
            epoch: buf.get_u32(),
            data_length: buf.get_u32(),
            result: buf.get_u32(),
        })
    }
}

/// The totally-ordered broadcast envelope: request header, response
/// header, and the request body when the operation runs a main-processing
/// step on every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyMessage {
    pub req: ReqHeader,
    pub rsp: RspHeader,
    pub body: Bytes,
}

impl NotifyMessage {
    pub fn encode(&self) -> Result<Bytes, FlockError> {
        if self.body.len() != self.req.data_length as usize {
            return Err(FlockError::Internal(format!(
                "notify body length {} disagrees with header {}",
                self.body.len(),
                self.req.data_length
            )));
        }
        let mut buf = BytesMut::with_capacity(REQ_HEADER_LEN + RSP_HEADER_LEN + self.body.len());
        self.req.encode(&mut buf);
        self.rsp.encode(&mut buf);
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    pub fn decode(raw: &[u8]) -> Result<Self, FlockError> {
        let mut buf = raw;
        let req = ReqHeader::decode(&mut buf)?;
        let rsp = RspHeader::decode(&mut buf)?;
        if buf.remaining() < req.data_length as usize {
            return Err(FlockError::TruncatedMessage);
        }
        let body = Bytes::copy_from_slice(&buf[..req.data_length as usize]);
        Ok(Self { req, rsp, body })
    }
}
