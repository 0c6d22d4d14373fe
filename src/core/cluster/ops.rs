// src/core/cluster/ops.rs

//! Cluster-wide operations: requests that need uniform ordering across all
//! nodes. The originator appends to its pending queue, routes the request
//! through the group driver, and delivers the reply when the broadcast
//! echoes back as a NOTIFY event.

use crate::core::FlockError;
use crate::core::cluster::payload::{NotifyMessage, ReqHeader, RspHeader, STORE_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};

pub const OP_FORMAT: u8 = 0x01;
pub const OP_SHUTDOWN: u8 = 0x02;

/// Result code of a successful operation.
pub const RES_SUCCESS: u32 = 0;

/// The operations the membership core itself owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterOp {
    /// Create the cluster: stamp a creation time and adopt the redundancy
    /// and store settings chosen by the operator.
    Format {
        nr_copies: u8,
        cluster_flags: u16,
        store: String,
    },
    /// Cluster-wide transition to SHUTDOWN.
    Shutdown,
}

impl ClusterOp {
    pub fn opcode(&self) -> u8 {
        match self {
            ClusterOp::Format { .. } => OP_FORMAT,
            ClusterOp::Shutdown => OP_SHUTDOWN,
        }
    }

    /// Whether the op runs a main-processing step on every node when its
    /// broadcast is delivered. The request body rides the broadcast only
    /// when this is true.
    pub fn has_process_main(&self) -> bool {
        matches!(self, ClusterOp::Format { .. } | ClusterOp::Shutdown)
    }

    /// Whether the op needs local pre-compute inside the cluster-wide
    /// critical section before its broadcast.
    pub fn is_blocked(&self) -> bool {
        // The format timestamp must be chosen exactly once cluster-wide.
        matches!(self, ClusterOp::Format { .. })
    }
}

/// Helper to get the current system time in nanoseconds since the UNIX
/// epoch; the cluster creation time is stamped from this.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

fn envelope(opcode: u8, epoch: u32, body: Bytes) -> Result<Bytes, FlockError> {
    NotifyMessage {
        req: ReqHeader {
            opcode,
            flags: 0,
            epoch,
            data_length: body.len() as u32,
        },
        rsp: RspHeader {
            opcode,
            flags: 0,
            epoch,
            data_length: body.len() as u32,
            result: RES_SUCCESS,
        },
        body,
    }
    .encode()
}

fn format_body(ctime: u64, nr_copies: u8, cluster_flags: u16, store: &str) -> Result<Bytes, FlockError> {
    if store.len() > STORE_LEN {
        return Err(FlockError::Internal(format!(
            "store name '{store}' exceeds {STORE_LEN} bytes"
        )));
    }
    let mut buf = BytesMut::with_capacity(8 + 1 + 2 + STORE_LEN);
    buf.put_u64(ctime);
    buf.put_u8(nr_copies);
    buf.put_u16(cluster_flags);
    let mut padded = [0u8; STORE_LEN];
    padded[..store.len()].copy_from_slice(store.as_bytes());
    buf.put_slice(&padded);
    Ok(buf.freeze())
}

/// Decodes the FORMAT main-step parameters: (ctime, copies, flags, store).
pub fn decode_format_body(body: &[u8]) -> Result<(u64, u8, u16, String), FlockError> {
    let mut buf = body;
    if buf.remaining() < 8 + 1 + 2 + STORE_LEN {
        return Err(FlockError::TruncatedMessage);
    }
    let ctime = buf.get_u64();
    let nr_copies = buf.get_u8();
    let cluster_flags = buf.get_u16();
    let mut store_raw = [0u8; STORE_LEN];
    buf.copy_to_slice(&mut store_raw);
    let end = store_raw.iter().position(|&b| b == 0).unwrap_or(STORE_LEN);
    let store = std::str::from_utf8(&store_raw[..end])
        .map_err(|_| FlockError::MalformedMessage("store name is not UTF-8".into()))?
        .to_string();
    Ok((ctime, nr_copies, cluster_flags, store))
}

/// Packages a non-blocking op for direct broadcast.
pub fn encode_direct(op: &ClusterOp, epoch: u32) -> Result<Bytes, FlockError> {
    debug_assert!(!op.is_blocked());
    let body = if op.has_process_main() {
        match op {
            ClusterOp::Shutdown => Bytes::new(),
            ClusterOp::Format { .. } => unreachable!("format is a blocked op"),
        }
    } else {
        Bytes::new()
    };
    envelope(op.opcode(), epoch, body)
}

/// Runs a blocked op's pre-compute and packages the resulting broadcast.
/// Executed inside the cluster-wide critical section, off the serializer.
pub fn precompute(op: &ClusterOp, epoch: u32) -> Result<Bytes, FlockError> {
    match op {
        ClusterOp::Format {
            nr_copies,
            cluster_flags,
            store,
        } => {
            let body = format_body(now_nanos(), *nr_copies, *cluster_flags, store)?;
            envelope(OP_FORMAT, epoch, body)
        }
        ClusterOp::Shutdown => Err(FlockError::Internal(
            "shutdown does not run a blocked pre-compute".into(),
        )),
    }
}

/// One originator-local entry awaiting its totally-ordered echo.
#[derive(Debug)]
pub struct PendingOp {
    pub op: ClusterOp,
    /// Whether the op's broadcast has been handed to the driver.
    pub broadcast: bool,
    pub responder: oneshot::Sender<Result<u32, FlockError>>,
}

/// The originator-local FIFO of cluster-wide operations. The driver
/// preserves per-originator order, so an echoed NOTIFY always matches the
/// head entry.
#[derive(Debug, Default)]
pub struct PendingQueue {
    queue: VecDeque<PendingOp>,
}

impl PendingQueue {
    pub fn push(&mut self, entry: PendingOp) {
        self.queue.push_back(entry);
    }

    pub fn pop(&mut self) -> Option<PendingOp> {
        self.queue.pop_front()
    }

    pub fn pop_if(&mut self, opcode: u8) -> Option<PendingOp> {
        if self.queue.front().is_some_and(|p| p.op.opcode() == opcode) {
            self.queue.pop_front()
        } else {
            None
        }
    }

    /// The earliest blocked entry whose broadcast has not started; this is
    /// the one a `Block` callback belongs to.
    pub fn next_blocked(&mut self) -> Option<&mut PendingOp> {
        self.queue
            .iter_mut()
            .find(|p| p.op.is_blocked() && !p.broadcast)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// A submitted operation on its way to the event serializer.
#[derive(Debug)]
pub struct OpRequest {
    pub op: ClusterOp,
    pub responder: oneshot::Sender<Result<u32, FlockError>>,
}

/// Front-end handle for submitting cluster-wide operations. Cheap to
/// clone; the admin surface holds one.
#[derive(Debug, Clone)]
pub struct ClusterOps {
    tx: mpsc::UnboundedSender<OpRequest>,
}

impl ClusterOps {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OpRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Submits an operation and awaits its totally-ordered reply.
    pub async fn submit(&self, op: ClusterOp) -> Result<u32, FlockError> {
        let (responder, reply) = oneshot::channel();
        self.tx
            .send(OpRequest { op, responder })
            .map_err(|_| FlockError::Driver("event serializer is gone".into()))?;
        reply
            .await
            .map_err(|_| FlockError::Driver("cluster operation was dropped".into()))?
    }

    pub async fn format(
        &self,
        nr_copies: u8,
        cluster_flags: u16,
        store: String,
    ) -> Result<(), FlockError> {
        self.submit(ClusterOp::Format {
            nr_copies,
            cluster_flags,
            store,
        })
        .await
        .map(|_| ())
    }

    pub async fn shutdown(&self) -> Result<(), FlockError> {
        self.submit(ClusterOp::Shutdown).await.map(|_| ())
    }
}
