// src/core/cluster/peer.rs

//! Point-to-point peer I/O used by event phase A: TCP reachability probes
//! for the majority check and the VDI bitmap fetch during a join.

use crate::core::FlockError;
use crate::core::cluster::node::Node;
use crate::core::store::VdiBitmap;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

// Timeout constants for robust network operations.
const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const PEER_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Peer I/O as seen from the membership core. Implementations must not
/// touch any shared cluster state; they get copied-in targets only.
#[async_trait]
pub trait PeerClient: Send + Sync + 'static {
    /// Whether the peer is reachable. A peer counts as reachable iff the
    /// TCP 3-way handshake completes within the timeout; no application
    /// data is exchanged.
    async fn probe(&self, node: &Node) -> bool;

    /// Fetches the peer's in-use VDI bitmap.
    async fn fetch_vdi_bitmap(&self, node: &Node) -> Result<VdiBitmap, FlockError>;
}

/// The production client: plain TCP with per-peer timeouts.
#[derive(Debug, Clone)]
pub struct TcpPeerClient {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl Default for TcpPeerClient {
    fn default() -> Self {
        Self {
            connect_timeout: PEER_CONNECT_TIMEOUT,
            read_timeout: PEER_READ_TIMEOUT,
        }
    }
}

impl TcpPeerClient {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }
}

#[async_trait]
impl PeerClient for TcpPeerClient {
    async fn probe(&self, node: &Node) -> bool {
        matches!(
            tokio::time::timeout(
                self.connect_timeout,
                TcpStream::connect(node.id.to_socket_addr())
            )
            .await,
            Ok(Ok(_))
        )
    }

    async fn fetch_vdi_bitmap(&self, node: &Node) -> Result<VdiBitmap, FlockError> {
        let mut stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(node.id.to_socket_addr()),
        )
        .await
        .map_err(|_| {
            FlockError::Driver(format!("connect timeout while fetching bitmap from {node}"))
        })??;

        // The peer's request handlers answer a bitmap request with a
        // length-prefixed blob; framing beyond this belongs to them.
        let mut len_buf = [0u8; 4];
        tokio::time::timeout(self.read_timeout, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| {
                FlockError::Driver(format!("read timeout while fetching bitmap from {node}"))
            })??;
        let len = u32::from_be_bytes(len_buf) as usize;

        let mut raw = vec![0u8; len];
        tokio::time::timeout(self.read_timeout, stream.read_exact(&mut raw))
            .await
            .map_err(|_| {
                FlockError::Driver(format!("read timeout while fetching bitmap from {node}"))
            })??;

        VdiBitmap::from_bytes(&raw)
    }
}
