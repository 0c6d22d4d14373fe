// tests/support/harness.rs

//! Shared scaffolding for multi-node membership tests: full nodes wired
//! over the in-process driver, with a scriptable peer client.

#![allow(dead_code)]

use async_trait::async_trait;
use flockd::core::FlockError;
use flockd::core::cluster::driver::GroupDriver;
use flockd::core::cluster::events::{EventSerializer, IoGate};
use flockd::core::cluster::local::LocalNet;
use flockd::core::cluster::node::{Node, NodeId};
use flockd::core::cluster::ops::ClusterOps;
use flockd::core::cluster::peer::PeerClient;
use flockd::core::cluster::state::{ClusterCtx, ClusterInfo, ClusterStatus, PublishedView};
use flockd::core::recovery::RecoveryHandle;
use flockd::core::store::{ObjectStore, PlainStore, VdiBitmap};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Peer I/O stub: reachability is whatever the test says it is, and
/// bitmap fetches fail (the serializer must tolerate that).
#[derive(Default)]
pub struct TestPeers {
    reachable: RwLock<HashSet<NodeId>>,
}

impl TestPeers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark_reachable(&self, id: NodeId) {
        self.reachable.write().insert(id);
    }

    pub fn set_reachable(&self, ids: &[NodeId]) {
        let mut guard = self.reachable.write();
        guard.clear();
        guard.extend(ids.iter().copied());
    }
}

#[async_trait]
impl PeerClient for TestPeers {
    async fn probe(&self, node: &Node) -> bool {
        self.reachable.read().contains(&node.id)
    }

    async fn fetch_vdi_bitmap(&self, node: &Node) -> Result<VdiBitmap, FlockError> {
        Err(FlockError::Driver(format!("{node} serves no bitmap in tests")))
    }
}

pub struct TestNode {
    pub node: Node,
    pub ops: ClusterOps,
    pub published: Arc<PublishedView>,
    pub recovery: RecoveryHandle,
    pub gate: Arc<IoGate>,
    pub task: JoinHandle<Result<(), FlockError>>,
    pub dir: PathBuf,
}

impl TestNode {
    /// Boots a node from `dir` (fresh or with durable state from an
    /// earlier run) and proposes it for membership.
    pub async fn start(
        net: &Arc<LocalNet>,
        peers: &Arc<TestPeers>,
        dir: &Path,
        octet: u8,
        zone: u32,
    ) -> TestNode {
        let node = Node::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet)), 7000, zone, 64);
        let defaults = ClusterInfo::unformatted(3, 0, "plain".to_string());
        let ctx = ClusterCtx::new(node, dir, defaults).unwrap();
        let published = ctx.published.clone();
        let payload = ctx.join_request().encode().unwrap();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ops, requests_rx) = ClusterOps::channel();
        let driver = net.register(node, published.clone(), events_tx);
        let recovery = RecoveryHandle::spawn();
        let store: Arc<dyn ObjectStore> = Arc::new(PlainStore::new());
        store.init(dir).unwrap();
        let gate = IoGate::new();

        let peer_client: Arc<dyn PeerClient> = peers.clone();
        let serializer = EventSerializer::new(
            ctx,
            Arc::new(driver.clone()),
            peer_client,
            store,
            recovery.clone(),
            gate.clone(),
            events_rx,
            requests_rx,
        );
        let task = tokio::spawn(serializer.run());

        peers.mark_reachable(node.id);
        driver.join(node, payload).await.unwrap();

        TestNode {
            node,
            ops,
            published,
            recovery,
            gate,
            task,
            dir: dir.to_path_buf(),
        }
    }

    /// Boots a node again from a prior incarnation's directory and
    /// identity.
    pub async fn restart(
        net: &Arc<LocalNet>,
        peers: &Arc<TestPeers>,
        prior: &TestNode,
    ) -> TestNode {
        let octet = match prior.node.id.addr {
            IpAddr::V4(v4) => v4.octets()[3],
            IpAddr::V6(_) => unreachable!("test nodes are IPv4"),
        };
        TestNode::start(net, peers, &prior.dir, octet, prior.node.zone).await
    }

    pub async fn wait_status(&self, status: ClusterStatus) {
        wait_until(&format!("{} to reach {status}", self.node), || {
            self.published.status() == status
        })
        .await;
    }

    pub async fn wait_epoch(&self, epoch: u32) {
        wait_until(&format!("{} to reach epoch {epoch}", self.node), || {
            self.published.epoch() == epoch
        })
        .await;
    }

    pub async fn wait_members(&self, count: usize) {
        wait_until(&format!("{} to see {count} members", self.node), || {
            self.published.admission().nodes.len() == count
        })
        .await;
    }

    /// Simulates an abrupt crash: the serializer dies and the driver
    /// detects the member loss.
    pub fn crash(&self, net: &LocalNet) {
        self.task.abort();
        net.kill(&self.node.id);
    }

    /// Awaits the self-demotion error the serializer exits with.
    pub async fn demotion(self) -> FlockError {
        match self.task.await {
            Ok(Err(e)) => e,
            other => panic!("expected a self-demotion, got {other:?}"),
        }
    }
}

pub async fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if predicate() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Boots one node per zone, formats the cluster through the first with
/// the given redundancy settings, and waits for epoch 1 everywhere.
pub async fn form_cluster_with(
    net: &Arc<LocalNet>,
    peers: &Arc<TestPeers>,
    root: &Path,
    zones: &[u32],
    nr_copies: u8,
    cluster_flags: u16,
) -> Vec<TestNode> {
    let mut nodes = Vec::new();
    for (i, &zone) in zones.iter().enumerate() {
        let octet = (i + 1) as u8;
        let dir = root.join(format!("n{octet}"));
        nodes.push(TestNode::start(net, peers, &dir, octet, zone).await);
    }
    for node in &nodes {
        node.wait_members(zones.len()).await;
    }
    nodes[0]
        .ops
        .format(nr_copies, cluster_flags, "plain".to_string())
        .await
        .unwrap();
    for node in &nodes {
        node.wait_status(ClusterStatus::Ok).await;
        node.wait_epoch(1).await;
    }
    nodes
}

/// `form_cluster_with` at the default three copies, halting permitted.
pub async fn form_cluster(
    net: &Arc<LocalNet>,
    peers: &Arc<TestPeers>,
    root: &Path,
    zones: &[u32],
) -> Vec<TestNode> {
    form_cluster_with(net, peers, root, zones, 3, 0).await
}
