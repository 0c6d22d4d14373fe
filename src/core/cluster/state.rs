// src/core/cluster/state.rs

//! Cluster-wide state: the status machine, membership registry, leave
//! list, persisted cluster identity, and the published read-side view.
//!
//! All mutable fields live in `ClusterCtx`, which is owned exclusively by
//! the event serializer task. Everything other tasks may read goes through
//! `PublishedView`.

use crate::core::FlockError;
use crate::core::cluster::epoch_log::EpochLog;
use crate::core::cluster::node::{Node, NodeId};
use crate::core::cluster::payload::JoinMessage;
use crate::core::cluster::vnodes::{SnapshotHandle, VnodeSnapshot};
use crate::core::store::VdiBitmap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use strum_macros::Display;
use tracing::{info, warn};

/// Cluster flag: the operator chose availability over redundancy; the
/// cluster never transitions to HALT on zone loss.
pub const CLUSTER_FLAG_NOHALT: u16 = 0x0001;

/// The file holding the persisted cluster identity.
const INFO_FILE: &str = "cluster.json";

/// The lifecycle states of the cluster as seen from one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    /// No epoch on disk; the cluster has never been formatted.
    WaitForFormat,
    /// An epoch exists; waiting for enough prior members to reconstitute.
    WaitForJoin,
    /// Quorum present and zones suffice; writes allowed.
    Ok,
    /// Insufficient zones for full redundancy; reads allowed, writes paused.
    Halt,
    /// Terminal; drains outstanding work and refuses new.
    Shutdown,
}

impl ClusterStatus {
    /// Wire encoding of the status field in the join handshake.
    pub fn to_wire(self) -> u32 {
        match self {
            ClusterStatus::WaitForFormat => 0x01,
            ClusterStatus::WaitForJoin => 0x02,
            ClusterStatus::Ok => 0x04,
            ClusterStatus::Halt => 0x08,
            ClusterStatus::Shutdown => 0x10,
        }
    }

    pub fn from_wire(raw: u32) -> Result<Self, FlockError> {
        match raw {
            0x01 => Ok(ClusterStatus::WaitForFormat),
            0x02 => Ok(ClusterStatus::WaitForJoin),
            0x04 => Ok(ClusterStatus::Ok),
            0x08 => Ok(ClusterStatus::Halt),
            0x10 => Ok(ClusterStatus::Shutdown),
            other => Err(FlockError::MalformedMessage(format!(
                "unknown cluster status 0x{other:08x}"
            ))),
        }
    }

    /// Whether membership changes may advance the epoch and kick recovery
    /// in this state.
    pub fn accepts_recovery(self) -> bool {
        matches!(self, ClusterStatus::Ok | ClusterStatus::Halt)
    }
}

/// The current sorted membership. Replaced wholesale by the event
/// serializer; read through the published snapshot everywhere else.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: Vec<Node>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the membership. The caller passes a sorted list.
    pub fn replace(&mut self, nodes: Vec<Node>) {
        debug_assert!(nodes.windows(2).all(|w| w[0] < w[1]), "unsorted registry");
        self.nodes = nodes;
    }

    pub fn as_slice(&self) -> &[Node] {
        &self.nodes
    }

    pub fn to_vec(&self) -> Vec<Node> {
        self.nodes.clone()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| &n.id == id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Members known to have departed between a pre-failure epoch and the next
/// quorum that accounts for them. Never overlaps the registry.
#[derive(Debug, Default)]
pub struct LeaveList {
    nodes: Vec<Node>,
}

impl LeaveList {
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| &n.id == id)
    }

    pub fn add(&mut self, node: Node) {
        if self.contains(&node.id) {
            return;
        }
        self.nodes.push(node);
        self.nodes.sort_unstable();
    }

    pub fn remove(&mut self, id: &NodeId) {
        self.nodes.retain(|n| &n.id != id);
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn as_slice(&self) -> &[Node] {
        &self.nodes
    }

    pub fn to_vec(&self) -> Vec<Node> {
        self.nodes.clone()
    }
}

/// The persisted cluster identity, written at format time and carried
/// across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterInfo {
    pub ctime: u64,
    pub nr_copies: u8,
    pub cluster_flags: u16,
    pub store: String,
}

impl ClusterInfo {
    pub fn unformatted(nr_copies: u8, cluster_flags: u16, store: String) -> Self {
        Self {
            ctime: 0,
            nr_copies,
            cluster_flags,
            store,
        }
    }

    pub fn load(base: &Path) -> Result<Option<Self>, FlockError> {
        let path = base.join(INFO_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Saves the identity atomically (tmp file + rename).
    pub fn save(&self, base: &Path) -> Result<(), FlockError> {
        let path = base.join(INFO_FILE);
        let content = serde_json::to_string_pretty(self)?;
        let tmp = base.join(format!("{INFO_FILE}.tmp-{}", rand::random::<u32>()));
        fs::write(&tmp, content)?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

/// The immutable inputs of join admission, republished by the event
/// serializer after every applied event. Admission is a pure function over
/// one of these, so any task (in particular the group driver evaluating a
/// join proposal) can run it without touching serializer-owned state.
#[derive(Debug, Clone)]
pub struct AdmissionView {
    pub status: ClusterStatus,
    pub ctime: u64,
    pub epoch: u32,
    pub nr_copies: u8,
    pub cluster_flags: u16,
    pub store: String,
    /// Current sorted membership.
    pub nodes: Vec<Node>,
    /// Current leave list.
    pub leave_nodes: Vec<Node>,
    /// Membership committed at `epoch` (empty when `epoch == 0`).
    pub last_entry: Vec<Node>,
}

/// The read side of the cluster state, shared with the I/O paths and the
/// group driver. Written only by the event serializer.
#[derive(Debug)]
pub struct PublishedView {
    epoch: AtomicU32,
    status: RwLock<ClusterStatus>,
    pub snapshot: SnapshotHandle,
    admission: RwLock<Arc<AdmissionView>>,
}

impl PublishedView {
    fn new(status: ClusterStatus, epoch: u32, admission: AdmissionView) -> Self {
        Self {
            epoch: AtomicU32::new(epoch),
            status: RwLock::new(status),
            snapshot: SnapshotHandle::new(VnodeSnapshot::build(&[])),
            admission: RwLock::new(Arc::new(admission)),
        }
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ClusterStatus {
        *self.status.read()
    }

    pub fn admission(&self) -> Arc<AdmissionView> {
        self.admission.read().clone()
    }

    fn set_epoch(&self, epoch: u32) {
        self.epoch.store(epoch, Ordering::Release);
    }

    fn set_status(&self, status: ClusterStatus) {
        *self.status.write() = status;
    }

    fn set_admission(&self, view: AdmissionView) {
        *self.admission.write() = Arc::new(view);
    }
}

/// Outcome of reevaluating a WAIT_FOR_JOIN cluster after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitJoinOutcome {
    /// Still missing members.
    Stay,
    /// All members of the logged epoch are back; run at the same epoch.
    Ready,
    /// Members plus the leave list account for the logged epoch; the
    /// missing nodes are permanently lost and the epoch advances.
    ReadyIncEpoch(u32),
}

/// All mutable cluster state, owned by the event serializer task. Worker
/// tasks only ever see `PublishedView` handles or copied-in values.
#[derive(Debug)]
pub struct ClusterCtx {
    pub me: Node,
    pub status: ClusterStatus,
    pub info: ClusterInfo,
    pub epoch: u32,
    pub registry: NodeRegistry,
    pub leave_list: LeaveList,
    pub epoch_log: EpochLog,
    pub published: Arc<PublishedView>,
    /// Set once this node's own join (or an adopted mastership) completed.
    pub join_finished: bool,
    pub vdi_bitmap: VdiBitmap,
    base_dir: PathBuf,
}

impl ClusterCtx {
    /// Builds the context from durable state under `base`. A node with a
    /// committed epoch wakes up in WAIT_FOR_JOIN; a blank one in
    /// WAIT_FOR_FORMAT.
    pub fn new(me: Node, base: &Path, defaults: ClusterInfo) -> Result<Self, FlockError> {
        fs::create_dir_all(base)?;
        let epoch_log = EpochLog::open(base)?;
        let info = ClusterInfo::load(base)?.unwrap_or(defaults);
        let epoch = epoch_log.latest();
        let status = if epoch == 0 {
            ClusterStatus::WaitForFormat
        } else {
            ClusterStatus::WaitForJoin
        };

        let admission = AdmissionView {
            status,
            ctime: info.ctime,
            epoch,
            nr_copies: info.nr_copies,
            cluster_flags: info.cluster_flags,
            store: info.store.clone(),
            nodes: Vec::new(),
            leave_nodes: Vec::new(),
            last_entry: epoch_log.read(epoch),
        };

        Ok(Self {
            me,
            status,
            info,
            epoch,
            registry: NodeRegistry::new(),
            leave_list: LeaveList::default(),
            epoch_log,
            published: Arc::new(PublishedView::new(status, epoch, admission)),
            join_finished: false,
            vdi_bitmap: VdiBitmap::new(),
            base_dir: base.to_path_buf(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn set_status(&mut self, next: ClusterStatus) {
        if self.status != next {
            info!("Cluster status {} -> {}", self.status, next);
            self.status = next;
            self.published.set_status(next);
        }
    }

    pub fn set_epoch(&mut self, epoch: u32) {
        self.epoch = epoch;
        self.published.set_epoch(epoch);
    }

    /// Replaces the membership and publishes a rebuilt vnode snapshot.
    /// The new snapshot is stored before the slot's reference to the old
    /// one drops; in-flight readers keep the old ring alive until they
    /// finish.
    pub fn install_members(&mut self, mut members: Vec<Node>) {
        members.sort_unstable();
        for node in &members {
            self.leave_list.remove(&node.id);
        }
        self.published.snapshot.publish(VnodeSnapshot::build(&members));
        self.registry.replace(members);
    }

    pub fn nr_zones(&self) -> usize {
        self.published.snapshot.current().nr_zones()
    }

    /// Whether the operator allows the HALT transition at all.
    pub fn can_halt(&self) -> bool {
        self.info.cluster_flags & CLUSTER_FLAG_NOHALT == 0
    }

    /// Adds a departed node to the leave list, keeping it disjoint from
    /// the registry.
    pub fn add_leave(&mut self, node: Node) {
        if self.registry.contains(&node.id) {
            warn!("Refusing leave-list entry for current member {}", node);
            return;
        }
        self.leave_list.add(node);
    }

    /// After a leave: pause writes when the surviving zones can no longer
    /// hold a full replica set.
    pub fn maybe_halt(&mut self) {
        if self.status == ClusterStatus::Ok
            && self.can_halt()
            && self.nr_zones() < self.info.nr_copies as usize
        {
            self.set_status(ClusterStatus::Halt);
        }
    }

    /// After a join: resume writes once the zones suffice again.
    pub fn maybe_resume(&mut self) {
        if self.status == ClusterStatus::Halt && self.nr_zones() >= self.info.nr_copies as usize {
            self.set_status(ClusterStatus::Ok);
        }
    }

    /// Reevaluates a WAIT_FOR_JOIN cluster against the epoch log entry at
    /// the current epoch. Mirrors the admission post-check so that the
    /// verdict computed before the event and the transition applied after
    /// it agree.
    pub fn wait_join_outcome(&self) -> WaitJoinOutcome {
        if self.status != ClusterStatus::WaitForJoin || !self.join_finished {
            return WaitJoinOutcome::Stay;
        }
        let entry = self.epoch_log.read(self.epoch);
        if entry.is_empty() {
            return WaitJoinOutcome::Stay;
        }
        let need = self.registry.len();
        let have = entry.len();
        let gone = self.leave_list.len();

        if need == have && entry.iter().all(|n| self.registry.contains(&n.id)) {
            return WaitJoinOutcome::Ready;
        }
        if have == need + gone {
            return WaitJoinOutcome::ReadyIncEpoch(self.epoch + 1);
        }
        WaitJoinOutcome::Stay
    }

    /// Rebuilds and republishes the admission view. Called by the event
    /// serializer after every applied event.
    pub fn republish_admission(&self) {
        self.published.set_admission(AdmissionView {
            status: self.status,
            ctime: self.info.ctime,
            epoch: self.epoch,
            nr_copies: self.info.nr_copies,
            cluster_flags: self.info.cluster_flags,
            store: self.info.store.clone(),
            nodes: self.registry.to_vec(),
            leave_nodes: self.leave_list.to_vec(),
            last_entry: self.epoch_log.read(self.epoch),
        });
    }

    /// The join request this node sends when proposing itself: its durable
    /// history (epoch, ctime, and the membership cached at that epoch), or
    /// a fresh claim when it has none.
    pub fn join_request(&self) -> JoinMessage {
        JoinMessage {
            nr_copies: self.info.nr_copies,
            cluster_flags: self.info.cluster_flags,
            cluster_status: self.status,
            epoch: self.epoch,
            ctime: self.info.ctime,
            result: crate::core::cluster::admission::result_code::SUCCESS,
            inc_epoch: false,
            store: self.info.store.clone(),
            nodes: if self.epoch > 0 {
                self.epoch_log.read(self.epoch)
            } else {
                Vec::new()
            },
            leave_nodes: Vec::new(),
        }
    }

    pub fn persist_info(&self) -> Result<(), FlockError> {
        self.info.save(&self.base_dir)
    }

    /// The FORMAT main step, identical on every node: adopt the cluster
    /// identity chosen by the originator and commit epoch 1 with the
    /// members present at format time.
    pub fn format(
        &mut self,
        ctime: u64,
        nr_copies: u8,
        cluster_flags: u16,
        store: String,
    ) -> Result<(), FlockError> {
        if self.status != ClusterStatus::WaitForFormat {
            return Err(FlockError::InvalidState(format!(
                "cannot format a cluster in {}",
                self.status
            )));
        }
        self.info = ClusterInfo {
            ctime,
            nr_copies,
            cluster_flags,
            store,
        };
        self.persist_info()?;
        let members = self.registry.to_vec();
        self.epoch_log.append(1, &members)?;
        self.set_epoch(1);
        self.leave_list.clear();
        self.join_finished = true;
        self.set_status(ClusterStatus::Ok);
        info!(
            "Cluster formatted: {} nodes, {} copies, store '{}'",
            members.len(),
            nr_copies,
            self.info.store
        );
        Ok(())
    }
}
