// src/core/cluster/events.rs

//! The event serializer: a single task that owns all mutable cluster
//! state and applies driver callbacks one at a time, gated on outstanding
//! I/O. Each event runs phase A (may suspend, copied-in inputs only) on a
//! worker and phase B (synchronous state transition) on the owner task.

use crate::core::FlockError;
use crate::core::cluster::admission::JoinVerdict;
use crate::core::cluster::driver::{DriverEvent, GroupDriver};
use crate::core::cluster::node::{self, Node};
use crate::core::cluster::ops::{self, OpRequest, PendingOp, PendingQueue};
use crate::core::cluster::payload::{JoinMessage, NotifyMessage};
use crate::core::cluster::peer::PeerClient;
use crate::core::cluster::state::{ClusterCtx, ClusterInfo, ClusterStatus, WaitJoinOutcome};
use crate::core::recovery::RecoveryHandle;
use crate::core::store::{ObjectStore, VdiBitmap};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};

/// Counts I/O dispatched under the published snapshot. The serializer
/// applies no event while any such I/O is outstanding, so an event can
/// never reorder with requests placed against the outgoing snapshot.
#[derive(Debug, Default)]
pub struct IoGate {
    outstanding: AtomicUsize,
    idle: Notify,
}

impl IoGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks one I/O in flight; drop the guard when it resolves.
    pub fn enter(self: &Arc<Self>) -> IoGuard {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        IoGuard { gate: self.clone() }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Waits until no I/O is outstanding.
    pub async fn quiesce(&self) {
        loop {
            let idle = self.idle.notified();
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }
}

#[derive(Debug)]
pub struct IoGuard {
    gate: Arc<IoGate>,
}

impl Drop for IoGuard {
    fn drop(&mut self) {
        if self.gate.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.gate.idle.notify_waiters();
        }
    }
}

/// Phase A of a join: merge in-use VDI bitmaps from the given peers.
/// Failures are logged and ignored; the join proceeds regardless.
async fn fetch_bitmaps(
    peers: Arc<dyn PeerClient>,
    targets: Vec<Node>,
    one_suffices: bool,
) -> Option<VdiBitmap> {
    if one_suffices {
        for target in &targets {
            match peers.fetch_vdi_bitmap(target).await {
                Ok(bitmap) => return Some(bitmap),
                Err(e) => warn!("VDI bitmap fetch from {} failed: {}", target, e),
            }
        }
        return None;
    }

    let results =
        futures::future::join_all(targets.iter().map(|t| peers.fetch_vdi_bitmap(t))).await;
    let mut merged: Option<VdiBitmap> = None;
    for (target, result) in targets.iter().zip(results) {
        match result {
            Ok(bitmap) => merged.get_or_insert_with(VdiBitmap::new).or_with(&bitmap),
            Err(e) => warn!("VDI bitmap fetch from {} failed: {}", target, e),
        }
    }
    merged
}

/// Phase A of a leave: count reachable peers among `targets`.
async fn probe_peers(peers: Arc<dyn PeerClient>, targets: Vec<Node>) -> usize {
    let results = futures::future::join_all(targets.iter().map(|t| peers.probe(t))).await;
    results.into_iter().filter(|ok| *ok).count()
}

/// The single-threaded event pump. Owns `ClusterCtx`; every membership
/// transition in the daemon happens inside `run`.
pub struct EventSerializer {
    ctx: ClusterCtx,
    driver: Arc<dyn GroupDriver>,
    peers: Arc<dyn PeerClient>,
    store: Arc<dyn ObjectStore>,
    recovery: RecoveryHandle,
    gate: Arc<IoGate>,
    events: mpsc::UnboundedReceiver<DriverEvent>,
    requests: mpsc::UnboundedReceiver<OpRequest>,
    requests_open: bool,
    pending: PendingQueue,
}

impl EventSerializer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: ClusterCtx,
        driver: Arc<dyn GroupDriver>,
        peers: Arc<dyn PeerClient>,
        store: Arc<dyn ObjectStore>,
        recovery: RecoveryHandle,
        gate: Arc<IoGate>,
        events: mpsc::UnboundedReceiver<DriverEvent>,
        requests: mpsc::UnboundedReceiver<OpRequest>,
    ) -> Self {
        ctx.republish_admission();
        Self {
            ctx,
            driver,
            peers,
            store,
            recovery,
            gate,
            events,
            requests,
            requests_open: true,
            pending: PendingQueue::default(),
        }
    }

    /// Runs until the cluster shuts down or the driver goes away. An `Err`
    /// is a self-demotion: the caller must tear the daemon down instead of
    /// continuing in an incoherent state.
    pub async fn run(mut self) -> Result<(), FlockError> {
        loop {
            tokio::select! {
                biased;
                maybe_ev = self.events.recv() => {
                    let Some(event) = maybe_ev else {
                        info!("Group driver closed the event channel; serializer stopping");
                        return Ok(());
                    };
                    // No event starts while I/O placed against the
                    // current snapshot is still in flight.
                    self.gate.quiesce().await;
                    let applied = self.apply(event).await;
                    self.ctx.republish_admission();
                    applied?;
                    if self.ctx.status == ClusterStatus::Shutdown && self.pending.is_empty() {
                        info!("Cluster shutdown: outstanding work drained");
                        return Ok(());
                    }
                }
                maybe_req = self.requests.recv(), if self.requests_open => {
                    match maybe_req {
                        Some(request) => self.submit(request).await,
                        None => self.requests_open = false,
                    }
                }
            }
        }
    }

    async fn apply(&mut self, event: DriverEvent) -> Result<(), FlockError> {
        match event {
            DriverEvent::Join {
                joined,
                members,
                request,
                response,
            } => self.on_join(joined, members, request, response).await,
            DriverEvent::Leave { left, members } => self.on_leave(left, members).await,
            DriverEvent::Notify { sender, payload } => self.on_notify(sender, payload),
            DriverEvent::Block => {
                self.on_block();
                Ok(())
            }
        }
    }

    // --- JOIN -----------------------------------------------------------

    async fn on_join(
        &mut self,
        joined: Node,
        members: Vec<Node>,
        request: JoinMessage,
        response: JoinMessage,
    ) -> Result<(), FlockError> {
        let verdict = response.verdict()?;
        let is_self = joined.id == self.ctx.me.id;

        match verdict {
            JoinVerdict::Fail(err) => {
                if is_self {
                    error!("Cluster rejected our join: {}", err);
                    return Err(FlockError::JoinRejected(err));
                }
                warn!("Join of {} rejected: {}", joined, err);
                return Ok(());
            }
            JoinVerdict::JoinLater => {
                if is_self {
                    error!("Cluster deferred our join; leaving for a clean restart");
                    return Err(FlockError::JoinDeferred);
                }
                info!("Join of {} deferred until the cluster is working", joined);
                return Ok(());
            }
            JoinVerdict::MasterTransfer => {
                return self.on_master_transfer(joined, members, request, response);
            }
            JoinVerdict::Success => {}
        }

        // Rejoin detection must look at the pre-adoption state.
        let was_rejoin = is_self && self.ctx.epoch_log.latest() > 0;

        // Phase A: merge in-use VDI bitmaps. The joiner learns from every
        // pre-existing member; members learn from the joiner.
        let fetch_from: Vec<Node> = if is_self {
            members
                .iter()
                .filter(|n| n.id != self.ctx.me.id)
                .copied()
                .collect()
        } else {
            vec![joined]
        };
        if !fetch_from.is_empty() {
            let peers = self.peers.clone();
            let one_suffices = self.ctx.status == ClusterStatus::WaitForFormat;
            match tokio::spawn(fetch_bitmaps(peers, fetch_from, one_suffices)).await {
                Ok(Some(merged)) => self.ctx.vdi_bitmap.or_with(&merged),
                Ok(None) => debug!("No VDI bitmap merged for join of {}", joined),
                Err(e) => warn!("VDI bitmap task for join of {} failed: {}", joined, e),
            }
        }

        // Phase B.
        if is_self && !self.ctx.join_finished {
            self.adopt_cluster(&response)?;
        }

        // The record for the epoch we are joining at must exist, excluding
        // the joiner itself.
        if self.ctx.epoch > 0 && self.ctx.epoch_log.read(self.ctx.epoch).is_empty() {
            let previous = node::without_node(&members, &joined.id);
            self.ctx.epoch_log.append(self.ctx.epoch, &previous)?;
        }

        self.ctx.install_members(members);
        if is_self {
            self.ctx.join_finished = true;
        }

        if self.ctx.status.accepts_recovery() && response.inc_epoch {
            self.ctx.leave_list.clear();
            let new_epoch = self.ctx.epoch + 1;
            let committed = self.ctx.registry.to_vec();
            self.ctx.epoch_log.append(new_epoch, &committed)?;
            self.ctx.set_epoch(new_epoch);
            if was_rejoin {
                if let Err(e) = self.store.purge_stale_objects() {
                    warn!("Stale-object purge after rejoin failed: {}", e);
                }
            }
            self.recovery.start_recovery(new_epoch);
            self.ctx.maybe_resume();
        }

        self.settle_wait_join()
    }

    /// Materializes this node's join parameters from the cluster's
    /// response: creation time, redundancy, store kind, epoch, status,
    /// and the departures the cluster is still accounting for.
    fn adopt_cluster(&mut self, response: &JoinMessage) -> Result<(), FlockError> {
        let info = ClusterInfo {
            ctime: response.ctime,
            nr_copies: response.nr_copies,
            cluster_flags: response.cluster_flags,
            store: response.store.clone(),
        };
        if self.ctx.info != info {
            self.ctx.info = info;
            self.ctx.persist_info()?;
        }
        if response.epoch != self.ctx.epoch {
            self.ctx.set_epoch(response.epoch);
        }
        self.ctx.set_status(response.cluster_status);
        self.ctx.leave_list.clear();
        for gone in &response.leave_nodes {
            self.ctx.add_leave(*gone);
        }
        Ok(())
    }

    /// The receiving side of a mastership transfer: the joiner's history
    /// is ahead, so every node (the joiner included) commits its epoch and
    /// membership record and adopts the derived leave list.
    fn on_master_transfer(
        &mut self,
        joined: Node,
        members: Vec<Node>,
        request: JoinMessage,
        response: JoinMessage,
    ) -> Result<(), FlockError> {
        info!(
            "Mastership transferred to {} at epoch {}",
            joined, request.epoch
        );

        if !request.nodes.is_empty() && self.ctx.epoch_log.read(request.epoch).is_empty() {
            self.ctx.epoch_log.append(request.epoch, &request.nodes)?;
        }
        let info = ClusterInfo {
            ctime: request.ctime,
            nr_copies: request.nr_copies,
            cluster_flags: request.cluster_flags,
            store: request.store.clone(),
        };
        if self.ctx.info != info {
            self.ctx.info = info;
            self.ctx.persist_info()?;
        }
        self.ctx.set_epoch(request.epoch);
        self.ctx.install_members(members);
        self.ctx.leave_list.clear();
        for gone in &response.leave_nodes {
            self.ctx.add_leave(*gone);
        }
        self.ctx.set_status(ClusterStatus::WaitForJoin);
        self.ctx.join_finished = true;

        self.settle_wait_join()
    }

    /// Reevaluates a waiting cluster after a membership event and applies
    /// the transition the admission logic advised.
    fn settle_wait_join(&mut self) -> Result<(), FlockError> {
        match self.ctx.wait_join_outcome() {
            WaitJoinOutcome::Stay => {}
            WaitJoinOutcome::Ready => {
                self.ctx.leave_list.clear();
                self.ctx.set_status(ClusterStatus::Ok);
                info!(
                    "All members of epoch {} reconstituted; cluster running",
                    self.ctx.epoch
                );
            }
            WaitJoinOutcome::ReadyIncEpoch(new_epoch) => {
                let committed = self.ctx.registry.to_vec();
                self.ctx.leave_list.clear();
                self.ctx.epoch_log.append(new_epoch, &committed)?;
                self.ctx.set_epoch(new_epoch);
                self.ctx.set_status(ClusterStatus::Ok);
                self.recovery.start_recovery(new_epoch);
                info!(
                    "Missing members written off; cluster running at epoch {}",
                    new_epoch
                );
            }
        }
        Ok(())
    }

    // --- LEAVE ----------------------------------------------------------

    async fn on_leave(&mut self, left: Node, members: Vec<Node>) -> Result<(), FlockError> {
        info!("Node {} left the cluster", left);

        // Phase A: before committing the departure, verify this node still
        // sits on the majority side. Probing targets are copied out of the
        // registry; the probe task touches no shared state.
        let current = self.ctx.registry.to_vec();
        let total = current.len();
        if total >= 3 {
            let me = self.ctx.me.id;
            let targets: Vec<Node> = current.into_iter().filter(|m| m.id != me).collect();
            let peers = self.peers.clone();
            let reachable = 1 + tokio::spawn(probe_peers(peers, targets))
                .await
                .unwrap_or(0);
            let majority = total / 2 + 1;
            if reachable < majority {
                error!(
                    "Only {}/{} members reachable; suspected partition, demoting instead of diverging",
                    reachable, total
                );
                return Err(FlockError::MajorityLost {
                    reachable,
                    total,
                });
            }
        }

        // Phase B.
        self.ctx.install_members(members);
        if self.ctx.status.accepts_recovery() {
            let new_epoch = self.ctx.epoch + 1;
            let committed = self.ctx.registry.to_vec();
            self.ctx.epoch_log.append(new_epoch, &committed)?;
            self.ctx.set_epoch(new_epoch);
            self.ctx.maybe_halt();
            self.recovery.start_recovery(new_epoch);
        } else {
            // No quorum to commit the departure yet; carry it on the
            // leave list until the next OK accounts for it.
            self.ctx.add_leave(left);
        }
        Ok(())
    }

    // --- NOTIFY and cluster-wide operations -----------------------------

    fn on_notify(&mut self, sender: Node, payload: Bytes) -> Result<(), FlockError> {
        let message = match NotifyMessage::decode(&payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("Dropping undecodable notify from {}: {}", sender, e);
                return Ok(());
            }
        };

        let outcome = self.process_main(&message);
        if let Err(e) = &outcome {
            error!(
                "Main step of op 0x{:02x} failed locally: {}",
                message.req.opcode, e
            );
        }

        if sender.id == self.ctx.me.id {
            match self.pending.pop_if(message.req.opcode) {
                Some(entry) => {
                    let _ = entry
                        .responder
                        .send(outcome.map(|_| message.rsp.result));
                }
                None => warn!(
                    "Notify for op 0x{:02x} does not match our pending head",
                    message.req.opcode
                ),
            }
        }
        Ok(())
    }

    /// Runs the main-processing step an operation carries, identically on
    /// every node.
    fn process_main(&mut self, message: &NotifyMessage) -> Result<(), FlockError> {
        match message.req.opcode {
            ops::OP_FORMAT => {
                let (ctime, nr_copies, cluster_flags, store) =
                    ops::decode_format_body(&message.body)?;
                self.store.init(self.ctx.base_dir())?;
                self.ctx.format(ctime, nr_copies, cluster_flags, store)
            }
            ops::OP_SHUTDOWN => {
                self.ctx.set_status(ClusterStatus::Shutdown);
                Ok(())
            }
            other => {
                warn!("Ignoring notify with unknown opcode 0x{:02x}", other);
                Ok(())
            }
        }
    }

    async fn submit(&mut self, request: OpRequest) {
        if self.ctx.status == ClusterStatus::Shutdown {
            let _ = request.responder.send(Err(FlockError::InvalidState(
                "cluster is shutting down".into(),
            )));
            return;
        }

        let OpRequest { op, responder } = request;
        if op.is_blocked() {
            self.pending.push(PendingOp {
                op,
                broadcast: false,
                responder,
            });
            if let Err(e) = self.driver.block().await {
                if let Some(entry) = self.pending.pop() {
                    let _ = entry.responder.send(Err(e));
                }
            }
        } else {
            let payload = match ops::encode_direct(&op, self.ctx.epoch) {
                Ok(p) => p,
                Err(e) => {
                    let _ = responder.send(Err(e));
                    return;
                }
            };
            self.pending.push(PendingOp {
                op,
                broadcast: true,
                responder,
            });
            if let Err(e) = self.driver.notify(payload).await {
                if let Some(entry) = self.pending.pop() {
                    let _ = entry.responder.send(Err(e));
                }
            }
        }
    }

    /// This node holds the cluster-wide critical section: run the pending
    /// blocked op's pre-compute off the serializer and rebroadcast the
    /// result through `unblock`.
    fn on_block(&mut self) {
        let epoch = self.ctx.epoch;
        let Some(entry) = self.pending.next_blocked() else {
            warn!("Driver granted a critical section we no longer want");
            return;
        };
        entry.broadcast = true;
        let op = entry.op.clone();
        let driver = self.driver.clone();
        tokio::spawn(async move {
            match ops::precompute(&op, epoch) {
                Ok(payload) => {
                    if let Err(e) = driver.unblock(payload).await {
                        error!("Unblock of op 0x{:02x} failed: {}", op.opcode(), e);
                    }
                }
                Err(e) => error!("Pre-compute of op 0x{:02x} failed: {}", op.opcode(), e),
            }
        });
    }
}
