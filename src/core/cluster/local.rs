// src/core/cluster/local.rs

//! The in-process group driver: a shared sequencer that commits join,
//! leave, notify, and block/unblock in one total order across every node
//! registered in the process. Suitable for single-host clusters and for
//! the end-to-end scenario tests; a corosync-like driver plugs into the
//! same `GroupDriver` seam for multi-host deployments.

use crate::core::FlockError;
use crate::core::cluster::admission::{self, JoinDecision, JoinVerdict};
use crate::core::cluster::driver::{DriverEvent, GroupDriver};
use crate::core::cluster::node::{self, Node, NodeId};
use crate::core::cluster::payload::JoinMessage;
use crate::core::cluster::state::PublishedView;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct MemberSlot {
    node: Node,
    view: Arc<PublishedView>,
    events: mpsc::UnboundedSender<DriverEvent>,
}

#[derive(Default)]
struct NetInner {
    /// Every node registered with the sequencer, member or not.
    slots: Vec<MemberSlot>,
    /// Identities of committed members, insertion-ordered.
    members: Vec<NodeId>,
    /// Requesters of the cluster-wide critical section; the head holds it.
    block_queue: Vec<NodeId>,
}

impl NetInner {
    fn slot(&self, id: &NodeId) -> Option<&MemberSlot> {
        self.slots.iter().find(|s| &s.node.id == id)
    }

    fn member_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .members
            .iter()
            .filter_map(|id| self.slot(id).map(|s| s.node))
            .collect();
        node::sort_nodes(&mut nodes);
        nodes
    }

    fn deliver(&self, id: &NodeId, event: DriverEvent) {
        if let Some(slot) = self.slot(id) {
            // A dead receiver just misses the event; its membership is
            // handled through leave.
            let _ = slot.events.send(event);
        }
    }

    fn grant_block_head(&self) {
        if let Some(head) = self.block_queue.first() {
            self.deliver(head, DriverEvent::Block);
        }
    }
}

/// The shared sequencer. All deliveries happen under one lock, so every
/// node's event FIFO observes the same order.
#[derive(Default)]
pub struct LocalNet {
    inner: Mutex<NetInner>,
}

impl LocalNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a node and returns its driver handle. The node's
    /// published view is how the sequencer runs admission without touching
    /// serializer-owned state.
    pub fn register(
        self: &Arc<Self>,
        node: Node,
        view: Arc<PublishedView>,
        events: mpsc::UnboundedSender<DriverEvent>,
    ) -> LocalDriver {
        let mut inner = self.inner.lock();
        inner.slots.retain(|s| s.node.id != node.id);
        inner.slots.push(MemberSlot { node, view, events });
        LocalDriver {
            net: self.clone(),
            me: node.id,
        }
    }

    /// Simulates an abrupt member failure: the sequencer detects the loss
    /// and delivers leave to the survivors, exactly as a graceful leave.
    pub fn kill(&self, id: &NodeId) {
        self.depart(id);
    }

    fn depart(&self, id: &NodeId) {
        let mut inner = self.inner.lock();
        let Some(position) = inner.members.iter().position(|m| m == id) else {
            return;
        };
        let left = inner.slot(id).map(|s| s.node);
        inner.members.remove(position);

        // A departing holder of the critical section forfeits it.
        let was_head = inner.block_queue.first() == Some(id);
        inner.block_queue.retain(|b| b != id);

        if let Some(left) = left {
            let members = inner.member_nodes();
            for member in inner.members.clone() {
                inner.deliver(
                    &member,
                    DriverEvent::Leave {
                        left,
                        members: members.clone(),
                    },
                );
            }
        }
        if was_head {
            inner.grant_block_head();
        }
    }

    fn propose_join(&self, id: &NodeId, payload: &Bytes) -> Result<(), FlockError> {
        let request = JoinMessage::decode(payload)?;
        let mut inner = self.inner.lock();
        let joiner = inner
            .slot(id)
            .map(|s| s.node)
            .ok_or_else(|| FlockError::Driver(format!("joining node {id} is not registered")))?;
        if inner.members.contains(id) {
            return Err(FlockError::Driver(format!("{id} is already a member")));
        }

        let (decision, response) = if inner.members.is_empty() {
            // Bootstrap: the first node is its own master and admits
            // itself with its own durable state.
            let view = inner.slot(id).unwrap().view.admission();
            let decision = JoinDecision {
                verdict: JoinVerdict::Success,
                inc_epoch: false,
                next_status: None,
            };
            let response = admission::build_join_response(&view, &joiner, &request, &decision);
            (decision, response)
        } else {
            // Admission runs on every existing member; total ordering of
            // prior events makes their views, and so their verdicts,
            // identical. The first member acts as master for the response.
            let mut decisions: Vec<JoinDecision> = Vec::new();
            for member in &inner.members {
                let view = inner.slot(member).unwrap().view.admission();
                decisions.push(admission::check_join(&view, &joiner, &request));
            }
            let master_decision = decisions[0];
            if decisions.iter().any(|d| *d != master_decision) {
                warn!("Join admission disagreed across members; using the master's verdict");
            }
            let master_view = inner.slot(&inner.members[0]).unwrap().view.admission();
            let response =
                admission::build_join_response(&master_view, &joiner, &request, &master_decision);
            (master_decision, response)
        };

        let committed = matches!(
            decision.verdict,
            JoinVerdict::Success | JoinVerdict::MasterTransfer
        );
        if committed {
            inner.members.push(*id);
        }
        debug!(
            "Join proposal from {}: {:?} (committed: {})",
            joiner, decision.verdict, committed
        );

        let members = inner.member_nodes();
        let mut recipients = inner.members.clone();
        if !committed {
            // The rejected joiner still hears its verdict.
            recipients.push(*id);
        }
        for recipient in recipients {
            inner.deliver(
                &recipient,
                DriverEvent::Join {
                    joined: joiner,
                    members: members.clone(),
                    request: request.clone(),
                    response: response.clone(),
                },
            );
        }
        Ok(())
    }

    fn broadcast(&self, sender_id: &NodeId, payload: Bytes) -> Result<(), FlockError> {
        let inner = self.inner.lock();
        let sender = inner
            .slot(sender_id)
            .map(|s| s.node)
            .ok_or_else(|| FlockError::Driver(format!("{sender_id} is not registered")))?;
        for member in &inner.members {
            inner.deliver(
                member,
                DriverEvent::Notify {
                    sender,
                    payload: payload.clone(),
                },
            );
        }
        Ok(())
    }
}

/// One node's handle onto the shared sequencer.
#[derive(Clone)]
pub struct LocalDriver {
    net: Arc<LocalNet>,
    me: NodeId,
}

#[async_trait]
impl GroupDriver for LocalDriver {
    async fn join(&self, me: Node, payload: Bytes) -> Result<(), FlockError> {
        debug_assert_eq!(me.id, self.me);
        self.net.propose_join(&self.me, &payload)
    }

    async fn leave(&self) -> Result<(), FlockError> {
        self.net.depart(&self.me);
        Ok(())
    }

    async fn notify(&self, payload: Bytes) -> Result<(), FlockError> {
        self.net.broadcast(&self.me, payload)
    }

    async fn block(&self) -> Result<(), FlockError> {
        let mut inner = self.net.inner.lock();
        inner.block_queue.push(self.me);
        if inner.block_queue.len() == 1 {
            inner.grant_block_head();
        }
        Ok(())
    }

    async fn unblock(&self, payload: Bytes) -> Result<(), FlockError> {
        // Pop, rebroadcast, and hand-off happen under one lock so no other
        // requester can squeeze in between and be granted twice.
        let mut inner = self.net.inner.lock();
        if inner.block_queue.first() != Some(&self.me) {
            return Err(FlockError::Driver(
                "unblock without holding the critical section".into(),
            ));
        }
        inner.block_queue.remove(0);
        let sender = inner
            .slot(&self.me)
            .map(|s| s.node)
            .ok_or_else(|| FlockError::Driver(format!("{} is not registered", self.me)))?;
        for member in &inner.members {
            inner.deliver(
                member,
                DriverEvent::Notify {
                    sender,
                    payload: payload.clone(),
                },
            );
        }
        inner.grant_block_head();
        Ok(())
    }
}
