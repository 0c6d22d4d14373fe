// src/core/cluster/admission.rs

//! Join admission: sanity-checks a joiner's claimed history against local
//! truth and decides accept / reject / defer / transfer-mastership.
//!
//! `check_join` is a pure function over an `AdmissionView`, so every
//! member evaluating the same totally-ordered join proposal reaches the
//! same verdict.

use crate::core::FlockError;
use crate::core::cluster::node::Node;
use crate::core::cluster::payload::JoinMessage;
use crate::core::cluster::state::{AdmissionView, ClusterStatus};
use thiserror::Error;
use tracing::debug;

/// Wire values of the `result` field in the join message.
pub mod result_code {
    pub const SUCCESS: u32 = 0x00;
    pub const JOIN_LATER: u32 = 0x01;
    pub const MASTER_TRANSFER: u32 = 0x02;
    pub const INVALID_CTIME: u32 = 0x10;
    pub const OLD_NODE_VER: u32 = 0x11;
    pub const NEW_NODE_VER: u32 = 0x12;
    pub const INVALID_EPOCH: u32 = 0x13;
    pub const NOT_FORMATTED: u32 = 0x14;
    pub const SHUTDOWN: u32 = 0x15;
    pub const VER_MISMATCH: u32 = 0x16;
}

/// Why a join was rejected. Reported to the joiner, never retried by the
/// cluster side.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    #[error("cluster creation time does not match")]
    InvalidCtime,
    #[error("local node is behind the joiner's epoch")]
    OldNodeVer,
    #[error("joiner's epoch is behind the cluster")]
    NewNodeVer,
    #[error("joiner's membership disagrees with the epoch log")]
    InvalidEpoch,
    #[error("cluster is not formatted")]
    NotFormatted,
    #[error("cluster is shutting down")]
    Shutdown,
    #[error("incompatible protocol version")]
    VerMismatch,
}

/// The admission verdict carried in the join response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinVerdict {
    Success,
    Fail(JoinError),
    /// The joiner must wait until the cluster starts working.
    JoinLater,
    /// The joiner's history is ahead; the receiving side adopts its epoch
    /// and leave list and the joiner becomes the authoritative master.
    MasterTransfer,
}

impl JoinVerdict {
    pub fn to_wire(self) -> u32 {
        use result_code::*;
        match self {
            JoinVerdict::Success => SUCCESS,
            JoinVerdict::JoinLater => JOIN_LATER,
            JoinVerdict::MasterTransfer => MASTER_TRANSFER,
            JoinVerdict::Fail(JoinError::InvalidCtime) => INVALID_CTIME,
            JoinVerdict::Fail(JoinError::OldNodeVer) => OLD_NODE_VER,
            JoinVerdict::Fail(JoinError::NewNodeVer) => NEW_NODE_VER,
            JoinVerdict::Fail(JoinError::InvalidEpoch) => INVALID_EPOCH,
            JoinVerdict::Fail(JoinError::NotFormatted) => NOT_FORMATTED,
            JoinVerdict::Fail(JoinError::Shutdown) => SHUTDOWN,
            JoinVerdict::Fail(JoinError::VerMismatch) => VER_MISMATCH,
        }
    }

    pub fn from_wire(raw: u32) -> Result<Self, FlockError> {
        use result_code::*;
        Ok(match raw {
            SUCCESS => JoinVerdict::Success,
            JOIN_LATER => JoinVerdict::JoinLater,
            MASTER_TRANSFER => JoinVerdict::MasterTransfer,
            INVALID_CTIME => JoinVerdict::Fail(JoinError::InvalidCtime),
            OLD_NODE_VER => JoinVerdict::Fail(JoinError::OldNodeVer),
            NEW_NODE_VER => JoinVerdict::Fail(JoinError::NewNodeVer),
            INVALID_EPOCH => JoinVerdict::Fail(JoinError::InvalidEpoch),
            NOT_FORMATTED => JoinVerdict::Fail(JoinError::NotFormatted),
            SHUTDOWN => JoinVerdict::Fail(JoinError::Shutdown),
            VER_MISMATCH => JoinVerdict::Fail(JoinError::VerMismatch),
            other => {
                return Err(FlockError::MalformedMessage(format!(
                    "unknown join result 0x{other:08x}"
                )));
            }
        })
    }
}

/// Verdict plus the side effects the applying side must honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinDecision {
    pub verdict: JoinVerdict,
    /// The epoch advances when the join commits.
    pub inc_epoch: bool,
    /// Post-state advised by the admission logic, if it differs from the
    /// current one.
    pub next_status: Option<ClusterStatus>,
}

impl JoinDecision {
    fn fail(err: JoinError) -> Self {
        Self {
            verdict: JoinVerdict::Fail(err),
            inc_epoch: false,
            next_status: None,
        }
    }
}

fn history_check(view: &AdmissionView, msg: &JoinMessage) -> Result<(), JoinError> {
    // A cluster that was never formatted, or one already tearing down, has
    // no history to defend.
    if matches!(
        view.status,
        ClusterStatus::WaitForFormat | ClusterStatus::Shutdown
    ) {
        return Ok(());
    }
    // A fresh node has nothing to check either.
    if msg.nodes.is_empty() {
        return Ok(());
    }
    if msg.ctime != view.ctime {
        return Err(JoinError::InvalidCtime);
    }
    if msg.epoch > view.epoch {
        return Err(JoinError::OldNodeVer);
    }
    // A halted cluster takes any compatible prior member back: a
    // returning replica holder is what restores redundancy, and recovery
    // reconciles its objects.
    if view.status == ClusterStatus::Halt {
        return Ok(());
    }
    if msg.epoch < view.epoch {
        return Err(JoinError::NewNodeVer);
    }
    if msg.nodes != view.last_entry {
        return Err(JoinError::InvalidEpoch);
    }
    Ok(())
}

/// Evaluates a join proposal. Deterministic: the same view, joiner, and
/// claim always produce the same decision.
pub fn check_join(view: &AdmissionView, joiner: &Node, msg: &JoinMessage) -> JoinDecision {
    if let Err(err) = history_check(view, msg) {
        // A joiner ahead of a waiting cluster is not wrong, we are: hand
        // it mastership instead of rejecting it.
        if err == JoinError::OldNodeVer && view.status == ClusterStatus::WaitForJoin {
            debug!("Joiner {} is ahead (epoch {} > {}); transferring mastership", joiner, msg.epoch, view.epoch);
            return JoinDecision {
                verdict: JoinVerdict::MasterTransfer,
                inc_epoch: false,
                next_status: None,
            };
        }
        return JoinDecision::fail(err);
    }

    match view.status {
        ClusterStatus::Ok | ClusterStatus::Halt => JoinDecision {
            verdict: JoinVerdict::Success,
            inc_epoch: true,
            next_status: None,
        },
        ClusterStatus::Shutdown => JoinDecision {
            verdict: JoinVerdict::Success,
            inc_epoch: false,
            next_status: None,
        },
        ClusterStatus::WaitForFormat => {
            if !msg.nodes.is_empty() {
                JoinDecision::fail(JoinError::NotFormatted)
            } else {
                JoinDecision {
                    verdict: JoinVerdict::Success,
                    inc_epoch: false,
                    next_status: None,
                }
            }
        }
        ClusterStatus::WaitForJoin => {
            // A fresh node cannot help reconstitute the logged membership;
            // it retries once the cluster is working.
            if msg.nodes.is_empty() {
                return JoinDecision {
                    verdict: JoinVerdict::JoinLater,
                    inc_epoch: false,
                    next_status: None,
                };
            }
            let need = view.nodes.len() + 1;
            let have = view.last_entry.len();
            let gone = view.leave_nodes.len();

            let accounted = view
                .last_entry
                .iter()
                .all(|n| n.id == joiner.id || view.nodes.iter().any(|m| m.id == n.id));
            if need == have && accounted {
                JoinDecision {
                    verdict: JoinVerdict::Success,
                    inc_epoch: false,
                    next_status: Some(ClusterStatus::Ok),
                }
            } else if have == need + gone {
                // The unaccounted members are permanently lost; run
                // without them under a new epoch.
                JoinDecision {
                    verdict: JoinVerdict::Success,
                    inc_epoch: true,
                    next_status: Some(ClusterStatus::Ok),
                }
            } else {
                JoinDecision {
                    verdict: JoinVerdict::Success,
                    inc_epoch: false,
                    next_status: None,
                }
            }
        }
    }
}

/// Builds the join response broadcast with the committed proposal. For a
/// mastership transfer the response carries the joiner's epoch and the
/// leave list derived from its claimed membership; otherwise it carries
/// the local cluster identity and the current leave list for the joiner
/// to adopt.
pub fn build_join_response(
    view: &AdmissionView,
    joiner: &Node,
    request: &JoinMessage,
    decision: &JoinDecision,
) -> JoinMessage {
    if decision.verdict == JoinVerdict::MasterTransfer {
        let leave_nodes: Vec<Node> = request
            .nodes
            .iter()
            .filter(|n| n.id != joiner.id && !view.nodes.iter().any(|m| m.id == n.id))
            .copied()
            .collect();
        return JoinMessage {
            nr_copies: request.nr_copies,
            cluster_flags: request.cluster_flags,
            cluster_status: view.status,
            epoch: request.epoch,
            ctime: view.ctime,
            result: decision.verdict.to_wire(),
            inc_epoch: false,
            store: request.store.clone(),
            nodes: Vec::new(),
            leave_nodes,
        };
    }

    JoinMessage {
        nr_copies: view.nr_copies,
        cluster_flags: view.cluster_flags,
        cluster_status: view.status,
        epoch: view.epoch,
        ctime: view.ctime,
        result: decision.verdict.to_wire(),
        inc_epoch: decision.inc_epoch,
        store: view.store.clone(),
        nodes: Vec::new(),
        leave_nodes: view.leave_nodes.clone(),
    }
}
