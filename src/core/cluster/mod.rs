// src/core/cluster/mod.rs

//! Cluster membership and coordination: the epoch log, the vnode
//! snapshot, join admission, the event serializer, cluster-wide
//! operations, and the group-driver seam.

pub mod admission;
pub mod driver;
pub mod epoch_log;
pub mod events;
pub mod local;
pub mod node;
pub mod ops;
pub mod payload;
pub mod peer;
pub mod state;
pub mod vnodes;

// Re-export key types for easier access from other modules.
pub use driver::{DriverEvent, GroupDriver};
pub use node::{Node, NodeId};
pub use state::{ClusterCtx, ClusterStatus, PublishedView};
