// src/core/cluster/driver.rs

//! The group-communication driver contract: any totally-ordered broadcast
//! that commits membership proposals and delivers the callbacks below in a
//! consistent order on every node can drive this core.

use crate::core::FlockError;
use crate::core::cluster::node::Node;
use crate::core::cluster::payload::JoinMessage;
use async_trait::async_trait;
use bytes::Bytes;

/// Callbacks from the driver, delivered in total order onto the core's
/// event FIFO. Payload bytes cross the driver bit-exact.
#[derive(Debug)]
pub enum DriverEvent {
    /// A join proposal ran admission on every existing member and was
    /// committed (or rejected). `members` is the resulting membership;
    /// `request` is the joiner's claim and `response` the admission
    /// response broadcast with it.
    Join {
        joined: Node,
        members: Vec<Node>,
        request: JoinMessage,
        response: JoinMessage,
    },
    /// A member departed (gracefully or by failure detection).
    Leave { left: Node, members: Vec<Node> },
    /// A totally-ordered broadcast payload.
    Notify { sender: Node, payload: Bytes },
    /// This node holds the cluster-wide critical section requested by
    /// `block()`; it must run its pre-compute and call `unblock()`.
    Block,
}

/// Operations the core invokes on the driver.
#[async_trait]
pub trait GroupDriver: Send + Sync + 'static {
    /// Proposes this node for membership, carrying its claimed history as
    /// an opaque payload.
    async fn join(&self, me: Node, payload: Bytes) -> Result<(), FlockError>;

    /// Graceful departure.
    async fn leave(&self) -> Result<(), FlockError>;

    /// Totally-ordered broadcast to all members, including the sender.
    async fn notify(&self, payload: Bytes) -> Result<(), FlockError>;

    /// Requests the cluster-wide critical section. The driver single-
    /// flights requests and eventually delivers `DriverEvent::Block` to
    /// exactly one requester at a time.
    async fn block(&self) -> Result<(), FlockError>;

    /// Ends the critical section, broadcasting `payload` as a notify.
    async fn unblock(&self, payload: Bytes) -> Result<(), FlockError>;
}
