//! Call requests and their identifiers.
//!
//! A [`CallRequest`] is an immutable description of one method call on a
//! remote mesh node. Requests are created by the connector, shared read-only
//! with the protocol layer, and matched against inbound responses by the
//! `(network, node, interface, method)` key.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process-unique identifier of a call request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(u64);

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

impl RequestId {
    /// Allocate the next identifier. Ids are never reused within a process.
    fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Node address of the local coordinator. Requests addressed here need no
/// routing confirmation.
pub const COORDINATOR_NODE_ID: &str = "0";

/// Maximal processing time of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingTime {
    /// Wait at most this long for the result.
    Bounded(Duration),
    /// Wait until a result or cancellation, however long that takes.
    Unlimited,
}

/// A method call destined for a remote mesh node.
///
/// Equality for duplicate suppression is structural and excludes the id:
/// see [`CallRequest::same_call`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    id: RequestId,
    network_id: String,
    node_id: String,
    interface_id: u8,
    method_id: String,
    args: Vec<serde_json::Value>,
    broadcast: bool,
    time_unbounded: bool,
}

impl CallRequest {
    /// Create a unicast request with a fresh id.
    pub fn new(
        network_id: impl Into<String>,
        node_id: impl Into<String>,
        interface_id: u8,
        method_id: impl Into<String>,
        args: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            id: RequestId::next(),
            network_id: network_id.into(),
            node_id: node_id.into(),
            interface_id,
            method_id: method_id.into(),
            args,
            broadcast: false,
            time_unbounded: false,
        }
    }

    /// Mark this request as a broadcast (no unicast response on the wire;
    /// completion is synthesized locally after confirmation).
    pub fn broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }

    /// Declare that the response time of this call is not bounded by the
    /// protocol timing formulas (e.g. a network-discovery operation). A
    /// machine timeout frees the medium but does not fail such a request;
    /// its answer stays correlatable until the request ages out.
    pub fn time_unbounded(mut self) -> Self {
        self.time_unbounded = true;
        self
    }

    /// Request id.
    #[inline]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Target network id.
    #[inline]
    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// Target node id.
    #[inline]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Device-interface identifier on the target node.
    #[inline]
    pub fn interface_id(&self) -> u8 {
        self.interface_id
    }

    /// Called method id.
    #[inline]
    pub fn method_id(&self) -> &str {
        &self.method_id
    }

    /// Ordered call arguments, opaque to this core.
    #[inline]
    pub fn args(&self) -> &[serde_json::Value] {
        &self.args
    }

    /// Whether this is a broadcast request.
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }

    /// Whether this request's response time is inherently unbounded.
    #[inline]
    pub fn is_time_unbounded(&self) -> bool {
        self.time_unbounded
    }

    /// Whether this request is addressed to the local coordinator.
    #[inline]
    pub fn is_for_coordinator(&self) -> bool {
        self.node_id == COORDINATOR_NODE_ID
    }

    /// Structural equality over everything but the id. Two requests that
    /// are `same_call` would be indistinguishable on the wire.
    pub fn same_call(&self, other: &CallRequest) -> bool {
        self.network_id == other.network_id
            && self.node_id == other.node_id
            && self.interface_id == other.interface_id
            && self.method_id == other.method_id
            && self.args == other.args
    }

    /// Validate the fields a dispatchable request must carry.
    pub fn validate(&self) -> Result<(), String> {
        if self.network_id.is_empty() {
            return Err("network id is empty".into());
        }
        if self.node_id.is_empty() {
            return Err("node id is empty".into());
        }
        if self.method_id.is_empty() {
            return Err("method id is empty".into());
        }
        Ok(())
    }
}
