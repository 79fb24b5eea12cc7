//! Identifiers: nodes, requests and event tracking

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Base value for locally generated request ids.
///
/// Ids handed out by a generator start here so they are easy to tell apart
/// from small ids chosen by remote peers.
pub const REQUEST_ID_BASE: u64 = 100_000;

/// Node id used as the broadcast pseudo-destination
pub const BROADCAST_NODE: &str = "*";

/// Identifier of a networking node (charging station, local controller, CSMS)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The broadcast marker
    pub fn broadcast() -> Self {
        Self(BROADCAST_NODE.to_string())
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == BROADCAST_NODE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Correlation token pairing a request with its response or error.
///
/// Opaque text on the wire; locally generated ids are decimal integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// Tracks one logical event across request, response and forwarding hops
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventTrackingId(String);

impl EventTrackingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventTrackingId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventTrackingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic request id source, safe to share between tasks
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(REQUEST_ID_BASE)
    }

    pub fn starting_at(base: u64) -> Self {
        Self {
            next: AtomicU64::new(base),
        }
    }

    /// Hand out the next id. Never repeats for the lifetime of the generator.
    pub fn next_request_id(&self) -> RequestId {
        RequestId::from(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
