//! Configuration for the OCPP adapter

use std::time::Duration;

use crate::ids::NodeId;

/// Message signing policy.
///
/// Only the selection of the active policy lives in the adapter; signing
/// and verification are done by the layer that builds payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignaturePolicy {
    pub id: String,
    pub description: String,
}

impl SignaturePolicy {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }
}

impl Default for SignaturePolicy {
    fn default() -> Self {
        Self::new("default", "Accept unsigned messages, sign nothing")
    }
}

/// Complete adapter configuration
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Identity of this networking node
    pub node_id: NodeId,

    /// Do not run the heartbeat task
    pub disable_send_heartbeats: bool,

    /// Heartbeat period
    pub send_heartbeats_every: Duration,

    /// Node the heartbeats go to (usually the CSMS)
    pub heartbeat_destination: Option<NodeId>,

    /// Timeout for requests that do not declare their own
    pub default_request_timeout: Duration,

    /// Configured policies; the first one is active
    pub signature_policies: Vec<SignaturePolicy>,

    /// Capacity of the incoming-message and unsolicited-error channels
    pub channel_capacity: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new("ocpp-node"),
            disable_send_heartbeats: false,
            send_heartbeats_every: Duration::from_secs(300),
            heartbeat_destination: None,
            default_request_timeout: Duration::from_secs(30),
            signature_policies: vec![SignaturePolicy::default()],
            channel_capacity: 64,
        }
    }
}

impl AdapterConfig {
    /// Create config for the given node
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Set default request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.default_request_timeout = timeout;
        self
    }

    /// Send heartbeats to `destination` every `every`
    pub fn with_heartbeats(mut self, destination: impl Into<NodeId>, every: Duration) -> Self {
        self.heartbeat_destination = Some(destination.into());
        self.send_heartbeats_every = every;
        self.disable_send_heartbeats = false;
        self
    }

    /// Disable heartbeats
    pub fn without_heartbeats(mut self) -> Self {
        self.disable_send_heartbeats = true;
        self
    }

    /// Replace the configured signature policies
    pub fn with_signature_policies(mut self, policies: Vec<SignaturePolicy>) -> Self {
        self.signature_policies = policies;
        self
    }

    /// Set channel capacity
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}
