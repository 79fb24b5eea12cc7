//! Transport abstraction
//!
//! A transport moves one envelope to one connected peer. It knows nothing
//! about pending requests or routing; the dispatcher picks the transport and
//! the adapter correlates answers.

use async_trait::async_trait;

use crate::envelope::{
    BinaryRequest, BinaryRequestError, BinaryResponse, BinaryResponseError, BinarySendMessage,
    JsonRequest, JsonRequestError, JsonResponse, JsonResponseError, JsonSendMessage,
};
use crate::ids::NodeId;

/// Outcome of a single transmit attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentMessageResult {
    /// Handed to a transport that accepted it
    Success,
    /// No route to the next hop
    UnknownClient,
    /// Fanned out to every known transport, best effort
    Broadcast { delivered: usize, failed: usize },
    /// The transport was found but could not send
    TransmissionFailed(String),
}

impl SentMessageResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SentMessageResult::Success)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        SentMessageResult::TransmissionFailed(reason.into())
    }
}

impl std::fmt::Display for SentMessageResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SentMessageResult::Success => write!(f, "Success"),
            SentMessageResult::UnknownClient => write!(f, "UnknownClient"),
            SentMessageResult::Broadcast { delivered, failed } => {
                write!(f, "Broadcast (delivered: {}, failed: {})", delivered, failed)
            }
            SentMessageResult::TransmissionFailed(reason) => {
                write!(f, "TransmissionFailed: {}", reason)
            }
        }
    }
}

/// The connection an inbound envelope actually arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_id: String,
    /// Node at the other end of the connection, when known
    pub remote_node: Option<NodeId>,
}

impl ConnectionInfo {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            remote_node: None,
        }
    }

    pub fn with_remote(mut self, node: impl Into<NodeId>) -> Self {
        self.remote_node = Some(node.into());
        self
    }
}

/// Send primitives of one live connection, for both envelope families.
///
/// Object safe so the routing table can hand out `Arc<dyn Transport>`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identifier used in logs
    fn name(&self) -> &str;

    async fn send_json_request(&self, request: &JsonRequest) -> SentMessageResult;
    async fn send_json_response(&self, response: &JsonResponse) -> SentMessageResult;
    async fn send_json_request_error(&self, error: &JsonRequestError) -> SentMessageResult;
    async fn send_json_response_error(&self, error: &JsonResponseError) -> SentMessageResult;
    async fn send_json_send_message(&self, message: &JsonSendMessage) -> SentMessageResult;

    async fn send_binary_request(&self, request: &BinaryRequest) -> SentMessageResult;
    async fn send_binary_response(&self, response: &BinaryResponse) -> SentMessageResult;
    async fn send_binary_request_error(&self, error: &BinaryRequestError) -> SentMessageResult;
    async fn send_binary_response_error(&self, error: &BinaryResponseError) -> SentMessageResult;
    async fn send_binary_send_message(&self, message: &BinarySendMessage) -> SentMessageResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_success_is_success() {
        assert!(SentMessageResult::Success.is_success());
        assert!(!SentMessageResult::UnknownClient.is_success());
        assert!(!SentMessageResult::Broadcast { delivered: 3, failed: 0 }.is_success());
        assert!(!SentMessageResult::failed("closed").is_success());
    }
}
