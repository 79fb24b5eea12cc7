//! OCPP adapter
//!
//! Ties the pieces together for one networking node:
//!
//! ```text
//!  message-specific senders            transport read loops
//!          │  send_*_and_wait                 │  receive_*
//!          ▼                                  ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ OcppAdapter                                              │
//! │  RequestIdGenerator   PendingRequestRegistry             │
//! │  MessageDispatcher ──► RoutingTable ──► Transport        │
//! │  InboundCompletionHandler ──► incoming / unsolicited     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Request lifecycle
//!
//! 1. Register a pending entry keyed by request id, with a deadline
//! 2. Dispatch; on any result other than `Success` drop the entry and
//!    return an `InternalError` outcome right away
//! 3. Wait for the first of: completion signal, deadline, cancellation
//! 4. Remove the entry and return it with exactly one outcome
//!
//! An answer that lands in the same instant as the deadline wins over the
//! timeout: the deadline arm yields once before giving up, so a reply
//! already scheduled for that instant gets to complete the entry first.
//!
//! Dropping the waiting future removes its entry, so a late answer for it is
//! treated like any other unknown id.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{AdapterConfig, SignaturePolicy};
use crate::dispatcher::{Dispatchable, MessageDispatcher, SentMessageLogger};
use crate::envelope::{
    AnyEnvelope, BinaryRequest, BinaryRequestError, BinaryResponse, BinaryResponseError,
    BinarySendMessage, Destination, Envelope, JsonRequest, JsonRequestError, JsonResponse,
    JsonResponseError, JsonSendMessage, Payload, Request, SendMessage,
};
use crate::error::{ErrorCode, OcppError};
use crate::ids::{NodeId, RequestId, RequestIdGenerator};
use crate::inbound::{IncomingMessage, InboundCompletionHandler, UnsolicitedError};
use crate::registry::{OutboundRequest, PendingRequest, PendingRequestRegistry};
use crate::routing::RoutingTable;
use crate::transport::{ConnectionInfo, SentMessageResult};

/// Receivers for what the adapter cannot handle itself
pub struct InboundChannels {
    /// Requests and one-way messages addressed to this node
    pub incoming: mpsc::Receiver<IncomingMessage>,
    /// Error answers that matched no pending request
    pub unsolicited_errors: mpsc::Receiver<UnsolicitedError>,
}

/// Where an inbound envelope goes next
enum InboundRoute<E> {
    Local(E),
    Forward(E),
    Dropped,
}

/// Removes a pending entry whose waiter went away without finishing,
/// e.g. when the future is dropped by an outer timeout or an aborted task.
struct PendingGuard {
    registry: Arc<PendingRequestRegistry>,
    request_id: RequestId,
    armed: bool,
}

impl PendingGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed && self.registry.try_remove(&self.request_id).is_some() {
            debug!("Waiter for {} dropped, entry removed", self.request_id);
        }
    }
}

pub struct OcppAdapter {
    config: AdapterConfig,
    ids: RequestIdGenerator,
    registry: Arc<PendingRequestRegistry>,
    dispatcher: MessageDispatcher,
    inbound: InboundCompletionHandler,
}

impl OcppAdapter {
    /// Create an adapter routing through `routing`
    pub fn new(
        config: AdapterConfig,
        routing: Arc<dyn RoutingTable>,
    ) -> Result<(Self, InboundChannels), OcppError> {
        if config.signature_policies.is_empty() {
            return Err(OcppError::NoSignaturePolicy);
        }

        let registry = Arc::new(PendingRequestRegistry::new());
        let (incoming_tx, incoming) = mpsc::channel(config.channel_capacity);
        let (unsolicited_tx, unsolicited_errors) = mpsc::channel(config.channel_capacity);

        let adapter = Self {
            ids: RequestIdGenerator::new(),
            dispatcher: MessageDispatcher::new(routing),
            inbound: InboundCompletionHandler::new(registry.clone(), incoming_tx, unsolicited_tx),
            registry,
            config,
        };

        info!("OCPP adapter ready: node={}", adapter.config.node_id);

        Ok((
            adapter,
            InboundChannels {
                incoming,
                unsolicited_errors,
            },
        ))
    }

    /// Install an audit hook called with every dispatch result
    pub fn with_sent_message_logger(mut self, logger: SentMessageLogger) -> Self {
        self.dispatcher = self.dispatcher.with_logger(logger);
        self
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    /// The active signature policy
    pub fn signature_policy(&self) -> &SignaturePolicy {
        // Non-empty: checked in `new`
        &self.config.signature_policies[0]
    }

    pub fn next_request_id(&self) -> RequestId {
        self.ids.next_request_id()
    }

    /// Number of requests currently awaiting an answer
    pub fn pending_count(&self) -> usize {
        self.registry.len()
    }

    /// JSON request from this node with a fresh request id
    pub fn new_json_request(
        &self,
        destination: Destination,
        action: impl Into<String>,
        payload: Value,
    ) -> JsonRequest {
        Request::new(
            self.next_request_id(),
            self.config.node_id.clone(),
            destination,
            action,
            payload,
        )
    }

    /// Binary request from this node with a fresh request id
    pub fn new_binary_request(
        &self,
        destination: Destination,
        action: impl Into<String>,
        payload: Vec<u8>,
    ) -> BinaryRequest {
        Request::new(
            self.next_request_id(),
            self.config.node_id.clone(),
            destination,
            action,
            payload,
        )
    }

    /// One-way JSON message from this node with a fresh request id
    pub fn new_json_send_message(
        &self,
        destination: Destination,
        action: impl Into<String>,
        payload: Value,
    ) -> JsonSendMessage {
        SendMessage::new(
            self.next_request_id(),
            self.config.node_id.clone(),
            destination,
            action,
            payload,
        )
    }

    // ------------------------------------------------------------------
    // Request / response correlation
    // ------------------------------------------------------------------

    /// Send a JSON request and wait for its single outcome
    pub async fn send_json_request_and_wait(&self, request: JsonRequest) -> PendingRequest {
        self.send_and_wait(request, OutboundRequest::Json).await
    }

    /// Send a binary request and wait for its single outcome
    pub async fn send_binary_request_and_wait(&self, request: BinaryRequest) -> PendingRequest {
        self.send_and_wait(request, OutboundRequest::Binary).await
    }

    async fn send_and_wait<P>(
        &self,
        request: Request<P>,
        wrap: fn(Request<P>) -> OutboundRequest,
    ) -> PendingRequest
    where
        P: Payload,
        Request<P>: Dispatchable,
    {
        let timeout = request
            .timeout
            .unwrap_or(self.config.default_request_timeout);
        let deadline = Instant::now() + timeout;
        let request_id = request.header.request_id.clone();
        let cancellation = request.header.cancellation.clone();
        let outbound = wrap(request.clone());

        // Registered before sending so an answer racing the send is not lost
        if !self
            .registry
            .add(request_id.clone(), PendingRequest::new(outbound.clone(), deadline))
        {
            warn!("Request id {} is already in flight", request_id);
            return PendingRequest::failed(
                outbound,
                deadline,
                ErrorCode::InternalError,
                format!("Request id {} is already in flight", request_id),
            );
        }
        let mut guard = PendingGuard {
            registry: self.registry.clone(),
            request_id: request_id.clone(),
            armed: true,
        };

        let result = self.dispatcher.dispatch(&request).await;
        if !result.is_success() {
            self.registry.try_remove(&request_id);
            guard.disarm();
            return PendingRequest::failed(
                outbound,
                deadline,
                ErrorCode::InternalError,
                format!("Could not send {} request: {}", request.action, result),
            );
        }

        let Some(signal) = self.registry.completion_signal(&request_id) else {
            // Removed by someone else between add and here
            guard.disarm();
            return PendingRequest::failed(
                outbound,
                deadline,
                ErrorCode::InternalError,
                "Pending request vanished",
            );
        };

        let done = loop {
            tokio::select! {
                biased;

                _ = cancellation.cancelled() => {
                    debug!("Request {} cancelled", request_id);
                    break self.finish(&request_id, outbound, deadline, ErrorCode::InternalError, "Request cancelled");
                }

                _ = signal.notified() => {
                    if let Some(done) = self.registry.take_completed(&request_id) {
                        break done;
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    // Let answers woken at the same instant land first
                    tokio::task::yield_now().await;
                    break self.finish(&request_id, outbound, deadline, ErrorCode::Timeout, "No response before deadline");
                }
            }
        };
        guard.disarm();
        done
    }

    /// Remove the entry, keeping an outcome that already landed,
    /// otherwise failing it locally.
    fn finish(
        &self,
        request_id: &RequestId,
        outbound: OutboundRequest,
        deadline: Instant,
        error_code: ErrorCode,
        description: &str,
    ) -> PendingRequest {
        match self.registry.try_remove(request_id) {
            Some(done) if done.is_completed() => done,
            Some(mut open) => {
                warn!(
                    "{} request {} failed locally: {} ({})",
                    open.request.action(),
                    request_id,
                    error_code,
                    description
                );
                open.fail_locally(error_code, description);
                open
            }
            None => PendingRequest::failed(outbound, deadline, error_code, description),
        }
    }

    // ------------------------------------------------------------------
    // Fire-and-forget sends
    // ------------------------------------------------------------------

    pub async fn send_json_request(&self, request: &JsonRequest) -> SentMessageResult {
        self.dispatcher.send_json_request(request).await
    }

    pub async fn send_json_response(&self, response: &JsonResponse) -> SentMessageResult {
        self.dispatcher.send_json_response(response).await
    }

    pub async fn send_json_request_error(&self, error: &JsonRequestError) -> SentMessageResult {
        self.dispatcher.send_json_request_error(error).await
    }

    pub async fn send_json_response_error(&self, error: &JsonResponseError) -> SentMessageResult {
        self.dispatcher.send_json_response_error(error).await
    }

    pub async fn send_json_send_message(&self, message: &JsonSendMessage) -> SentMessageResult {
        self.dispatcher.send_json_send_message(message).await
    }

    pub async fn send_binary_request(&self, request: &BinaryRequest) -> SentMessageResult {
        self.dispatcher.send_binary_request(request).await
    }

    pub async fn send_binary_response(&self, response: &BinaryResponse) -> SentMessageResult {
        self.dispatcher.send_binary_response(response).await
    }

    pub async fn send_binary_request_error(&self, error: &BinaryRequestError) -> SentMessageResult {
        self.dispatcher.send_binary_request_error(error).await
    }

    pub async fn send_binary_response_error(
        &self,
        error: &BinaryResponseError,
    ) -> SentMessageResult {
        self.dispatcher.send_binary_response_error(error).await
    }

    pub async fn send_binary_send_message(&self, message: &BinarySendMessage) -> SentMessageResult {
        self.dispatcher.send_binary_send_message(message).await
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Decide whether an inbound envelope is for us or has to travel on
    fn route_inbound<E: Envelope>(&self, mut envelope: E) -> InboundRoute<E> {
        let local = &self.config.node_id;

        let destination = envelope.destination().advance(local);
        envelope.header_mut().destination = destination;

        if envelope.destination().is_for(local) {
            return InboundRoute::Local(envelope);
        }

        if envelope.network_path().contains(local) {
            warn!(
                "Dropping {} {}: routing loop via {}",
                envelope.kind(),
                envelope.request_id(),
                local
            );
            return InboundRoute::Dropped;
        }

        let path = envelope.network_path().append(local.clone());
        envelope.header_mut().network_path = path;
        InboundRoute::Forward(envelope)
    }

    async fn forward<E: Dispatchable>(&self, envelope: E) -> bool {
        debug!(
            "Forwarding {} {} towards {}",
            envelope.kind(),
            envelope.request_id(),
            envelope.destination().target()
        );
        self.dispatcher.dispatch(&envelope).await.is_success()
    }

    pub async fn receive_json_response(
        &self,
        response: JsonResponse,
        connection: ConnectionInfo,
    ) -> bool {
        match self.route_inbound(response) {
            InboundRoute::Local(r) => self.inbound.receive_json_response(&r, &connection),
            InboundRoute::Forward(r) => self.forward(r).await,
            InboundRoute::Dropped => false,
        }
    }

    pub async fn receive_binary_response(
        &self,
        response: BinaryResponse,
        connection: ConnectionInfo,
    ) -> bool {
        match self.route_inbound(response) {
            InboundRoute::Local(r) => self.inbound.receive_binary_response(&r, &connection),
            InboundRoute::Forward(r) => self.forward(r).await,
            InboundRoute::Dropped => false,
        }
    }

    pub async fn receive_json_request_error(
        &self,
        error: JsonRequestError,
        connection: ConnectionInfo,
    ) -> bool {
        match self.route_inbound(error) {
            InboundRoute::Local(e) => self.inbound.receive_json_request_error(&e, &connection),
            InboundRoute::Forward(e) => self.forward(e).await,
            InboundRoute::Dropped => false,
        }
    }

    pub async fn receive_binary_request_error(
        &self,
        error: BinaryRequestError,
        connection: ConnectionInfo,
    ) -> bool {
        match self.route_inbound(error) {
            InboundRoute::Local(e) => self.inbound.receive_binary_request_error(&e, &connection),
            InboundRoute::Forward(e) => self.forward(e).await,
            InboundRoute::Dropped => false,
        }
    }

    pub async fn receive_json_response_error(
        &self,
        error: JsonResponseError,
        connection: ConnectionInfo,
    ) -> bool {
        match self.route_inbound(error) {
            InboundRoute::Local(e) => self.inbound.receive_json_response_error(&e, &connection),
            InboundRoute::Forward(e) => self.forward(e).await,
            InboundRoute::Dropped => false,
        }
    }

    pub async fn receive_binary_response_error(
        &self,
        error: BinaryResponseError,
        connection: ConnectionInfo,
    ) -> bool {
        match self.route_inbound(error) {
            InboundRoute::Local(e) => self.inbound.receive_binary_response_error(&e, &connection),
            InboundRoute::Forward(e) => self.forward(e).await,
            InboundRoute::Dropped => false,
        }
    }

    pub async fn receive_json_request(&self, request: JsonRequest, connection: ConnectionInfo) -> bool {
        match self.route_inbound(request) {
            InboundRoute::Local(r) => self
                .inbound
                .deliver_incoming(AnyEnvelope::JsonRequest(r), &connection),
            InboundRoute::Forward(r) => self.forward(r).await,
            InboundRoute::Dropped => false,
        }
    }

    pub async fn receive_binary_request(
        &self,
        request: BinaryRequest,
        connection: ConnectionInfo,
    ) -> bool {
        match self.route_inbound(request) {
            InboundRoute::Local(r) => self
                .inbound
                .deliver_incoming(AnyEnvelope::BinaryRequest(r), &connection),
            InboundRoute::Forward(r) => self.forward(r).await,
            InboundRoute::Dropped => false,
        }
    }

    pub async fn receive_json_send_message(
        &self,
        message: JsonSendMessage,
        connection: ConnectionInfo,
    ) -> bool {
        match self.route_inbound(message) {
            InboundRoute::Local(m) => self
                .inbound
                .deliver_incoming(AnyEnvelope::JsonSendMessage(m), &connection),
            InboundRoute::Forward(m) => self.forward(m).await,
            InboundRoute::Dropped => false,
        }
    }

    pub async fn receive_binary_send_message(
        &self,
        message: BinarySendMessage,
        connection: ConnectionInfo,
    ) -> bool {
        match self.route_inbound(message) {
            InboundRoute::Local(m) => self
                .inbound
                .deliver_incoming(AnyEnvelope::BinarySendMessage(m), &connection),
            InboundRoute::Forward(m) => self.forward(m).await,
            InboundRoute::Dropped => false,
        }
    }

    /// Dispatch a decoded envelope of any kind to its receive operation
    pub async fn receive(&self, envelope: AnyEnvelope, connection: ConnectionInfo) -> bool {
        match envelope {
            AnyEnvelope::JsonRequest(e) => self.receive_json_request(e, connection).await,
            AnyEnvelope::JsonResponse(e) => self.receive_json_response(e, connection).await,
            AnyEnvelope::JsonRequestError(e) => self.receive_json_request_error(e, connection).await,
            AnyEnvelope::JsonResponseError(e) => {
                self.receive_json_response_error(e, connection).await
            }
            AnyEnvelope::JsonSendMessage(e) => self.receive_json_send_message(e, connection).await,
            AnyEnvelope::BinaryRequest(e) => self.receive_binary_request(e, connection).await,
            AnyEnvelope::BinaryResponse(e) => self.receive_binary_response(e, connection).await,
            AnyEnvelope::BinaryRequestError(e) => {
                self.receive_binary_request_error(e, connection).await
            }
            AnyEnvelope::BinaryResponseError(e) => {
                self.receive_binary_response_error(e, connection).await
            }
            AnyEnvelope::BinarySendMessage(e) => {
                self.receive_binary_send_message(e, connection).await
            }
        }
    }
}
