//! Inbound completion handling
//!
//! Transport read loops hand every decoded answer addressed to this node to
//! the `InboundCompletionHandler`. Answers complete the matching pending
//! request. Answers for unknown ids are logged and dropped: they are late
//! (the waiter already timed out), duplicated or unsolicited. Nothing here
//! returns an error or creates a registry entry.
//!
//! Error answers that match nothing are additionally pushed to the
//! unsolicited-error channel, since no waiter will ever see them.
//! Inbound requests and one-way messages go to the incoming channel.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::envelope::{
    AnyEnvelope, BinaryRequestError, BinaryResponse, BinaryResponseError, Envelope,
    EnvelopeHeader, EnvelopeKind, JsonRequestError, JsonResponse, JsonResponseError,
};
use crate::registry::{Completion, PendingRequestRegistry, ReceivedFrom};
use crate::transport::ConnectionInfo;

/// Request or one-way message for the layer above the adapter
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub envelope: AnyEnvelope,
    pub connection: ConnectionInfo,
}

/// Error envelope that matched no pending request
#[derive(Debug, Clone)]
pub struct UnsolicitedError {
    pub envelope: AnyEnvelope,
    pub connection: ConnectionInfo,
}

pub struct InboundCompletionHandler {
    registry: Arc<PendingRequestRegistry>,
    incoming_tx: mpsc::Sender<IncomingMessage>,
    unsolicited_tx: mpsc::Sender<UnsolicitedError>,
}

impl InboundCompletionHandler {
    pub fn new(
        registry: Arc<PendingRequestRegistry>,
        incoming_tx: mpsc::Sender<IncomingMessage>,
        unsolicited_tx: mpsc::Sender<UnsolicitedError>,
    ) -> Self {
        Self {
            registry,
            incoming_tx,
            unsolicited_tx,
        }
    }

    fn complete(
        &self,
        kind: EnvelopeKind,
        header: &EnvelopeHeader,
        completion: Completion,
        connection: &ConnectionInfo,
    ) -> bool {
        let received = ReceivedFrom {
            connection: Some(connection.clone()),
            destination: header.destination.clone(),
            network_path: header.network_path.clone(),
        };

        if self
            .registry
            .try_complete(&header.request_id, completion, Some(received))
        {
            debug!(
                "Completed request {} with {} from {}",
                header.request_id, kind, connection.connection_id
            );
            true
        } else {
            warn!(
                "Received {} for unknown request {} on {}, dropping",
                kind, header.request_id, connection.connection_id
            );
            false
        }
    }

    fn report_unsolicited(&self, envelope: AnyEnvelope, connection: &ConnectionInfo) {
        let kind = envelope.kind();
        let request_id = envelope.request_id().clone();
        let unsolicited = UnsolicitedError {
            envelope,
            connection: connection.clone(),
        };
        if let Err(e) = self.unsolicited_tx.try_send(unsolicited) {
            warn!(
                "Could not forward unsolicited {} {}: {}",
                kind, request_id, e
            );
        }
    }

    pub fn receive_json_response(&self, response: &JsonResponse, connection: &ConnectionInfo) -> bool {
        self.complete(
            response.kind(),
            &response.header,
            Completion::JsonResponse(response.clone()),
            connection,
        )
    }

    pub fn receive_binary_response(
        &self,
        response: &BinaryResponse,
        connection: &ConnectionInfo,
    ) -> bool {
        self.complete(
            response.kind(),
            &response.header,
            Completion::BinaryResponse(response.clone()),
            connection,
        )
    }

    pub fn receive_json_request_error(
        &self,
        error: &JsonRequestError,
        connection: &ConnectionInfo,
    ) -> bool {
        let completed = self.complete(
            error.kind(),
            &error.header,
            Completion::JsonRequestError(error.clone()),
            connection,
        );
        if !completed {
            self.report_unsolicited(AnyEnvelope::JsonRequestError(error.clone()), connection);
        }
        completed
    }

    pub fn receive_binary_request_error(
        &self,
        error: &BinaryRequestError,
        connection: &ConnectionInfo,
    ) -> bool {
        let completed = self.complete(
            error.kind(),
            &error.header,
            Completion::BinaryRequestError(error.clone()),
            connection,
        );
        if !completed {
            self.report_unsolicited(AnyEnvelope::BinaryRequestError(error.clone()), connection);
        }
        completed
    }

    pub fn receive_json_response_error(
        &self,
        error: &JsonResponseError,
        connection: &ConnectionInfo,
    ) -> bool {
        let completed = self.complete(
            error.kind(),
            &error.header,
            Completion::JsonResponseError(error.clone()),
            connection,
        );
        if !completed {
            self.report_unsolicited(AnyEnvelope::JsonResponseError(error.clone()), connection);
        }
        completed
    }

    pub fn receive_binary_response_error(
        &self,
        error: &BinaryResponseError,
        connection: &ConnectionInfo,
    ) -> bool {
        let completed = self.complete(
            error.kind(),
            &error.header,
            Completion::BinaryResponseError(error.clone()),
            connection,
        );
        if !completed {
            self.report_unsolicited(AnyEnvelope::BinaryResponseError(error.clone()), connection);
        }
        completed
    }

    /// Hand a request or one-way message to the layer above.
    /// Returns false when the incoming channel is full or closed.
    pub fn deliver_incoming(&self, envelope: AnyEnvelope, connection: &ConnectionInfo) -> bool {
        let kind = envelope.kind();
        let request_id = envelope.request_id().clone();
        match self.incoming_tx.try_send(IncomingMessage {
            envelope,
            connection: connection.clone(),
        }) {
            Ok(()) => {
                debug!("Delivered incoming {} {}", kind, request_id);
                true
            }
            Err(e) => {
                warn!("Dropping incoming {} {}: {}", kind, request_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Destination, JsonRequest};
    use crate::error::ErrorCode;
    use crate::ids::RequestId;
    use crate::registry::{OutboundRequest, PendingRequest};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::Instant;

    fn handler() -> (
        InboundCompletionHandler,
        Arc<PendingRequestRegistry>,
        mpsc::Receiver<IncomingMessage>,
        mpsc::Receiver<UnsolicitedError>,
    ) {
        let registry = Arc::new(PendingRequestRegistry::new());
        let (incoming_tx, incoming_rx) = mpsc::channel(4);
        let (unsolicited_tx, unsolicited_rx) = mpsc::channel(4);
        let handler = InboundCompletionHandler::new(registry.clone(), incoming_tx, unsolicited_tx);
        (handler, registry, incoming_rx, unsolicited_rx)
    }

    fn request(id: u64) -> JsonRequest {
        JsonRequest::new(
            RequestId::from(id),
            "CS001",
            Destination::to("CSMS"),
            "Authorize",
            json!({"idToken": {"idToken": "TOKEN123", "type": "ISO14443"}}),
        )
    }

    fn register(registry: &PendingRequestRegistry, request: &JsonRequest) {
        registry.add(
            request.header.request_id.clone(),
            PendingRequest::new(
                OutboundRequest::Json(request.clone()),
                Instant::now() + Duration::from_secs(30),
            ),
        );
    }

    #[test]
    fn test_response_completes_pending_request() {
        let (handler, registry, _in, _un) = handler();
        let req = request(42);
        register(&registry, &req);

        let response = JsonResponse::for_request(&req, "CSMS", json!({"idTokenInfo": {"status": "Accepted"}}));
        let conn = ConnectionInfo::new("ws-csms").with_remote("CSMS");
        assert!(handler.receive_json_response(&response, &conn));

        let done = registry.take_completed(&req.header.request_id).unwrap();
        assert!(done.json_response().is_some());
        assert_eq!(done.connection_received.unwrap(), conn);
    }

    #[test]
    fn test_unknown_response_is_dropped() {
        let (handler, registry, _in, mut unsolicited) = handler();
        let response = JsonResponse::for_request(&request(1), "CSMS", json!({}));

        assert!(!handler.receive_json_response(&response, &ConnectionInfo::new("ws-1")));
        assert!(registry.is_empty());
        // Responses are not reported as unsolicited errors
        assert!(unsolicited.try_recv().is_err());
    }

    #[test]
    fn test_unmatched_response_error_goes_to_sink() {
        let (handler, registry, _in, mut unsolicited) = handler();
        let response = JsonResponse::for_request(&request(9), "CSMS", json!({}));
        let error = JsonResponseError::for_response(
            &response,
            "CS001",
            ErrorCode::FormatViolation,
            "payload did not match schema",
        );

        assert!(!handler.receive_json_response_error(&error, &ConnectionInfo::new("ws-1")));
        assert!(registry.is_empty());

        let reported = unsolicited.try_recv().unwrap();
        assert_eq!(reported.envelope.request_id(), &RequestId::from(9));
    }

    #[test]
    fn test_request_error_completes() {
        let (handler, registry, _in, mut unsolicited) = handler();
        let req = request(5);
        register(&registry, &req);

        let error = JsonRequestError::for_request(&req, "CSMS", ErrorCode::NotImplemented, "nope");
        assert!(handler.receive_json_request_error(&error, &ConnectionInfo::new("ws-1")));
        assert!(unsolicited.try_recv().is_err());

        let done = registry.try_remove(&req.header.request_id).unwrap();
        assert_eq!(done.error_code(), Some(ErrorCode::NotImplemented));
    }

    #[test]
    fn test_incoming_channel_full() {
        let (handler, _registry, mut incoming, _un) = handler();
        let conn = ConnectionInfo::new("ws-1");
        for i in 0..4 {
            assert!(handler.deliver_incoming(AnyEnvelope::JsonRequest(request(i)), &conn));
        }
        assert!(!handler.deliver_incoming(AnyEnvelope::JsonRequest(request(5)), &conn));

        assert!(incoming.try_recv().is_ok());
    }
}
