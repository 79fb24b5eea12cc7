//! Outbound message dispatch
//!
//! Resolves an envelope's next hop through the routing table and hands it to
//! the matching transport. The broadcast destination fans out to every known
//! transport; one failing connection never stops delivery to the others.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::envelope::{
    BinaryRequest, BinaryRequestError, BinaryResponse, BinaryResponseError, BinarySendMessage,
    Envelope, EnvelopeKind, JsonRequest, JsonRequestError, JsonResponse, JsonResponseError,
    JsonSendMessage,
};
use crate::ids::{NodeId, RequestId};
use crate::routing::RoutingTable;
use crate::transport::{SentMessageResult, Transport};

/// Envelopes that know which transport primitive carries them
#[async_trait]
pub trait Dispatchable: Envelope {
    async fn send_via(&self, transport: &dyn Transport) -> SentMessageResult;
}

macro_rules! dispatchable {
    ($ty:ty, $method:ident) => {
        #[async_trait]
        impl Dispatchable for $ty {
            async fn send_via(&self, transport: &dyn Transport) -> SentMessageResult {
                transport.$method(self).await
            }
        }
    };
}

dispatchable!(JsonRequest, send_json_request);
dispatchable!(JsonResponse, send_json_response);
dispatchable!(JsonRequestError, send_json_request_error);
dispatchable!(JsonResponseError, send_json_response_error);
dispatchable!(JsonSendMessage, send_json_send_message);
dispatchable!(BinaryRequest, send_binary_request);
dispatchable!(BinaryResponse, send_binary_response);
dispatchable!(BinaryRequestError, send_binary_request_error);
dispatchable!(BinaryResponseError, send_binary_response_error);
dispatchable!(BinarySendMessage, send_binary_send_message);

/// Record handed to the sent-message logger after every dispatch
#[derive(Debug, Clone)]
pub struct SentMessageLog {
    pub kind: EnvelopeKind,
    pub request_id: RequestId,
    pub next_hop: NodeId,
    pub result: SentMessageResult,
}

/// Audit hook invoked with the final result of every dispatch
pub type SentMessageLogger = Arc<dyn Fn(&SentMessageLog) + Send + Sync>;

pub struct MessageDispatcher {
    routing: Arc<dyn RoutingTable>,
    logger: Option<SentMessageLogger>,
}

impl MessageDispatcher {
    pub fn new(routing: Arc<dyn RoutingTable>) -> Self {
        Self {
            routing,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: SentMessageLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn routing(&self) -> &Arc<dyn RoutingTable> {
        &self.routing
    }

    /// Route and send any envelope
    pub async fn dispatch<E: Dispatchable>(&self, envelope: &E) -> SentMessageResult {
        let destination = envelope.destination();
        let next_hop = destination.next_hop();

        let result = if destination.is_broadcast() {
            self.broadcast(envelope).await
        } else {
            match self.routing.lookup(next_hop) {
                Some(route) => {
                    let result = envelope.send_via(route.transport().as_ref()).await;
                    debug!(
                        "Sent {} {} to {} via {:?}: {}",
                        envelope.kind(),
                        envelope.request_id(),
                        next_hop,
                        route,
                        result
                    );
                    result
                }
                None => {
                    warn!(
                        "No route to {} for {} {}",
                        next_hop,
                        envelope.kind(),
                        envelope.request_id()
                    );
                    SentMessageResult::UnknownClient
                }
            }
        };

        if let Some(logger) = &self.logger {
            logger(&SentMessageLog {
                kind: envelope.kind(),
                request_id: envelope.request_id().clone(),
                next_hop: next_hop.clone(),
                result: result.clone(),
            });
        }

        result
    }

    async fn broadcast<E: Dispatchable>(&self, envelope: &E) -> SentMessageResult {
        let transports: Vec<Arc<dyn Transport>> = self
            .routing
            .all_client_transports()
            .into_iter()
            .chain(self.routing.all_server_transports())
            .collect();

        let results = join_all(
            transports
                .iter()
                .map(|transport| envelope.send_via(transport.as_ref())),
        )
        .await;

        let mut failed = 0;
        for (transport, result) in transports.iter().zip(&results) {
            if !result.is_success() {
                failed += 1;
                warn!(
                    "Broadcast of {} {} to {} failed: {}",
                    envelope.kind(),
                    envelope.request_id(),
                    transport.name(),
                    result
                );
            }
        }

        debug!(
            "Broadcast {} {} to {} transports ({} failed)",
            envelope.kind(),
            envelope.request_id(),
            transports.len(),
            failed
        );

        SentMessageResult::Broadcast {
            delivered: transports.len() - failed,
            failed,
        }
    }

    pub async fn send_json_request(&self, request: &JsonRequest) -> SentMessageResult {
        self.dispatch(request).await
    }

    pub async fn send_json_response(&self, response: &JsonResponse) -> SentMessageResult {
        self.dispatch(response).await
    }

    pub async fn send_json_request_error(&self, error: &JsonRequestError) -> SentMessageResult {
        self.dispatch(error).await
    }

    pub async fn send_json_response_error(&self, error: &JsonResponseError) -> SentMessageResult {
        self.dispatch(error).await
    }

    pub async fn send_json_send_message(&self, message: &JsonSendMessage) -> SentMessageResult {
        self.dispatch(message).await
    }

    pub async fn send_binary_request(&self, request: &BinaryRequest) -> SentMessageResult {
        self.dispatch(request).await
    }

    pub async fn send_binary_response(&self, response: &BinaryResponse) -> SentMessageResult {
        self.dispatch(response).await
    }

    pub async fn send_binary_request_error(&self, error: &BinaryRequestError) -> SentMessageResult {
        self.dispatch(error).await
    }

    pub async fn send_binary_response_error(
        &self,
        error: &BinaryResponseError,
    ) -> SentMessageResult {
        self.dispatch(error).await
    }

    pub async fn send_binary_send_message(&self, message: &BinarySendMessage) -> SentMessageResult {
        self.dispatch(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{AnyEnvelope, Destination};
    use crate::loopback::LoopbackTransport;
    use crate::routing::StaticRoutingTable;
    use parking_lot::Mutex;
    use serde_json::json;

    fn heartbeat(id: u64, to: Destination) -> JsonRequest {
        JsonRequest::new(RequestId::from(id), "CS001", to, "Heartbeat", json!({}))
    }

    #[tokio::test]
    async fn test_send_to_registered_client() {
        let table = Arc::new(StaticRoutingTable::new());
        let (csms, mut rx) = LoopbackTransport::new("csms");
        table.register_client("CSMS", csms);

        let dispatcher = MessageDispatcher::new(table);
        let result = dispatcher
            .send_json_request(&heartbeat(1, Destination::to("CSMS")))
            .await;

        assert_eq!(result, SentMessageResult::Success);
        match rx.recv().await.unwrap() {
            AnyEnvelope::JsonRequest(r) => assert_eq!(r.action, "Heartbeat"),
            other => panic!("Expected JsonRequest, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let dispatcher = MessageDispatcher::new(Arc::new(StaticRoutingTable::new()));
        let result = dispatcher
            .send_json_request(&heartbeat(2, Destination::to("B")))
            .await;
        assert_eq!(result, SentMessageResult::UnknownClient);
    }

    #[tokio::test]
    async fn test_logger_sees_every_result() {
        let table = Arc::new(StaticRoutingTable::new());
        let (csms, _rx) = LoopbackTransport::new("csms");
        table.register_client("CSMS", csms);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let dispatcher = MessageDispatcher::new(table)
            .with_logger(Arc::new(move |log: &SentMessageLog| sink.lock().push(log.clone())));

        dispatcher
            .send_json_request(&heartbeat(3, Destination::to("CSMS")))
            .await;
        dispatcher
            .send_json_request(&heartbeat(4, Destination::to("nowhere")))
            .await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].result, SentMessageResult::Success);
        assert_eq!(seen[1].result, SentMessageResult::UnknownClient);
        assert_eq!(seen[1].next_hop.as_str(), "nowhere");
        assert_eq!(seen[0].kind.to_string(), "JSONRequest");
    }

    #[tokio::test]
    async fn test_broadcast_survives_failing_transport() {
        let table = Arc::new(StaticRoutingTable::new());
        let (uplink, _rx1) = LoopbackTransport::new("uplink");
        let (cs1, _rx2) = LoopbackTransport::new("cs1");
        let (cs2, _rx3) = LoopbackTransport::new("cs2");
        cs1.set_failing(true);

        table.register_client("CSMS", uplink.clone());
        table.register_server("CS1", cs1.clone());
        table.register_server("CS2", cs2.clone());

        let dispatcher = MessageDispatcher::new(table);
        let message = JsonSendMessage::new(
            RequestId::from(5),
            "LC1",
            Destination::broadcast(),
            "NotifyNetworkTopology",
            json!({}),
        );
        let result = dispatcher.send_json_send_message(&message).await;

        assert_eq!(result, SentMessageResult::Broadcast { delivered: 2, failed: 1 });
        assert_eq!(uplink.sent_count(), 1);
        assert_eq!(cs1.sent_count(), 0);
        assert_eq!(cs2.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_source_route_uses_first_hop() {
        let table = Arc::new(StaticRoutingTable::new());
        let (lc, _rx) = LoopbackTransport::new("lc1");
        table.register_server("LC1", lc.clone());

        let dispatcher = MessageDispatcher::new(table);
        let to = Destination::via("CS042", vec![NodeId::new("LC1")]);
        let result = dispatcher
            .send_binary_request(&BinaryRequest::new(
                RequestId::from(6),
                "CSMS",
                to,
                "BinaryDataTransfer",
                vec![0xde, 0xad],
            ))
            .await;

        assert!(result.is_success());
        assert_eq!(lc.sent_count(), 1);
    }
}
