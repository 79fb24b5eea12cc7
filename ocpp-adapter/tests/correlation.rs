//! End-to-end correlation scenarios over loopback transports

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ocpp_adapter::loopback::LoopbackTransport;
use ocpp_adapter::{
    AdapterConfig, AnyEnvelope, BinaryRequestError, BinaryResponse, BinaryResponseError,
    ConnectionInfo, Destination, ErrorCode, InboundChannels, JsonRequest, JsonRequestError,
    JsonResponse, JsonResponseError, OcppAdapter, RequestId, SentMessageResult,
    StaticRoutingTable,
};
use tokio::sync::mpsc;
use serde_json::json;
use tokio::time::Instant;

fn adapter(node: &str, table: Arc<StaticRoutingTable>) -> (Arc<OcppAdapter>, InboundChannels) {
    let (adapter, channels) = OcppAdapter::new(AdapterConfig::new(node), table).unwrap();
    (Arc::new(adapter), channels)
}

#[tokio::test]
async fn unreachable_node_fails_without_waiting() {
    let (a, _channels) = adapter("A", Arc::new(StaticRoutingTable::new()));
    let request = JsonRequest::new(
        RequestId::from(42),
        "A",
        Destination::to("B"),
        "GetVariables",
        json!({"getVariableData": []}),
    );

    let started = Instant::now();
    let done = a.send_json_request_and_wait(request).await;

    assert_eq!(done.request_id(), &RequestId::from(42));
    assert_eq!(done.error_code(), Some(ErrorCode::InternalError));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(a.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn late_response_within_timeout_is_returned() {
    let table = Arc::new(StaticRoutingTable::new());
    let (csms, mut rx) = LoopbackTransport::new("csms");
    table.register_client("CSMS", csms);
    let (cs, _channels) = adapter("CS001", table);

    let responder = cs.clone();
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if let AnyEnvelope::JsonRequest(request) = envelope {
                tokio::time::sleep(Duration::from_secs(2)).await;
                let response = JsonResponse::for_request(
                    &request,
                    "CSMS",
                    json!({"idTokenInfo": {"status": "Accepted"}}),
                );
                responder
                    .receive_json_response(response, ConnectionInfo::new("ws-csms").with_remote("CSMS"))
                    .await;
            }
        }
    });

    let request = JsonRequest::new(
        RequestId::from(7),
        "CS001",
        Destination::to("CSMS"),
        "Authorize",
        json!({"idToken": {"idToken": "TOKEN123", "type": "ISO14443"}}),
    )
    .with_timeout(Duration::from_secs(30));

    let started = Instant::now();
    let done = cs.send_json_request_and_wait(request).await;
    let elapsed = started.elapsed();

    let response = done.json_response().expect("response");
    assert_eq!(response.payload["idTokenInfo"]["status"], "Accepted");
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_millis(2025));
    assert_eq!(done.connection_received.as_ref().unwrap().connection_id, "ws-csms");
    assert!(done.response_timestamp.is_some());
    assert_eq!(cs.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_get_their_own_answers() {
    let table = Arc::new(StaticRoutingTable::new());
    let (csms, mut rx) = LoopbackTransport::new("csms");
    table.register_client("CSMS", csms);
    let (cs, _channels) = adapter("CS001", table);

    // Answer in reverse arrival order, each with a payload naming the request
    let responder = cs.clone();
    tokio::spawn(async move {
        let mut requests = Vec::new();
        while requests.len() < 20 {
            if let Some(AnyEnvelope::JsonRequest(request)) = rx.recv().await {
                requests.push(request);
            }
        }
        for request in requests.into_iter().rev() {
            let echo = json!({"echo": request.header.request_id.as_str()});
            let response = JsonResponse::for_request(&request, "CSMS", echo);
            responder
                .receive_json_response(response, ConnectionInfo::new("ws-csms"))
                .await;
        }
    });

    let mut waiters = Vec::new();
    for _ in 0..20 {
        let cs = cs.clone();
        waiters.push(tokio::spawn(async move {
            let request = cs.new_json_request(Destination::to("CSMS"), "DataTransfer", json!({}));
            let id = request.header.request_id.clone();
            (id, cs.send_json_request_and_wait(request).await)
        }));
    }

    for waiter in waiters {
        let (id, done) = waiter.await.unwrap();
        let response = done.json_response().expect("response");
        assert_eq!(response.payload["echo"], id.as_str());
    }
    assert_eq!(cs.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_ids_unique_across_tasks() {
    let (a, _channels) = adapter("A", Arc::new(StaticRoutingTable::new()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let a = a.clone();
        handles.push(tokio::spawn(async move {
            (0..500).map(|_| a.next_request_id()).collect::<Vec<_>>()
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "duplicate request id");
        }
    }
    assert_eq!(seen.len(), 8 * 500);
}

#[tokio::test]
async fn response_for_unknown_id_is_ignored() {
    let (a, mut channels) = adapter("A", Arc::new(StaticRoutingTable::new()));
    let never_sent = JsonRequest::new(
        RequestId::from(999),
        "A",
        Destination::to("B"),
        "Heartbeat",
        json!({}),
    );
    let response = JsonResponse::for_request(&never_sent, "B", json!({}));

    assert!(!a.receive_json_response(response, ConnectionInfo::new("ws-b")).await);
    assert_eq!(a.pending_count(), 0);
    assert!(channels.unsolicited_errors.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn answer_after_timeout_is_dropped() {
    let table = Arc::new(StaticRoutingTable::new());
    let (csms, mut rx) = LoopbackTransport::new("csms");
    table.register_client("CSMS", csms);
    let (cs, mut channels) = adapter("CS001", table);

    let request = cs
        .new_json_request(Destination::to("CSMS"), "Heartbeat", json!({}))
        .with_timeout(Duration::from_millis(100));
    let done = cs.send_json_request_and_wait(request).await;
    assert_eq!(done.error_code(), Some(ErrorCode::Timeout));

    let Some(AnyEnvelope::JsonRequest(sent)) = rx.recv().await else {
        panic!("request was not sent");
    };
    let late = JsonRequestError::for_request(&sent, "CSMS", ErrorCode::GenericError, "too late");
    assert!(!cs.receive_json_request_error(late, ConnectionInfo::new("ws-csms")).await);

    // Nobody waits for it any more, so it ends up in the unsolicited sink
    let unsolicited = channels.unsolicited_errors.try_recv().unwrap();
    assert_eq!(unsolicited.envelope.request_id(), &sent.header.request_id);
    assert_eq!(cs.pending_count(), 0);
}

#[tokio::test]
async fn broadcast_survives_one_failing_transport() {
    let table = Arc::new(StaticRoutingTable::new());
    let (uplink, _up_rx) = LoopbackTransport::new("uplink");
    let (cs1, _rx1) = LoopbackTransport::new("cs1");
    let (cs2, _rx2) = LoopbackTransport::new("cs2");
    cs2.set_failing(true);
    table.register_client("CSMS", uplink.clone());
    table.register_server("CS001", cs1.clone());
    table.register_server("CS002", cs2.clone());
    let (lc, _channels) = adapter("LC1", table);

    let message = lc.new_json_send_message(
        Destination::broadcast(),
        "NotifyEvent",
        json!({"seqNo": 0, "eventData": []}),
    );
    let result = lc.send_json_send_message(&message).await;

    assert_eq!(result, SentMessageResult::Broadcast { delivered: 2, failed: 1 });
    assert_eq!(uplink.sent_count(), 1);
    assert_eq!(cs1.sent_count(), 1);
    assert_eq!(cs2.sent_count(), 0);
}

#[tokio::test]
async fn binary_request_round_trip() {
    let table = Arc::new(StaticRoutingTable::new());
    let (csms, mut rx) = LoopbackTransport::new("csms");
    table.register_client("CSMS", csms);
    let (cs, _channels) = adapter("CS001", table);

    let responder = cs.clone();
    tokio::spawn(async move {
        if let Some(AnyEnvelope::BinaryRequest(request)) = rx.recv().await {
            let mut payload = request.payload.clone();
            payload.reverse();
            let response = BinaryResponse::for_request(&request, "CSMS", payload);
            responder
                .receive_binary_response(response, ConnectionInfo::new("ws-csms"))
                .await;
        }
    });

    let request = cs.new_binary_request(Destination::to("CSMS"), "BinaryDataTransfer", vec![1, 2, 3]);
    let done = cs.send_binary_request_and_wait(request).await;

    assert_eq!(done.binary_response().unwrap().payload, vec![3, 2, 1]);
    assert_eq!(cs.pending_count(), 0);
}

/// Station CS001 with its CSMS uplink; answers are produced by `answer`
/// for the first request the CSMS side sees.
fn station_answering<F>(answer: F) -> Arc<OcppAdapter>
where
    F: FnOnce(AnyEnvelope) -> Option<AnyEnvelope> + Send + 'static,
{
    let table = Arc::new(StaticRoutingTable::new());
    let (csms, rx) = LoopbackTransport::new("csms");
    table.register_client("CSMS", csms);
    let (cs, _channels) = adapter("CS001", table);
    spawn_answer(rx, cs.clone(), answer);
    cs
}

fn spawn_answer<F>(mut rx: mpsc::UnboundedReceiver<AnyEnvelope>, to: Arc<OcppAdapter>, answer: F)
where
    F: FnOnce(AnyEnvelope) -> Option<AnyEnvelope> + Send + 'static,
{
    tokio::spawn(async move {
        if let Some(reply) = rx.recv().await.and_then(answer) {
            to.receive(reply, ConnectionInfo::new("ws-csms").with_remote("CSMS"))
                .await;
        }
    });
}

#[tokio::test(start_paused = true)]
async fn binary_request_error_completes_request() {
    let cs = station_answering(|envelope| match envelope {
        AnyEnvelope::BinaryRequest(request) => Some(AnyEnvelope::BinaryRequestError(
            BinaryRequestError::for_request(&request, "CSMS", ErrorCode::FormatViolation, "bad frame")
                .with_details(vec![0xde, 0xad]),
        )),
        _ => None,
    });

    let request = cs.new_binary_request(Destination::to("CSMS"), "BinaryDataTransfer", vec![1, 2, 3]);
    let id = request.header.request_id.clone();
    let done = cs.send_binary_request_and_wait(request).await;

    let error = done.binary_request_error().expect("binary request error");
    assert_eq!(error.header.request_id, id);
    assert_eq!(error.error_description, "bad frame");
    assert_eq!(error.error_details, vec![0xde, 0xad]);
    assert_eq!(done.error_code(), Some(ErrorCode::FormatViolation));
    assert_eq!(cs.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn binary_response_error_completes_request() {
    let cs = station_answering(|envelope| match envelope {
        AnyEnvelope::BinaryRequest(request) => {
            // Error raised against a response bearing the same request id
            let response = BinaryResponse::for_request(&request, "CS001", Vec::new());
            Some(AnyEnvelope::BinaryResponseError(BinaryResponseError::for_response(
                &response,
                "CSMS",
                ErrorCode::PropertyConstraintViolation,
                "length out of range",
            )))
        }
        _ => None,
    });

    let request = cs.new_binary_request(Destination::to("CSMS"), "BinaryDataTransfer", vec![9]);
    let done = cs.send_binary_request_and_wait(request).await;

    let error = done.binary_response_error().expect("binary response error");
    assert_eq!(error.error_description, "length out of range");
    assert_eq!(done.error_code(), Some(ErrorCode::PropertyConstraintViolation));
    assert!(done.binary_response().is_none());
    assert_eq!(cs.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn json_response_error_completes_request() {
    let cs = station_answering(|envelope| match envelope {
        AnyEnvelope::JsonRequest(request) => {
            let response = JsonResponse::for_request(&request, "CS001", json!({}));
            Some(AnyEnvelope::JsonResponseError(
                JsonResponseError::for_response(
                    &response,
                    "CSMS",
                    ErrorCode::TypeConstraintViolation,
                    "status must be a string",
                ),
            ))
        }
        _ => None,
    });

    let request = cs.new_json_request(Destination::to("CSMS"), "StatusNotification", json!({}));
    let done = cs.send_json_request_and_wait(request).await;

    let error = done.json_response_error().expect("json response error");
    assert_eq!(error.error_description, "status must be a string");
    assert_eq!(done.error_code(), Some(ErrorCode::TypeConstraintViolation));
    assert!(done.json_response().is_none());
    assert_eq!(cs.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn json_request_answered_in_binary() {
    let cs = station_answering(|envelope| match envelope {
        AnyEnvelope::JsonRequest(request) => Some(AnyEnvelope::BinaryResponse(
            BinaryResponse::for_request(&request, "CSMS", vec![0x01, 0x02]),
        )),
        _ => None,
    });

    let request = cs.new_json_request(Destination::to("CSMS"), "GetLog", json!({"logType": "DiagnosticsLog"}));
    let started = Instant::now();
    let done = cs.send_json_request_and_wait(request).await;

    // Correlation is by request id only, whatever the payload family
    assert_eq!(done.binary_response().unwrap().payload, vec![0x01, 0x02]);
    assert!(done.json_response().is_none());
    assert_eq!(done.error_code(), None);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(cs.pending_count(), 0);
}
