//! Periodic heartbeats
//!
//! Runs on its own task and talks to the rest of the adapter only through
//! ordinary `send_json_request_and_wait` calls.

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::OcppAdapter;
use crate::envelope::Destination;

pub const HEARTBEAT_ACTION: &str = "Heartbeat";

/// Start the heartbeat task, unless heartbeats are disabled or have no destination
pub fn spawn_heartbeats(
    adapter: Arc<OcppAdapter>,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    let config = adapter.config();
    if config.disable_send_heartbeats {
        debug!("Heartbeats disabled");
        return None;
    }
    let Some(destination) = config.heartbeat_destination.clone() else {
        debug!("No heartbeat destination configured");
        return None;
    };
    let period = config.send_heartbeats_every;

    info!("Sending heartbeats to {} every {:?}", destination, period);

    Some(tokio::spawn(async move {
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Heartbeat task stopped");
                    break;
                }
                _ = ticks.tick() => {
                    let request = adapter
                        .new_json_request(Destination::to(destination.clone()), HEARTBEAT_ACTION, json!({}))
                        .with_cancellation(shutdown.child_token());

                    let done = adapter.send_json_request_and_wait(request).await;
                    match done.json_response() {
                        Some(response) => debug!("Heartbeat answered: {}", response.payload),
                        None => match done.error_code() {
                            Some(code) => warn!("Heartbeat to {} failed: {}", destination, code),
                            None => debug!("Heartbeat answered with binary payload"),
                        },
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterConfig;
    use crate::envelope::{AnyEnvelope, JsonResponse};
    use crate::loopback::LoopbackTransport;
    use crate::routing::StaticRoutingTable;
    use crate::transport::ConnectionInfo;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_sent_periodically() {
        let table = Arc::new(StaticRoutingTable::new());
        let (csms, mut rx) = LoopbackTransport::new("csms");
        table.register_client("CSMS", csms.clone());

        let config = AdapterConfig::new("CS001").with_heartbeats("CSMS", Duration::from_secs(60));
        let (adapter, _channels) = OcppAdapter::new(config, table).unwrap();
        let adapter = Arc::new(adapter);

        let shutdown = CancellationToken::new();
        let handle = spawn_heartbeats(adapter.clone(), shutdown.clone()).unwrap();

        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                AnyEnvelope::JsonRequest(request) => {
                    assert_eq!(request.action, HEARTBEAT_ACTION);
                    let response = JsonResponse::for_request(
                        &request,
                        "CSMS",
                        json!({"currentTime": "2026-10-17T12:00:00Z"}),
                    );
                    adapter
                        .receive_json_response(response, ConnectionInfo::new("ws-csms"))
                        .await;
                }
                other => panic!("Expected heartbeat request, got {:?}", other),
            }
        }

        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(csms.sent_count(), 2);
        assert_eq!(adapter.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_heartbeats_do_not_spawn() {
        let config = AdapterConfig::new("CS001")
            .with_heartbeats("CSMS", Duration::from_secs(60))
            .without_heartbeats();
        let (adapter, _channels) =
            OcppAdapter::new(config, Arc::new(StaticRoutingTable::new())).unwrap();

        assert!(spawn_heartbeats(Arc::new(adapter), CancellationToken::new()).is_none());
    }

    #[tokio::test]
    async fn test_no_destination_no_heartbeats() {
        let (adapter, _channels) =
            OcppAdapter::new(AdapterConfig::new("CS001"), Arc::new(StaticRoutingTable::new()))
                .unwrap();
        assert!(spawn_heartbeats(Arc::new(adapter), CancellationToken::new()).is_none());
    }
}
