//! # OCPP Adapter
//!
//! Request/response correlation and multi-hop routing for OCPP networking
//! nodes: charging stations, local controllers and the CSMS.
//!
//! Every outbound request is registered under its request id before it is
//! sent. Exactly one outcome is delivered to the caller: the matching
//! response or error, a `Timeout` error at the deadline, or an
//! `InternalError` when the request could not be sent or was cancelled.
//!
//! ## Architecture
//!
//! ```text
//!          CSMS
//!            │ WebSocket (OCPP-J)
//!            ▼
//! ┌─────────────────────────────────┐
//! │    local controller LC1         │
//! │  ┌───────────┐  ┌────────────┐  │
//! │  │ Pending   │◄─│ Inbound    │◄─┼── responses / errors
//! │  │ Registry  │  │ Completion │  │
//! │  └───────────┘  └────────────┘  │
//! │  ┌───────────┐  ┌────────────┐  │
//! │  │ Dispatcher│─►│ Routing    │──┼── next hop / broadcast
//! │  └───────────┘  │ Table      │  │
//! │                 └────────────┘  │
//! └─────────────┬───────────────────┘
//!               │ WebSocket (OCPP-J)
//!               ▼
//!      charging stations
//! ```
//!
//! Envelopes addressed elsewhere are forwarded with the local node appended
//! to their network path. An envelope whose path already contains the local
//! node is dropped.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ocpp_adapter::{AdapterConfig, Destination, OcppAdapter, StaticRoutingTable};
//! use ocpp_adapter::ws::{WebSocketClientConfig, WebSocketClientTransport};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let uplink = WebSocketClientTransport::new(WebSocketClientConfig {
//!         csms_url: "ws://localhost:8180/steve/websocket/CentralSystemService".into(),
//!         station_id: "CS001".into(),
//!         ..Default::default()
//!     });
//!
//!     let routing = Arc::new(StaticRoutingTable::new());
//!     routing.register_client("CSMS", uplink.clone());
//!
//!     let (adapter, _channels) = OcppAdapter::new(AdapterConfig::new("CS001"), routing)?;
//!     let adapter = Arc::new(adapter);
//!     tokio::spawn(uplink.run(adapter.clone(), CancellationToken::new()));
//!
//!     let request = adapter.new_json_request(
//!         Destination::to("CSMS"),
//!         "Heartbeat",
//!         serde_json::json!({}),
//!     );
//!     let done = adapter.send_json_request_and_wait(request).await;
//!     println!("{:?}", done.error_code());
//!
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod ids;
pub mod inbound;
pub mod loopback;
pub mod registry;
pub mod routing;
pub mod transport;
pub mod ws;

pub use adapter::{InboundChannels, OcppAdapter};
pub use config::{AdapterConfig, SignaturePolicy};
pub use dispatcher::{MessageDispatcher, SentMessageLog, SentMessageLogger};
pub use error::{ErrorCode, OcppError};
pub use heartbeat::spawn_heartbeats;
pub use ids::{EventTrackingId, NodeId, RequestId, RequestIdGenerator};
pub use inbound::{IncomingMessage, UnsolicitedError};
pub use registry::{Completion, PendingRequest, PendingRequestRegistry};
pub use routing::{Reachability, RoutingTable, StaticRoutingTable};
pub use transport::{ConnectionInfo, SentMessageResult, Transport};

// Re-export envelope types
pub use envelope::{
    AnyEnvelope, BinaryRequest, BinaryRequestError, BinaryResponse, BinaryResponseError,
    BinarySendMessage, Destination, Envelope, EnvelopeHeader, JsonRequest, JsonRequestError,
    JsonResponse, JsonResponseError, JsonSendMessage, NetworkPath,
};
