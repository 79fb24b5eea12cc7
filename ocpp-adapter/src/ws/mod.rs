//! WebSocket transports

pub mod client;

pub use client::{build_ocpp_url, WebSocketClientConfig, WebSocketClientTransport, OCPP_SUBPROTOCOL};
