//! OCPP WebSocket client transport
//!
//! Uplink from a networking node to the next node towards the CSMS.
//! Handles:
//! - WebSocket connection with OCPP subprotocol
//! - Automatic reconnection with exponential backoff
//! - Feeding decoded frames into the adapter's receive operations
//!
//! Sends never block on the socket: frames go through a bounded queue that
//! the connection loop drains. While disconnected every send fails with
//! `TransmissionFailed`, so waiting requests fail fast instead of timing out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        protocol::WebSocketConfig,
        Message,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::OcppAdapter;
use crate::envelope::{
    BinaryRequest, BinaryRequestError, BinaryResponse, BinaryResponseError, BinarySendMessage,
    JsonRequest, JsonRequestError, JsonResponse, JsonResponseError, JsonSendMessage,
};
use crate::error::OcppError;
use crate::frame::{self, EncodeFrame, Frame, FrameContext};
use crate::ids::NodeId;
use crate::transport::{ConnectionInfo, SentMessageResult, Transport};

/// OCPP 2.0.1 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

/// Configuration for the WebSocket uplink
#[derive(Debug, Clone)]
pub struct WebSocketClientConfig {
    /// CSMS (or upstream node) WebSocket URL
    pub csms_url: String,
    /// Charging station identity (used in URL path)
    pub station_id: String,
    /// Node at the other end of the connection
    pub remote_node: NodeId,
    /// Subprotocol requested during the handshake
    pub subprotocol: String,
    /// Reconnect delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,
    /// Outgoing frame queue size
    pub queue_capacity: usize,
}

impl Default for WebSocketClientConfig {
    fn default() -> Self {
        Self {
            csms_url: "ws://localhost:8180/steve/websocket/CentralSystemService".to_string(),
            station_id: "EK3-001".to_string(),
            remote_node: NodeId::new("CSMS"),
            subprotocol: OCPP_SUBPROTOCOL.to_string(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            queue_capacity: 64,
        }
    }
}

pub struct WebSocketClientTransport {
    config: WebSocketClientConfig,
    name: String,
    outgoing_tx: mpsc::Sender<Frame>,
    outgoing_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    connected: watch::Sender<bool>,
}

impl WebSocketClientTransport {
    pub fn new(config: WebSocketClientConfig) -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.queue_capacity);
        let (connected, _) = watch::channel(false);
        Arc::new(Self {
            name: format!("ws:{}", config.remote_node),
            config,
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            connected,
        })
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    fn enqueue<E: EncodeFrame>(&self, envelope: &E) -> SentMessageResult {
        if !self.is_connected() {
            return SentMessageResult::failed(format!("{} is not connected", self.name));
        }
        let frame = match envelope.encode_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to serialize message: {}", e);
                return SentMessageResult::failed(e.to_string());
            }
        };
        match self.outgoing_tx.try_send(frame) {
            Ok(()) => SentMessageResult::Success,
            Err(e) => SentMessageResult::failed(format!("{}: {}", self.name, e)),
        }
    }

    /// Run the connection loop until `shutdown` fires.
    ///
    /// Decoded frames are handed to `adapter`. Can only be started once.
    pub async fn run(
        self: Arc<Self>,
        adapter: Arc<OcppAdapter>,
        shutdown: CancellationToken,
    ) -> Result<(), OcppError> {
        let mut outgoing_rx = self
            .outgoing_rx
            .lock()
            .take()
            .ok_or(OcppError::AlreadyRunning)?;

        let mut reconnect_delay = self.config.reconnect_delay;
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            info!("Connecting to CSMS: {}", self.config.csms_url);

            let result = self
                .connect_and_run(attempt, &mut outgoing_rx, &adapter, &shutdown, &mut reconnect_delay)
                .await;
            self.connected.send_replace(false);

            match result {
                Ok(()) => {
                    info!("Connection closed gracefully");
                    return Ok(());
                }
                Err(OcppError::InvalidUrl(url)) => {
                    error!("Invalid CSMS URL: {}", url);
                    return Err(OcppError::InvalidUrl(url));
                }
                Err(e) => {
                    error!("Connection error: {}", e);

                    // Exponential backoff
                    info!("Reconnecting in {:?}", reconnect_delay);
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(reconnect_delay) => {}
                    }
                    reconnect_delay =
                        std::cmp::min(reconnect_delay * 2, self.config.max_reconnect_delay);
                }
            }
        }
    }

    /// Connect and run until disconnection or shutdown
    async fn connect_and_run(
        &self,
        attempt: u64,
        outgoing_rx: &mut mpsc::Receiver<Frame>,
        adapter: &OcppAdapter,
        shutdown: &CancellationToken,
        reconnect_delay: &mut Duration,
    ) -> Result<(), OcppError> {
        let url = build_ocpp_url(&self.config.csms_url, &self.config.station_id);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|_| OcppError::InvalidUrl(url.clone()))?;
        let protocol = HeaderValue::from_str(&self.config.subprotocol)
            .map_err(|_| OcppError::InvalidFormat)?;
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);

        let ws_config = WebSocketConfig {
            max_message_size: Some(64 * 1024),
            max_frame_size: Some(16 * 1024),
            ..Default::default()
        };

        let connect = connect_async_with_config(request, Some(ws_config), false);
        let (ws_stream, response) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            connected = connect => connected.map_err(|e| {
                error!("WebSocket connection failed: {}", e);
                OcppError::ConnectionClosed
            })?,
        };

        let accepted_protocol = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        debug!("Negotiated subprotocol: {:?}", accepted_protocol);

        info!("WebSocket connected to {}", url);

        // Frames queued before this connection belong to requests that
        // already failed or timed out
        while outgoing_rx.try_recv().is_ok() {}

        *reconnect_delay = self.config.reconnect_delay;
        self.connected.send_replace(true);

        let ctx = FrameContext {
            local: adapter.node_id().clone(),
            remote: self.config.remote_node.clone(),
        };
        let connection = ConnectionInfo::new(format!("{}#{}", self.name, attempt))
            .with_remote(self.config.remote_node.clone());

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ok(());
                }

                Some(frame) = outgoing_rx.recv() => {
                    let message = match frame {
                        Frame::Text(text) => {
                            debug!("Sending: {}", text);
                            Message::Text(text)
                        }
                        Frame::Binary(bytes) => Message::Binary(bytes),
                    };
                    if let Err(e) = ws_tx.send(message).await {
                        error!("Failed to send WebSocket message: {}", e);
                        return Err(OcppError::ConnectionClosed);
                    }
                }

                msg = ws_rx.next() => {
                    let decoded = match msg {
                        Some(Ok(Message::Text(text))) => {
                            debug!("Received: {}", text);
                            frame::decode_text(&text, &ctx)
                        }
                        Some(Ok(Message::Binary(bytes))) => frame::decode_binary(&bytes, &ctx),
                        Some(Ok(Message::Close(_))) => {
                            info!("WebSocket closed by server");
                            return Err(OcppError::ConnectionClosed);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            error!("WebSocket error: {}", e);
                            return Err(OcppError::ConnectionClosed);
                        }
                        None => {
                            info!("WebSocket stream ended");
                            return Err(OcppError::ConnectionClosed);
                        }
                    };

                    match decoded {
                        Ok(envelope) => {
                            adapter.receive(envelope, connection.clone()).await;
                        }
                        Err(e) => warn!("Failed to parse OCPP message: {}", e),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketClientTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_json_request(&self, request: &JsonRequest) -> SentMessageResult {
        self.enqueue(request)
    }

    async fn send_json_response(&self, response: &JsonResponse) -> SentMessageResult {
        self.enqueue(response)
    }

    async fn send_json_request_error(&self, error: &JsonRequestError) -> SentMessageResult {
        self.enqueue(error)
    }

    async fn send_json_response_error(&self, error: &JsonResponseError) -> SentMessageResult {
        self.enqueue(error)
    }

    async fn send_json_send_message(&self, message: &JsonSendMessage) -> SentMessageResult {
        self.enqueue(message)
    }

    async fn send_binary_request(&self, request: &BinaryRequest) -> SentMessageResult {
        self.enqueue(request)
    }

    async fn send_binary_response(&self, response: &BinaryResponse) -> SentMessageResult {
        self.enqueue(response)
    }

    async fn send_binary_request_error(&self, error: &BinaryRequestError) -> SentMessageResult {
        self.enqueue(error)
    }

    async fn send_binary_response_error(&self, error: &BinaryResponseError) -> SentMessageResult {
        self.enqueue(error)
    }

    async fn send_binary_send_message(&self, message: &BinarySendMessage) -> SentMessageResult {
        self.enqueue(message)
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, station_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), station_id)
}
