//! In-process transport
//!
//! Every envelope handed to a `LoopbackTransport` is recorded and pushed onto
//! an unbounded channel, so a test (or an in-process peer) can read it and
//! answer through the adapter's receive operations. The transport can be
//! switched into a failing mode to simulate a broken connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::envelope::{
    AnyEnvelope, BinaryRequest, BinaryRequestError, BinaryResponse, BinaryResponseError,
    BinarySendMessage, JsonRequest, JsonRequestError, JsonResponse, JsonResponseError,
    JsonSendMessage,
};
use crate::transport::{SentMessageResult, Transport};

pub struct LoopbackTransport {
    name: String,
    failing: AtomicBool,
    sent: Mutex<Vec<AnyEnvelope>>,
    tx: mpsc::UnboundedSender<AnyEnvelope>,
}

impl LoopbackTransport {
    /// Create a transport and the receiver observing everything it sends
    pub fn new(name: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<AnyEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            name: name.into(),
            failing: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            tx,
        });
        (transport, rx)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Everything successfully sent so far
    pub fn sent(&self) -> Vec<AnyEnvelope> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    fn deliver(&self, envelope: AnyEnvelope) -> SentMessageResult {
        if self.failing.load(Ordering::SeqCst) {
            return SentMessageResult::failed(format!("{} is failing", self.name));
        }
        self.sent.lock().push(envelope.clone());
        // Nobody listening is fine; the envelope is still recorded
        let _ = self.tx.send(envelope);
        SentMessageResult::Success
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_json_request(&self, request: &JsonRequest) -> SentMessageResult {
        self.deliver(AnyEnvelope::JsonRequest(request.clone()))
    }

    async fn send_json_response(&self, response: &JsonResponse) -> SentMessageResult {
        self.deliver(AnyEnvelope::JsonResponse(response.clone()))
    }

    async fn send_json_request_error(&self, error: &JsonRequestError) -> SentMessageResult {
        self.deliver(AnyEnvelope::JsonRequestError(error.clone()))
    }

    async fn send_json_response_error(&self, error: &JsonResponseError) -> SentMessageResult {
        self.deliver(AnyEnvelope::JsonResponseError(error.clone()))
    }

    async fn send_json_send_message(&self, message: &JsonSendMessage) -> SentMessageResult {
        self.deliver(AnyEnvelope::JsonSendMessage(message.clone()))
    }

    async fn send_binary_request(&self, request: &BinaryRequest) -> SentMessageResult {
        self.deliver(AnyEnvelope::BinaryRequest(request.clone()))
    }

    async fn send_binary_response(&self, response: &BinaryResponse) -> SentMessageResult {
        self.deliver(AnyEnvelope::BinaryResponse(response.clone()))
    }

    async fn send_binary_request_error(&self, error: &BinaryRequestError) -> SentMessageResult {
        self.deliver(AnyEnvelope::BinaryRequestError(error.clone()))
    }

    async fn send_binary_response_error(&self, error: &BinaryResponseError) -> SentMessageResult {
        self.deliver(AnyEnvelope::BinaryResponseError(error.clone()))
    }

    async fn send_binary_send_message(&self, message: &BinarySendMessage) -> SentMessageResult {
        self.deliver(AnyEnvelope::BinarySendMessage(message.clone()))
    }
}
