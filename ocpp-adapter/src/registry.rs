//! Pending request registry
//!
//! Maps request ids to in-flight requests. Transport reader tasks complete
//! entries, waiting callers remove them. Every operation is atomic per key
//! (one `DashMap` shard lock), so there is no global lock across requests.
//!
//! Completion is first-writer-wins: once an entry carries an outcome, further
//! completion attempts for the same id are refused, and after removal the id
//! is simply unknown.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::envelope::{
    BinaryRequest, BinaryRequestError, BinaryResponse, BinaryResponseError, Destination,
    EnvelopeHeader, JsonRequest, JsonRequestError, JsonResponse, JsonResponseError, NetworkPath,
    Payload, RequestError,
};
use crate::error::ErrorCode;
use crate::ids::RequestId;
use crate::transport::ConnectionInfo;

/// The request a pending entry was created for
#[derive(Debug, Clone)]
pub enum OutboundRequest {
    Json(JsonRequest),
    Binary(BinaryRequest),
}

impl OutboundRequest {
    pub fn header(&self) -> &EnvelopeHeader {
        match self {
            OutboundRequest::Json(r) => &r.header,
            OutboundRequest::Binary(r) => &r.header,
        }
    }

    pub fn action(&self) -> &str {
        match self {
            OutboundRequest::Json(r) => &r.action,
            OutboundRequest::Binary(r) => &r.action,
        }
    }
}

/// The single final outcome of a request
#[derive(Debug, Clone)]
pub enum Completion {
    JsonResponse(JsonResponse),
    BinaryResponse(BinaryResponse),
    JsonRequestError(JsonRequestError),
    JsonResponseError(JsonResponseError),
    BinaryRequestError(BinaryRequestError),
    BinaryResponseError(BinaryResponseError),
}

impl Completion {
    /// Error code for error outcomes, `None` for responses
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Completion::JsonResponse(_) | Completion::BinaryResponse(_) => None,
            Completion::JsonRequestError(e) => Some(e.error_code),
            Completion::JsonResponseError(e) => Some(e.error_code),
            Completion::BinaryRequestError(e) => Some(e.error_code),
            Completion::BinaryResponseError(e) => Some(e.error_code),
        }
    }

    pub fn is_response(&self) -> bool {
        self.error_code().is_none()
    }
}

/// Where an answer actually came from
#[derive(Debug, Clone)]
pub struct ReceivedFrom {
    pub connection: Option<ConnectionInfo>,
    pub destination: Destination,
    pub network_path: NetworkPath,
}

/// In-flight correlation record
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_timestamp: DateTime<Utc>,
    pub destination: Destination,
    /// Absolute deadline for an answer
    pub deadline: Instant,
    pub request: OutboundRequest,
    completion: Option<Completion>,
    pub response_timestamp: Option<DateTime<Utc>>,
    pub connection_received: Option<ConnectionInfo>,
    pub destination_received: Option<Destination>,
    pub network_path_received: Option<NetworkPath>,
}

impl PendingRequest {
    pub fn new(request: OutboundRequest, deadline: Instant) -> Self {
        Self {
            request_timestamp: request.header().timestamp,
            destination: request.header().destination.clone(),
            deadline,
            request,
            completion: None,
            response_timestamp: None,
            connection_received: None,
            destination_received: None,
            network_path_received: None,
        }
    }

    /// A request that failed locally before (or instead of) an answer:
    /// routing failure, transmit failure, timeout or cancellation.
    pub fn failed(
        request: OutboundRequest,
        deadline: Instant,
        error_code: ErrorCode,
        description: impl Into<String>,
    ) -> Self {
        let mut pending = Self::new(request, deadline);
        pending.fail_locally(error_code, description);
        pending
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request.header().request_id
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_some()
    }

    pub fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    pub fn into_completion(self) -> Option<Completion> {
        self.completion
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.completion.as_ref().and_then(Completion::error_code)
    }

    pub fn json_response(&self) -> Option<&JsonResponse> {
        match &self.completion {
            Some(Completion::JsonResponse(r)) => Some(r),
            _ => None,
        }
    }

    pub fn binary_response(&self) -> Option<&BinaryResponse> {
        match &self.completion {
            Some(Completion::BinaryResponse(r)) => Some(r),
            _ => None,
        }
    }

    pub fn json_request_error(&self) -> Option<&JsonRequestError> {
        match &self.completion {
            Some(Completion::JsonRequestError(e)) => Some(e),
            _ => None,
        }
    }

    pub fn json_response_error(&self) -> Option<&JsonResponseError> {
        match &self.completion {
            Some(Completion::JsonResponseError(e)) => Some(e),
            _ => None,
        }
    }

    pub fn binary_request_error(&self) -> Option<&BinaryRequestError> {
        match &self.completion {
            Some(Completion::BinaryRequestError(e)) => Some(e),
            _ => None,
        }
    }

    pub fn binary_response_error(&self) -> Option<&BinaryResponseError> {
        match &self.completion {
            Some(Completion::BinaryResponseError(e)) => Some(e),
            _ => None,
        }
    }

    /// Fill the outcome slot. Returns false if an outcome is already present.
    fn complete(&mut self, completion: Completion, received: Option<ReceivedFrom>) -> bool {
        if self.completion.is_some() {
            return false;
        }
        self.completion = Some(completion);
        self.response_timestamp = Some(Utc::now());
        if let Some(received) = received {
            self.connection_received = received.connection;
            self.destination_received = Some(received.destination);
            self.network_path_received = Some(received.network_path);
        }
        true
    }

    /// Overwrite the outcome with a locally synthesized request error,
    /// addressed back to the request's originator.
    pub(crate) fn fail_locally(&mut self, error_code: ErrorCode, description: impl Into<String>) {
        let description = description.into();
        self.completion = Some(match &self.request {
            OutboundRequest::Json(r) => {
                Completion::JsonRequestError(local_error(&r.header, error_code, description))
            }
            OutboundRequest::Binary(r) => {
                Completion::BinaryRequestError(local_error(&r.header, error_code, description))
            }
        });
        self.response_timestamp = Some(Utc::now());
    }
}

fn local_error<P: Payload>(
    request: &EnvelopeHeader,
    error_code: ErrorCode,
    description: String,
) -> RequestError<P> {
    let origin = request
        .network_path
        .source()
        .cloned()
        .unwrap_or_else(|| request.destination.target().clone());

    RequestError {
        header: EnvelopeHeader {
            timestamp: Utc::now(),
            event_tracking_id: request.event_tracking_id.clone(),
            destination: Destination::to(origin),
            network_path: NetworkPath::new(),
            request_id: request.request_id.clone(),
            cancellation: request.cancellation.clone(),
        },
        error_code,
        error_description: description,
        error_details: P::empty_details(),
    }
}

struct Slot {
    pending: PendingRequest,
    signal: Arc<Notify>,
}

/// Concurrent map of in-flight requests
#[derive(Default)]
pub struct PendingRequestRegistry {
    slots: DashMap<RequestId, Slot>,
}

impl PendingRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. Refused if the id is already pending.
    pub fn add(&self, id: RequestId, pending: PendingRequest) -> bool {
        match self.slots.entry(id) {
            Entry::Occupied(entry) => {
                debug!("Request id {} is already pending", entry.key());
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot {
                    pending,
                    signal: Arc::new(Notify::new()),
                });
                true
            }
        }
    }

    /// Signal fired once the entry for `id` is completed
    pub fn completion_signal(&self, id: &RequestId) -> Option<Arc<Notify>> {
        self.slots.get(id).map(|slot| slot.signal.clone())
    }

    /// Record the outcome for `id`.
    ///
    /// Returns false if the id is unknown or was already completed; the
    /// caller treats that as a late or duplicate answer.
    pub fn try_complete(
        &self,
        id: &RequestId,
        completion: Completion,
        received: Option<ReceivedFrom>,
    ) -> bool {
        let Some(mut slot) = self.slots.get_mut(id) else {
            return false;
        };
        if !slot.pending.complete(completion, received) {
            debug!("Request {} already completed, ignoring duplicate", id);
            return false;
        }
        // Stores a permit if the waiter is not parked yet
        slot.signal.notify_one();
        true
    }

    /// Remove and return the entry, completed or not
    pub fn try_remove(&self, id: &RequestId) -> Option<PendingRequest> {
        self.slots.remove(id).map(|(_, slot)| slot.pending)
    }

    /// Remove and return the entry only if it already carries an outcome
    pub fn take_completed(&self, id: &RequestId) -> Option<PendingRequest> {
        self.slots
            .remove_if(id, |_, slot| slot.pending.is_completed())
            .map(|(_, slot)| slot.pending)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn is_completed(&self, id: &RequestId) -> bool {
        self.slots
            .get(id)
            .map(|slot| slot.pending.is_completed())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
