//! Generic message envelopes
//!
//! Every message the adapter moves is one of five envelope kinds, each
//! available in a JSON and a binary flavour:
//!
//! | Kind          | JSON                | Binary                |
//! |---------------|---------------------|-----------------------|
//! | Request       | `JsonRequest`       | `BinaryRequest`       |
//! | Response      | `JsonResponse`      | `BinaryResponse`      |
//! | Request error | `JsonRequestError`  | `BinaryRequestError`  |
//! | Response error| `JsonResponseError` | `BinaryResponseError` |
//! | One-way send  | `JsonSendMessage`   | `BinarySendMessage`   |
//!
//! All of them share an `EnvelopeHeader`. Pairing of requests with their
//! answers is by `RequestId` only, so a JSON request may be answered by a
//! binary response and vice versa.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorCode;
use crate::ids::{EventTrackingId, NodeId, RequestId};

/// Ordered list of nodes a message has traversed, originator first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkPath(Vec<NodeId>);

impl NetworkPath {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Path starting at the given originator
    pub fn from_source(source: NodeId) -> Self {
        Self(vec![source])
    }

    /// The originating node
    pub fn source(&self) -> Option<&NodeId> {
        self.0.first()
    }

    /// The most recent hop
    pub fn last(&self) -> Option<&NodeId> {
        self.0.last()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.0.contains(node)
    }

    /// Copy of this path with `node` appended
    pub fn append(&self, node: NodeId) -> Self {
        let mut hops = self.0.clone();
        hops.push(node);
        Self(hops)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.0
    }
}

impl From<Vec<NodeId>> for NetworkPath {
    fn from(hops: Vec<NodeId>) -> Self {
        Self(hops)
    }
}

/// Routing expression: a final target plus an optional explicit source route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    target: NodeId,
    via: Vec<NodeId>,
}

impl Destination {
    /// Address a node directly; the routing table decides how to reach it
    pub fn to(target: impl Into<NodeId>) -> Self {
        Self {
            target: target.into(),
            via: Vec::new(),
        }
    }

    /// Address a node through explicit intermediate hops
    pub fn via(target: impl Into<NodeId>, hops: Vec<NodeId>) -> Self {
        Self {
            target: target.into(),
            via: hops,
        }
    }

    /// Every currently connected transport
    pub fn broadcast() -> Self {
        Self::to(NodeId::broadcast())
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    pub fn remaining_hops(&self) -> &[NodeId] {
        &self.via
    }

    /// Node the message has to be handed to next
    pub fn next_hop(&self) -> &NodeId {
        self.via.first().unwrap_or(&self.target)
    }

    pub fn is_broadcast(&self) -> bool {
        self.via.is_empty() && self.target.is_broadcast()
    }

    /// Whether a node receiving this message is its final recipient
    pub fn is_for(&self, local: &NodeId) -> bool {
        self.via.is_empty() && (self.target == *local || self.target.is_broadcast())
    }

    /// Drop the head of the source route if it names `local`
    pub fn advance(&self, local: &NodeId) -> Self {
        let mut next = self.clone();
        if next.via.first() == Some(local) {
            next.via.remove(0);
        }
        next
    }
}

/// Fields shared by every envelope kind
#[derive(Debug, Clone)]
pub struct EnvelopeHeader {
    pub timestamp: DateTime<Utc>,
    pub event_tracking_id: EventTrackingId,
    pub destination: Destination,
    pub network_path: NetworkPath,
    pub request_id: RequestId,
    pub cancellation: CancellationToken,
}

impl EnvelopeHeader {
    pub fn new(request_id: RequestId, source: NodeId, destination: Destination) -> Self {
        Self {
            timestamp: Utc::now(),
            event_tracking_id: EventTrackingId::new(),
            destination,
            network_path: NetworkPath::from_source(source),
            request_id,
            cancellation: CancellationToken::new(),
        }
    }

    /// Header for an answer to `request`: same request and tracking id,
    /// addressed back to the request's originator.
    pub fn reply_to(request: &EnvelopeHeader, responder: NodeId) -> Self {
        let origin = request
            .network_path
            .source()
            .cloned()
            .unwrap_or_else(|| request.destination.target().clone());

        Self {
            timestamp: Utc::now(),
            event_tracking_id: request.event_tracking_id.clone(),
            destination: Destination::to(origin),
            network_path: NetworkPath::from_source(responder),
            request_id: request.request_id.clone(),
            cancellation: CancellationToken::new(),
        }
    }
}

/// JSON or binary payload family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    Json,
    Binary,
}

/// Payload types an envelope can carry
pub trait Payload: Clone + std::fmt::Debug + Send + Sync + 'static {
    const FORMAT: WireFormat;

    /// Details used when an error envelope is synthesized locally
    fn empty_details() -> Self;
}

impl Payload for Value {
    const FORMAT: WireFormat = WireFormat::Json;

    fn empty_details() -> Self {
        Value::Object(serde_json::Map::new())
    }
}

impl Payload for Vec<u8> {
    const FORMAT: WireFormat = WireFormat::Binary;

    fn empty_details() -> Self {
        Vec::new()
    }
}

/// Envelope kinds, used for logging and routing decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Response,
    RequestError,
    ResponseError,
    Send,
}

/// Kind plus wire format, e.g. "JSONRequest" or "BinaryResponseError"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvelopeKind {
    pub kind: MessageKind,
    pub format: WireFormat,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.format {
            WireFormat::Json => "JSON",
            WireFormat::Binary => "Binary",
        };
        let suffix = match self.kind {
            MessageKind::Request => "Request",
            MessageKind::Response => "Response",
            MessageKind::RequestError => "RequestError",
            MessageKind::ResponseError => "ResponseError",
            MessageKind::Send => "SendMessage",
        };
        write!(f, "{}{}", prefix, suffix)
    }
}

/// Common view over all envelope kinds
pub trait Envelope: Clone + std::fmt::Debug + Send + Sync + 'static {
    fn header(&self) -> &EnvelopeHeader;
    fn header_mut(&mut self) -> &mut EnvelopeHeader;
    fn kind(&self) -> EnvelopeKind;

    fn request_id(&self) -> &RequestId {
        &self.header().request_id
    }

    fn destination(&self) -> &Destination {
        &self.header().destination
    }

    fn network_path(&self) -> &NetworkPath {
        &self.header().network_path
    }
}

/// Request expecting exactly one response or error
#[derive(Debug, Clone)]
pub struct Request<P: Payload> {
    pub header: EnvelopeHeader,
    pub action: String,
    pub payload: P,
    /// Time allowed for the answer; the adapter default applies when unset
    pub timeout: Option<Duration>,
}

impl<P: Payload> Request<P> {
    pub fn new(
        request_id: RequestId,
        source: impl Into<NodeId>,
        destination: Destination,
        action: impl Into<String>,
        payload: P,
    ) -> Self {
        Self {
            header: EnvelopeHeader::new(request_id, source.into(), destination),
            action: action.into(),
            payload,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.header.cancellation = token;
        self
    }

    pub fn with_event_tracking_id(mut self, id: EventTrackingId) -> Self {
        self.header.event_tracking_id = id;
        self
    }
}

/// Successful answer to a request
#[derive(Debug, Clone)]
pub struct Response<P: Payload> {
    pub header: EnvelopeHeader,
    pub payload: P,
}

impl<P: Payload> Response<P> {
    pub fn for_request<Q: Payload>(request: &Request<Q>, responder: impl Into<NodeId>, payload: P) -> Self {
        Self {
            header: EnvelopeHeader::reply_to(&request.header, responder.into()),
            payload,
        }
    }
}

/// The recipient could not process a request
#[derive(Debug, Clone)]
pub struct RequestError<P: Payload> {
    pub header: EnvelopeHeader,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: P,
}

impl<P: Payload> RequestError<P> {
    pub fn for_request<Q: Payload>(
        request: &Request<Q>,
        responder: impl Into<NodeId>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            header: EnvelopeHeader::reply_to(&request.header, responder.into()),
            error_code,
            error_description: error_description.into(),
            error_details: P::empty_details(),
        }
    }

    pub fn with_details(mut self, details: P) -> Self {
        self.error_details = details;
        self
    }
}

/// The originator could not process a response
#[derive(Debug, Clone)]
pub struct ResponseError<P: Payload> {
    pub header: EnvelopeHeader,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: P,
}

impl<P: Payload> ResponseError<P> {
    pub fn for_response<Q: Payload>(
        response: &Response<Q>,
        responder: impl Into<NodeId>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            header: EnvelopeHeader::reply_to(&response.header, responder.into()),
            error_code,
            error_description: error_description.into(),
            error_details: P::empty_details(),
        }
    }
}

/// One-way message, no answer expected
#[derive(Debug, Clone)]
pub struct SendMessage<P: Payload> {
    pub header: EnvelopeHeader,
    pub action: String,
    pub payload: P,
}

impl<P: Payload> SendMessage<P> {
    pub fn new(
        request_id: RequestId,
        source: impl Into<NodeId>,
        destination: Destination,
        action: impl Into<String>,
        payload: P,
    ) -> Self {
        Self {
            header: EnvelopeHeader::new(request_id, source.into(), destination),
            action: action.into(),
            payload,
        }
    }
}

macro_rules! impl_envelope {
    ($ty:ident, $kind:expr) => {
        impl<P: Payload> Envelope for $ty<P> {
            fn header(&self) -> &EnvelopeHeader {
                &self.header
            }

            fn header_mut(&mut self) -> &mut EnvelopeHeader {
                &mut self.header
            }

            fn kind(&self) -> EnvelopeKind {
                EnvelopeKind {
                    kind: $kind,
                    format: P::FORMAT,
                }
            }
        }
    };
}

impl_envelope!(Request, MessageKind::Request);
impl_envelope!(Response, MessageKind::Response);
impl_envelope!(RequestError, MessageKind::RequestError);
impl_envelope!(ResponseError, MessageKind::ResponseError);
impl_envelope!(SendMessage, MessageKind::Send);

pub type JsonRequest = Request<Value>;
pub type JsonResponse = Response<Value>;
pub type JsonRequestError = RequestError<Value>;
pub type JsonResponseError = ResponseError<Value>;
pub type JsonSendMessage = SendMessage<Value>;

pub type BinaryRequest = Request<Vec<u8>>;
pub type BinaryResponse = Response<Vec<u8>>;
pub type BinaryRequestError = RequestError<Vec<u8>>;
pub type BinaryResponseError = ResponseError<Vec<u8>>;
pub type BinarySendMessage = SendMessage<Vec<u8>>;

/// Any envelope, owned. Produced by frame decoding and captured by test transports.
#[derive(Debug, Clone)]
pub enum AnyEnvelope {
    JsonRequest(JsonRequest),
    JsonResponse(JsonResponse),
    JsonRequestError(JsonRequestError),
    JsonResponseError(JsonResponseError),
    JsonSendMessage(JsonSendMessage),
    BinaryRequest(BinaryRequest),
    BinaryResponse(BinaryResponse),
    BinaryRequestError(BinaryRequestError),
    BinaryResponseError(BinaryResponseError),
    BinarySendMessage(BinarySendMessage),
}

impl AnyEnvelope {
    pub fn header(&self) -> &EnvelopeHeader {
        match self {
            AnyEnvelope::JsonRequest(e) => &e.header,
            AnyEnvelope::JsonResponse(e) => &e.header,
            AnyEnvelope::JsonRequestError(e) => &e.header,
            AnyEnvelope::JsonResponseError(e) => &e.header,
            AnyEnvelope::JsonSendMessage(e) => &e.header,
            AnyEnvelope::BinaryRequest(e) => &e.header,
            AnyEnvelope::BinaryResponse(e) => &e.header,
            AnyEnvelope::BinaryRequestError(e) => &e.header,
            AnyEnvelope::BinaryResponseError(e) => &e.header,
            AnyEnvelope::BinarySendMessage(e) => &e.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut EnvelopeHeader {
        match self {
            AnyEnvelope::JsonRequest(e) => &mut e.header,
            AnyEnvelope::JsonResponse(e) => &mut e.header,
            AnyEnvelope::JsonRequestError(e) => &mut e.header,
            AnyEnvelope::JsonResponseError(e) => &mut e.header,
            AnyEnvelope::JsonSendMessage(e) => &mut e.header,
            AnyEnvelope::BinaryRequest(e) => &mut e.header,
            AnyEnvelope::BinaryResponse(e) => &mut e.header,
            AnyEnvelope::BinaryRequestError(e) => &mut e.header,
            AnyEnvelope::BinaryResponseError(e) => &mut e.header,
            AnyEnvelope::BinarySendMessage(e) => &mut e.header,
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            AnyEnvelope::JsonRequest(e) => e.kind(),
            AnyEnvelope::JsonResponse(e) => e.kind(),
            AnyEnvelope::JsonRequestError(e) => e.kind(),
            AnyEnvelope::JsonResponseError(e) => e.kind(),
            AnyEnvelope::JsonSendMessage(e) => e.kind(),
            AnyEnvelope::BinaryRequest(e) => e.kind(),
            AnyEnvelope::BinaryResponse(e) => e.kind(),
            AnyEnvelope::BinaryRequestError(e) => e.kind(),
            AnyEnvelope::BinaryResponseError(e) => e.kind(),
            AnyEnvelope::BinarySendMessage(e) => e.kind(),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.header().request_id
    }
}
