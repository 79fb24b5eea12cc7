//! OCPP-J framing
//!
//! JSON envelopes travel as WebSocket text frames:
//! - CALL:            `[2, messageId, action, payload]`
//! - CALLRESULT:      `[3, messageId, payload]`
//! - CALLERROR:       `[4, messageId, errorCode, errorDescription, errorDetails]`
//! - CALLRESULTERROR: `[5, messageId, errorCode, errorDescription, errorDetails]`
//! - SEND:            `[6, messageId, action, payload]`
//!
//! Binary envelopes travel as WebSocket binary frames with the same message
//! type numbers and length-prefixed (u16, big endian) text fields:
//! `type | id | action` for CALL/SEND, `type | id` for CALLRESULT,
//! `type | id | code | description` for the error frames, followed by the
//! raw payload or error details.
//!
//! Frames carry no routing information. Decoded envelopes are addressed to
//! the local node and their path starts at the peer of the connection.

use serde_json::Value;

use crate::envelope::{
    AnyEnvelope, BinaryRequest, BinaryRequestError, BinaryResponse, BinaryResponseError,
    BinarySendMessage, Destination, EnvelopeHeader, JsonRequest, JsonRequestError, JsonResponse,
    JsonResponseError, JsonSendMessage, Request, RequestError, Response, ResponseError,
    SendMessage,
};
use crate::error::{ErrorCode, OcppError};
use crate::ids::{NodeId, RequestId};

/// OCPP-J message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
    CallResultError = 5,
    Send = 6,
}

impl MessageType {
    fn from_code(code: i64) -> Result<Self, OcppError> {
        match code {
            2 => Ok(MessageType::Call),
            3 => Ok(MessageType::CallResult),
            4 => Ok(MessageType::CallError),
            5 => Ok(MessageType::CallResultError),
            6 => Ok(MessageType::Send),
            other => Err(OcppError::UnknownMessageType(other)),
        }
    }
}

/// A WebSocket payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Both ends of the connection a frame arrived on
#[derive(Debug, Clone)]
pub struct FrameContext {
    pub local: NodeId,
    pub remote: NodeId,
}

impl FrameContext {
    fn header(&self, request_id: RequestId) -> EnvelopeHeader {
        EnvelopeHeader::new(request_id, self.remote.clone(), Destination::to(self.local.clone()))
    }
}

/// Envelopes that can be written as a frame
pub trait EncodeFrame {
    fn encode_frame(&self) -> Result<Frame, OcppError>;
}

fn json_frame(array: Value) -> Result<Frame, OcppError> {
    Ok(Frame::Text(serde_json::to_string(&array)?))
}

impl EncodeFrame for JsonRequest {
    fn encode_frame(&self) -> Result<Frame, OcppError> {
        json_frame(serde_json::json!([
            MessageType::Call as i32,
            self.header.request_id.as_str(),
            &self.action,
            &self.payload
        ]))
    }
}

impl EncodeFrame for JsonResponse {
    fn encode_frame(&self) -> Result<Frame, OcppError> {
        json_frame(serde_json::json!([
            MessageType::CallResult as i32,
            self.header.request_id.as_str(),
            &self.payload
        ]))
    }
}

impl EncodeFrame for JsonRequestError {
    fn encode_frame(&self) -> Result<Frame, OcppError> {
        json_frame(serde_json::json!([
            MessageType::CallError as i32,
            self.header.request_id.as_str(),
            self.error_code.as_str(),
            &self.error_description,
            &self.error_details
        ]))
    }
}

impl EncodeFrame for JsonResponseError {
    fn encode_frame(&self) -> Result<Frame, OcppError> {
        json_frame(serde_json::json!([
            MessageType::CallResultError as i32,
            self.header.request_id.as_str(),
            self.error_code.as_str(),
            &self.error_description,
            &self.error_details
        ]))
    }
}

impl EncodeFrame for JsonSendMessage {
    fn encode_frame(&self) -> Result<Frame, OcppError> {
        json_frame(serde_json::json!([
            MessageType::Send as i32,
            self.header.request_id.as_str(),
            &self.action,
            &self.payload
        ]))
    }
}

/// Writer for the binary frame layout
struct BinaryWriter(Vec<u8>);

impl BinaryWriter {
    fn new(message_type: MessageType, request_id: &RequestId) -> Result<Self, OcppError> {
        let mut writer = Self(vec![message_type as u8]);
        writer.field(request_id.as_str())?;
        Ok(writer)
    }

    fn field(&mut self, text: &str) -> Result<(), OcppError> {
        let len = u16::try_from(text.len()).map_err(|_| OcppError::InvalidFormat)?;
        self.0.extend_from_slice(&len.to_be_bytes());
        self.0.extend_from_slice(text.as_bytes());
        Ok(())
    }

    fn finish(mut self, payload: &[u8]) -> Frame {
        self.0.extend_from_slice(payload);
        Frame::Binary(self.0)
    }
}

impl EncodeFrame for BinaryRequest {
    fn encode_frame(&self) -> Result<Frame, OcppError> {
        let mut w = BinaryWriter::new(MessageType::Call, &self.header.request_id)?;
        w.field(&self.action)?;
        Ok(w.finish(&self.payload))
    }
}

impl EncodeFrame for BinaryResponse {
    fn encode_frame(&self) -> Result<Frame, OcppError> {
        let w = BinaryWriter::new(MessageType::CallResult, &self.header.request_id)?;
        Ok(w.finish(&self.payload))
    }
}

impl EncodeFrame for BinaryRequestError {
    fn encode_frame(&self) -> Result<Frame, OcppError> {
        let mut w = BinaryWriter::new(MessageType::CallError, &self.header.request_id)?;
        w.field(self.error_code.as_str())?;
        w.field(&self.error_description)?;
        Ok(w.finish(&self.error_details))
    }
}

impl EncodeFrame for BinaryResponseError {
    fn encode_frame(&self) -> Result<Frame, OcppError> {
        let mut w = BinaryWriter::new(MessageType::CallResultError, &self.header.request_id)?;
        w.field(self.error_code.as_str())?;
        w.field(&self.error_description)?;
        Ok(w.finish(&self.error_details))
    }
}

impl EncodeFrame for BinarySendMessage {
    fn encode_frame(&self) -> Result<Frame, OcppError> {
        let mut w = BinaryWriter::new(MessageType::Send, &self.header.request_id)?;
        w.field(&self.action)?;
        Ok(w.finish(&self.payload))
    }
}

fn text_at(array: &[Value], index: usize) -> Result<&str, OcppError> {
    array
        .get(index)
        .and_then(Value::as_str)
        .ok_or(OcppError::InvalidFormat)
}

/// Decode a text frame
pub fn decode_text(text: &str, ctx: &FrameContext) -> Result<AnyEnvelope, OcppError> {
    let array: Vec<Value> = serde_json::from_str(text)?;

    let code = array
        .first()
        .and_then(Value::as_i64)
        .ok_or(OcppError::InvalidFormat)?;
    let message_type = MessageType::from_code(code)?;

    let expected_len = match message_type {
        MessageType::Call | MessageType::Send => 4,
        MessageType::CallResult => 3,
        MessageType::CallError | MessageType::CallResultError => 5,
    };
    if array.len() != expected_len {
        return Err(OcppError::InvalidFormat);
    }

    let header = ctx.header(RequestId::new(text_at(&array, 1)?));

    Ok(match message_type {
        MessageType::Call => AnyEnvelope::JsonRequest(Request {
            header,
            action: text_at(&array, 2)?.to_string(),
            payload: array[3].clone(),
            timeout: None,
        }),
        MessageType::Send => AnyEnvelope::JsonSendMessage(SendMessage {
            header,
            action: text_at(&array, 2)?.to_string(),
            payload: array[3].clone(),
        }),
        MessageType::CallResult => AnyEnvelope::JsonResponse(Response {
            header,
            payload: array[2].clone(),
        }),
        MessageType::CallError => AnyEnvelope::JsonRequestError(RequestError {
            header,
            error_code: ErrorCode::parse_lenient(text_at(&array, 2)?),
            error_description: array[3].as_str().unwrap_or("").to_string(),
            error_details: array[4].clone(),
        }),
        MessageType::CallResultError => AnyEnvelope::JsonResponseError(ResponseError {
            header,
            error_code: ErrorCode::parse_lenient(text_at(&array, 2)?),
            error_description: array[3].as_str().unwrap_or("").to_string(),
            error_details: array[4].clone(),
        }),
    })
}

/// Reader for the binary frame layout
struct BinaryReader<'a> {
    bytes: &'a [u8],
}

impl<'a> BinaryReader<'a> {
    fn field(&mut self) -> Result<&'a str, OcppError> {
        let bytes = self.bytes;
        if bytes.len() < 2 {
            return Err(OcppError::InvalidFormat);
        }
        let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let rest = &bytes[2..];
        if rest.len() < len {
            return Err(OcppError::InvalidFormat);
        }
        let text = std::str::from_utf8(&rest[..len]).map_err(|_| OcppError::InvalidFormat)?;
        self.bytes = &rest[len..];
        Ok(text)
    }

    fn rest(self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

/// Decode a binary frame
pub fn decode_binary(bytes: &[u8], ctx: &FrameContext) -> Result<AnyEnvelope, OcppError> {
    let (&code, rest) = bytes.split_first().ok_or(OcppError::InvalidFormat)?;
    let message_type = MessageType::from_code(code as i64)?;

    let mut reader = BinaryReader { bytes: rest };
    let header = ctx.header(RequestId::new(reader.field()?));

    Ok(match message_type {
        MessageType::Call => {
            let action = reader.field()?.to_string();
            AnyEnvelope::BinaryRequest(Request {
                header,
                action,
                payload: reader.rest(),
                timeout: None,
            })
        }
        MessageType::Send => {
            let action = reader.field()?.to_string();
            AnyEnvelope::BinarySendMessage(SendMessage {
                header,
                action,
                payload: reader.rest(),
            })
        }
        MessageType::CallResult => AnyEnvelope::BinaryResponse(Response {
            header,
            payload: reader.rest(),
        }),
        MessageType::CallError => {
            let error_code = ErrorCode::parse_lenient(reader.field()?);
            let error_description = reader.field()?.to_string();
            AnyEnvelope::BinaryRequestError(RequestError {
                header,
                error_code,
                error_description,
                error_details: reader.rest(),
            })
        }
        MessageType::CallResultError => {
            let error_code = ErrorCode::parse_lenient(reader.field()?);
            let error_description = reader.field()?.to_string();
            AnyEnvelope::BinaryResponseError(ResponseError {
                header,
                error_code,
                error_description,
                error_details: reader.rest(),
            })
        }
    })
}

/// Decode either kind of frame
pub fn decode(frame: &Frame, ctx: &FrameContext) -> Result<AnyEnvelope, OcppError> {
    match frame {
        Frame::Text(text) => decode_text(text, ctx),
        Frame::Binary(bytes) => decode_binary(bytes, ctx),
    }
}
