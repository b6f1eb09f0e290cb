//! Frame codec seam between the communication core and the packet layout.
//!
//! The core never touches byte layouts itself: a [`FrameCodec`] converts a
//! [`CallRequest`] into raw frame bytes and classifies inbound bytes into
//! confirmations, responses, or unrecognized traffic. Peripheral-specific
//! argument encoding and result parsing live behind this seam.
//!
//! [`MsgPackFrameCodec`] is a reference implementation (one tag byte plus a
//! MessagePack body) used by the test suite and in-memory loops.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{DpaError, Result};
use crate::request::CallRequest;
use crate::response::{Confirmation, Response};

/// Classification of one inbound frame.
#[derive(Debug, Clone)]
pub enum FrameClass {
    /// The network accepted a request into mesh routing.
    Confirmation(Confirmation),
    /// A response or unsolicited message from a node.
    Response(Response),
    /// Bytes the codec cannot attribute to the protocol.
    Unrecognized,
}

/// Converts call requests to raw frames and classifies inbound frames.
pub trait FrameCodec: Send + Sync + 'static {
    /// Serialize a request into frame bytes.
    ///
    /// Fails with [`DpaError::Encoding`] when the arguments cannot be
    /// converted to the wire format.
    fn encode(&self, request: &CallRequest) -> Result<Bytes>;

    /// Classify raw inbound bytes.
    ///
    /// Fails with [`DpaError::Decoding`] on malformed frames.
    fn classify(&self, frame: &[u8]) -> Result<FrameClass>;
}

/// Frame tag bytes used by the reference codec.
mod tag {
    /// Outbound call request.
    pub const REQUEST: u8 = 0x01;
    /// Routing confirmation.
    pub const CONFIRMATION: u8 = 0x02;
    /// Response or unsolicited message.
    pub const RESPONSE: u8 = 0x03;
}

/// What the reference codec puts on the wire for a request. The request id
/// is deliberately absent: correlation is the orchestrator's job, done by
/// the addressing key, exactly as on the real medium.
#[derive(Debug, Serialize, Deserialize)]
struct WireRequest {
    network_id: String,
    node_id: String,
    interface_id: u8,
    method_id: String,
    args: Vec<serde_json::Value>,
}

/// Reference codec: one tag byte followed by a MessagePack body.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackFrameCodec;

impl MsgPackFrameCodec {
    /// Build confirmation frame bytes. Test harnesses use this to play the
    /// network's side of an exchange.
    pub fn confirmation_frame(confirmation: &Confirmation) -> Bytes {
        let mut out = vec![tag::CONFIRMATION];
        // Confirmation serialization cannot fail: three plain integers.
        out.extend(rmp_serde::to_vec_named(confirmation).unwrap_or_default());
        Bytes::from(out)
    }

    /// Build response frame bytes for the network's side of an exchange.
    pub fn response_frame(response: &Response) -> Result<Bytes> {
        let mut out = vec![tag::RESPONSE];
        let body = rmp_serde::to_vec_named(response)
            .map_err(|e| DpaError::Encoding(e.to_string()))?;
        out.extend(body);
        Ok(Bytes::from(out))
    }
}

impl FrameCodec for MsgPackFrameCodec {
    fn encode(&self, request: &CallRequest) -> Result<Bytes> {
        let wire = WireRequest {
            network_id: request.network_id().to_owned(),
            node_id: request.node_id().to_owned(),
            interface_id: request.interface_id(),
            method_id: request.method_id().to_owned(),
            args: request.args().to_vec(),
        };
        let body = rmp_serde::to_vec_named(&wire)
            .map_err(|e| DpaError::Encoding(e.to_string()))?;
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(tag::REQUEST);
        out.extend(body);
        Ok(Bytes::from(out))
    }

    fn classify(&self, frame: &[u8]) -> Result<FrameClass> {
        let (&first, body) = frame
            .split_first()
            .ok_or_else(|| DpaError::Decoding("empty frame".into()))?;
        match first {
            tag::CONFIRMATION => {
                let confirmation: Confirmation = rmp_serde::from_slice(body)
                    .map_err(|e| DpaError::Decoding(e.to_string()))?;
                Ok(FrameClass::Confirmation(confirmation))
            }
            tag::RESPONSE => {
                let response: Response = rmp_serde::from_slice(body)
                    .map_err(|e| DpaError::Decoding(e.to_string()))?;
                Ok(FrameClass::Response(response))
            }
            _ => Ok(FrameClass::Unrecognized),
        }
    }
}
