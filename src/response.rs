//! Inbound protocol data and per-call processing state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::RequestId;

/// Confirmation frame metadata: the network accepted a request into mesh
/// routing. Consumed exactly once by the state machine to size the
/// downstream waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Outbound routing depth.
    pub hops: u8,
    /// Inbound routing depth; `0` denotes a broadcast with no unicast
    /// response expected.
    pub hops_response: u8,
    /// Medium time unit for this exchange, in 10 ms units.
    pub timeslot_length: u8,
}

impl Confirmation {
    /// Whether this confirmation acknowledges a broadcast.
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.hops_response == 0
    }
}

/// A decoded non-confirmation frame coming up from the frame codec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Source network id.
    pub network_id: String,
    /// Source node id.
    pub node_id: String,
    /// Device-interface identifier the frame belongs to.
    pub interface_id: u8,
    /// Method id the frame answers (or announces, for unsolicited traffic).
    pub method_id: String,
    /// Decoded result payload, opaque to this core.
    pub result: serde_json::Value,
    /// Optional additional data carried alongside the result.
    pub additional_data: Option<serde_json::Value>,
}

/// Result payload of a completed call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    /// Main decoded result.
    pub main: serde_json::Value,
    /// Additional data, if the frame carried any.
    pub additional: Option<serde_json::Value>,
}

impl CallResult {
    /// Result of a locally accepted broadcast: there is no wire-level
    /// payload, only the acceptance itself.
    pub fn broadcast_accepted() -> Self {
        Self {
            main: serde_json::Value::String("broadcast accepted".into()),
            additional: None,
        }
    }
}

/// Why a call failed. Resolved locally into [`ProcessingInfo`], never
/// propagated across component boundaries as a panic or crate error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Transport or encoding failure while handing the request over.
    #[error("request dispatch failed: {0}")]
    Dispatch(String),
    /// No confirmation arrived within the confirmation wait.
    #[error("confirmation timeouted")]
    ConfirmationTimeout,
    /// No response arrived within the computed response wait.
    #[error("response timeouted")]
    ResponseTimeout,
}

/// Processing state of one call request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    /// Still in the pending queue, or retained as an idle request.
    WaitingForProcessing,
    /// Handed to the protocol layer, waiting for a matching inbound event.
    WaitingForResult,
    /// A result arrived and is available.
    ResultArrived,
    /// The call was cancelled before completion.
    Cancelled,
    /// The call failed; see the error descriptor.
    Error,
}

/// Snapshot of the processing of one call request.
#[derive(Debug, Clone)]
pub struct ProcessingInfo {
    /// Id of the request this info describes.
    pub request_id: RequestId,
    /// Current processing state.
    pub state: ProcessingState,
    /// Result payload, present once `state` is [`ProcessingState::ResultArrived`].
    pub result: Option<CallResult>,
    /// Error descriptor, present once `state` is [`ProcessingState::Error`].
    pub error: Option<CallError>,
}

impl ProcessingInfo {
    /// Info in a payload-less state.
    pub fn new(request_id: RequestId, state: ProcessingState) -> Self {
        Self {
            request_id,
            state,
            result: None,
            error: None,
        }
    }

    /// Info for an arrived result.
    pub fn arrived(request_id: RequestId, result: CallResult) -> Self {
        Self {
            request_id,
            state: ProcessingState::ResultArrived,
            result: Some(result),
            error: None,
        }
    }

    /// Info for a failed call.
    pub fn failed(request_id: RequestId, error: CallError) -> Self {
        Self {
            request_id,
            state: ProcessingState::Error,
            result: None,
            error: Some(error),
        }
    }
}

/// Completion of one tracked request, produced by the protocol layer.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Id of the causing request.
    pub request_id: RequestId,
    /// Result on success, error descriptor on failure.
    pub outcome: Result<CallResult, CallError>,
}

/// Event flowing from the protocol layer up to the connector.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// An inbound frame (or synthesized completion) matched a tracked request.
    Completion(Completion),
    /// Unsolicited traffic with no causing request.
    Async(Response),
}
