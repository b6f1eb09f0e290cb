//! Error types for dpa-link.

use thiserror::Error;

use crate::machine::MachineState;

/// Main error type for all dpa-link operations.
#[derive(Debug, Error)]
pub enum DpaError {
    /// A call request with missing or malformed fields, rejected at call time.
    #[error("invalid call request: {0}")]
    InvalidArgument(String),

    /// Frame codec failed to encode a request.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Frame codec failed to decode an inbound frame.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// I/O error while sending on the transport.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// An event arrived in a machine state that cannot legally accept it.
    ///
    /// This indicates a violated single-flight invariant or a desync with
    /// the connected network, not an ordinary protocol timeout.
    #[error("illegal {event} in machine state {state:?}")]
    StateViolation {
        /// State the machine was in when the event arrived.
        state: MachineState,
        /// Name of the offending event.
        event: &'static str,
    },

    /// A worker task or its channel has shut down.
    #[error("communication core closed")]
    Closed,

    /// The request id is not known to the connector.
    #[error("request not found")]
    NotFound,
}

/// Result type alias using DpaError.
pub type Result<T> = std::result::Result<T, DpaError>;
