//! Client-side communication core for DPA mesh networks.
//!
//! The DPA request flow over a time-slotted, half-duplex mesh looks like
//! this: a request frame goes out, the network answers with a routing
//! confirmation, and eventually the addressed node's response comes back.
//! Between and after those frames the medium stays occupied for windows
//! derived from routing depth, and only one exchange may be in flight.
//!
//! This crate stacks three layers on top of a pluggable transport:
//!
//! ```text
//! caller ──► Connector ──► ProtocolLayer ──► Transport
//!            (queue,        (framing,          (raw frames)
//!             pacing,        correlation,
//!             delivery)      StateMachine timing)
//! ```
//!
//! * [`connector::Connector`] is the user surface. Calls are submitted and
//!   tracked by [`request::RequestId`]; outcomes are pushed to a
//!   [`connector::DeliveryListener`].
//! * [`protocol::ProtocolLayer`] serializes requests, correlates inbound
//!   frames by call identity and attributes timeouts.
//! * [`machine::StateMachine`] enforces the single-flight invariant and
//!   computes every wait from the confirmation's routing figures.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dpa_link::codec::MsgPackFrameCodec;
//! use dpa_link::config::{ConnectorConfig, ProtocolConfig};
//! use dpa_link::connector::{Connector, DeliveryListener};
//! use dpa_link::protocol::ProtocolLayer;
//! use dpa_link::request::{CallRequest, ProcessingTime};
//! use dpa_link::response::{ProcessingInfo, Response};
//! use dpa_link::transport::ChannelTransport;
//!
//! struct PrintOutcomes;
//!
//! impl DeliveryListener for PrintOutcomes {
//!     fn on_delivery(&self, info: ProcessingInfo) {
//!         println!("{} finished: {:?}", info.request_id, info.state);
//!     }
//!     fn on_async_notification(&self, response: Response) {
//!         println!("unsolicited message from node {}", response.node_id);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (transport, _outbound) = ChannelTransport::new();
//!     let (inbound_tx, inbound_rx) = tokio::sync::mpsc::unbounded_channel();
//!     let (protocol, events) = ProtocolLayer::spawn(
//!         Arc::new(MsgPackFrameCodec),
//!         Arc::new(transport),
//!         inbound_rx,
//!         ProtocolConfig::default(),
//!     );
//!     let connector = Connector::spawn(
//!         protocol,
//!         events,
//!         Arc::new(PrintOutcomes),
//!         ConnectorConfig::default(),
//!     );
//!
//!     let request = CallRequest::new("net-1", "3", 10, "read_temperature", vec![]);
//!     let id = connector.call(request, ProcessingTime::Unlimited).await?;
//!     println!("submitted {id}");
//!     // frames arriving from the network are fed through `inbound_tx`
//!     drop(inbound_tx);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connector;
pub mod error;
pub mod machine;
pub mod protocol;
pub mod request;
pub mod response;
pub mod transport;

pub use codec::{FrameClass, FrameCodec, MsgPackFrameCodec};
pub use config::{ConnectorConfig, MachineConfig, ProtocolConfig, RetryPolicy};
pub use connector::{Connector, DeliveryListener};
pub use error::{DpaError, Result};
pub use machine::{MachineState, StateMachine};
pub use protocol::ProtocolLayer;
pub use request::{CallRequest, ProcessingTime, RequestId, COORDINATOR_NODE_ID};
pub use response::{
    CallError, CallResult, Confirmation, ProcessingInfo, ProcessingState, ProtocolEvent, Response,
};
pub use transport::{ChannelTransport, InboundFrame, Transport};
