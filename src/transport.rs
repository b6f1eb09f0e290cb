//! Transport seam - the physical link carrying raw frames.
//!
//! The core only ever calls [`Transport::send`]; inbound frames arrive on an
//! mpsc channel handed to the protocol layer at spawn time, which plays the
//! role of the transport's single registered listener. Concrete UDP/serial
//! transports live outside this crate; [`ChannelTransport`] is an in-memory
//! implementation for tests and local loops.

use bytes::Bytes;
use tokio::sync::mpsc;

/// A raw frame delivered by the transport.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Raw frame bytes.
    pub bytes: Bytes,
    /// Network the frame arrived from.
    pub network_id: String,
}

/// Sends raw frames toward a connected network.
pub trait Transport: Send + Sync + 'static {
    /// Transmit one frame to the given network.
    fn send(&self, frame: Bytes, network_id: &str) -> std::io::Result<()>;
}

/// In-memory transport: outbound frames are pushed to a channel the test
/// harness reads, inbound frames are whatever the harness feeds into the
/// channel given to the protocol layer.
#[derive(Debug)]
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<InboundFrame>,
}

impl ChannelTransport {
    /// Create a transport plus the receiving end of its outbound frames.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<InboundFrame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (Self { outbound }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Bytes, network_id: &str) -> std::io::Result<()> {
        self.outbound
            .send(InboundFrame {
                bytes: frame,
                network_id: network_id.to_owned(),
            })
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "transport receiver dropped")
            })
    }
}
