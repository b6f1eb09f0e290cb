//! End-to-end tests over the full stack: connector, protocol layer, state
//! machine and an in-memory transport standing in for the network.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use dpa_link::{
    CallError, CallRequest, CallResult, ChannelTransport, Confirmation, Connector,
    ConnectorConfig, DeliveryListener, InboundFrame, MsgPackFrameCodec, ProcessingInfo,
    ProcessingState, ProcessingTime, ProtocolConfig, ProtocolLayer, Response,
};

struct ChannelListener {
    deliveries: mpsc::UnboundedSender<ProcessingInfo>,
    notifications: mpsc::UnboundedSender<Response>,
}

impl DeliveryListener for ChannelListener {
    fn on_delivery(&self, info: ProcessingInfo) {
        self.deliveries.send(info).ok();
    }

    fn on_async_notification(&self, response: Response) {
        self.notifications.send(response).ok();
    }
}

/// The crate's side of the wire plus the harness playing the network.
struct Network {
    connector: Connector,
    deliveries: mpsc::UnboundedReceiver<ProcessingInfo>,
    notifications: mpsc::UnboundedReceiver<Response>,
    outbound: mpsc::UnboundedReceiver<InboundFrame>,
    inbound_tx: mpsc::UnboundedSender<InboundFrame>,
}

fn network() -> Network {
    let (transport, outbound) = ChannelTransport::new();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (protocol, events) = ProtocolLayer::spawn(
        Arc::new(MsgPackFrameCodec),
        Arc::new(transport),
        inbound_rx,
        ProtocolConfig::default(),
    );
    let (deliveries_tx, deliveries) = mpsc::unbounded_channel();
    let (notifications_tx, notifications) = mpsc::unbounded_channel();
    let listener = Arc::new(ChannelListener {
        deliveries: deliveries_tx,
        notifications: notifications_tx,
    });
    let connector = Connector::spawn(protocol, events, listener, ConnectorConfig::default());
    Network {
        connector,
        deliveries,
        notifications,
        outbound,
        inbound_tx,
    }
}

impl Network {
    async fn recv_request_frame(&mut self) -> InboundFrame {
        let frame = tokio::time::timeout(Duration::from_secs(60), self.outbound.recv())
            .await
            .expect("outbound frame expected")
            .expect("transport open");
        assert_eq!(frame.bytes[0], 0x01, "request frames carry the request tag");
        frame
    }

    fn feed(&self, bytes: impl Into<Bytes>) {
        self.inbound_tx
            .send(InboundFrame {
                bytes: bytes.into(),
                network_id: "net-1".into(),
            })
            .unwrap();
    }

    fn confirm(&self, hops: u8, hops_response: u8, timeslot_length: u8) {
        self.feed(MsgPackFrameCodec::confirmation_frame(&Confirmation {
            hops,
            hops_response,
            timeslot_length,
        }));
    }

    fn respond_to(&self, request: &CallRequest, result: serde_json::Value) {
        let response = Response {
            network_id: request.network_id().to_owned(),
            node_id: request.node_id().to_owned(),
            interface_id: request.interface_id(),
            method_id: request.method_id().to_owned(),
            result,
            additional_data: None,
        };
        self.feed(MsgPackFrameCodec::response_frame(&response).unwrap());
    }

    async fn next_delivery(&mut self) -> ProcessingInfo {
        tokio::time::timeout(Duration::from_secs(120), self.deliveries.recv())
            .await
            .expect("delivery expected")
            .expect("listener open")
    }
}

fn read_request(node: &str) -> CallRequest {
    CallRequest::new("net-1", node, 10, "read_temperature", vec![serde_json::json!(1)])
}

#[tokio::test(start_paused = true)]
async fn routed_call_round_trip() {
    let mut net = network();
    let request = read_request("3");
    let id = net
        .connector
        .call_with_default_time(request.clone())
        .await
        .unwrap();

    net.recv_request_frame().await;
    net.confirm(1, 1, 8);
    net.respond_to(&request, serde_json::json!({ "celsius": 21 }));

    let delivery = net.next_delivery().await;
    assert_eq!(delivery.request_id, id);
    assert_eq!(delivery.state, ProcessingState::ResultArrived);
    assert_eq!(
        delivery.result.unwrap().main,
        serde_json::json!({ "celsius": 21 })
    );
}

#[tokio::test(start_paused = true)]
async fn coordinator_call_needs_no_confirmation() {
    let mut net = network();
    let request = CallRequest::new("net-1", "0", 2, "peripheral_info", vec![]);
    let id = net
        .connector
        .call_with_default_time(request.clone())
        .await
        .unwrap();

    net.recv_request_frame().await;
    net.respond_to(&request, serde_json::json!("ok"));

    let delivery = net.next_delivery().await;
    assert_eq!(delivery.request_id, id);
    assert_eq!(delivery.state, ProcessingState::ResultArrived);
}

#[tokio::test(start_paused = true)]
async fn broadcast_acknowledged_by_confirmation_alone() {
    let mut net = network();
    let request = CallRequest::new("net-1", "255", 1, "set_output", vec![]).broadcast();
    let id = net.connector.call_with_default_time(request).await.unwrap();

    net.recv_request_frame().await;
    // hops_response 0: a broadcast routes out but nothing routes back
    net.confirm(2, 0, 8);

    let delivery = net.next_delivery().await;
    assert_eq!(delivery.request_id, id);
    assert_eq!(delivery.result, Some(CallResult::broadcast_accepted()));
}

#[tokio::test(start_paused = true)]
async fn silent_network_fails_then_recovers() {
    let mut net = network();
    let sent_at = Instant::now();
    let first = net
        .connector
        .call_with_default_time(read_request("3"))
        .await
        .unwrap();

    // nothing answers: the confirmation wait expires
    let delivery = net.next_delivery().await;
    assert_eq!(delivery.request_id, first);
    assert_eq!(delivery.error, Some(CallError::ConfirmationTimeout));
    let elapsed = sent_at.elapsed();
    assert!(
        elapsed >= Duration::from_millis(2000) && elapsed < Duration::from_millis(2500),
        "confirmation wait should expire at its configured timeout, took {elapsed:?}"
    );

    // the next call goes through unimpeded
    let request = read_request("4");
    let second = net
        .connector
        .call_with_default_time(request.clone())
        .await
        .unwrap();
    net.recv_request_frame().await;
    net.confirm(1, 1, 8);
    net.respond_to(&request, serde_json::json!(2));

    let delivery = net.next_delivery().await;
    assert_eq!(delivery.request_id, second);
    assert_eq!(delivery.state, ProcessingState::ResultArrived);
}

#[tokio::test(start_paused = true)]
async fn unsolicited_traffic_mid_exchange_reaches_the_listener() {
    let mut net = network();
    let request = read_request("3");
    let id = net
        .connector
        .call_with_default_time(request.clone())
        .await
        .unwrap();
    net.recv_request_frame().await;
    net.confirm(1, 1, 8);

    // another node speaks up before our response arrives
    let unsolicited = Response {
        network_id: "net-1".into(),
        node_id: "7".into(),
        interface_id: 4,
        method_id: "alarm".into(),
        result: serde_json::json!(true),
        additional_data: None,
    };
    net.feed(MsgPackFrameCodec::response_frame(&unsolicited).unwrap());
    net.respond_to(&request, serde_json::json!(21));

    let notification = tokio::time::timeout(Duration::from_secs(30), net.notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.node_id, "7");

    let delivery = net.next_delivery().await;
    assert_eq!(delivery.request_id, id);
    assert_eq!(delivery.state, ProcessingState::ResultArrived);
}

#[tokio::test(start_paused = true)]
async fn consecutive_calls_are_paced_and_ordered() {
    let mut net = network();
    let first = read_request("3");
    let second = read_request("4");
    let first_id = net
        .connector
        .call_with_default_time(first.clone())
        .await
        .unwrap();
    let second_id = net
        .connector
        .call_with_default_time(second.clone())
        .await
        .unwrap();

    net.recv_request_frame().await;
    let first_sent = Instant::now();
    net.confirm(1, 1, 8);
    net.respond_to(&first, serde_json::json!(1));
    let delivery = net.next_delivery().await;
    assert_eq!(delivery.request_id, first_id);

    // the second send respects the minimum spacing between sends
    net.recv_request_frame().await;
    assert!(first_sent.elapsed() >= Duration::from_millis(1000));
    net.confirm(1, 1, 8);
    net.respond_to(&second, serde_json::json!(2));
    let delivery = net.next_delivery().await;
    assert_eq!(delivery.request_id, second_id);
}

#[tokio::test(start_paused = true)]
async fn late_answer_after_processing_window() {
    let mut net = network();
    let request = CallRequest::new("net-1", "0", 2, "discovery", vec![]).time_unbounded();
    let id = net
        .connector
        .call(request.clone(), ProcessingTime::Bounded(Duration::from_secs(4)))
        .await
        .unwrap();
    net.recv_request_frame().await;

    // the processing window elapses; the call parks instead of failing
    tokio::time::sleep(Duration::from_secs(6)).await;
    let info = net.connector.processing_info(id).await.expect("parked call");
    assert_eq!(info.state, ProcessingState::WaitingForProcessing);

    net.respond_to(&request, serde_json::json!({ "nodes": [1, 2, 3] }));
    let delivery = net.next_delivery().await;
    assert_eq!(delivery.request_id, id);
    assert_eq!(delivery.state, ProcessingState::ResultArrived);
}

#[tokio::test(start_paused = true)]
async fn cancelled_call_never_delivers_a_result() {
    let mut net = network();
    let request = read_request("3");
    let id = net
        .connector
        .call(request.clone(), ProcessingTime::Unlimited)
        .await
        .unwrap();
    net.recv_request_frame().await;

    net.connector.cancel(id).await.unwrap();
    let delivery = net.next_delivery().await;
    assert_eq!(delivery.request_id, id);
    assert_eq!(delivery.state, ProcessingState::Cancelled);

    // an answer arriving after the cancellation is dropped
    net.confirm(1, 1, 8);
    net.respond_to(&request, serde_json::json!(21));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(net.deliveries.try_recv().is_err());
}
