//! Call-dispatch connector: the user-facing surface of the crate.
//!
//! Callers submit [`CallRequest`]s and get a [`RequestId`] back immediately;
//! a single worker task dispatches queued calls one at a time through the
//! protocol layer and delivers every terminal outcome to the registered
//! [`DeliveryListener`]. One call is in flight at any moment, matching the
//! one-exchange contract of the medium underneath.
//!
//! A call whose processing window elapses is not forgotten: it parks in an
//! idle set for a retention window and a late response still reaches the
//! listener. Cancellation and completion are mutually exclusive; whichever
//! claims the call first under the lock wins.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;

use crate::config::ConnectorConfig;
use crate::error::{DpaError, Result};
use crate::protocol::ProtocolLayer;
use crate::request::{CallRequest, ProcessingTime, RequestId};
use crate::response::{
    CallError, Completion, ProcessingInfo, ProcessingState, ProtocolEvent, Response,
};

/// Receives terminal call outcomes and unsolicited node messages.
pub trait DeliveryListener: Send + Sync + 'static {
    /// A call reached a terminal state: result, error or cancellation.
    fn on_delivery(&self, info: ProcessingInfo);

    /// A message arrived that correlates to no sent request.
    fn on_async_notification(&self, response: Response);
}

/// A submitted call waiting for the worker.
#[derive(Debug)]
struct PendingCall {
    request: CallRequest,
    max_time: ProcessingTime,
}

/// The call the worker is processing right now.
#[derive(Debug)]
struct CurrentCall {
    request_id: RequestId,
    state: ProcessingState,
    cancelled: bool,
    max_time: ProcessingTime,
}

/// A call whose processing window elapsed without an answer.
#[derive(Debug)]
struct IdleCall {
    request_id: RequestId,
    since: Instant,
}

/// A delivered terminal outcome, kept queryable for the retention window.
#[derive(Debug)]
struct FinishedCall {
    info: ProcessingInfo,
    at: Instant,
}

struct Shared {
    config: ConnectorConfig,
    pending: Mutex<VecDeque<PendingCall>>,
    current: Mutex<Option<CurrentCall>>,
    idle: Mutex<Vec<IdleCall>>,
    finished: Mutex<Vec<FinishedCall>>,
    /// Signals new pending work to the worker.
    wake: Notify,
    /// Signals a cancellation or deadline change on the current call.
    current_changed: Notify,
}

impl Shared {
    /// Drop idle entries past the retention window.
    fn purge_idle(&self, idle: &mut Vec<IdleCall>) {
        idle.retain(|i| {
            let keep = i.since.elapsed() <= self.config.max_idle_time;
            if !keep {
                tracing::debug!(id = %i.request_id, "idle request aged out");
            }
            keep
        });
    }

    /// Drop finished entries past the retention window.
    fn purge_finished(&self, finished: &mut Vec<FinishedCall>) {
        finished.retain(|f| f.at.elapsed() <= self.config.max_idle_time);
    }
}

/// Handle to the dispatch connector.
#[derive(Clone)]
pub struct Connector {
    shared: Arc<Shared>,
}

impl Connector {
    /// Spawn the connector worker over a protocol layer and its event
    /// stream. Terminal outcomes go to `listener`.
    pub fn spawn(
        protocol: ProtocolLayer,
        events: mpsc::Receiver<ProtocolEvent>,
        listener: Arc<dyn DeliveryListener>,
        config: ConnectorConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            config,
            pending: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            idle: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            wake: Notify::new(),
            current_changed: Notify::new(),
        });
        let worker = Worker {
            shared: Arc::clone(&shared),
            protocol,
            events,
            listener,
            last_send: None,
        };
        tokio::spawn(worker.run());
        Self { shared }
    }

    /// Submit a call with an explicit processing time.
    ///
    /// Returns the id to track the call by; the outcome arrives at the
    /// listener. Fails with [`DpaError::InvalidArgument`] on a malformed
    /// request.
    pub async fn call(
        &self,
        request: CallRequest,
        max_time: ProcessingTime,
    ) -> Result<RequestId> {
        request.validate().map_err(DpaError::InvalidArgument)?;
        let id = request.id();
        tracing::debug!(%id, method = %request.method_id(), "call queued");
        self.shared
            .pending
            .lock()
            .await
            .push_back(PendingCall { request, max_time });
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Submit a call with the configured default processing time.
    pub async fn call_with_default_time(&self, request: CallRequest) -> Result<RequestId> {
        let max_time = ProcessingTime::Bounded(self.shared.config.default_processing_timeout);
        self.call(request, max_time).await
    }

    /// Current processing state of a call. Terminal outcomes stay
    /// retrievable for the retention window, then the call is forgotten.
    pub async fn processing_info(&self, id: RequestId) -> Option<ProcessingInfo> {
        if self
            .shared
            .pending
            .lock()
            .await
            .iter()
            .any(|p| p.request.id() == id)
        {
            return Some(ProcessingInfo::new(id, ProcessingState::WaitingForProcessing));
        }
        if let Some(current) = self.shared.current.lock().await.as_ref() {
            if current.request_id == id {
                return Some(ProcessingInfo::new(id, current.state));
            }
        }
        {
            let mut finished = self.shared.finished.lock().await;
            self.shared.purge_finished(&mut finished);
            if let Some(f) = finished.iter().find(|f| f.info.request_id == id) {
                return Some(f.info.clone());
            }
        }
        let mut idle = self.shared.idle.lock().await;
        self.shared.purge_idle(&mut idle);
        if idle.iter().any(|i| i.request_id == id) {
            return Some(ProcessingInfo::new(id, ProcessingState::WaitingForProcessing));
        }
        None
    }

    /// Cancel a call. Pending calls are withdrawn, the in-flight call is
    /// cancelled unless its completion already won, idle calls are dropped.
    pub async fn cancel(&self, id: RequestId) -> Result<()> {
        {
            let mut pending = self.shared.pending.lock().await;
            if let Some(pos) = pending.iter().position(|p| p.request.id() == id) {
                pending.remove(pos);
                tracing::debug!(%id, "pending call withdrawn");
                return Ok(());
            }
        }
        {
            let mut current = self.shared.current.lock().await;
            if let Some(c) = current.as_mut() {
                if c.request_id == id {
                    c.cancelled = true;
                    self.shared.current_changed.notify_one();
                    tracing::debug!(%id, "in-flight call cancelled");
                    return Ok(());
                }
            }
        }
        {
            let mut idle = self.shared.idle.lock().await;
            if let Some(pos) = idle.iter().position(|i| i.request_id == id) {
                idle.remove(pos);
                tracing::debug!(%id, "idle call dropped");
                return Ok(());
            }
        }
        Err(DpaError::NotFound)
    }

    /// Change the processing time of a pending or in-flight call.
    pub async fn set_max_processing_time(
        &self,
        id: RequestId,
        max_time: ProcessingTime,
    ) -> Result<()> {
        {
            let mut pending = self.shared.pending.lock().await;
            if let Some(p) = pending.iter_mut().find(|p| p.request.id() == id) {
                p.max_time = max_time;
                return Ok(());
            }
        }
        {
            let mut current = self.shared.current.lock().await;
            if let Some(c) = current.as_mut() {
                if c.request_id == id {
                    c.max_time = max_time;
                    self.shared.current_changed.notify_one();
                    return Ok(());
                }
            }
        }
        {
            let mut idle = self.shared.idle.lock().await;
            self.shared.purge_idle(&mut idle);
            if let Some(i) = idle.iter_mut().find(|i| i.request_id == id) {
                // renewed interest restarts the retention window
                i.since = Instant::now();
                return Ok(());
            }
        }
        Err(DpaError::NotFound)
    }
}

struct Worker {
    shared: Arc<Shared>,
    protocol: ProtocolLayer,
    events: mpsc::Receiver<ProtocolEvent>,
    listener: Arc<dyn DeliveryListener>,
    last_send: Option<Instant>,
}

impl Worker {
    /// Record a terminal outcome and hand it to the listener.
    async fn deliver(&self, info: ProcessingInfo) {
        {
            let mut finished = self.shared.finished.lock().await;
            self.shared.purge_finished(&mut finished);
            finished.push(FinishedCall {
                info: info.clone(),
                at: Instant::now(),
            });
        }
        self.listener.on_delivery(info);
    }
}

/// Sleep until an optional deadline; never wakes when there is none.
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

impl Worker {
    async fn run(mut self) {
        loop {
            let Some(call) = self.next_call().await else {
                tracing::debug!("connector worker shutting down");
                return;
            };
            let id = call.request.id();
            *self.shared.current.lock().await = Some(CurrentCall {
                request_id: id,
                state: ProcessingState::WaitingForProcessing,
                cancelled: false,
                max_time: call.max_time,
            });

            if !self.dispatch(&call.request).await {
                continue;
            }
            self.await_outcome(id).await;
        }
    }

    /// Wait for the next submitted call, pumping protocol events meanwhile
    /// so idle completions and async messages are never starved.
    async fn next_call(&mut self) -> Option<PendingCall> {
        loop {
            if let Some(call) = self.shared.pending.lock().await.pop_front() {
                return Some(call);
            }
            tokio::select! {
                _ = self.shared.wake.notified() => {}
                event = self.events.recv() => match event {
                    Some(event) => self.background_event(event).await,
                    None => return None,
                },
            }
        }
    }

    /// Hand the request to the protocol layer, pacing sends and retrying on
    /// dispatch failure. Returns false when the call went no further.
    async fn dispatch(&mut self, request: &CallRequest) -> bool {
        let policy = self.shared.config.retry.clone();
        let mut attempt: u32 = 0;
        loop {
            let since_last = self
                .last_send
                .map(|t| t.elapsed())
                .unwrap_or(Duration::MAX);
            let delay = policy.delay_before_send(attempt, since_last);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if self.take_if_cancelled().await {
                return false;
            }

            match self.protocol.send_request(request).await {
                Ok(()) => {
                    self.last_send = Some(Instant::now());
                    if let Some(c) = self.shared.current.lock().await.as_mut() {
                        c.state = ProcessingState::WaitingForResult;
                    }
                    return true;
                }
                Err(error) => {
                    attempt += 1;
                    tracing::warn!(
                        id = %request.id(),
                        %error,
                        attempt,
                        "request dispatch failed"
                    );
                    if attempt >= policy.max_send_attempts {
                        self.shared.current.lock().await.take();
                        self.deliver(ProcessingInfo::failed(
                            request.id(),
                            CallError::Dispatch(error.to_string()),
                        ))
                        .await;
                        return false;
                    }
                }
            }
        }
    }

    /// Wait until the in-flight call completes, is cancelled, or exceeds its
    /// processing window.
    async fn await_outcome(&mut self, id: RequestId) {
        let started = Instant::now();
        loop {
            let (cancelled, max_time) = {
                let current = self.shared.current.lock().await;
                match current.as_ref() {
                    Some(c) if c.request_id == id => (c.cancelled, c.max_time),
                    // completion already claimed it
                    _ => return,
                }
            };
            if cancelled {
                self.take_if_cancelled().await;
                return;
            }
            let deadline = match max_time {
                ProcessingTime::Bounded(d) => Some(started + d),
                ProcessingTime::Unlimited => None,
            };

            tokio::select! {
                _ = self.shared.current_changed.notified() => {}
                _ = until(deadline) => {
                    self.shared.current.lock().await.take();
                    let mut idle = self.shared.idle.lock().await;
                    self.shared.purge_idle(&mut idle);
                    idle.push(IdleCall { request_id: id, since: Instant::now() });
                    tracing::info!(%id, "processing window elapsed, call parked idle");
                    return;
                }
                event = self.events.recv() => match event {
                    None => return,
                    Some(ProtocolEvent::Async(response)) => {
                        self.listener.on_async_notification(response);
                    }
                    Some(ProtocolEvent::Completion(completion)) => {
                        if completion.request_id == id {
                            if self.finish_current(id, completion).await {
                                return;
                            }
                        } else {
                            self.deliver_idle(completion).await;
                        }
                    }
                },
            }
        }
    }

    /// Claim the current call for its completion. Returns false when a
    /// cancellation won the race; the result is then dropped.
    async fn finish_current(&self, id: RequestId, completion: Completion) -> bool {
        {
            let mut current = self.shared.current.lock().await;
            match current.as_ref() {
                Some(c) if c.request_id == id && !c.cancelled => {
                    current.take();
                }
                _ => {
                    tracing::debug!(%id, "completion lost the race to cancellation");
                    return false;
                }
            }
        }
        self.deliver(outcome_info(completion)).await;
        true
    }

    /// Terminal handling of a cancelled in-flight call.
    async fn take_if_cancelled(&self) -> bool {
        let taken = {
            let mut current = self.shared.current.lock().await;
            match current.as_ref() {
                Some(c) if c.cancelled => current.take(),
                _ => None,
            }
        };
        match taken {
            Some(c) => {
                self.deliver(ProcessingInfo::new(c.request_id, ProcessingState::Cancelled))
                    .await;
                true
            }
            None => false,
        }
    }

    /// Completion for something other than the current call: a late answer
    /// for an idle one, or noise.
    async fn deliver_idle(&self, completion: Completion) {
        let found = {
            let mut idle = self.shared.idle.lock().await;
            self.shared.purge_idle(&mut idle);
            idle.iter()
                .position(|i| i.request_id == completion.request_id)
                .map(|pos| idle.remove(pos))
        };
        match found {
            Some(i) => {
                tracing::debug!(id = %i.request_id, "late outcome for idle call");
                self.deliver(outcome_info(completion)).await;
            }
            None => {
                tracing::debug!(id = %completion.request_id, "outcome for unknown call dropped");
            }
        }
    }

    /// Event arriving while no call is in flight.
    async fn background_event(&self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Async(response) => self.listener.on_async_notification(response),
            ProtocolEvent::Completion(completion) => self.deliver_idle(completion).await,
        }
    }
}

fn outcome_info(completion: Completion) -> ProcessingInfo {
    match completion.outcome {
        Ok(result) => ProcessingInfo::arrived(completion.request_id, result),
        Err(error) => ProcessingInfo::failed(completion.request_id, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackFrameCodec;
    use crate::config::{ConnectorConfig, ProtocolConfig};
    use crate::response::{CallResult, Confirmation};
    use crate::transport::{ChannelTransport, InboundFrame};

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

    struct Harness {
        connector: Connector,
        deliveries: mpsc::UnboundedReceiver<ProcessingInfo>,
        notifications: mpsc::UnboundedReceiver<Response>,
        outbound: Option<mpsc::UnboundedReceiver<InboundFrame>>,
        inbound_tx: mpsc::UnboundedSender<InboundFrame>,
    }

    fn harness() -> Harness {
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
        Harness {
            connector,
            deliveries,
            notifications,
            outbound: Some(outbound),
            inbound_tx,
        }
    }

    impl Harness {
        fn feed_confirmation(&self, hops: u8, hops_response: u8, timeslot_length: u8) {
            let frame = MsgPackFrameCodec::confirmation_frame(&Confirmation {
                hops,
                hops_response,
                timeslot_length,
            });
            self.inbound_tx
                .send(InboundFrame {
                    bytes: frame,
                    network_id: "net-1".into(),
                })
                .unwrap();
        }

        fn feed_response_for(&self, request: &CallRequest, result: serde_json::Value) {
            let response = Response {
                network_id: request.network_id().to_owned(),
                node_id: request.node_id().to_owned(),
                interface_id: request.interface_id(),
                method_id: request.method_id().to_owned(),
                result,
                additional_data: None,
            };
            let frame = MsgPackFrameCodec::response_frame(&response).unwrap();
            self.inbound_tx
                .send(InboundFrame {
                    bytes: frame,
                    network_id: response.network_id,
                })
                .unwrap();
        }

        async fn next_delivery(&mut self) -> ProcessingInfo {
            tokio::time::timeout(Duration::from_secs(60), self.deliveries.recv())
                .await
                .expect("delivery expected")
                .expect("listener channel open")
        }
    }

    fn routed_request() -> CallRequest {
        CallRequest::new("net-1", "3", 10, "read", vec![serde_json::json!(1)])
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_malformed_request() {
        let h = harness();
        let bad = CallRequest::new("net-1", "", 10, "read", vec![]);
        let err = h
            .connector
            .call(bad, ProcessingTime::Unlimited)
            .await
            .unwrap_err();
        assert!(matches!(err, DpaError::InvalidArgument(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn call_completes_and_delivers_result() {
        let mut h = harness();
        let request = routed_request();
        let id = h.connector.call_with_default_time(request.clone()).await.unwrap();

        // wait until the worker has actually sent the frame
        let sent = h.outbound.as_mut().unwrap().recv().await.unwrap();
        assert!(!sent.bytes.is_empty());

        h.feed_confirmation(1, 1, 8);
        h.feed_response_for(&request, serde_json::json!({ "temp": 20 }));

        let delivery = h.next_delivery().await;
        assert_eq!(delivery.request_id, id);
        assert_eq!(delivery.state, ProcessingState::ResultArrived);
        assert_eq!(
            delivery.result.unwrap().main,
            serde_json::json!({ "temp": 20 })
        );

        // the terminal outcome stays queryable for the retention window
        let info = h.connector.processing_info(id).await.expect("retained outcome");
        assert_eq!(info.state, ProcessingState::ResultArrived);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(h.connector.processing_info(id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_timeout_is_delivered_as_error() {
        let mut h = harness();
        let id = h
            .connector
            .call_with_default_time(routed_request())
            .await
            .unwrap();

        let delivery = h.next_delivery().await;
        assert_eq!(delivery.request_id, id);
        assert_eq!(delivery.state, ProcessingState::Error);
        assert_eq!(delivery.error, Some(CallError::ConfirmationTimeout));

        // the error is retrievable afterwards, not only via the listener
        let info = h.connector.processing_info(id).await.expect("retained error");
        assert_eq!(info.state, ProcessingState::Error);
        assert_eq!(info.error, Some(CallError::ConfirmationTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_failure_retries_then_errors() {
        let mut h = harness();
        // closing the outbound end makes every transport send fail
        h.outbound.take();

        let id = h
            .connector
            .call_with_default_time(routed_request())
            .await
            .unwrap();

        let delivery = h.next_delivery().await;
        assert_eq!(delivery.request_id, id);
        assert_eq!(delivery.state, ProcessingState::Error);
        assert!(matches!(delivery.error, Some(CallError::Dispatch(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_is_accepted_without_response() {
        let mut h = harness();
        let request = CallRequest::new("net-1", "255", 1, "set", vec![]).broadcast();
        let id = h.connector.call_with_default_time(request).await.unwrap();

        h.outbound.as_mut().unwrap().recv().await.unwrap();
        h.feed_confirmation(2, 0, 8);

        let delivery = h.next_delivery().await;
        assert_eq!(delivery.request_id, id);
        assert_eq!(delivery.state, ProcessingState::ResultArrived);
        assert_eq!(delivery.result, Some(CallResult::broadcast_accepted()));
    }

    #[tokio::test(start_paused = true)]
    async fn processing_timeout_parks_idle_and_late_answer_arrives() {
        let mut h = harness();
        let request = CallRequest::new("net-1", "0", 2, "long_job", vec![]).time_unbounded();
        let id = h
            .connector
            .call(request.clone(), ProcessingTime::Bounded(Duration::from_secs(3)))
            .await
            .unwrap();

        h.outbound.as_mut().unwrap().recv().await.unwrap();

        // the window elapses with no answer; the call parks idle
        tokio::time::sleep(Duration::from_secs(5)).await;
        let info = h.connector.processing_info(id).await.expect("idle call");
        assert_eq!(info.state, ProcessingState::WaitingForProcessing);
        assert!(h.deliveries.try_recv().is_err());

        // a late answer still reaches the listener
        h.feed_response_for(&request, serde_json::json!("done"));
        let delivery = h.next_delivery().await;
        assert_eq!(delivery.request_id, id);
        assert_eq!(delivery.state, ProcessingState::ResultArrived);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_calls_age_out() {
        let mut h = harness();
        let request = CallRequest::new("net-1", "0", 2, "long_job", vec![]).time_unbounded();
        let id = h
            .connector
            .call(request, ProcessingTime::Bounded(Duration::from_secs(2)))
            .await
            .unwrap();

        h.outbound.as_mut().unwrap().recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(h.connector.processing_info(id).await.is_some());

        // past the retention window the call is gone
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(h.connector.processing_info(id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_in_flight_call() {
        let mut h = harness();
        let id = h
            .connector
            .call(routed_request(), ProcessingTime::Unlimited)
            .await
            .unwrap();

        h.outbound.as_mut().unwrap().recv().await.unwrap();
        h.connector.cancel(id).await.unwrap();

        let delivery = h.next_delivery().await;
        assert_eq!(delivery.request_id, id);
        assert_eq!(delivery.state, ProcessingState::Cancelled);
        let info = h.connector.processing_info(id).await.expect("retained outcome");
        assert_eq!(info.state, ProcessingState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_unknown_call_is_not_found() {
        let h = harness();
        let id = routed_request().id();
        assert!(matches!(
            h.connector.cancel(id).await,
            Err(DpaError::NotFound)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn async_notification_reaches_listener() {
        let mut h = harness();
        let response = Response {
            network_id: "net-1".into(),
            node_id: "7".into(),
            interface_id: 4,
            method_id: "alarm".into(),
            result: serde_json::json!(true),
            additional_data: None,
        };
        let frame = MsgPackFrameCodec::response_frame(&response).unwrap();
        h.inbound_tx
            .send(InboundFrame {
                bytes: frame,
                network_id: "net-1".into(),
            })
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), h.notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.node_id, "7");
    }

    #[tokio::test(start_paused = true)]
    async fn extended_processing_time_keeps_call_current() {
        let mut h = harness();
        let request = CallRequest::new("net-1", "0", 2, "long_job", vec![]).time_unbounded();
        let id = h
            .connector
            .call(request.clone(), ProcessingTime::Bounded(Duration::from_secs(2)))
            .await
            .unwrap();

        h.outbound.as_mut().unwrap().recv().await.unwrap();
        h.connector
            .set_max_processing_time(id, ProcessingTime::Bounded(Duration::from_secs(60)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        let info = h.connector.processing_info(id).await.expect("still current");
        assert_eq!(info.state, ProcessingState::WaitingForResult);

        h.feed_response_for(&request, serde_json::json!("done"));
        let delivery = h.next_delivery().await;
        assert_eq!(delivery.state, ProcessingState::ResultArrived);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_calls_run_in_submission_order() {
        let mut h = harness();
        let first = routed_request();
        let second = CallRequest::new("net-1", "4", 10, "read", vec![]);
        let first_id = h.connector.call_with_default_time(first.clone()).await.unwrap();
        let second_id = h
            .connector
            .call_with_default_time(second.clone())
            .await
            .unwrap();

        h.outbound.as_mut().unwrap().recv().await.unwrap();
        h.feed_confirmation(1, 1, 8);
        h.feed_response_for(&first, serde_json::json!(1));
        let delivery = h.next_delivery().await;
        assert_eq!(delivery.request_id, first_id);

        h.outbound.as_mut().unwrap().recv().await.unwrap();
        h.feed_confirmation(1, 1, 8);
        h.feed_response_for(&second, serde_json::json!(2));
        let delivery = h.next_delivery().await;
        assert_eq!(delivery.request_id, second_id);
    }
}
