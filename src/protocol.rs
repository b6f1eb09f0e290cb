//! Protocol orchestration: framing, correlation and timeout attribution.
//!
//! Sits between the raw [`Transport`] and the connector. Outbound, it
//! serializes requests, gates them on the state machine's send window and
//! tracks them for later correlation. Inbound, it classifies frames, feeds
//! the state machine and turns matched responses into [`ProtocolEvent`]s.
//!
//! Correlation is by value: the wire carries no request id, so a response is
//! matched to the sent request with the same network, node, interface and
//! method. Responses that match nothing are unsolicited traffic and surface
//! as [`ProtocolEvent::Async`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::codec::{FrameClass, FrameCodec};
use crate::config::ProtocolConfig;
use crate::error::Result;
use crate::machine::{MachineEvent, MachineState, StateMachine};
use crate::request::{CallRequest, RequestId};
use crate::response::{CallError, CallResult, Completion, ProtocolEvent, Response};
use crate::transport::{InboundFrame, Transport};

/// Event channel capacity toward the connector.
const EVENT_CAPACITY: usize = 32;

/// A sent request awaiting its answer.
#[derive(Debug, Clone)]
struct TrackedRequest {
    request: CallRequest,
    sent_at: Instant,
}

/// Requests the orchestrator is accountable for.
#[derive(Debug, Default)]
struct TrackedSet {
    /// Sent unicast requests, oldest first.
    sent: Vec<TrackedRequest>,
    /// At most one broadcast can be in flight; its acceptance is synthesized
    /// from the confirmation, never from a response frame.
    pending_broadcast: Option<TrackedRequest>,
    /// Most recently sent request, the one a machine timeout refers to.
    last_sent: Option<RequestId>,
}

impl TrackedSet {
    /// Drop stale entries before `next` goes out: anything older than
    /// `max_age`, plus any earlier attempt of the same call. Requests marked
    /// time-unbounded never age out, but a same-call resend displaces them.
    fn purge(&mut self, next: &CallRequest, max_age: std::time::Duration) {
        self.sent.retain(|t| {
            let stale = !t.request.is_time_unbounded() && t.sent_at.elapsed() > max_age;
            let duplicate = t.request.same_call(next);
            if stale || duplicate {
                tracing::debug!(id = %t.request.id(), stale, duplicate, "purging tracked request");
            }
            !(stale || duplicate)
        });
    }

    /// Remove and return the tracked request a response correlates to.
    fn take_match(&mut self, response: &Response) -> Option<TrackedRequest> {
        let pos = self.sent.iter().position(|t| {
            t.request.network_id() == response.network_id
                && t.request.node_id() == response.node_id
                && t.request.interface_id() == response.interface_id
                && t.request.method_id() == response.method_id
        })?;
        Some(self.sent.remove(pos))
    }

    /// Remove and return the request with the given id, wherever it is.
    fn take_by_id(&mut self, id: RequestId) -> Option<TrackedRequest> {
        if let Some(t) = self.pending_broadcast.take_if(|t| t.request.id() == id) {
            return Some(t);
        }
        let pos = self.sent.iter().position(|t| t.request.id() == id)?;
        Some(self.sent.remove(pos))
    }
}

struct Inner {
    codec: Arc<dyn FrameCodec>,
    transport: Arc<dyn Transport>,
    machine: StateMachine,
    config: ProtocolConfig,
    /// The send-or-receive critical section. The send path holds it across
    /// transmit, machine update and recording; inbound classification holds
    /// it across machine update and correlation. A response therefore cannot
    /// observe the wire before its request is tracked.
    tracked: Mutex<TrackedSet>,
    /// Serializes the send path so the free-for-send window cannot be
    /// claimed by two senders at once.
    send_lock: Mutex<()>,
    /// Feeds the broadcast responder task.
    broadcast_tx: mpsc::UnboundedSender<RequestId>,
    /// A time-unbounded request is in flight: the machine's timing formulas
    /// do not apply, so inbound frames bypass it entirely.
    unbounded_in_flight: AtomicBool,
    events_tx: mpsc::Sender<ProtocolEvent>,
}

impl Inner {
    async fn emit(&self, event: ProtocolEvent) {
        if self.events_tx.send(event).await.is_err() {
            tracing::warn!("protocol event receiver dropped");
        }
    }
}

/// Handle to the protocol layer.
#[derive(Clone)]
pub struct ProtocolLayer {
    inner: Arc<Inner>,
}

impl ProtocolLayer {
    /// Spawn the protocol layer over a codec, a transport and the stream of
    /// inbound frames. Returns the handle and the event stream the connector
    /// consumes.
    pub fn spawn(
        codec: Arc<dyn FrameCodec>,
        transport: Arc<dyn Transport>,
        inbound_rx: mpsc::UnboundedReceiver<InboundFrame>,
        config: ProtocolConfig,
    ) -> (Self, mpsc::Receiver<ProtocolEvent>) {
        let (machine, machine_events, _machine_join) = StateMachine::spawn(config.machine.clone());
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            codec,
            transport,
            machine,
            config,
            tracked: Mutex::new(TrackedSet::default()),
            send_lock: Mutex::new(()),
            broadcast_tx,
            unbounded_in_flight: AtomicBool::new(false),
            events_tx,
        });

        tokio::spawn(run_inbound(Arc::clone(&inner), inbound_rx));
        tokio::spawn(run_broadcast_acks(Arc::clone(&inner), broadcast_rx));
        tokio::spawn(run_timeouts(Arc::clone(&inner), machine_events));

        (Self { inner }, events_rx)
    }

    /// Current state of the underlying machine.
    pub fn machine_state(&self) -> MachineState {
        self.inner.machine.state()
    }

    /// Adjust the machine's timing at runtime.
    pub async fn set_timing(
        &self,
        confirmation_timeout: Option<std::time::Duration>,
        base_response_timeout: Option<std::time::Duration>,
    ) -> Result<()> {
        self.inner
            .machine
            .set_timing(confirmation_timeout, base_response_timeout)
            .await
    }

    /// Send one request, waiting for the medium to be free first.
    ///
    /// Holds the send path exclusively: a concurrent sender queues behind
    /// this one. A machine left in an error state by a previous exchange is
    /// reset here, before the new request claims the window.
    pub async fn send_request(&self, request: &CallRequest) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.send_lock.lock().await;

        self.wait_until_free().await?;

        let frame = inner.codec.encode(request)?;

        // Transmit, machine update and recording happen as one unit under
        // the send-or-receive critical section, otherwise an early answer
        // could be classified against an empty tracked set.
        let mut tracked = inner.tracked.lock().await;
        tracked.purge(request, inner.config.max_request_duration);
        inner.transport.send(frame, request.network_id())?;
        // Completion time of a time-unbounded request is not governed by
        // the timing formulas; the machine stays free and inbound frames
        // bypass it until the answer lands or the next send takes over.
        inner
            .unbounded_in_flight
            .store(request.is_time_unbounded(), Ordering::Release);
        if !request.is_time_unbounded() {
            inner.machine.new_request(request.is_for_coordinator()).await?;
        }
        tracing::info!(
            id = %request.id(),
            network = %request.network_id(),
            node = %request.node_id(),
            method = %request.method_id(),
            broadcast = request.is_broadcast(),
            "request sent"
        );

        tracked.last_sent = Some(request.id());
        let entry = TrackedRequest {
            request: request.clone(),
            sent_at: Instant::now(),
        };
        if request.is_broadcast() {
            if let Some(stale) = tracked.pending_broadcast.replace(entry) {
                tracing::warn!(id = %stale.request.id(), "unanswered broadcast displaced");
            }
        } else {
            tracked.sent.push(entry);
        }
        Ok(())
    }

    async fn wait_until_free(&self) -> Result<()> {
        let mut states = self.inner.machine.subscribe();
        loop {
            let state = *states.borrow_and_update();
            match state {
                MachineState::FreeForSend => return Ok(()),
                state if state.is_error() => {
                    // Only the send path resets; the error state is stable
                    // until we do.
                    self.inner.machine.reset_after_error().await?;
                }
                _ => {
                    states
                        .changed()
                        .await
                        .map_err(|_| crate::error::DpaError::Closed)?;
                }
            }
        }
    }
}

async fn run_inbound(inner: Arc<Inner>, mut inbound_rx: mpsc::UnboundedReceiver<InboundFrame>) {
    while let Some(frame) = inbound_rx.recv().await {
        let recv_time = Instant::now();
        let class = match inner.codec.classify(&frame.bytes) {
            Ok(class) => class,
            Err(error) => {
                tracing::warn!(%error, network = %frame.network_id, "dropping undecodable frame");
                continue;
            }
        };
        match class {
            FrameClass::Confirmation(confirmation) => {
                // Scope of the send-or-receive critical section: a send in
                // progress finishes recording before this frame is applied.
                let accepted = {
                    let mut tracked = inner.tracked.lock().await;
                    if inner.unbounded_in_flight.load(Ordering::Acquire) {
                        tracing::debug!("confirmation during time-unbounded exchange ignored");
                        continue;
                    }
                    if let Err(error) = inner
                        .machine
                        .confirmation_received(recv_time, confirmation)
                        .await
                    {
                        tracing::warn!(%error, "confirmation outside an exchange dropped");
                        continue;
                    }
                    if confirmation.is_broadcast() {
                        // No response will follow; the confirmation itself
                        // is the network's acceptance of the broadcast.
                        tracked.pending_broadcast.take()
                    } else {
                        None
                    }
                };
                match accepted {
                    Some(t) => {
                        if inner.broadcast_tx.send(t.request.id()).is_err() {
                            tracing::warn!("broadcast responder gone");
                        }
                    }
                    None if confirmation.is_broadcast() => {
                        tracing::warn!("broadcast confirmation with no tracked broadcast");
                    }
                    None => {}
                }
            }
            FrameClass::Response(response) => {
                let matched = {
                    let mut tracked = inner.tracked.lock().await;
                    // A response outside an exchange is tolerated: it is
                    // either unsolicited traffic or a late answer, both
                    // handled by correlation below.
                    if !inner.unbounded_in_flight.load(Ordering::Acquire) {
                        if let Err(error) = inner
                            .machine
                            .response_received(recv_time, frame.bytes.len())
                            .await
                        {
                            tracing::debug!(%error, "response outside an exchange");
                        }
                    }
                    let matched = tracked.take_match(&response);
                    if let Some(t) = &matched {
                        if t.request.is_time_unbounded() {
                            inner.unbounded_in_flight.store(false, Ordering::Release);
                        }
                    }
                    matched
                };
                match matched {
                    Some(t) => {
                        tracing::debug!(id = %t.request.id(), "response correlated");
                        inner
                            .emit(ProtocolEvent::Completion(Completion {
                                request_id: t.request.id(),
                                outcome: Ok(CallResult {
                                    main: response.result,
                                    additional: response.additional_data,
                                }),
                            }))
                            .await;
                    }
                    None => {
                        tracing::debug!(
                            network = %response.network_id,
                            node = %response.node_id,
                            "unsolicited response"
                        );
                        inner.emit(ProtocolEvent::Async(response)).await;
                    }
                }
            }
            FrameClass::Unrecognized => {
                tracing::warn!(network = %frame.network_id, "unrecognized frame dropped");
            }
        }
    }
    tracing::debug!("inbound frame stream closed");
}

/// Broadcast acknowledgements run on their own task so synthesizing one
/// never stalls inbound-frame classification behind a slow event consumer.
async fn run_broadcast_acks(inner: Arc<Inner>, mut accepted_rx: mpsc::UnboundedReceiver<RequestId>) {
    while let Some(request_id) = accepted_rx.recv().await {
        tracing::debug!(id = %request_id, "broadcast accepted");
        inner
            .emit(ProtocolEvent::Completion(Completion {
                request_id,
                outcome: Ok(CallResult::broadcast_accepted()),
            }))
            .await;
    }
    tracing::debug!("broadcast acceptance stream closed");
}

async fn run_timeouts(inner: Arc<Inner>, mut machine_events: mpsc::Receiver<MachineEvent>) {
    while let Some(event) = machine_events.recv().await {
        let error = match event {
            MachineEvent::ConfirmationTimeout => CallError::ConfirmationTimeout,
            MachineEvent::ResponseTimeout => CallError::ResponseTimeout,
        };
        let victim = {
            let mut tracked = inner.tracked.lock().await;
            match tracked.last_sent.take() {
                Some(id) => {
                    let unbounded = tracked
                        .sent
                        .iter()
                        .any(|t| t.request.id() == id && t.request.is_time_unbounded());
                    if unbounded {
                        // The answer may still arrive; keep it correlatable.
                        tracing::debug!(
                            %id,
                            "machine timeout on time-unbounded request, keeping it tracked"
                        );
                        None
                    } else {
                        tracked.take_by_id(id)
                    }
                }
                None => None,
            }
        };
        match victim {
            Some(t) => {
                tracing::warn!(id = %t.request.id(), %error, "request failed");
                inner
                    .emit(ProtocolEvent::Completion(Completion {
                        request_id: t.request.id(),
                        outcome: Err(error),
                    }))
                    .await;
            }
            None => tracing::debug!(%error, "machine timeout with no attributable request"),
        }
    }
    tracing::debug!("machine event stream closed");
}
