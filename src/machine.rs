//! Protocol state machine: the shared-medium timing contract.
//!
//! The DPA medium is half-duplex and time-slotted: after every frame the
//! channel stays occupied for a routing-dependent window, so only one
//! exchange may be in flight and the minimum legal inter-frame spacing must
//! be respected. This module tracks that contract independently of any
//! request's content.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator ──commands──► Machine Task ──timeout events──► Orchestrator
//!                                │
//!                                └──watch(MachineState)──► send gate
//! ```
//!
//! A single spawned task owns all state and wait scheduling; everything else
//! sends commands and awaits the acknowledgement. Wait durations are computed
//! per exchange from the confirmation's hop count and timeslot length, not
//! from static constants, because mesh routing depth varies per exchange.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::MachineConfig;
use crate::error::{DpaError, Result};
use crate::response::Confirmation;

/// Command channel capacity. The orchestrator issues at most one command at
/// a time per exchange; a small buffer absorbs timeout races.
const COMMAND_CAPACITY: usize = 8;

/// Event channel capacity.
const EVENT_CAPACITY: usize = 8;

/// States of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// The medium is free; a new request may be sent.
    FreeForSend,
    /// A routed request is out; waiting for its confirmation.
    WaitingForConfirmation,
    /// No confirmation arrived in time. Terminal until reset.
    WaitingForConfirmationError,
    /// Broadcast confirmed; waiting out the routing window, no response
    /// expected.
    WaitingAfterConfirmation,
    /// Waiting for the response frame.
    WaitingForResponse,
    /// No response arrived in time. Terminal until reset.
    WaitingForResponseError,
    /// Response arrived; waiting out the return-routing window.
    WaitingAfterResponse,
}

impl MachineState {
    /// Whether this is one of the terminal error states.
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            MachineState::WaitingForConfirmationError | MachineState::WaitingForResponseError
        )
    }
}

/// Timeout events raised by the machine toward the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineEvent {
    /// `WAITING_FOR_CONFIRMATION` expired without a confirmation.
    ConfirmationTimeout,
    /// `WAITING_FOR_RESPONSE` expired without a response.
    ResponseTimeout,
}

enum Command {
    NewRequest {
        to_coordinator: bool,
        ack: oneshot::Sender<Result<()>>,
    },
    ConfirmationReceived {
        recv_time: Instant,
        confirmation: Confirmation,
        ack: oneshot::Sender<Result<()>>,
    },
    ResponseReceived {
        recv_time: Instant,
        response_len: usize,
        ack: oneshot::Sender<Result<()>>,
    },
    ResetAfterError {
        ack: oneshot::Sender<Result<()>>,
    },
    SetTiming {
        confirmation_timeout: Option<Duration>,
        base_response_timeout: Option<Duration>,
        ack: oneshot::Sender<Result<()>>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::NewRequest { .. } => "new request",
            Command::ConfirmationReceived { .. } => "confirmation",
            Command::ResponseReceived { .. } => "response",
            Command::ResetAfterError { .. } => "reset",
            Command::SetTiming { .. } => "timing update",
        }
    }
}

// --- timing formulas -------------------------------------------------------
//
// All in milliseconds; timeslot values are 10 ms units.

/// Timeslot length occupied by a response of the given byte length.
pub(crate) fn response_timeslot_length(response_len: usize) -> u64 {
    if response_len < 19 {
        8
    } else if response_len < 41 {
        9
    } else {
        10
    }
}

/// Time the medium spends routing one frame over `hops` relays.
pub(crate) fn routing_time(hops: u8, timeslot_length: u64) -> Duration {
    Duration::from_millis((u64::from(hops) + 1) * timeslot_length * 10)
}

/// Full wait for a response: base timeout plus outbound routing surcharge.
pub(crate) fn response_wait(base: Duration, confirmation: Option<&Confirmation>) -> Duration {
    let surcharge = match confirmation {
        Some(c) => routing_time(c.hops, u64::from(c.timeslot_length)),
        None => Duration::ZERO,
    };
    base + surcharge + Duration::from_millis(100)
}

/// Remaining occupied-medium window after a broadcast confirmation.
pub(crate) fn after_confirmation_wait(confirmation: &Confirmation, elapsed: Duration) -> Duration {
    routing_time(confirmation.hops, u64::from(confirmation.timeslot_length)).saturating_sub(elapsed)
}

/// Remaining occupied-medium window after a response of `response_len` bytes.
pub(crate) fn after_response_wait(
    confirmation: Option<&Confirmation>,
    response_len: usize,
    elapsed: Duration,
) -> Duration {
    let resp_ts = response_timeslot_length(response_len);
    let full = match confirmation {
        Some(c) => {
            routing_time(c.hops, u64::from(c.timeslot_length))
                + routing_time(c.hops_response, resp_ts)
        }
        None => Duration::from_millis(resp_ts * 10),
    };
    full.saturating_sub(elapsed)
}

// --- machine task ----------------------------------------------------------

/// Per-exchange bookkeeping, reset on every new request.
#[derive(Debug, Default)]
struct Exchange {
    confirmation: Option<Confirmation>,
    confirm_recv_time: Option<Instant>,
    /// Whether routing (and thus the confirmation) participates in the wait
    /// arithmetic. False only for coordinator-local calls.
    count_with_confirmation: bool,
}

struct MachineTask {
    config: MachineConfig,
    cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<MachineState>,
    events_tx: mpsc::Sender<MachineEvent>,
    exchange: Exchange,
    /// Deadline for the current `WAITING_FOR_*` state.
    deadline: Instant,
    /// Mandatory wait for the current `WAITING_AFTER_*` state.
    after_wait: Duration,
}

impl MachineTask {
    fn state(&self) -> MachineState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: MachineState) {
        tracing::debug!(?state, "machine state change");
        self.state_tx.send_replace(state);
    }

    async fn run(mut self) {
        loop {
            match self.state() {
                MachineState::FreeForSend
                | MachineState::WaitingForConfirmationError
                | MachineState::WaitingForResponseError => {
                    // Nothing scheduled; block on the next command.
                    match self.cmd_rx.recv().await {
                        Some(cmd) => self.handle(cmd),
                        None => return,
                    }
                }
                state @ (MachineState::WaitingForConfirmation
                | MachineState::WaitingForResponse) => {
                    tokio::select! {
                        cmd = self.cmd_rx.recv() => match cmd {
                            Some(cmd) => self.handle(cmd),
                            None => return,
                        },
                        _ = tokio::time::sleep_until(self.deadline) => {
                            self.timeout_in(state).await;
                        }
                    }
                }
                MachineState::WaitingAfterConfirmation | MachineState::WaitingAfterResponse => {
                    // Mandatory occupied-medium window; commands queue up
                    // behind it and are handled once the channel is free.
                    tokio::time::sleep(self.after_wait).await;
                    self.exchange = Exchange::default();
                    self.set_state(MachineState::FreeForSend);
                    tracing::debug!("free for send");
                }
            }
        }
    }

    /// The expected event did not arrive within the computed window.
    async fn timeout_in(&mut self, state: MachineState) {
        let (error_state, event) = match state {
            MachineState::WaitingForConfirmation => (
                MachineState::WaitingForConfirmationError,
                MachineEvent::ConfirmationTimeout,
            ),
            MachineState::WaitingForResponse => (
                MachineState::WaitingForResponseError,
                MachineEvent::ResponseTimeout,
            ),
            // select! only polls the deadline in the two states above
            _ => return,
        };
        tracing::warn!(?state, "wait timeouted");
        self.set_state(error_state);
        if self.events_tx.send(event).await.is_err() {
            tracing::warn!("machine event receiver dropped");
        }
    }

    fn violation(&self, cmd_name: &'static str) -> DpaError {
        let state = self.state();
        tracing::error!(?state, event = cmd_name, "illegal machine event");
        DpaError::StateViolation {
            state,
            event: cmd_name,
        }
    }

    fn handle(&mut self, cmd: Command) {
        let name = cmd.name();
        match cmd {
            Command::NewRequest {
                to_coordinator,
                ack,
            } => {
                if self.state() != MachineState::FreeForSend {
                    let _ = ack.send(Err(self.violation(name)));
                    return;
                }
                self.exchange = Exchange::default();
                if to_coordinator {
                    // Local call: no routing confirmation will come.
                    self.exchange.count_with_confirmation = false;
                    self.deadline = Instant::now()
                        + response_wait(self.config.base_response_timeout, None);
                    self.set_state(MachineState::WaitingForResponse);
                } else {
                    self.exchange.count_with_confirmation = true;
                    self.deadline = Instant::now() + self.config.confirmation_timeout;
                    self.set_state(MachineState::WaitingForConfirmation);
                }
                let _ = ack.send(Ok(()));
            }
            Command::ConfirmationReceived {
                recv_time,
                confirmation,
                ack,
            } => {
                if self.state() != MachineState::WaitingForConfirmation {
                    let _ = ack.send(Err(self.violation(name)));
                    return;
                }
                self.exchange.confirmation = Some(confirmation);
                self.exchange.confirm_recv_time = Some(recv_time);
                if confirmation.is_broadcast() {
                    self.after_wait =
                        after_confirmation_wait(&confirmation, recv_time.elapsed());
                    self.set_state(MachineState::WaitingAfterConfirmation);
                } else {
                    self.deadline = recv_time
                        + response_wait(self.config.base_response_timeout, Some(&confirmation));
                    self.set_state(MachineState::WaitingForResponse);
                }
                let _ = ack.send(Ok(()));
            }
            Command::ResponseReceived {
                recv_time,
                response_len,
                ack,
            } => {
                if self.state() != MachineState::WaitingForResponse {
                    let _ = ack.send(Err(self.violation(name)));
                    return;
                }
                let confirmation = if self.exchange.count_with_confirmation {
                    self.exchange.confirmation.as_ref()
                } else {
                    None
                };
                self.after_wait =
                    after_response_wait(confirmation, response_len, recv_time.elapsed());
                self.set_state(MachineState::WaitingAfterResponse);
                let _ = ack.send(Ok(()));
            }
            Command::ResetAfterError { ack } => {
                if !self.state().is_error() {
                    let _ = ack.send(Err(self.violation(name)));
                    return;
                }
                self.exchange = Exchange::default();
                self.set_state(MachineState::FreeForSend);
                tracing::info!("machine reset after error");
                let _ = ack.send(Ok(()));
            }
            Command::SetTiming {
                confirmation_timeout,
                base_response_timeout,
                ack,
            } => {
                if let Some(t) = confirmation_timeout {
                    self.config.confirmation_timeout = t;
                }
                if let Some(t) = base_response_timeout {
                    self.config.base_response_timeout = t;
                }
                let _ = ack.send(Ok(()));
            }
        }
    }
}

/// Handle to the state machine task.
///
/// Cheaply cloneable; all mutation happens inside the owning task,
/// callers only send commands and await the acknowledgement.
#[derive(Clone)]
pub struct StateMachine {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<MachineState>,
}

impl StateMachine {
    /// Spawn the machine task.
    ///
    /// Returns the handle, the receiver of timeout events, and the task's
    /// join handle. The task exits when every handle clone is dropped.
    pub fn spawn(
        config: MachineConfig,
    ) -> (Self, mpsc::Receiver<MachineEvent>, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(MachineState::FreeForSend);

        let task = MachineTask {
            config,
            cmd_rx,
            state_tx,
            events_tx,
            exchange: Exchange::default(),
            deadline: Instant::now(),
            after_wait: Duration::ZERO,
        };
        let join = tokio::spawn(task.run());

        (Self { cmd_tx, state_rx }, events_rx, join)
    }

    /// Current state of the machine.
    pub fn state(&self) -> MachineState {
        *self.state_rx.borrow()
    }

    /// Whether a new request may be sent right now.
    pub fn is_free_for_send(&self) -> bool {
        self.state() == MachineState::FreeForSend
    }

    /// A fresh subscription to state changes.
    pub fn subscribe(&self) -> watch::Receiver<MachineState> {
        self.state_rx.clone()
    }

    async fn command<F>(&self, make: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> Command,
    {
        let (ack, done) = oneshot::channel();
        self.cmd_tx
            .send(make(ack))
            .await
            .map_err(|_| DpaError::Closed)?;
        done.await.map_err(|_| DpaError::Closed)?
    }

    /// Inform the machine that a new request has been sent.
    ///
    /// Legal only from `FREE_FOR_SEND`. Requests addressed to the local
    /// coordinator skip the confirmation and wait for the response directly.
    pub async fn new_request(&self, to_coordinator: bool) -> Result<()> {
        self.command(|ack| Command::NewRequest {
            to_coordinator,
            ack,
        })
        .await
    }

    /// Inform the machine that a confirmation has been received.
    pub async fn confirmation_received(
        &self,
        recv_time: Instant,
        confirmation: Confirmation,
    ) -> Result<()> {
        self.command(|ack| Command::ConfirmationReceived {
            recv_time,
            confirmation,
            ack,
        })
        .await
    }

    /// Inform the machine that a response of `response_len` bytes has been
    /// received.
    pub async fn response_received(&self, recv_time: Instant, response_len: usize) -> Result<()> {
        self.command(|ack| Command::ResponseReceived {
            recv_time,
            response_len,
            ack,
        })
        .await
    }

    /// Return the machine to `FREE_FOR_SEND` out of an error state.
    pub async fn reset_after_error(&self) -> Result<()> {
        self.command(|ack| Command::ResetAfterError { ack }).await
    }

    /// Update the machine's timing at runtime.
    pub async fn set_timing(
        &self,
        confirmation_timeout: Option<Duration>,
        base_response_timeout: Option<Duration>,
    ) -> Result<()> {
        self.command(|ack| Command::SetTiming {
            confirmation_timeout,
            base_response_timeout,
            ack,
        })
        .await
    }
}
