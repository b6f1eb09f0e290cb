//! Runtime configuration for the communication core.
//!
//! All settings are plain numeric/duration values with defaults taken from
//! the DPA timing contract. There is no on-disk configuration; embed these
//! structs in whatever configuration layer owns the surrounding application.

use std::time::Duration;

/// Default time to wait for a confirmation frame.
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default base time to wait for a response frame, before routing surcharge.
pub const DEFAULT_BASE_RESPONSE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default maximal age of entries in the sent-request set.
pub const DEFAULT_MAX_REQUEST_DURATION: Duration = Duration::from_millis(10_000);

/// Default retention window for idle requests awaiting a late response.
pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_millis(30_000);

/// Default pause between subsequent send attempts of one request.
pub const DEFAULT_ATTEMPT_PAUSE: Duration = Duration::from_millis(1000);

/// Default minimal pause between sending any two requests.
pub const DEFAULT_BETWEEN_SEND_PAUSE: Duration = Duration::from_millis(1000);

/// Default number of attempts to hand a request to the protocol layer.
pub const DEFAULT_MAX_SEND_ATTEMPTS: u32 = 3;

/// Default per-call maximal processing time.
pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_millis(25_000);

/// Timing configuration of the protocol state machine.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// How long the machine waits for a confirmation before erroring out.
    pub confirmation_timeout: Duration,
    /// Base component of the response wait; routing surcharge is computed
    /// per exchange from the confirmation's hop/timeslot metadata.
    pub base_response_timeout: Duration,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            base_response_timeout: DEFAULT_BASE_RESPONSE_TIMEOUT,
        }
    }
}

/// Configuration of the protocol orchestration layer.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// State machine timing.
    pub machine: MachineConfig,
    /// Maximal age of a sent request before it is purged from the
    /// sent-request set regardless of outcome.
    pub max_request_duration: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            machine: MachineConfig::default(),
            max_request_duration: DEFAULT_MAX_REQUEST_DURATION,
        }
    }
}

impl ProtocolConfig {
    /// Create a configuration with default timing.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Send-pacing and retry policy of the dispatch worker.
///
/// Kept as a standalone value so pacing arithmetic is testable without
/// running the whole pipeline.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximal attempts to hand one request to the protocol layer.
    pub max_send_attempts: u32,
    /// Pause before a retry attempt.
    pub attempt_pause: Duration,
    /// Minimal spacing between any two sends.
    pub between_send_pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
            attempt_pause: DEFAULT_ATTEMPT_PAUSE,
            between_send_pause: DEFAULT_BETWEEN_SEND_PAUSE,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep before the given send attempt, accounting for time
    /// already elapsed since the previous send.
    ///
    /// On retry the larger of the two configured pauses applies.
    pub fn delay_before_send(&self, attempt: u32, since_last_send: Duration) -> Duration {
        let pause = if attempt > 0 {
            self.attempt_pause.max(self.between_send_pause)
        } else {
            self.between_send_pause
        };
        pause.saturating_sub(since_last_send)
    }
}

/// Configuration of the call-dispatch connector.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Retention window for requests whose wait elapsed without a match.
    pub max_idle_time: Duration,
    /// Default per-call processing time used by
    /// [`call_with_default_time`](crate::connector::Connector::call_with_default_time).
    pub default_processing_timeout: Duration,
    /// Send pacing and retry policy.
    pub retry: RetryPolicy,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            default_processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}
