//! # Reconnection Controller
//!
//! Connection state machine shared by every transport variant:
//!
//! ```text
//! Idle → Connecting → Open → Closing → Closed
//!             ↑         │
//!             │         ├─→ Reconnecting ─┐
//!             └─────────┴─────────────────┘
//!                  (non-retriable / budget exhausted) → Failed
//! ```
//!
//! The controller is pure: the engine's session supervisor performs the I/O
//! and sleeps, and reports outcomes back here. Every transition returns the
//! [`SessionEvent`] to publish, if any.

use std::time::Duration;

// ─── Backoff ────────────────────────────────────────────────────────────────

/// Exponential backoff with a cap and a retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            base: Duration::from_millis(2000),
            max: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^(attempt-1), max)` for a 1-based attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

// ─── Failure Classification ─────────────────────────────────────────────────

const FATAL_PHRASES: &[&str] = &[
    "invalid url",
    "invalid-url",
    "unauthorized",
    "authentication",
    "forbidden",
    "not found",
    "not-found",
    "bad request",
    "bad-request",
    "invalid configuration",
    "invalid-configuration",
];

const FATAL_STATUS: &[&str] = &["400", "401", "403", "404"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retriability {
    Retriable,
    Fatal,
}

/// Classify a close or connect failure by its message.
///
/// A missing message (graceful close) is retriable.
pub fn classify(message: Option<&str>) -> Retriability {
    let Some(message) = message else {
        return Retriability::Retriable;
    };
    let lower = message.to_ascii_lowercase();
    if FATAL_PHRASES.iter().any(|p| lower.contains(p)) {
        return Retriability::Fatal;
    }
    let has_status = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| FATAL_STATUS.contains(&token));
    if has_status {
        Retriability::Fatal
    } else {
        Retriability::Retriable
    }
}

// ─── State Machine ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Reconnecting,
    Failed,
    Closed,
}

/// Lifecycle notifications published to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    Reconnected,
    ReconnectionFailed {
        reason: String,
    },
    Disconnected {
        reason: Option<String>,
    },
}

/// What the supervisor should do after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    /// Sleep `delay`, then call [`ReconnectController::begin_retry`].
    Retry { attempt: u32, delay: Duration },
    /// Terminal; the session is in `Failed`.
    GiveUp,
    /// Failure reported while not connected or connecting; nothing to do.
    Ignore,
}

/// Tracks connection state and the reconnect-attempt counter.
#[derive(Debug)]
pub struct ReconnectController {
    state: ConnectionState,
    policy: BackoffPolicy,
    attempt: u32,
}

impl ReconnectController {
    pub fn new(policy: BackoffPolicy) -> Self {
        ReconnectController {
            state: ConnectionState::Idle,
            policy,
            attempt: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Retries made since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ConnectionState::Failed | ConnectionState::Closed)
    }

    /// `Idle → Connecting` (also restarts a closed or failed controller).
    pub fn connect(&mut self) -> Option<SessionEvent> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Failed => {
                self.attempt = 0;
                self.state = ConnectionState::Connecting;
                Some(SessionEvent::Connecting)
            }
            _ => None,
        }
    }

    /// `Reconnecting → Connecting` once the backoff delay has elapsed.
    pub fn begin_retry(&mut self) -> Option<SessionEvent> {
        if self.state != ConnectionState::Reconnecting {
            return None;
        }
        self.state = ConnectionState::Connecting;
        Some(SessionEvent::Connecting)
    }

    /// `Connecting → Open`; resets the attempt counter.
    pub fn on_open(&mut self) -> Option<SessionEvent> {
        if self.state != ConnectionState::Connecting {
            return None;
        }
        let retried = self.attempt > 0;
        self.attempt = 0;
        self.state = ConnectionState::Open;
        Some(if retried {
            SessionEvent::Reconnected
        } else {
            SessionEvent::Connected
        })
    }

    /// A connect attempt failed or an open connection closed unexpectedly.
    pub fn on_failure(&mut self, message: Option<&str>) -> (FailureAction, Option<SessionEvent>) {
        if !matches!(self.state, ConnectionState::Connecting | ConnectionState::Open) {
            return (FailureAction::Ignore, None);
        }

        if classify(message) == Retriability::Fatal {
            self.state = ConnectionState::Failed;
            let reason = message.unwrap_or_default().to_string();
            return (
                FailureAction::GiveUp,
                Some(SessionEvent::ReconnectionFailed { reason }),
            );
        }

        if self.attempt >= self.policy.max_attempts {
            self.state = ConnectionState::Failed;
            let reason = format!("gave up after {} attempts", self.attempt);
            return (
                FailureAction::GiveUp,
                Some(SessionEvent::ReconnectionFailed { reason }),
            );
        }

        self.attempt += 1;
        self.state = ConnectionState::Reconnecting;
        let delay = self.policy.delay(self.attempt);
        (
            FailureAction::Retry {
                attempt: self.attempt,
                delay,
            },
            Some(SessionEvent::Reconnecting {
                attempt: self.attempt,
                max_attempts: self.policy.max_attempts,
                delay,
            }),
        )
    }

    /// A failure known to be fatal regardless of its message (protocol
    /// mismatch during the handshake).
    pub fn on_fatal(&mut self, reason: impl Into<String>) -> Option<SessionEvent> {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Reconnecting
        ) {
            return None;
        }
        self.state = ConnectionState::Failed;
        Some(SessionEvent::ReconnectionFailed { reason: reason.into() })
    }

    /// Explicit disconnect requested: `→ Closing`.
    pub fn disconnect(&mut self) -> Option<SessionEvent> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Reconnecting => {
                self.state = ConnectionState::Closing;
                None
            }
            ConnectionState::Idle => {
                self.state = ConnectionState::Closed;
                Some(SessionEvent::Disconnected { reason: None })
            }
            _ => None,
        }
    }

    /// `Closing → Closed` after the transport has been released.
    pub fn on_closed(&mut self, reason: Option<String>) -> Option<SessionEvent> {
        if self.state != ConnectionState::Closing {
            return None;
        }
        self.state = ConnectionState::Closed;
        Some(SessionEvent::Disconnected { reason })
    }
}

impl Default for ReconnectController {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule() {
        let p = BackoffPolicy::default();
        let delays: Vec<u64> = (1..=6).map(|a| p.delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(p.delay(100), p.max);
    }

    #[test]
    fn classification() {
        assert_eq!(classify(Some("Unauthorized")), Retriability::Fatal);
        assert_eq!(classify(Some("server said: Not Found")), Retriability::Fatal);
        assert_eq!(classify(Some("invalid-configuration: tiers")), Retriability::Fatal);
        assert_eq!(classify(Some("HTTP error: 403")), Retriability::Fatal);
        assert_eq!(classify(Some("connection reset by peer")), Retriability::Retriable);
        assert_eq!(classify(Some("timeout after 4030 ms")), Retriability::Retriable);
        assert_eq!(classify(None), Retriability::Retriable);
    }

    #[test]
    fn first_connect_emits_connected() {
        let mut c = ReconnectController::default();
        assert_eq!(c.connect(), Some(SessionEvent::Connecting));
        assert_eq!(c.state(), ConnectionState::Connecting);
        assert_eq!(c.on_open(), Some(SessionEvent::Connected));
        assert!(c.is_open());
    }

    #[test]
    fn fatal_failure_does_not_retry() {
        let mut c = ReconnectController::default();
        c.connect();
        let (action, event) = c.on_failure(Some("Not Found"));
        assert_eq!(action, FailureAction::GiveUp);
        assert!(matches!(event, Some(SessionEvent::ReconnectionFailed { .. })));
        assert_eq!(c.state(), ConnectionState::Failed);
        assert_eq!(c.attempt(), 0);
    }

    #[test]
    fn retry_counter_resets_on_success() {
        let mut c = ReconnectController::default();
        c.connect();
        c.on_open();

        let (action, _) = c.on_failure(None);
        assert_eq!(
            action,
            FailureAction::Retry { attempt: 1, delay: Duration::from_millis(2000) }
        );
        assert_eq!(c.state(), ConnectionState::Reconnecting);
        c.begin_retry();

        let (action, _) = c.on_failure(None);
        assert_eq!(
            action,
            FailureAction::Retry { attempt: 2, delay: Duration::from_millis(4000) }
        );
        c.begin_retry();
        assert_eq!(c.attempt(), 2);

        assert_eq!(c.on_open(), Some(SessionEvent::Reconnected));
        assert_eq!(c.attempt(), 0);
    }

    #[test]
    fn budget_exhaustion_fails() {
        let mut c = ReconnectController::new(BackoffPolicy {
            max_attempts: 2,
            ..BackoffPolicy::default()
        });
        c.connect();
        for _ in 0..2 {
            let (action, _) = c.on_failure(None);
            assert!(matches!(action, FailureAction::Retry { .. }));
            c.begin_retry();
        }
        let (action, _) = c.on_failure(None);
        assert_eq!(action, FailureAction::GiveUp);
        assert_eq!(c.state(), ConnectionState::Failed);
    }

    #[test]
    fn explicit_disconnect() {
        let mut c = ReconnectController::default();
        c.connect();
        c.on_open();
        assert_eq!(c.disconnect(), None);
        assert_eq!(c.state(), ConnectionState::Closing);
        // Close notifications while closing are not failures.
        assert_eq!(c.on_failure(None).0, FailureAction::Ignore);
        assert_eq!(
            c.on_closed(None),
            Some(SessionEvent::Disconnected { reason: None })
        );
        assert!(c.is_terminal());
    }

    #[test]
    fn protocol_failure_is_fatal_from_reconnecting() {
        let mut c = ReconnectController::default();
        c.connect();
        c.on_failure(None);
        assert_eq!(c.state(), ConnectionState::Reconnecting);
        assert!(matches!(c.on_fatal("bad hello"), Some(SessionEvent::ReconnectionFailed { .. })));
        assert_eq!(c.state(), ConnectionState::Failed);
        assert_eq!(c.on_fatal("again"), None);
    }
}
