//! Connection state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! The driver in `supervisor.rs` executes the I/O implied by each action.

use std::time::Duration;

use serde::Serialize;

use crate::backoff::{BackoffPolicy, RetryBudget};

/// Chat connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting for the retry timer
    Reconnecting,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

/// Machine state: lifecycle phase plus the retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorState {
    pub phase: ConnectionState,
    pub budget: RetryBudget,
    /// Persistent-failure alert already raised for the current outage
    pub alerted: bool,
}

impl SupervisorState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            phase: ConnectionState::Disconnected,
            budget: RetryBudget::new(max_attempts),
            alerted: false,
        }
    }
}

/// Events that drive state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Start,
    /// Connect attempt succeeded
    Connected,
    /// Connect attempt failed; `clean` selects the backoff schedule
    ConnectFailed { clean: bool },
    /// The live session ended
    TransportClosed,
    RetryTimer,
    ProbeTick { transport_alive: bool },
    ForceReconnect,
    Shutdown,
}

impl SupervisorEvent {
    /// Label for `chat_reconnect_attempts_total{trigger}` when this event
    /// leads to a connect attempt.
    pub fn trigger(&self) -> &'static str {
        match self {
            SupervisorEvent::Start => "start",
            SupervisorEvent::RetryTimer => "retry",
            SupervisorEvent::ProbeTick { .. } => "probe",
            SupervisorEvent::ForceReconnect => "manual",
            _ => "other",
        }
    }
}

/// Actions the driver should execute after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorAction {
    /// Close any previous session and open a new one
    Connect,
    /// Arm the retry timer
    ScheduleRetry {
        delay: Duration,
        attempt: u32,
        /// First time the budget was exceeded in this outage
        persistent_failure: bool,
    },
    /// Close the session and stop
    Disconnect,
    None,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(
    state: SupervisorState,
    event: SupervisorEvent,
) -> (SupervisorState, SupervisorAction) {
    use ConnectionState::*;

    match (state.phase, event) {
        (_, SupervisorEvent::Shutdown) => (
            SupervisorState {
                phase: Disconnected,
                ..state
            },
            SupervisorAction::Disconnect,
        ),

        (_, SupervisorEvent::ForceReconnect) => {
            let mut budget = state.budget;
            budget.reset();
            (
                SupervisorState {
                    phase: Connecting,
                    budget,
                    alerted: false,
                },
                SupervisorAction::Connect,
            )
        }

        // --- Disconnected ---
        (Disconnected, SupervisorEvent::Start | SupervisorEvent::ProbeTick { .. }) => (
            SupervisorState {
                phase: Connecting,
                ..state
            },
            SupervisorAction::Connect,
        ),

        // --- Connecting ---
        (Connecting, SupervisorEvent::Connected) => {
            let mut budget = state.budget;
            budget.reset();
            (
                SupervisorState {
                    phase: Connected,
                    budget,
                    alerted: false,
                },
                SupervisorAction::None,
            )
        }

        (Connecting, SupervisorEvent::ConnectFailed { clean }) => {
            let policy = if clean {
                BackoffPolicy::CLEAN
            } else {
                BackoffPolicy::EXCEPTIONAL
            };
            schedule_retry(state, policy)
        }

        // --- Connected ---
        (Connected, SupervisorEvent::TransportClosed)
        | (
            Connected,
            SupervisorEvent::ProbeTick {
                transport_alive: false,
            },
        ) => schedule_retry(state, BackoffPolicy::CLEAN),

        // --- Reconnecting ---
        (Reconnecting, SupervisorEvent::RetryTimer) => (
            SupervisorState {
                phase: Connecting,
                ..state
            },
            SupervisorAction::Connect,
        ),

        // Healthy probes, probes while a retry is pending, stale timers and
        // stale close notifications all leave the state alone
        (_, _) => (state, SupervisorAction::None),
    }
}

fn schedule_retry(
    state: SupervisorState,
    policy: BackoffPolicy,
) -> (SupervisorState, SupervisorAction) {
    let mut budget = state.budget;
    budget.attempts = budget.attempts.saturating_add(1);

    let exhausted = budget.exhausted();
    let delay = if exhausted {
        policy.ceiling
    } else {
        policy.delay(budget.attempts)
    };
    budget.next_delay = Some(delay);

    let persistent_failure = exhausted && !state.alerted;
    (
        SupervisorState {
            phase: ConnectionState::Reconnecting,
            budget,
            alerted: state.alerted || exhausted,
        },
        SupervisorAction::ScheduleRetry {
            delay,
            attempt: budget.attempts,
            persistent_failure,
        },
    )
}
