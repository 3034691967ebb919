use std::time::{Duration, Instant};

use serde::Serialize;

use crate::registry::ManagedService;

/// Lifecycle state of a managed service, derived from the registry record
/// plus a liveness probe. `Starting` only exists while a caller tracks a
/// `PendingStart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Stopped,
    Starting,
    Running,
    Crashed,
}

/// Observed truth for `service`: running if its last PID is alive, crashed
/// if a run was recorded without a matching stop, stopped otherwise.
pub fn observe(service: &ManagedService, is_alive: impl Fn(u32) -> bool) -> State {
    match service.last_pid {
        Some(pid) if pid > 0 && is_alive(pid) => State::Running,
        _ if service.has_unstopped_run() => State::Crashed,
        _ => State::Stopped,
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(State, State),
}

impl TransitionError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidTransition(State::Running, State::Starting) => "ALREADY_RUNNING",
            Self::InvalidTransition(..) => "INVALID_TRANSITION",
        }
    }
}

/// Guards lifecycle requests against the state a service is observed in.
#[derive(Debug, Clone)]
pub struct StateMachine {
    pub state: State,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: State::Stopped }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: State) -> Self {
        Self { state }
    }

    pub fn can_transition(&self, to: State) -> bool {
        matches!(
            (self.state, to),
            (State::Stopped, State::Starting)
                | (State::Crashed, State::Starting)
                | (State::Starting, State::Running)
                | (State::Starting, State::Crashed)
                | (State::Starting, State::Stopped)
                | (State::Running, State::Stopped)
                | (State::Running, State::Crashed)
                | (State::Crashed, State::Stopped)
        )
    }

    pub fn transition(&mut self, to: State) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::debug!("State transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}

/// Caller-tracked `Starting` window opened by a start request.
#[derive(Debug, Clone, Copy)]
pub struct PendingStart {
    since: Instant,
    timeout: Duration,
}

impl PendingStart {
    pub fn new(timeout: Duration) -> Self {
        Self::since(Instant::now(), timeout)
    }

    pub fn since(since: Instant, timeout: Duration) -> Self {
        Self { since, timeout }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.since) >= self.timeout
    }

    /// `Starting` only while nothing has been observed yet and the window
    /// is open. `Running` and `Crashed` always pass through.
    pub fn resolve(&self, observed: State, now: Instant) -> State {
        if observed == State::Stopped && !self.is_expired(now) {
            State::Starting
        } else {
            observed
        }
    }
}

/// Phases of a stop request: `Terminating → Escalating → Confirmed | Unconfirmed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPhase {
    /// SIGTERM delivered; waiting for exit until `deadline`.
    Terminating { deadline: Instant },
    /// SIGKILL delivered; waiting out the grace period.
    Escalating { deadline: Instant },
    Confirmed,
    Unconfirmed,
}

/// What the driver of a `StopPhase` must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    /// Sleep this long, then probe again.
    Poll(Duration),
    /// Deliver SIGKILL, then keep polling.
    Escalate,
    Finish,
}

#[derive(Debug, Clone, Copy)]
pub struct StopTiming {
    pub poll_interval: Duration,
    pub kill_grace: Duration,
}

impl Default for StopTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(120),
            kill_grace: Duration::from_millis(200),
        }
    }
}

/// Upper bound on any single stop wait, so absurd timeouts cannot overflow `Instant`.
pub const MAX_STOP_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

fn deadline_after(now: Instant, wait: Duration) -> Instant {
    let wait = wait.min(MAX_STOP_WAIT);
    now.checked_add(wait).unwrap_or(now)
}

impl StopPhase {
    pub fn terminating(now: Instant, timeout: Duration) -> Self {
        Self::Terminating {
            deadline: deadline_after(now, timeout),
        }
    }

    pub fn advance(self, alive: bool, now: Instant, timing: &StopTiming) -> (StopPhase, StopAction) {
        match self {
            Self::Terminating { .. } | Self::Escalating { .. } if !alive => (Self::Confirmed, StopAction::Finish),
            Self::Terminating { deadline } if now >= deadline => (
                Self::Escalating {
                    deadline: deadline_after(now, timing.kill_grace),
                },
                StopAction::Escalate,
            ),
            Self::Escalating { deadline } if now >= deadline => (Self::Unconfirmed, StopAction::Finish),
            Self::Terminating { deadline } | Self::Escalating { deadline } => {
                let wait = timing.poll_interval.min(deadline.saturating_duration_since(now));
                (self, StopAction::Poll(wait))
            }
            Self::Confirmed | Self::Unconfirmed => (self, StopAction::Finish),
        }
    }
}
