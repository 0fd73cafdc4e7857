//! Pure state transition function
//!
//! All pairing lifecycle rules live here as a pure, synchronous function:
//! `transition(state, input, now) -> (state, effects)`.
//! The caller executes the returned effects; nothing here does IO.

use chrono::{DateTime, Utc};
use pairline_protocol::{ConnState, ErrorKind, PairingSession, PairingStatus, SessionError};

use crate::error::PairingError;

// ---------------------------------------------------------------------------
// Observations: who reported a connection state, and when
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Poll,
    Webhook,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Poll => "poll",
            Source::Webhook => "webhook",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub source: Source,
    pub observed_at: DateTime<Utc>,
}

impl Observation {
    /// Whether `self` should be discarded because `applied` already supersedes it.
    /// Event time decides; at the same instant the webhook outranks the poll.
    fn is_superseded_by(&self, applied: &Observation) -> bool {
        if self.observed_at != applied.observed_at {
            return self.observed_at < applied.observed_at;
        }
        self.source == Source::Poll && applied.source == Source::Webhook
    }
}

// ---------------------------------------------------------------------------
// TransitionState: session row plus in-memory observer bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransitionState {
    pub session: PairingSession,
    pub last_observed: Option<Observation>,
    /// Most recent transient poll failure; surfaced only if the budget runs out.
    pub last_poll_error: Option<String>,
}

impl TransitionState {
    pub fn new(session: PairingSession) -> Self {
        Self {
            session,
            last_observed: None,
            last_poll_error: None,
        }
    }

    fn status(&self) -> PairingStatus {
        self.session.status
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Input {
    /// Caller asked to pair. Only honoured from `Disconnected` or `Failed`.
    StartRequested,
    Provisioned {
        qr_payload: String,
    },
    ProvisionFailed {
        error: SessionError,
    },
    /// A new QR arrived, from the refresh timer, a manual refresh or a webhook.
    QrRefreshed {
        qr_payload: String,
    },
    ConnectionObserved {
        state: ConnState,
        source: Source,
        observed_at: DateTime<Utc>,
    },
    /// A poll failed at the transport level; polling continues.
    TransientFailure {
        message: String,
    },
    /// The gateway refused the pairing or lost the instance.
    PairingRejected {
        error: SessionError,
    },
    BudgetExhausted {
        budget_secs: u64,
    },
    DisconnectRequested {
        error: Option<SessionError>,
    },
}

// ---------------------------------------------------------------------------
// Effects: describe IO to be executed by the caller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Write the session row, refresh the snapshot, notify readers.
    Persist,
    /// Start the QR timer and poller for this session.
    StartScheduler,
    /// Stop the QR timer and poller, waiting for the task to finish.
    StopScheduler,
}

// ---------------------------------------------------------------------------
// transition
// ---------------------------------------------------------------------------

pub fn transition(
    mut state: TransitionState,
    input: Input,
    now: DateTime<Utc>,
) -> (TransitionState, Vec<Effect>) {
    let mut effects: Vec<Effect> = Vec::new();

    match input {
        Input::StartRequested => {
            if matches!(
                state.status(),
                PairingStatus::Disconnected | PairingStatus::Failed
            ) {
                let session = &mut state.session;
                session.status = PairingStatus::Provisioning;
                session.qr_payload = None;
                session.qr_issued_at = None;
                session.last_error = None;
                session.updated_at = now;
                state.last_observed = None;
                state.last_poll_error = None;
                effects.push(Effect::Persist);
            }
        }

        Input::Provisioned { qr_payload } => {
            if state.status() == PairingStatus::Provisioning {
                let session = &mut state.session;
                session.status = PairingStatus::WaitingForScan;
                session.qr_payload = Some(qr_payload);
                session.qr_issued_at = Some(now);
                session.updated_at = now;
                effects.push(Effect::Persist);
                effects.push(Effect::StartScheduler);
            }
        }

        Input::ProvisionFailed { error } => {
            if state.status() == PairingStatus::Provisioning {
                fail(&mut state, error, now);
                effects.push(Effect::Persist);
            }
        }

        Input::QrRefreshed { qr_payload } => {
            if state.status() == PairingStatus::WaitingForScan {
                let session = &mut state.session;
                session.qr_payload = Some(qr_payload);
                session.qr_issued_at = Some(now);
                session.updated_at = now;
                effects.push(Effect::Persist);
            }
        }

        Input::ConnectionObserved {
            state: conn,
            source,
            observed_at,
        } => {
            let observation = Observation {
                source,
                observed_at,
            };
            if let Some(applied) = &state.last_observed {
                if observation.is_superseded_by(applied) {
                    return (state, effects);
                }
            }

            let applied = match (state.status(), conn) {
                (PairingStatus::WaitingForScan, ConnState::Open) => {
                    let session = &mut state.session;
                    session.status = PairingStatus::Connected;
                    session.connected_at = Some(observed_at);
                    session.last_activity_at = Some(observed_at);
                    session.qr_payload = None;
                    session.last_error = None;
                    session.updated_at = now;
                    state.last_poll_error = None;
                    effects.push(Effect::StopScheduler);
                    effects.push(Effect::Persist);
                    true
                }
                (PairingStatus::Connected, ConnState::Open) => {
                    state.session.last_activity_at = Some(observed_at);
                    state.session.updated_at = now;
                    effects.push(Effect::Persist);
                    true
                }
                // Only the gateway's own push may take a linked device offline.
                (PairingStatus::Connected, ConnState::Close) if source == Source::Webhook => {
                    let session = &mut state.session;
                    session.status = PairingStatus::Disconnected;
                    session.qr_payload = None;
                    session.last_activity_at = Some(observed_at);
                    session.updated_at = now;
                    effects.push(Effect::StopScheduler);
                    effects.push(Effect::Persist);
                    true
                }
                _ => false,
            };

            // A webhook that changed nothing must not shadow a poll still in flight.
            if applied {
                state.last_observed = Some(observation);
            }
        }

        Input::TransientFailure { message } => {
            if state.status() == PairingStatus::WaitingForScan {
                state.last_poll_error = Some(message);
            }
        }

        Input::PairingRejected { error } => {
            if state.status() == PairingStatus::WaitingForScan {
                fail(&mut state, error, now);
                effects.push(Effect::StopScheduler);
                effects.push(Effect::Persist);
            }
        }

        Input::BudgetExhausted { budget_secs } => {
            if state.status() == PairingStatus::WaitingForScan {
                let mut error = PairingError::PairingTimeout { budget_secs }.to_session_error(now);
                if let Some(last) = state.last_poll_error.take() {
                    error.message = format!("{} (last poll error: {})", error.message, last);
                }
                fail(&mut state, error, now);
                effects.push(Effect::StopScheduler);
                effects.push(Effect::Persist);
            }
        }

        Input::DisconnectRequested { error } => {
            if state.status() != PairingStatus::Disconnected {
                let session = &mut state.session;
                session.status = PairingStatus::Disconnected;
                session.qr_payload = None;
                session.last_error = error;
                session.updated_at = now;
                state.last_poll_error = None;
                effects.push(Effect::StopScheduler);
                effects.push(Effect::Persist);
            }
        }
    }

    (state, effects)
}

fn fail(state: &mut TransitionState, error: SessionError, now: DateTime<Utc>) {
    let session = &mut state.session;
    session.status = PairingStatus::Failed;
    session.qr_payload = None;
    session.last_error = Some(error);
    session.updated_at = now;
}

/// Reconcile the in-memory row with what the store currently holds.
///
/// A stored row wins only if it was written later and sits higher in the
/// status rank, so a newer externally observed `Connected` or `Failed` is
/// never clobbered by a stale in-memory copy.
pub fn reconcile_with_stored(current: PairingSession, stored: PairingSession) -> PairingSession {
    if stored.updated_at > current.updated_at && stored.status.rank() > current.status.rank() {
        stored
    } else {
        current
    }
}

/// Whether a status change is an edge of the pairing lifecycle graph.
pub fn is_valid_edge(from: PairingStatus, to: PairingStatus) -> bool {
    use PairingStatus::*;
    from == to
        || matches!(
            (from, to),
            (Disconnected, Provisioning)
                | (Failed, Provisioning)
                | (Provisioning, WaitingForScan)
                | (Provisioning, Failed)
                | (WaitingForScan, Connected)
                | (WaitingForScan, Failed)
                | (Connected, Disconnected)
                | (Provisioning, Disconnected)
                | (WaitingForScan, Disconnected)
                | (Failed, Disconnected)
        )
}

/// Error descriptor for a pairing the gateway refused.
pub fn rejection(message: impl Into<String>, at: DateTime<Utc>) -> SessionError {
    SessionError {
        kind: ErrorKind::ProvisionFailed,
        message: message.into(),
        at,
    }
}
