//! Session state machine for a single call attempt.

use crate::types::call::HangupReason;
use serde::Serialize;

/// Current phase of a call attempt.
///
/// This is the authoritative in-process state: every operation and every
/// inbound signal is validated against it before anything else happens.
/// `Ringing` is the initial phase for both sides — the caller enters it when
/// the offer goes out, the callee when the invitation arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    #[default]
    Ringing,
    /// The callee accepted; capability negotiation is in progress.
    Connecting,
    /// First inbound media observed.
    Connected,
    /// Terminal: hung up, failed, or timed out after negotiation started.
    Ended,
    /// Terminal: the callee refused the invitation.
    Declined,
    /// Terminal: the invitation was never answered.
    Missed,
}

impl SessionPhase {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Declined | Self::Missed)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ended => "ended",
            Self::Declined => "declined",
            Self::Missed => "missed",
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State transitions for a call attempt.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// The callee accepted the invitation (locally or remotely).
    Accepted,
    /// The negotiated transport reported its first inbound media.
    MediaConnected,
    /// The callee refused the invitation.
    Declined,
    /// The ring timeout elapsed without an answer.
    TimedOut,
    /// Explicit hangup, error, or connection failure.
    Terminated { reason: HangupReason },
}

impl SessionPhase {
    /// Apply a transition, returning the next phase.
    ///
    /// Terminal phases absorb: any transition attempted on them is invalid,
    /// which is how stale signals for a finished call are rejected.
    pub fn apply_transition(
        self,
        transition: &CallTransition,
    ) -> Result<SessionPhase, InvalidTransition> {
        let next = match (self, transition) {
            (Self::Ringing, CallTransition::Accepted) => Self::Connecting,
            (Self::Connecting, CallTransition::MediaConnected) => Self::Connected,
            (Self::Ringing, CallTransition::Declined) => Self::Declined,
            (Self::Ringing | Self::Connecting | Self::Connected, CallTransition::TimedOut) => {
                Self::Missed
            }
            (
                Self::Ringing | Self::Connecting | Self::Connected,
                CallTransition::Terminated { .. },
            ) => Self::Ended,
            (current, transition) => {
                return Err(InvalidTransition {
                    current_phase: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        Ok(next)
    }
}

/// A transition was attempted from a phase that does not permit it.
#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_phase: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in phase {}",
            self.attempted, self.current_phase
        )
    }
}

impl std::error::Error for InvalidTransition {}
