//! Signal message type definitions.
//!
//! Four signal types drive the whole protocol: one `offer` and at most one
//! `answer` per call, any number of `ice-candidate` messages, and at most one
//! effective `hangup` (further hangups are no-ops on the receiving side).

use crate::types::call::{CallId, UserId};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signaling message types for call control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    /// Initial session description sent by the caller.
    Offer,
    /// Responding session description sent by the callee.
    Answer,
    /// A discovered network path, exchanged until a working one is found.
    IceCandidate,
    /// Call teardown; the payload carries the reason string.
    Hangup,
}

impl SignalType {
    /// All signal types in order.
    pub const ALL: [SignalType; 4] = [
        Self::Offer,
        Self::Answer,
        Self::IceCandidate,
        Self::Hangup,
    ];

    /// Wire tag for this signal type.
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::Hangup => "hangup",
        }
    }

    /// Parse from a wire tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "ice-candidate" => Some(Self::IceCandidate),
            "hangup" => Some(Self::Hangup),
            _ => None,
        }
    }

    /// Whether this signal type changes call state.
    ///
    /// Candidates only feed negotiation; offer/answer/hangup move the state
    /// machine.
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::Hangup)
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_name())
    }
}

/// One signaling message exchanged over the relay.
///
/// Immutable once created; rows are retained for audit/history and are never
/// replayed on reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    pub id: String,
    pub call_id: CallId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub signal_type: SignalType,
    /// Opaque serialized negotiation data (session description or candidate
    /// descriptor), or a reason string for `hangup`.
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl SignalMessage {
    pub fn new(
        call_id: CallId,
        from_user_id: UserId,
        to_user_id: UserId,
        signal_type: SignalType,
        payload: String,
    ) -> Self {
        Self {
            id: generate_signal_id(),
            call_id,
            from_user_id,
            to_user_id,
            signal_type,
            payload,
            created_at: Utc::now(),
        }
    }
}

fn generate_signal_id() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    let mut id = String::with_capacity(16);
    for b in bytes {
        id.push_str(&format!("{b:02x}"));
    }
    id
}
