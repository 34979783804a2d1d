//! Call record types shared across the crate.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Participant identifiers are opaque to this core; they come from the
/// surrounding marketplace's account system.
pub type UserId = String;

/// Unique identifier for one call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random call id (32 uppercase hex chars).
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::rng().random();
        let mut id = String::with_capacity(32);
        for b in bytes {
            id.push_str(&format!("{b:02X}"));
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Media kind for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    #[default]
    Audio,
    Video,
}

impl CallType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    pub const fn has_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted status of a call record.
///
/// `Ended`, `Missed` and `Declined` are terminal; a record is transitioned
/// into a terminal status exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Answered,
    Ended,
    Missed,
    Declined,
}

impl CallStatus {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Missed | Self::Declined)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Answered => "answered",
            Self::Ended => "ended",
            Self::Missed => "missed",
            Self::Declined => "declined",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call reached a terminal state.
///
/// Carried as the payload of a `hangup` signal so the other side can tell an
/// intentional hangup apart from a decline, a busy peer, a ring timeout, or a
/// dropped connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HangupReason {
    #[default]
    Ended,
    Declined,
    Missed,
    Busy,
    ConnectionLost,
}

impl HangupReason {
    pub const ALL: [HangupReason; 5] = [
        Self::Ended,
        Self::Declined,
        Self::Missed,
        Self::Busy,
        Self::ConnectionLost,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ended => "ended",
            Self::Declined => "declined",
            Self::Missed => "missed",
            Self::Busy => "busy",
            Self::ConnectionLost => "connection-lost",
        }
    }

    pub fn from_str(reason: &str) -> Option<Self> {
        match reason {
            "ended" => Some(Self::Ended),
            "declined" => Some(Self::Declined),
            "missed" => Some(Self::Missed),
            "busy" => Some(Self::Busy),
            "connection-lost" => Some(Self::ConnectionLost),
            _ => None,
        }
    }

    /// The record status a call ends up in when it terminates for this reason.
    pub const fn terminal_status(&self) -> CallStatus {
        match self {
            Self::Ended | Self::ConnectionLost => CallStatus::Ended,
            Self::Declined | Self::Busy => CallStatus::Declined,
            Self::Missed => CallStatus::Missed,
        }
    }
}

impl fmt::Display for HangupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted metadata for one call attempt.
///
/// Created by the caller's `initiate_call` and updated on every status
/// transition. `answered_at` is set only when the callee answers;
/// `duration_seconds` is computed from `answered_at` to `ended_at`, so calls
/// that end before being answered carry no duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    /// Chat thread this call belongs to; opaque to the call core.
    pub conversation_id: String,
    pub call_type: CallType,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

impl CallRecord {
    pub fn new(
        caller_id: UserId,
        callee_id: UserId,
        conversation_id: String,
        call_type: CallType,
    ) -> Self {
        Self {
            id: CallId::generate(),
            caller_id,
            callee_id,
            conversation_id,
            call_type,
            status: CallStatus::Ringing,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            duration_seconds: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark the record answered. Idempotent on `answered_at`.
    pub fn mark_answered(&mut self) {
        self.status = CallStatus::Answered;
        if self.answered_at.is_none() {
            self.answered_at = Some(Utc::now());
        }
    }

    /// Transition the record into the terminal status for `reason`, stamping
    /// `ended_at` and computing the duration when the call had been answered.
    pub fn finish(&mut self, reason: HangupReason) {
        let ended_at = Utc::now();
        self.status = reason.terminal_status();
        self.ended_at = Some(ended_at);
        self.duration_seconds = self
            .answered_at
            .map(|answered| ended_at.signed_duration_since(answered).num_seconds());
    }

    /// The participant on the other side of `user_id`.
    pub fn other_party(&self, user_id: &str) -> &UserId {
        if self.caller_id == user_id {
            &self.callee_id
        } else {
            &self.caller_id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_generate_is_unique() {
        let a = CallId::generate();
        let b = CallId::generate();
        assert_eq!(a.as_str().len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hangup_reason_roundtrip() {
        for reason in HangupReason::ALL {
            assert_eq!(HangupReason::from_str(reason.as_str()), Some(reason));
        }
        assert_eq!(HangupReason::from_str("unplugged"), None);
    }

    #[test]
    fn test_terminal_status_mapping() {
        assert_eq!(HangupReason::Ended.terminal_status(), CallStatus::Ended);
        assert_eq!(
            HangupReason::ConnectionLost.terminal_status(),
            CallStatus::Ended
        );
        assert_eq!(
            HangupReason::Declined.terminal_status(),
            CallStatus::Declined
        );
        assert_eq!(HangupReason::Busy.terminal_status(), CallStatus::Declined);
        assert_eq!(HangupReason::Missed.terminal_status(), CallStatus::Missed);
    }

    #[test]
    fn test_finish_without_answer_has_no_duration() {
        let mut record = CallRecord::new(
            "driver-1".into(),
            "client-9".into(),
            "conv-1".into(),
            CallType::Audio,
        );
        record.finish(HangupReason::Ended);
        assert_eq!(record.status, CallStatus::Ended);
        assert!(record.ended_at.is_some());
        assert!(record.duration_seconds.is_none());
    }

    #[test]
    fn test_finish_after_answer_records_duration() {
        let mut record = CallRecord::new(
            "driver-1".into(),
            "client-9".into(),
            "conv-1".into(),
            CallType::Video,
        );
        record.mark_answered();
        assert_eq!(record.status, CallStatus::Answered);
        assert!(record.answered_at.is_some());

        record.finish(HangupReason::Ended);
        assert!(record.duration_seconds.is_some());
        assert!(record.duration_seconds.unwrap() >= 0);
    }

    #[test]
    fn test_other_party() {
        let record = CallRecord::new(
            "driver-1".into(),
            "client-9".into(),
            "conv-1".into(),
            CallType::Audio,
        );
        assert_eq!(record.other_party("driver-1"), "client-9");
        assert_eq!(record.other_party("client-9"), "driver-1");
    }
}
