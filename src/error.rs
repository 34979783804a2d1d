//! Call-related error types.

use crate::relay::RelayError;
use crate::session::SessionError;
use crate::state::InvalidTransition;
use crate::store::StoreError;
use crate::types::call::CallId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call not found: {0}")]
    CallNotFound(CallId),

    /// The call is no longer in a valid state for the attempted operation,
    /// e.g. answering a call the other side already hung up.
    #[error("call {0} is no longer in a valid state for this operation")]
    StaleCall(CallId),

    /// Only one active call attempt is supported per user; a second
    /// initiate/answer fails fast instead of replacing state.
    #[error("another call is already in progress")]
    CallInProgress,

    /// The user refused capture permission. When raised during initiate, no
    /// record has been created.
    #[error("media capture permission denied")]
    MediaAccessDenied,

    #[error("media capture device unavailable: {0}")]
    MediaUnavailable(String),

    /// An incoming-call notification arrived but the offer row was missing:
    /// the first signal was published before our subscription was active.
    #[error("offer signal was never delivered for call {0}")]
    SignalDeliveryGap(CallId),

    #[error("negotiation error: {0}")]
    Negotiation(#[from] SessionError),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl CallError {
    /// Map a rejected state-machine transition to the stale-call error for
    /// `call_id`.
    pub(crate) fn stale(call_id: &CallId, invalid: InvalidTransition) -> Self {
        log::debug!("rejected transition for call {call_id}: {invalid}");
        Self::StaleCall(call_id.clone())
    }
}

impl From<crate::media::MediaError> for CallError {
    fn from(err: crate::media::MediaError) -> Self {
        match err {
            crate::media::MediaError::AccessDenied => Self::MediaAccessDenied,
            crate::media::MediaError::Unavailable(detail) => Self::MediaUnavailable(detail),
        }
    }
}
