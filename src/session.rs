//! Peer session: negotiation state for one call attempt.
//!
//! A [`PeerSession`] owns one local media capture and the description/
//! candidate exchange for a single call. It is deliberately free of any
//! transport engine: the platform media layer injects locally-discovered
//! network-path candidates and connectivity transitions, and this type
//! enforces the protocol rules around them —
//!
//! - local tracks are attached before any description is generated, so the
//!   description reflects actual capabilities;
//! - an offer must be applied before an answer, and each description at most
//!   once;
//! - every locally-generated candidate is forwarded at most once;
//! - remote candidates that arrive before the remote description are queued
//!   and replayed once the description lands.

use crate::media::LocalMedia;
use crate::types::call::{CallId, CallType, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Which side of the exchange a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

impl DescriptionKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

/// One side's proposed media capabilities, exchanged as the opaque payload of
/// an `offer` or `answer` signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub audio: bool,
    pub video: bool,
}

impl SessionDescription {
    pub fn to_payload(&self) -> String {
        // the struct has no non-serializable members
        serde_json::to_string(self).expect("description serialization cannot fail")
    }

    pub fn from_payload(payload: &str) -> Result<Self, SessionError> {
        serde_json::from_str(payload).map_err(|e| SessionError::InvalidPayload(e.to_string()))
    }
}

/// Connectivity reported by the negotiated transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// No transport report yet.
    New,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectivityState {
    /// Whether the transport is unusable and the call must end.
    pub const fn is_lost(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

/// What happened to a remote candidate handed to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Applied to the transport immediately.
    Applied,
    /// Arrived before the remote description; held until it lands.
    Queued,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("description payload could not be parsed: {0}")]
    InvalidPayload(String),

    /// An answer arrived on the answering side, or an offer on the
    /// initiating side.
    #[error("unexpected {} description for this side", .0.as_str())]
    UnexpectedDescription(DescriptionKind),

    #[error("remote description already applied")]
    DuplicateDescription,

    #[error("local description already generated")]
    DuplicateLocalDescription,

    /// An answer cannot be generated before the remote offer was applied.
    #[error("no remote offer has been applied")]
    OfferNotApplied,
}

/// Negotiation state for one call attempt.
///
/// The `(local_user, remote_user)` pair is resolved once when the session is
/// opened and cached here, so outbound candidates never re-derive the other
/// participant from storage.
pub struct PeerSession {
    call_id: CallId,
    local_user: UserId,
    remote_user: UserId,
    media: Arc<LocalMedia>,
    /// True on the side that sent the offer.
    initiator: bool,
    discovery_endpoints: Vec<String>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    /// Remote candidates that arrived before the remote description.
    pending_remote_candidates: Vec<String>,
    applied_remote_candidates: Vec<String>,
    /// Local candidates already handed off for relaying.
    forwarded_candidates: HashSet<String>,
    connectivity: ConnectivityState,
}

impl PeerSession {
    pub fn new(
        call_id: CallId,
        local_user: UserId,
        remote_user: UserId,
        media: Arc<LocalMedia>,
        initiator: bool,
        discovery_endpoints: Vec<String>,
    ) -> Self {
        Self {
            call_id,
            local_user,
            remote_user,
            media,
            initiator,
            discovery_endpoints,
            local_description: None,
            remote_description: None,
            pending_remote_candidates: Vec::new(),
            applied_remote_candidates: Vec::new(),
            forwarded_candidates: HashSet::new(),
            connectivity: ConnectivityState::New,
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn remote_user(&self) -> &UserId {
        &self.remote_user
    }

    pub fn media(&self) -> &Arc<LocalMedia> {
        &self.media
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Endpoints the platform layer probes to discover reachable paths.
    /// There is no guaranteed-reachable relay of last resort in this list.
    pub fn discovery_endpoints(&self) -> &[String] {
        &self.discovery_endpoints
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.connectivity
    }

    /// Capabilities of the attached local capture.
    fn local_capabilities(&self, kind: DescriptionKind) -> SessionDescription {
        SessionDescription {
            kind,
            audio: true,
            video: self.media.has_video(),
        }
    }

    /// Generate the offer. Initiating side only, at most once.
    pub fn create_offer(&mut self) -> Result<SessionDescription, SessionError> {
        if !self.initiator {
            return Err(SessionError::UnexpectedDescription(DescriptionKind::Offer));
        }
        if self.local_description.is_some() {
            return Err(SessionError::DuplicateLocalDescription);
        }

        let offer = self.local_capabilities(DescriptionKind::Offer);
        self.local_description = Some(offer.clone());
        Ok(offer)
    }

    /// Generate the answer. Answering side only, after the remote offer.
    pub fn create_answer(&mut self) -> Result<SessionDescription, SessionError> {
        if self.initiator {
            return Err(SessionError::UnexpectedDescription(DescriptionKind::Answer));
        }
        if self.remote_description.is_none() {
            return Err(SessionError::OfferNotApplied);
        }
        if self.local_description.is_some() {
            return Err(SessionError::DuplicateLocalDescription);
        }

        let answer = self.local_capabilities(DescriptionKind::Answer);
        self.local_description = Some(answer.clone());
        Ok(answer)
    }

    /// Apply the other side's description.
    ///
    /// Returns the remote candidates that had been queued while waiting for
    /// it; they are now applied and the caller may log or count them.
    pub fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<Vec<String>, SessionError> {
        if self.remote_description.is_some() {
            return Err(SessionError::DuplicateDescription);
        }

        let expected = if self.initiator {
            DescriptionKind::Answer
        } else {
            DescriptionKind::Offer
        };
        if description.kind != expected {
            return Err(SessionError::UnexpectedDescription(description.kind));
        }
        // the initiator can only receive an answer to an offer it generated
        if self.initiator && self.local_description.is_none() {
            return Err(SessionError::UnexpectedDescription(description.kind));
        }

        self.remote_description = Some(description);

        let replayed: Vec<String> = self.pending_remote_candidates.drain(..).collect();
        self.applied_remote_candidates.extend(replayed.clone());
        Ok(replayed)
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    /// Record a locally-discovered candidate for forwarding.
    ///
    /// Returns true exactly once per distinct candidate; the caller forwards
    /// it over the relay only on true.
    pub fn add_local_candidate(&mut self, candidate: &str) -> bool {
        self.forwarded_candidates.insert(candidate.to_string())
    }

    /// Hand a remote candidate to the session, in whatever order it arrived
    /// relative to the remote description.
    pub fn add_remote_candidate(&mut self, candidate: String) -> CandidateDisposition {
        if self.remote_description.is_some() {
            self.applied_remote_candidates.push(candidate);
            CandidateDisposition::Applied
        } else {
            self.pending_remote_candidates.push(candidate);
            CandidateDisposition::Queued
        }
    }

    pub fn applied_remote_candidates(&self) -> &[String] {
        &self.applied_remote_candidates
    }

    pub fn pending_remote_candidates(&self) -> &[String] {
        &self.pending_remote_candidates
    }

    /// Record a connectivity transition. Returns the previous state.
    pub fn report_connectivity(&mut self, state: ConnectivityState) -> ConnectivityState {
        std::mem::replace(&mut self.connectivity, state)
    }

    /// The call type this session was opened for.
    pub fn call_type(&self) -> CallType {
        self.media.call_type()
    }
}
