//! Call service: the single entry point the UI layer talks to.
//!
//! Orchestrates the record store, the peer session, the session state
//! machine, and the relay for every call attempt. All state is kept in an
//! explicit per-call map keyed by [`CallId`]; the service itself holds only
//! the local user identity and its collaborators, so concurrent signals for
//! the same call are serialized through the map lock and checked against the
//! session phase before anything happens.

use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::{LocalMedia, MediaSource};
use crate::relay::{
    MessageRelay, RelayCallback, RelayError, RelaySubscription, call_channel, inbox_channel,
};
use crate::session::{CandidateDisposition, ConnectivityState, PeerSession, SessionDescription};
use crate::signaling::{SignalMessage, SignalType};
use crate::state::{CallTransition, SessionPhase};
use crate::store::CallRecordStore;
use crate::types::call::{CallId, CallRecord, CallStatus, CallType, HangupReason, UserId};
use crate::types::events::{CallEvent, CallEventBus};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Callback for invitations delivered on the local user's inbox channel.
pub trait IncomingCallHandler: Send + Sync {
    fn on_incoming(&self, record: &CallRecord, offer_payload: &str);
}

/// Live state for one call attempt.
struct CallSession {
    record: CallRecord,
    phase: SessionPhase,
    /// Opened when media is acquired; an incoming call has none until it is
    /// answered.
    peer: Option<PeerSession>,
    media: Option<Arc<LocalMedia>>,
    subscription: Option<RelaySubscription>,
    ring_timer: Option<JoinHandle<()>>,
    /// Remote candidates that arrived before the call was answered (no peer
    /// session exists yet to queue them in).
    early_candidates: Vec<String>,
    /// Outstanding async work (a media prompt, a negotiation step) checks
    /// this when it completes and releases what it acquired instead of
    /// proceeding.
    cancelled: bool,
    released: bool,
}

impl CallSession {
    fn active(
        record: CallRecord,
        peer: PeerSession,
        media: Arc<LocalMedia>,
        subscription: RelaySubscription,
        ring_timer: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            record,
            phase: SessionPhase::Ringing,
            peer: Some(peer),
            media: Some(media),
            subscription: Some(subscription),
            ring_timer,
            early_candidates: Vec::new(),
            cancelled: false,
            released: false,
        }
    }

    fn incoming(record: CallRecord, subscription: RelaySubscription) -> Self {
        Self {
            record,
            phase: SessionPhase::Ringing,
            peer: None,
            media: None,
            subscription: Some(subscription),
            ring_timer: None,
            early_candidates: Vec::new(),
            cancelled: false,
            released: false,
        }
    }

    /// Release everything this call holds. Every exit path funnels here;
    /// idempotent because exits can race.
    fn teardown(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.cancelled = true;
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
        if let Some(media) = self.media.take() {
            media.release();
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.early_candidates.clear();
    }
}

pub struct CallService {
    user_id: UserId,
    config: CallConfig,
    relay: Arc<dyn MessageRelay>,
    store: Arc<dyn CallRecordStore>,
    media_source: Arc<dyn MediaSource>,
    event_bus: CallEventBus,
    sessions: RwLock<HashMap<CallId, CallSession>>,
    /// Handle to ourselves for the tasks spawned off relay callbacks and
    /// timers; weak so a dropped service stops its background work.
    weak: Weak<CallService>,
}

impl CallService {
    pub fn new(
        user_id: impl Into<UserId>,
        config: CallConfig,
        relay: Arc<dyn MessageRelay>,
        store: Arc<dyn CallRecordStore>,
        media_source: Arc<dyn MediaSource>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            user_id: user_id.into(),
            config,
            relay,
            store,
            media_source,
            event_bus: CallEventBus::new(),
            sessions: RwLock::new(HashMap::new()),
            weak: weak.clone(),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn event_bus(&self) -> &CallEventBus {
        &self.event_bus
    }

    /// Whether any call attempt is currently non-terminal.
    pub async fn has_active_call(&self) -> bool {
        self.sessions
            .read()
            .await
            .values()
            .any(|s| !s.phase.is_terminal())
    }

    /// The record of the current non-terminal call, if any.
    pub async fn active_call(&self) -> Option<CallRecord> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| !s.phase.is_terminal())
            .map(|s| s.record.clone())
    }

    /// This service's view of a call's record.
    pub async fn call_record(&self, call_id: &CallId) -> Option<CallRecord> {
        self.sessions
            .read()
            .await
            .get(call_id)
            .map(|s| s.record.clone())
    }

    pub async fn session_phase(&self, call_id: &CallId) -> Option<SessionPhase> {
        self.sessions.read().await.get(call_id).map(|s| s.phase)
    }

    // Expose negotiation internals for protocol tests
    #[cfg(test)]
    pub(crate) async fn applied_remote_candidate_count(&self, call_id: &CallId) -> usize {
        self.sessions
            .read()
            .await
            .get(call_id)
            .and_then(|s| s.peer.as_ref())
            .map(|p| p.applied_remote_candidates().len())
            .unwrap_or(0)
    }

    /// Drop finished call entries from memory. Their records live on in the
    /// store.
    pub async fn cleanup_finished_calls(&self) {
        self.sessions
            .write()
            .await
            .retain(|_, s| !s.phase.is_terminal());
    }

    /// Start an outgoing call.
    ///
    /// Acquires local media first — a denied permission aborts before any
    /// record exists — then creates the record, opens the peer session, and
    /// publishes the offer. The call channel subscription is established
    /// before the offer is published: a subscriber that joins after a publish
    /// misses it.
    pub async fn initiate_call(
        &self,
        callee_id: impl Into<UserId>,
        conversation_id: impl Into<String>,
        call_type: CallType,
    ) -> Result<(CallId, Arc<LocalMedia>), CallError> {
        let callee_id: UserId = callee_id.into();

        if self.has_active_call().await {
            return Err(CallError::CallInProgress);
        }

        // the slow step; may sit on a permission prompt indefinitely
        let media = self.media_source.acquire(call_type).await?;

        let mut sessions = self.sessions.write().await;
        // a concurrent attempt may have won while the prompt was open
        if sessions.values().any(|s| !s.phase.is_terminal()) {
            media.release();
            return Err(CallError::CallInProgress);
        }

        let record = CallRecord::new(
            self.user_id.clone(),
            callee_id.clone(),
            conversation_id.into(),
            call_type,
        );
        let call_id = record.id.clone();

        let setup = async {
            self.store.create_call(&record).await?;

            let mut peer = PeerSession::new(
                call_id.clone(),
                self.user_id.clone(),
                callee_id.clone(),
                media.clone(),
                true,
                self.config.discovery_endpoints.clone(),
            );
            let offer = peer.create_offer()?;

            let subscription = self.subscribe_call_channel(&call_id).await?;

            let offer_signal = SignalMessage::new(
                call_id.clone(),
                self.user_id.clone(),
                callee_id.clone(),
                SignalType::Offer,
                offer.to_payload(),
            );
            // the offer row must exist before the invitation goes out: the
            // callee fetches it from the store on receipt
            self.store.append_signal(&offer_signal).await?;

            let invitation = serde_json::to_value(&record)
                .map_err(|e| RelayError::Backend(e.to_string()))?;
            self.relay
                .publish(&inbox_channel(&callee_id), invitation)
                .await?;
            self.relay
                .publish(
                    &call_channel(&call_id),
                    serde_json::to_value(&offer_signal)
                        .map_err(|e| RelayError::Backend(e.to_string()))?,
                )
                .await?;

            Ok::<_, CallError>((peer, subscription))
        }
        .await;

        let (peer, subscription) = match setup {
            Ok(parts) => parts,
            Err(error) => {
                media.release();
                return Err(error);
            }
        };

        let ring_timer = self.spawn_ring_timer(&call_id);
        sessions.insert(
            call_id.clone(),
            CallSession::active(record, peer, media.clone(), subscription, ring_timer),
        );
        drop(sessions);

        info!(
            "initiated {} call {} to {}",
            call_type, call_id, callee_id
        );
        self.event_bus.dispatch(&CallEvent::StateChanged {
            call_id: call_id.clone(),
            phase: SessionPhase::Ringing,
        });

        Ok((call_id, media))
    }

    /// Answer an incoming call.
    ///
    /// Media acquisition is the slow step, so the call's state is re-checked
    /// after it resolves: a hangup that raced the permission prompt wins and
    /// this fails with [`CallError::StaleCall`], releasing the capture.
    pub async fn answer_call(
        &self,
        call_id: &CallId,
        caller_id: &str,
        call_type: CallType,
        offer_payload: &str,
    ) -> Result<Arc<LocalMedia>, CallError> {
        {
            let sessions = self.sessions.read().await;
            if sessions
                .iter()
                .any(|(id, s)| id != call_id && !s.phase.is_terminal())
            {
                return Err(CallError::CallInProgress);
            }
            if let Some(session) = sessions.get(call_id)
                && (session.cancelled || session.phase.is_terminal())
            {
                return Err(CallError::StaleCall(call_id.clone()));
            }
        }

        let offer = SessionDescription::from_payload(offer_payload)?;

        let media = self.media_source.acquire(call_type).await?;

        let mut sessions = self.sessions.write().await;

        // everything can have changed while the prompt was open
        if sessions
            .iter()
            .any(|(id, s)| id != call_id && !s.phase.is_terminal())
        {
            media.release();
            return Err(CallError::CallInProgress);
        }
        if let Some(session) = sessions.get(call_id)
            && (session.cancelled || session.phase.is_terminal())
        {
            media.release();
            return Err(CallError::StaleCall(call_id.clone()));
        }

        let mut record = match self.store.get_call(call_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                media.release();
                return Err(CallError::CallNotFound(call_id.clone()));
            }
            Err(error) => {
                media.release();
                return Err(error.into());
            }
        };
        if record.is_terminal() {
            media.release();
            return Err(CallError::StaleCall(call_id.clone()));
        }

        let mut peer = PeerSession::new(
            call_id.clone(),
            self.user_id.clone(),
            caller_id.to_string(),
            media.clone(),
            false,
            self.config.discovery_endpoints.clone(),
        );

        let setup = async {
            peer.apply_remote_description(offer)?;
            let answer = peer.create_answer()?;

            record.mark_answered();
            self.store.update_call(&record).await?;

            let answer_signal = SignalMessage::new(
                call_id.clone(),
                self.user_id.clone(),
                caller_id.to_string(),
                SignalType::Answer,
                answer.to_payload(),
            );
            self.publish_signal(&answer_signal).await?;
            Ok::<_, CallError>(())
        }
        .await;
        if let Err(error) = setup {
            media.release();
            return Err(error);
        }

        // past this point nothing fails: assemble the live session
        let previous = sessions.remove(call_id);
        let subscription = match previous {
            Some(mut existing) => {
                for candidate in existing.early_candidates.drain(..) {
                    // the remote description is applied, so these all land
                    if peer.add_remote_candidate(candidate) == CandidateDisposition::Queued {
                        warn!("call {call_id}: early candidate queued unexpectedly");
                    }
                }
                existing.subscription.take()
            }
            None => None,
        };
        let subscription = match subscription {
            Some(subscription) => subscription,
            // answered straight from the offer payload, without a prior
            // invitation on our inbox
            None => match self.subscribe_call_channel(call_id).await {
                Ok(subscription) => subscription,
                Err(error) => {
                    media.release();
                    return Err(error);
                }
            },
        };

        let phase = SessionPhase::Ringing
            .apply_transition(&CallTransition::Accepted)
            .map_err(|invalid| CallError::stale(call_id, invalid))?;

        let mut session = CallSession::active(record, peer, media.clone(), subscription, None);
        session.phase = phase;
        sessions.insert(call_id.clone(), session);
        drop(sessions);

        info!("answered call {} from {}", call_id, caller_id);
        self.event_bus.dispatch(&CallEvent::StateChanged {
            call_id: call_id.clone(),
            phase,
        });

        Ok(media)
    }

    /// Refuse an incoming call. No-op when the call is already terminal.
    pub async fn decline_call(&self, call_id: &CallId) -> Result<(), CallError> {
        self.finish_locally(call_id, HangupReason::Declined, CallTransition::Declined)
            .await
    }

    /// End a call from this side. Always succeeds against in-flight
    /// negotiation work; no-op when the call is already terminal.
    pub async fn hangup_call(
        &self,
        call_id: &CallId,
        reason: Option<HangupReason>,
    ) -> Result<(), CallError> {
        let reason = reason.unwrap_or(HangupReason::Ended);
        self.finish_locally(call_id, reason, CallTransition::Terminated { reason })
            .await
    }

    /// Subscribe to invitations addressed to this user.
    ///
    /// The subscription must be active before anyone can call this user:
    /// relay delivery only reaches current subscribers, so an invitation
    /// published earlier is gone.
    pub async fn subscribe_incoming_calls(
        &self,
        handler: Arc<dyn IncomingCallHandler>,
    ) -> Result<RelaySubscription, CallError> {
        let service = self.weak.clone();
        let callback: RelayCallback = Arc::new(move |payload| {
            let Some(service) = service.upgrade() else {
                return;
            };
            let handler = handler.clone();
            match serde_json::from_value::<CallRecord>(payload) {
                Ok(record) => {
                    tokio::spawn(async move {
                        service.handle_incoming_invitation(record, handler).await;
                    });
                }
                Err(error) => warn!("dropping malformed invitation payload: {error}"),
            }
        });

        Ok(self
            .relay
            .subscribe(&inbox_channel(&self.user_id), callback)
            .await?)
    }

    /// Flip the local audio track. Pure local state, no signaling traffic.
    /// Returns the new muted state.
    pub async fn toggle_mute(&self, call_id: &CallId) -> Result<bool, CallError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(call_id)
            .ok_or_else(|| CallError::CallNotFound(call_id.clone()))?;
        if session.phase.is_terminal() {
            return Err(CallError::StaleCall(call_id.clone()));
        }
        let media = session
            .media
            .as_ref()
            .ok_or_else(|| CallError::StaleCall(call_id.clone()))?;
        Ok(media.toggle_mute())
    }

    /// Flip the local video track. Returns the new off state.
    pub async fn toggle_video(&self, call_id: &CallId) -> Result<bool, CallError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(call_id)
            .ok_or_else(|| CallError::CallNotFound(call_id.clone()))?;
        if session.phase.is_terminal() {
            return Err(CallError::StaleCall(call_id.clone()));
        }
        let media = session
            .media
            .as_ref()
            .ok_or_else(|| CallError::StaleCall(call_id.clone()))?;
        Ok(media.toggle_video())
    }

    /// Forward a locally-discovered network-path candidate to the other
    /// participant. Each distinct candidate is forwarded exactly once;
    /// candidates for finished calls are dropped.
    pub async fn add_local_candidate(
        &self,
        call_id: &CallId,
        candidate: &str,
    ) -> Result<(), CallError> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(call_id) else {
            return Err(CallError::CallNotFound(call_id.clone()));
        };
        if session.phase.is_terminal() {
            debug!("dropping local candidate for finished call {call_id}");
            return Ok(());
        }
        let Some(peer) = session.peer.as_mut() else {
            return Err(CallError::StaleCall(call_id.clone()));
        };

        if !peer.add_local_candidate(candidate) {
            debug!("call {call_id}: candidate already forwarded");
            return Ok(());
        }

        let to = peer.remote_user().clone();
        let signal = SignalMessage::new(
            call_id.clone(),
            self.user_id.clone(),
            to,
            SignalType::IceCandidate,
            candidate.to_string(),
        );
        self.publish_signal(&signal).await
    }

    /// Feed a transport connectivity report into the state machine.
    ///
    /// The first `Connected` report is the "first inbound media" edge; a
    /// lost transport after negotiation started ends the call with reason
    /// `connection-lost`.
    pub async fn report_connectivity(
        &self,
        call_id: &CallId,
        state: ConnectivityState,
    ) -> Result<(), CallError> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(call_id) else {
            return Err(CallError::CallNotFound(call_id.clone()));
        };
        if session.phase.is_terminal() {
            debug!("ignoring connectivity report for finished call {call_id}");
            return Ok(());
        }
        let Some(peer) = session.peer.as_mut() else {
            return Err(CallError::StaleCall(call_id.clone()));
        };
        peer.report_connectivity(state);

        match state {
            ConnectivityState::Connected if session.phase == SessionPhase::Connecting => {
                session.phase = session
                    .phase
                    .apply_transition(&CallTransition::MediaConnected)
                    .map_err(|invalid| CallError::stale(call_id, invalid))?;
                if let Some(timer) = session.ring_timer.take() {
                    timer.abort();
                }
                let phase = session.phase;
                drop(sessions);

                info!("call {call_id} connected");
                self.event_bus.dispatch(&CallEvent::StateChanged {
                    call_id: call_id.clone(),
                    phase,
                });
                self.event_bus.dispatch(&CallEvent::RemoteMediaAvailable {
                    call_id: call_id.clone(),
                });
            }
            state if state.is_lost() => {
                let reason = HangupReason::ConnectionLost;
                warn!("call {call_id} lost its transport ({state:?})");
                let phase = match self
                    .finish_session(
                        call_id,
                        session,
                        reason,
                        CallTransition::Terminated { reason },
                        true,
                    )
                    .await
                {
                    Ok(phase) => phase,
                    Err(invalid) => return Err(CallError::stale(call_id, invalid)),
                };
                drop(sessions);

                self.event_bus.dispatch(&CallEvent::StateChanged {
                    call_id: call_id.clone(),
                    phase,
                });
                self.event_bus.dispatch(&CallEvent::Ended {
                    call_id: call_id.clone(),
                    reason,
                });
            }
            _ => {}
        }

        Ok(())
    }

    // ---- internals ----

    /// Persist and publish one signal row on the call's channel.
    async fn publish_signal(&self, signal: &SignalMessage) -> Result<(), CallError> {
        self.store.append_signal(signal).await?;
        let payload =
            serde_json::to_value(signal).map_err(|e| RelayError::Backend(e.to_string()))?;
        self.relay
            .publish(&call_channel(&signal.call_id), payload)
            .await?;
        Ok(())
    }

    /// Subscribe to a call's signal channel, routing inbound messages into
    /// [`Self::handle_signal`].
    async fn subscribe_call_channel(
        &self,
        call_id: &CallId,
    ) -> Result<RelaySubscription, CallError> {
        let service = self.weak.clone();
        let callback: RelayCallback = Arc::new(move |payload| {
            let Some(service) = service.upgrade() else {
                return;
            };
            match serde_json::from_value::<SignalMessage>(payload) {
                Ok(signal) => {
                    tokio::spawn(async move {
                        service.handle_signal(signal).await;
                    });
                }
                Err(error) => warn!("dropping malformed signal payload: {error}"),
            }
        });

        Ok(self.relay.subscribe(&call_channel(call_id), callback).await?)
    }

    async fn handle_signal(&self, signal: SignalMessage) {
        // our own publishes are echoed back on the channel
        if signal.from_user_id == self.user_id {
            return;
        }

        debug!(
            "received {} signal for call {} from {}",
            signal.signal_type, signal.call_id, signal.from_user_id
        );

        match signal.signal_type {
            // offers reach the callee through the inbox path, never here
            SignalType::Offer => {}
            SignalType::Answer => self.handle_remote_answer(signal).await,
            SignalType::IceCandidate => self.handle_remote_candidate(signal).await,
            SignalType::Hangup => self.handle_remote_hangup(signal).await,
        }
    }

    /// The callee accepted: apply its answer and move to Connecting.
    async fn handle_remote_answer(&self, signal: SignalMessage) {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(&signal.call_id) else {
            debug!("answer for unknown call {}", signal.call_id);
            return;
        };
        if session.phase.is_terminal() {
            debug!("ignoring answer for finished call {}", signal.call_id);
            return;
        }

        let description = match SessionDescription::from_payload(&signal.payload) {
            Ok(description) => description,
            Err(error) => {
                warn!("call {}: malformed answer payload: {error}", signal.call_id);
                return;
            }
        };

        let Some(peer) = session.peer.as_mut() else {
            warn!("call {}: answer without a peer session", signal.call_id);
            return;
        };
        match peer.apply_remote_description(description) {
            Ok(replayed) => {
                if !replayed.is_empty() {
                    debug!(
                        "call {}: replayed {} queued candidate(s)",
                        signal.call_id,
                        replayed.len()
                    );
                }
            }
            Err(error) => {
                warn!("call {}: cannot apply answer: {error}", signal.call_id);
                return;
            }
        }

        match session.phase.apply_transition(&CallTransition::Accepted) {
            Ok(next) => session.phase = next,
            Err(invalid) => {
                debug!("call {}: {invalid}", signal.call_id);
                return;
            }
        }

        // the callee wrote the authoritative record update; stamp our copy
        session.record.mark_answered();
        if let Some(timer) = session.ring_timer.take() {
            timer.abort();
        }

        let phase = session.phase;
        drop(sessions);
        self.event_bus.dispatch(&CallEvent::StateChanged {
            call_id: signal.call_id.clone(),
            phase,
        });
    }

    async fn handle_remote_candidate(&self, signal: SignalMessage) {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(&signal.call_id) else {
            debug!("candidate for unknown call {}", signal.call_id);
            return;
        };
        if session.phase.is_terminal() {
            debug!("ignoring candidate for finished call {}", signal.call_id);
            return;
        }

        match session.peer.as_mut() {
            Some(peer) => {
                if peer.add_remote_candidate(signal.payload) == CandidateDisposition::Queued {
                    debug!(
                        "call {}: candidate queued until the remote description lands",
                        signal.call_id
                    );
                }
            }
            // invitation received but not answered yet
            None => session.early_candidates.push(signal.payload),
        }
    }

    /// The other side hung up, declined, was busy, or timed us out.
    /// Idempotent: repeated hangups find a terminal phase and do nothing.
    async fn handle_remote_hangup(&self, signal: SignalMessage) {
        let reason = HangupReason::from_str(&signal.payload).unwrap_or_default();

        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(&signal.call_id) else {
            debug!("hangup for unknown call {}", signal.call_id);
            return;
        };
        if session.phase.is_terminal() {
            debug!("ignoring repeated hangup for call {}", signal.call_id);
            return;
        }

        let transition = match reason {
            HangupReason::Declined | HangupReason::Busy => CallTransition::Declined,
            HangupReason::Missed => CallTransition::TimedOut,
            _ => CallTransition::Terminated { reason },
        };
        let phase = match self
            .finish_session(&signal.call_id, session, reason, transition, false)
            .await
        {
            Ok(phase) => phase,
            Err(invalid) => {
                debug!("call {}: {invalid}", signal.call_id);
                return;
            }
        };
        drop(sessions);

        info!("call {} ended remotely ({reason})", signal.call_id);
        self.event_bus.dispatch(&CallEvent::StateChanged {
            call_id: signal.call_id.clone(),
            phase,
        });
        self.event_bus.dispatch(&CallEvent::Ended {
            call_id: signal.call_id.clone(),
            reason,
        });
    }

    /// Terminal operation initiated on this side (hangup, decline, timeout,
    /// connection loss). No-op when the call is already terminal.
    async fn finish_locally(
        &self,
        call_id: &CallId,
        reason: HangupReason,
        transition: CallTransition,
    ) -> Result<(), CallError> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(call_id) else {
            return Err(CallError::CallNotFound(call_id.clone()));
        };
        if session.phase.is_terminal() {
            debug!("call {call_id} already terminal; nothing to do");
            return Ok(());
        }

        let phase = self
            .finish_session(call_id, session, reason, transition, true)
            .await
            .map_err(|invalid| CallError::stale(call_id, invalid))?;
        drop(sessions);

        info!("call {call_id} finished locally ({reason})");
        self.event_bus.dispatch(&CallEvent::StateChanged {
            call_id: call_id.clone(),
            phase,
        });
        self.event_bus.dispatch(&CallEvent::Ended {
            call_id: call_id.clone(),
            reason,
        });
        Ok(())
    }

    /// The single teardown path: validates the transition, notifies the
    /// other side and persists the terminal status (local exits only), and
    /// releases resources. Cleanup proceeds to completion even when the
    /// notify/persist steps fail.
    async fn finish_session(
        &self,
        call_id: &CallId,
        session: &mut CallSession,
        reason: HangupReason,
        transition: CallTransition,
        local: bool,
    ) -> Result<SessionPhase, crate::state::InvalidTransition> {
        // a decline that raced an accept falls back to plain termination
        let next = session.phase.apply_transition(&transition).or_else(|_| {
            session
                .phase
                .apply_transition(&CallTransition::Terminated { reason })
        })?;

        session.cancelled = true;

        if local {
            let to = session.record.other_party(&self.user_id).clone();
            let signal = SignalMessage::new(
                call_id.clone(),
                self.user_id.clone(),
                to,
                SignalType::Hangup,
                reason.as_str().to_string(),
            );
            if let Err(error) = self.publish_signal(&signal).await {
                warn!("failed to publish hangup for {call_id}: {error}");
            }
        }

        session.record.finish(reason);
        if local {
            // the record is transitioned into a terminal status exactly once;
            // if the other side already did, leave its write alone
            let already_terminal = matches!(
                self.store.get_call(call_id).await,
                Ok(Some(stored)) if stored.is_terminal()
            );
            if !already_terminal
                && let Err(error) = self.store.update_call(&session.record).await
            {
                warn!("failed to persist terminal status for {call_id}: {error}");
            }
        }

        session.phase = next;
        session.teardown();
        Ok(next)
    }

    /// An invitation arrived on this user's inbox.
    async fn handle_incoming_invitation(
        &self,
        record: CallRecord,
        handler: Arc<dyn IncomingCallHandler>,
    ) {
        if record.callee_id != self.user_id {
            // inbox channels are per-user; anything else is misrouted
            warn!(
                "invitation for {} arrived on {}'s inbox",
                record.callee_id, self.user_id
            );
            return;
        }
        if record.status != CallStatus::Ringing {
            debug!("ignoring invitation for {} call {}", record.status, record.id);
            return;
        }

        let call_id = record.id.clone();

        // relay delivery is at-least-once
        if self.sessions.read().await.contains_key(&call_id) {
            debug!("duplicate invitation for call {call_id}");
            return;
        }

        // already in a call: refuse distinctly so the caller can tell busy
        // from an explicit decline
        if self.has_active_call().await {
            info!("busy; refusing call {call_id} from {}", record.caller_id);
            self.refuse_busy(record).await;
            return;
        }

        let offer = match self.store.offer_for_call(&call_id).await {
            Ok(Some(offer)) => offer,
            Ok(None) => {
                // the offer was published before any subscription for this
                // call was active; without this log the call would just
                // silently never ring
                error!("{}", CallError::SignalDeliveryGap(call_id));
                return;
            }
            Err(error) => {
                warn!("failed to fetch offer for call {call_id}: {error}");
                return;
            }
        };

        // subscribe before answering so hangups and early candidates for
        // this call reach us while it is still ringing
        let subscription = match self.subscribe_call_channel(&call_id).await {
            Ok(subscription) => subscription,
            Err(error) => {
                warn!("failed to subscribe to call {call_id}: {error}");
                return;
            }
        };

        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&call_id) {
                debug!("duplicate invitation for call {call_id}");
                return;
            }
            sessions.insert(call_id.clone(), CallSession::incoming(record.clone(), subscription));
        }

        info!(
            "incoming {} call {} from {}",
            record.call_type, call_id, record.caller_id
        );
        self.event_bus.dispatch(&CallEvent::IncomingCall {
            record: record.clone(),
            offer_payload: offer.payload.clone(),
        });
        handler.on_incoming(&record, &offer.payload);
    }

    /// Refuse an invitation while another call is active, without touching
    /// the active call's state.
    async fn refuse_busy(&self, mut record: CallRecord) {
        let reason = HangupReason::Busy;
        let signal = SignalMessage::new(
            record.id.clone(),
            self.user_id.clone(),
            record.caller_id.clone(),
            SignalType::Hangup,
            reason.as_str().to_string(),
        );
        if let Err(error) = self.publish_signal(&signal).await {
            warn!("failed to publish busy refusal for {}: {error}", record.id);
        }

        record.finish(reason);
        if let Err(error) = self.store.update_call(&record).await {
            warn!(
                "failed to persist busy refusal for {}: {error}",
                record.id
            );
        }
    }

    fn spawn_ring_timer(&self, call_id: &CallId) -> Option<JoinHandle<()>> {
        let timeout = self.config.ring_timeout?;
        let service = self.weak.clone();
        let call_id = call_id.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(service) = service.upgrade() {
                service.handle_ring_timeout(&call_id).await;
            }
        }))
    }

    /// The ring timeout elapsed; if nobody answered, the call is missed.
    async fn handle_ring_timeout(&self, call_id: &CallId) {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(call_id) else {
            return;
        };
        if session.phase != SessionPhase::Ringing {
            return;
        }

        info!("call {call_id} was not answered in time; marking missed");
        let reason = HangupReason::Missed;
        let phase = match self
            .finish_session(call_id, session, reason, CallTransition::TimedOut, true)
            .await
        {
            Ok(phase) => phase,
            // another exit path won the race
            Err(_) => return,
        };
        drop(sessions);

        self.event_bus.dispatch(&CallEvent::StateChanged {
            call_id: call_id.clone(),
            phase,
        });
        self.event_bus.dispatch(&CallEvent::Ended {
            call_id: call_id.clone(),
            reason,
        });
    }
}

impl std::fmt::Debug for CallService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallService")
            .field("user_id", &self.user_id)
            .finish()
    }
}
