//! End-to-end protocol scenarios: two services, one shared relay and store.

use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::{LocalMedia, MediaError, MediaSource};
use crate::relay::InMemoryRelay;
use crate::service::{CallService, IncomingCallHandler};
use crate::session::ConnectivityState;
use crate::signaling::SignalType;
use crate::state::SessionPhase;
use crate::store::{CallRecordStore, MemoryCallStore};
use crate::types::call::{CallRecord, CallStatus, CallType, HangupReason};
use crate::types::events::{CallEvent, CallEventHandler};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const DRIVER: &str = "driver-1";
const CLIENT: &str = "client-9";
const CONVERSATION: &str = "conv-42";

/// Media layer fake: acquisition can succeed, stall like a permission
/// prompt, or fail. Keeps every handle it hands out so tests can probe
/// whether captures were released.
struct TestMediaSource {
    delay: Option<Duration>,
    deny: bool,
    handles: Mutex<Vec<Arc<LocalMedia>>>,
}

impl TestMediaSource {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            delay: None,
            deny: false,
            handles: Mutex::new(Vec::new()),
        })
    }

    fn denying() -> Arc<Self> {
        Arc::new(Self {
            delay: None,
            deny: true,
            handles: Mutex::new(Vec::new()),
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            deny: false,
            handles: Mutex::new(Vec::new()),
        })
    }

    fn last_handle(&self) -> Option<Arc<LocalMedia>> {
        self.handles.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl MediaSource for TestMediaSource {
    async fn acquire(&self, call_type: CallType) -> Result<Arc<LocalMedia>, MediaError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.deny {
            return Err(MediaError::AccessDenied);
        }
        let media = LocalMedia::new(call_type);
        self.handles.lock().unwrap().push(media.clone());
        Ok(media)
    }
}

/// Queues invitations for the test body to consume.
struct InvitationQueue(mpsc::UnboundedSender<(CallRecord, String)>);

impl IncomingCallHandler for InvitationQueue {
    fn on_incoming(&self, record: &CallRecord, offer_payload: &str) {
        let _ = self.0.send((record.clone(), offer_payload.to_string()));
    }
}

#[derive(Default)]
struct EventLog(Mutex<Vec<CallEvent>>);

impl EventLog {
    fn ended_reasons(&self) -> Vec<HangupReason> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                CallEvent::Ended { reason, .. } => Some(*reason),
                _ => None,
            })
            .collect()
    }

    fn phases(&self) -> Vec<SessionPhase> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                CallEvent::StateChanged { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect()
    }

    fn remote_media_seen(&self) -> bool {
        self.0
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, CallEvent::RemoteMediaAvailable { .. }))
    }
}

impl CallEventHandler for EventLog {
    fn handle_event(&self, event: &CallEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

struct Harness {
    relay: Arc<InMemoryRelay>,
    store: Arc<MemoryCallStore>,
    caller: Arc<CallService>,
    callee: Arc<CallService>,
    caller_media: Arc<TestMediaSource>,
    callee_media: Arc<TestMediaSource>,
    caller_events: Arc<EventLog>,
    callee_events: Arc<EventLog>,
}

impl Harness {
    fn build(
        caller_config: CallConfig,
        caller_media: Arc<TestMediaSource>,
        callee_media: Arc<TestMediaSource>,
    ) -> Self {
        let relay = InMemoryRelay::new();
        let store = Arc::new(MemoryCallStore::new());

        let caller = CallService::new(
            DRIVER,
            caller_config,
            relay.clone(),
            store.clone(),
            caller_media.clone(),
        );
        let callee = CallService::new(
            CLIENT,
            CallConfig::default(),
            relay.clone(),
            store.clone(),
            callee_media.clone(),
        );

        let caller_events = Arc::new(EventLog::default());
        let callee_events = Arc::new(EventLog::default());
        caller.event_bus().add_handler(caller_events.clone());
        callee.event_bus().add_handler(callee_events.clone());

        Self {
            relay,
            store,
            caller,
            callee,
            caller_media,
            callee_media,
            caller_events,
            callee_events,
        }
    }

    fn new() -> Self {
        Self::build(
            CallConfig::default(),
            TestMediaSource::ok(),
            TestMediaSource::ok(),
        )
    }

    /// Register the callee's inbox subscription and return the invitation
    /// queue. The subscription handle must outlive the test body.
    async fn watch_inbox(
        &self,
    ) -> (
        crate::relay::RelaySubscription,
        mpsc::UnboundedReceiver<(CallRecord, String)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self
            .callee
            .subscribe_incoming_calls(Arc::new(InvitationQueue(tx)))
            .await
            .expect("inbox subscription");
        (sub, rx)
    }
}

/// Let spawned signal handlers drain.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn test_full_call_lifecycle() {
    let h = Harness::new();
    let (_inbox, mut invitations) = h.watch_inbox().await;

    let (call_id, caller_media) = h
        .caller
        .initiate_call(CLIENT, CONVERSATION, CallType::Audio)
        .await
        .expect("initiate");
    settle().await;

    // the invitation reached the callee with the offer payload
    let (record, offer_payload) = invitations.try_recv().expect("invitation delivered");
    assert_eq!(record.id, call_id);
    assert_eq!(record.caller_id, DRIVER);
    assert_eq!(record.status, CallStatus::Ringing);
    assert!(offer_payload.contains("offer"));
    assert_eq!(
        h.callee.session_phase(&call_id).await,
        Some(SessionPhase::Ringing)
    );

    let callee_media = h
        .callee
        .answer_call(&call_id, DRIVER, CallType::Audio, &offer_payload)
        .await
        .expect("answer");
    settle().await;

    // both sides are negotiating; the record shows the answer
    assert_eq!(
        h.caller.session_phase(&call_id).await,
        Some(SessionPhase::Connecting)
    );
    assert_eq!(
        h.callee.session_phase(&call_id).await,
        Some(SessionPhase::Connecting)
    );
    let stored = h.store.get_call(&call_id).await.unwrap().unwrap();
    assert_eq!(stored.status, CallStatus::Answered);
    assert!(stored.answered_at.is_some());

    // candidates flow each way exactly once
    h.caller
        .add_local_candidate(&call_id, "path-caller-1")
        .await
        .unwrap();
    h.caller
        .add_local_candidate(&call_id, "path-caller-1")
        .await
        .unwrap();
    h.callee
        .add_local_candidate(&call_id, "path-callee-1")
        .await
        .unwrap();
    settle().await;

    let candidate_signals: Vec<_> = h
        .store
        .signals_for_call(&call_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.signal_type == SignalType::IceCandidate)
        .collect();
    assert_eq!(candidate_signals.len(), 2, "duplicates must not be relayed");
    assert_eq!(h.callee.applied_remote_candidate_count(&call_id).await, 1);
    assert_eq!(h.caller.applied_remote_candidate_count(&call_id).await, 1);

    // first inbound media
    h.caller
        .report_connectivity(&call_id, ConnectivityState::Connected)
        .await
        .unwrap();
    h.callee
        .report_connectivity(&call_id, ConnectivityState::Connected)
        .await
        .unwrap();
    assert_eq!(
        h.caller.session_phase(&call_id).await,
        Some(SessionPhase::Connected)
    );
    assert!(h.caller_events.remote_media_seen());
    assert_eq!(
        h.caller_events.phases(),
        vec![
            SessionPhase::Ringing,
            SessionPhase::Connecting,
            SessionPhase::Connected
        ]
    );

    // callee hangs up; the caller observes it
    h.callee.hangup_call(&call_id, None).await.expect("hangup");
    settle().await;

    assert_eq!(
        h.caller.session_phase(&call_id).await,
        Some(SessionPhase::Ended)
    );
    let stored = h.store.get_call(&call_id).await.unwrap().unwrap();
    assert_eq!(stored.status, CallStatus::Ended);
    assert!(stored.duration_seconds.is_some());

    assert_eq!(h.caller_events.ended_reasons(), vec![HangupReason::Ended]);
    assert!(!caller_media.is_capturing());
    assert!(!callee_media.is_capturing());
    // the handles the services handed back are the ones the sources created
    assert!(!h.caller_media.last_handle().unwrap().is_capturing());
}

#[tokio::test]
async fn test_caller_hangup_wins_over_inflight_answer() {
    let h = Harness::build(
        CallConfig::default(),
        TestMediaSource::ok(),
        // the callee sits on the permission prompt while the caller bails
        TestMediaSource::slow(Duration::from_millis(80)),
    );
    let (_inbox, mut invitations) = h.watch_inbox().await;

    let (call_id, _media) = h
        .caller
        .initiate_call(CLIENT, CONVERSATION, CallType::Audio)
        .await
        .expect("initiate");
    settle().await;
    let (_, offer_payload) = invitations.try_recv().expect("invitation delivered");

    let callee = h.callee.clone();
    let answer_call_id = call_id.clone();
    let answer = tokio::spawn(async move {
        callee
            .answer_call(&answer_call_id, DRIVER, CallType::Audio, &offer_payload)
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    h.caller.hangup_call(&call_id, None).await.expect("hangup");
    settle().await;

    let result = answer.await.expect("join");
    assert!(
        matches!(result, Err(CallError::StaleCall(_))),
        "got {result:?}"
    );

    // the capture acquired mid-race was released, not leaked
    let handle = h.callee_media.last_handle().expect("media was acquired");
    assert!(!handle.is_capturing());

    let stored = h.store.get_call(&call_id).await.unwrap().unwrap();
    assert_eq!(stored.status, CallStatus::Ended);
    assert!(stored.answered_at.is_none());
    assert!(stored.duration_seconds.is_none());
}

#[tokio::test]
async fn test_decline_flow() {
    let h = Harness::new();
    let (_inbox, mut invitations) = h.watch_inbox().await;

    let (call_id, _media) = h
        .caller
        .initiate_call(CLIENT, CONVERSATION, CallType::Video)
        .await
        .expect("initiate");
    settle().await;
    invitations.try_recv().expect("invitation delivered");

    h.callee.decline_call(&call_id).await.expect("decline");
    settle().await;

    assert_eq!(
        h.caller.session_phase(&call_id).await,
        Some(SessionPhase::Declined)
    );
    assert_eq!(
        h.caller_events.ended_reasons(),
        vec![HangupReason::Declined]
    );

    let stored = h.store.get_call(&call_id).await.unwrap().unwrap();
    assert_eq!(stored.status, CallStatus::Declined);
    assert!(stored.answered_at.is_none());

    let hangups: Vec<_> = h
        .store
        .signals_for_call(&call_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.signal_type == SignalType::Hangup)
        .collect();
    assert_eq!(hangups.len(), 1);
    assert_eq!(hangups[0].payload, "declined");
}

#[tokio::test]
async fn test_hangup_is_idempotent() {
    let h = Harness::new();
    let (call_id, _media) = h
        .caller
        .initiate_call(CLIENT, CONVERSATION, CallType::Audio)
        .await
        .expect("initiate");

    h.caller.hangup_call(&call_id, None).await.expect("hangup");
    h.caller
        .hangup_call(&call_id, None)
        .await
        .expect("second hangup is a no-op");
    settle().await;

    assert_eq!(h.caller_events.ended_reasons(), vec![HangupReason::Ended]);

    let hangups = h
        .store
        .signals_for_call(&call_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.signal_type == SignalType::Hangup)
        .count();
    assert_eq!(hangups, 1);
}

#[tokio::test]
async fn test_media_denied_aborts_before_any_record() {
    let h = Harness::build(
        CallConfig::default(),
        TestMediaSource::denying(),
        TestMediaSource::ok(),
    );

    let result = h
        .caller
        .initiate_call(CLIENT, CONVERSATION, CallType::Audio)
        .await;
    assert!(matches!(result, Err(CallError::MediaAccessDenied)));

    assert!(h.store.calls_for_user(DRIVER).await.unwrap().is_empty());
    assert!(!h.caller.has_active_call().await);
}

#[tokio::test]
async fn test_second_call_fails_fast() {
    let h = Harness::new();
    let (_call_id, _media) = h
        .caller
        .initiate_call(CLIENT, CONVERSATION, CallType::Audio)
        .await
        .expect("initiate");

    let result = h
        .caller
        .initiate_call("someone-else", CONVERSATION, CallType::Audio)
        .await;
    assert!(matches!(result, Err(CallError::CallInProgress)));
}

#[tokio::test]
async fn test_busy_callee_refuses_distinctly() {
    let h = Harness::new();
    let (_inbox, mut invitations) = h.watch_inbox().await;

    // first call is ringing at the callee
    let (first_id, _media) = h
        .caller
        .initiate_call(CLIENT, CONVERSATION, CallType::Audio)
        .await
        .expect("initiate");
    settle().await;
    invitations.try_recv().expect("invitation delivered");

    // a second caller on the same relay and store
    let broker_media = TestMediaSource::ok();
    let broker = CallService::new(
        "broker-5",
        CallConfig::default(),
        h.relay.clone(),
        h.store.clone(),
        broker_media.clone(),
    );
    let broker_events = Arc::new(EventLog::default());
    broker.event_bus().add_handler(broker_events.clone());

    let (second_id, _broker_handle) = broker
        .initiate_call(CLIENT, "conv-77", CallType::Audio)
        .await
        .expect("initiate");
    settle().await;

    // the broker's call was refused as busy, not as a user decline
    assert_eq!(
        broker.session_phase(&second_id).await,
        Some(SessionPhase::Declined)
    );
    assert_eq!(broker_events.ended_reasons(), vec![HangupReason::Busy]);
    let stored = h.store.get_call(&second_id).await.unwrap().unwrap();
    assert_eq!(stored.status, CallStatus::Declined);

    // the first call is untouched and still ringing
    assert_eq!(
        h.callee.session_phase(&first_id).await,
        Some(SessionPhase::Ringing)
    );
    // no second invitation reached the callee's UI
    assert!(invitations.try_recv().is_err());
}

#[tokio::test]
async fn test_ring_timeout_marks_missed() {
    let h = Harness::build(
        CallConfig {
            ring_timeout: Some(Duration::from_millis(50)),
            ..CallConfig::default()
        },
        TestMediaSource::ok(),
        TestMediaSource::ok(),
    );
    let (_inbox, mut invitations) = h.watch_inbox().await;

    let (call_id, media) = h
        .caller
        .initiate_call(CLIENT, CONVERSATION, CallType::Audio)
        .await
        .expect("initiate");
    settle().await;
    invitations.try_recv().expect("invitation delivered");

    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(
        h.caller.session_phase(&call_id).await,
        Some(SessionPhase::Missed)
    );
    // the hangup told the callee to stop ringing too
    assert_eq!(
        h.callee.session_phase(&call_id).await,
        Some(SessionPhase::Missed)
    );
    assert_eq!(h.caller_events.ended_reasons(), vec![HangupReason::Missed]);

    let stored = h.store.get_call(&call_id).await.unwrap().unwrap();
    assert_eq!(stored.status, CallStatus::Missed);
    assert!(stored.answered_at.is_none());
    assert!(!media.is_capturing());
}

#[tokio::test]
async fn test_early_candidates_are_replayed_on_answer() {
    let h = Harness::new();
    let (_inbox, mut invitations) = h.watch_inbox().await;

    let (call_id, _media) = h
        .caller
        .initiate_call(CLIENT, CONVERSATION, CallType::Audio)
        .await
        .expect("initiate");
    settle().await;
    let (_, offer_payload) = invitations.try_recv().expect("invitation delivered");

    // candidates reach the callee while it is still deciding whether to
    // answer; no peer session exists yet on that side
    h.caller
        .add_local_candidate(&call_id, "path-a")
        .await
        .unwrap();
    h.caller
        .add_local_candidate(&call_id, "path-b")
        .await
        .unwrap();
    settle().await;
    assert_eq!(h.callee.applied_remote_candidate_count(&call_id).await, 0);

    h.callee
        .answer_call(&call_id, DRIVER, CallType::Audio, &offer_payload)
        .await
        .expect("answer");

    assert_eq!(h.callee.applied_remote_candidate_count(&call_id).await, 2);
}

#[tokio::test]
async fn test_connection_loss_ends_call_with_distinct_reason() {
    let h = Harness::new();
    let (_inbox, mut invitations) = h.watch_inbox().await;

    let (call_id, caller_media) = h
        .caller
        .initiate_call(CLIENT, CONVERSATION, CallType::Audio)
        .await
        .expect("initiate");
    settle().await;
    let (_, offer_payload) = invitations.try_recv().expect("invitation delivered");

    let callee_media = h
        .callee
        .answer_call(&call_id, DRIVER, CallType::Audio, &offer_payload)
        .await
        .expect("answer");
    settle().await;

    h.caller
        .report_connectivity(&call_id, ConnectivityState::Connected)
        .await
        .unwrap();
    h.callee
        .report_connectivity(&call_id, ConnectivityState::Connected)
        .await
        .unwrap();

    // the transport drops mid-call on the caller's side
    h.caller
        .report_connectivity(&call_id, ConnectivityState::Failed)
        .await
        .unwrap();
    settle().await;

    assert_eq!(
        h.caller.session_phase(&call_id).await,
        Some(SessionPhase::Ended)
    );
    assert_eq!(
        h.callee.session_phase(&call_id).await,
        Some(SessionPhase::Ended)
    );
    // distinguishable from an intentional hangup on both sides
    assert_eq!(
        h.caller_events.ended_reasons(),
        vec![HangupReason::ConnectionLost]
    );
    assert_eq!(
        h.callee_events.ended_reasons(),
        vec![HangupReason::ConnectionLost]
    );

    let stored = h.store.get_call(&call_id).await.unwrap().unwrap();
    assert_eq!(stored.status, CallStatus::Ended);
    assert!(stored.duration_seconds.is_some());
    assert!(!caller_media.is_capturing());
    assert!(!callee_media.is_capturing());
}

#[tokio::test]
async fn test_toggle_mute_and_video_are_local_only() {
    let h = Harness::new();
    let (call_id, media) = h
        .caller
        .initiate_call(CLIENT, CONVERSATION, CallType::Video)
        .await
        .expect("initiate");
    let signals_before = h.store.signals_for_call(&call_id).await.unwrap().len();

    assert!(h.caller.toggle_mute(&call_id).await.unwrap());
    assert!(!h.caller.toggle_mute(&call_id).await.unwrap());
    assert!(!media.is_muted());

    assert!(h.caller.toggle_video(&call_id).await.unwrap());
    assert!(media.is_video_off());

    // pure local state: nothing went over the relay or into the store
    let signals_after = h.store.signals_for_call(&call_id).await.unwrap().len();
    assert_eq!(signals_before, signals_after);

    h.caller.hangup_call(&call_id, None).await.unwrap();
    assert!(matches!(
        h.caller.toggle_mute(&call_id).await,
        Err(CallError::StaleCall(_))
    ));
}

#[tokio::test]
async fn test_stale_signals_after_end_are_ignored() {
    let h = Harness::new();
    let (_inbox, mut invitations) = h.watch_inbox().await;

    let (call_id, _media) = h
        .caller
        .initiate_call(CLIENT, CONVERSATION, CallType::Audio)
        .await
        .expect("initiate");
    settle().await;
    invitations.try_recv().expect("invitation delivered");

    h.caller.hangup_call(&call_id, None).await.unwrap();
    settle().await;

    // candidates for the dead call are dropped without error on both sides
    h.caller
        .add_local_candidate(&call_id, "path-late")
        .await
        .expect("late candidate is a silent no-op");
    // a decline racing the hangup finds the call already terminal
    h.callee
        .decline_call(&call_id)
        .await
        .expect("late decline is a no-op");
    settle().await;

    let stored = h.store.get_call(&call_id).await.unwrap().unwrap();
    assert_eq!(stored.status, CallStatus::Ended, "terminal state is stable");
    assert_eq!(h.caller_events.ended_reasons(), vec![HangupReason::Ended]);
}
