//! UI-facing call events.
//!
//! The presentation layer never polls the service; it registers an
//! [`CallEventHandler`] and reacts to dispatched [`CallEvent`]s. Errors that
//! happen after a call is already connecting/connected have no synchronous
//! caller to return to, so they surface here as `Ended { reason }`.

use crate::state::SessionPhase;
use crate::types::call::{CallId, CallRecord, HangupReason};
use serde::Serialize;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Serialize)]
pub enum CallEvent {
    /// A new invitation addressed to the local user, with the offer payload
    /// needed to answer it.
    IncomingCall {
        record: CallRecord,
        offer_payload: String,
    },
    /// The session phase moved along the transition table.
    StateChanged {
        call_id: CallId,
        phase: SessionPhase,
    },
    /// First inbound media observed; the platform layer can attach the
    /// remote stream to the UI.
    RemoteMediaAvailable { call_id: CallId },
    /// The call reached a terminal state. `connection-lost` and `declined`
    /// are distinguishable from an intentional hangup here.
    Ended {
        call_id: CallId,
        reason: HangupReason,
    },
}

pub trait CallEventHandler: Send + Sync {
    fn handle_event(&self, event: &CallEvent);
}

/// Fan-out of call events to registered handlers.
#[derive(Default, Clone)]
pub struct CallEventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn CallEventHandler>>>>,
}

impl CallEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn CallEventHandler>) {
        self.handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push(handler);
    }

    pub fn has_handlers(&self) -> bool {
        !self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .is_empty()
    }

    pub fn dispatch(&self, event: &CallEvent) {
        for handler in self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
        {
            handler.handle_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<String>>);

    impl CallEventHandler for Recorder {
        fn handle_event(&self, event: &CallEvent) {
            let label = match event {
                CallEvent::IncomingCall { .. } => "incoming",
                CallEvent::StateChanged { phase, .. } => phase.as_str(),
                CallEvent::RemoteMediaAvailable { .. } => "media",
                CallEvent::Ended { .. } => "ended",
            };
            self.0.lock().unwrap().push(label.to_string());
        }
    }

    #[test]
    fn test_dispatch_reaches_all_handlers() {
        let bus = CallEventBus::new();
        assert!(!bus.has_handlers());

        let a = Arc::new(Recorder(Mutex::new(Vec::new())));
        let b = Arc::new(Recorder(Mutex::new(Vec::new())));
        bus.add_handler(a.clone());
        bus.add_handler(b.clone());
        assert!(bus.has_handlers());

        bus.dispatch(&CallEvent::StateChanged {
            call_id: CallId::new("call-1"),
            phase: SessionPhase::Connecting,
        });

        assert_eq!(*a.0.lock().unwrap(), vec!["connecting"]);
        assert_eq!(*b.0.lock().unwrap(), vec!["connecting"]);
    }
}
