//! Call signaling and session lifecycle core for the Loadline marketplace.
//!
//! Establishes live two-party audio/video sessions between marketplace
//! participants over a signaling relay that guarantees nothing beyond
//! "eventually delivered, roughly once."
//!
//! # Architecture
//!
//! - [`CallService`]: orchestrates everything; the only component the UI
//!   layer talks to
//! - [`SessionPhase`] & [`CallTransition`]: the call-attempt state machine
//! - [`PeerSession`]: media capture + description/candidate exchange for one
//!   call
//! - [`MessageRelay`]: the publish/subscribe primitive shared with the rest
//!   of the product
//! - [`CallRecordStore`]: persisted call records and signal rows
//! - [`CallEventBus`]: state-change notification toward the UI
//!
//! # Protocol overview
//!
//! Each call attempt gets its own relay channel. The caller publishes an
//! `offer`, the callee replies with an `answer`, both sides exchange
//! `ice-candidate` messages until a direct path works, and either side ends
//! the attempt with a single effective `hangup` carrying a reason. An inbox
//! channel per user carries new-call invitations.

pub mod config;
pub mod error;
pub mod media;
pub mod relay;
pub mod service;
pub mod session;
pub mod signaling;
pub mod state;
pub mod store;
pub mod types;

#[cfg(test)]
mod protocol_tests;

pub use config::CallConfig;
pub use error::CallError;
pub use media::{LocalMedia, MediaError, MediaSource};
pub use relay::{InMemoryRelay, MessageRelay, RelaySubscription};
pub use service::{CallService, IncomingCallHandler};
pub use session::{ConnectivityState, PeerSession, SessionDescription};
pub use signaling::{SignalMessage, SignalType};
pub use state::{CallTransition, InvalidTransition, SessionPhase};
pub use store::{CallRecordStore, MemoryCallStore, StoreError};
pub use types::call::{CallId, CallRecord, CallStatus, CallType, HangupReason, UserId};
pub use types::events::{CallEvent, CallEventBus, CallEventHandler};
