//! Persistence layer for call records and signal messages.
//!
//! The storage engine itself is external; this crate only defines the traits
//! it consumes and the schema it expects:
//!
//! - `calls(id, caller_id, callee_id, conversation_id, call_type, status,
//!   started_at, answered_at, ended_at, duration)`
//! - `call_signals(id, call_id, from_user_id, to_user_id, signal_type,
//!   signal_data, created_at)`
//!
//! Records are append-on-create and update-on-transition; signal rows are
//! append-only audit data and never mutated.

use crate::signaling::{SignalMessage, SignalType};
use crate::types::call::{CallId, CallRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait CallRecordStore: Send + Sync {
    /// Insert a freshly created record.
    async fn create_call(&self, record: &CallRecord) -> Result<()>;

    /// Persist a status transition. Fails with `NotFound` for unknown ids.
    async fn update_call(&self, record: &CallRecord) -> Result<()>;

    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>>;

    /// Call history for one user (as caller or callee), newest first.
    async fn calls_for_user(&self, user_id: &str) -> Result<Vec<CallRecord>>;

    /// Append one signal row.
    async fn append_signal(&self, signal: &SignalMessage) -> Result<()>;

    /// All signal rows for a call, in append order.
    async fn signals_for_call(&self, call_id: &CallId) -> Result<Vec<SignalMessage>>;

    /// The offer row for a call, if it was ever stored.
    async fn offer_for_call(&self, call_id: &CallId) -> Result<Option<SignalMessage>> {
        let signals = self.signals_for_call(call_id).await?;
        Ok(signals
            .into_iter()
            .find(|s| s.signal_type == SignalType::Offer))
    }
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryCallStore {
    calls: Mutex<HashMap<CallId, CallRecord>>,
    signals: Mutex<Vec<SignalMessage>>,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallRecordStore for MemoryCallStore {
    async fn create_call(&self, record: &CallRecord) -> Result<()> {
        self.calls
            .lock()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_call(&self, record: &CallRecord) -> Result<()> {
        let mut calls = self.calls.lock().await;
        if !calls.contains_key(&record.id) {
            return Err(StoreError::NotFound(record.id.to_string()));
        }
        calls.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>> {
        Ok(self.calls.lock().await.get(call_id).cloned())
    }

    async fn calls_for_user(&self, user_id: &str) -> Result<Vec<CallRecord>> {
        let mut records: Vec<CallRecord> = self
            .calls
            .lock()
            .await
            .values()
            .filter(|r| r.caller_id == user_id || r.callee_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }

    async fn append_signal(&self, signal: &SignalMessage) -> Result<()> {
        self.signals.lock().await.push(signal.clone());
        Ok(())
    }

    async fn signals_for_call(&self, call_id: &CallId) -> Result<Vec<SignalMessage>> {
        Ok(self
            .signals
            .lock()
            .await
            .iter()
            .filter(|s| &s.call_id == call_id)
            .cloned()
            .collect())
    }
}
