//! Configuration for the call service.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long an unanswered call rings before it is marked missed.
    /// `None` disables the timeout entirely.
    pub ring_timeout: Option<Duration>,

    /// Public discovery endpoints used to find reachable network paths
    /// between peers. This list carries no guaranteed-reachable relay of
    /// last resort, so peers on restrictive networks may fail to connect;
    /// that failure surfaces as reason `connection-lost`.
    pub discovery_endpoints: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: None,
            discovery_endpoints: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        }
    }
}
