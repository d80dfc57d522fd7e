//! Socket configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use strand_core::event::STREAM;
use strand_core::DEFAULT_WINDOW;

/// When a receiver re-advertises its inbound window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplenishPolicy {
    /// Only while receiving `STREAM` events, so a capacity update never
    /// lands on a conversation that is about to close
    #[default]
    StreamOnly,
    /// On any application event once the window runs low
    Always,
}

impl ReplenishPolicy {
    /// Whether receiving an event named `name` may trigger a capacity update
    pub fn applies_to(&self, name: &str) -> bool {
        match self {
            ReplenishPolicy::StreamOnly => name == STREAM,
            ReplenishPolicy::Always => true,
        }
    }
}

/// Per-socket channel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Inbound window advertised by every channel
    pub window: usize,
    /// Channel-owned heartbeat interval (None = heartbeats left to middleware)
    pub heartbeat: Option<Duration>,
    /// Capacity re-advertisement policy
    pub replenish: ReplenishPolicy,
}

impl SocketConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the inbound window size
    pub fn window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Give every channel its own heartbeat with the given interval
    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = Some(interval);
        self
    }

    /// Set the capacity re-advertisement policy
    pub fn replenish(mut self, policy: ReplenishPolicy) -> Self {
        self.replenish = policy;
        self
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            heartbeat: None,
            replenish: ReplenishPolicy::StreamOnly,
        }
    }
}
