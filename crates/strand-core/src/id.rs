//! Message and channel id generation.
//!
//! Ids are a per-process random base followed by a 12 hex digit counter.
//! Uniqueness across peers comes from the base, not the counter.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Length of the random base prefix in hex characters
pub const BASE_LEN: usize = 24;

/// Largest counter value before wrapping back to zero
pub const COUNTER_MAX: u64 = 0xFFFF_FFFF_FFFF;

/// Fast local id generator
#[derive(Debug)]
pub struct IdGenerator {
    base: String,
    counter: AtomicU64,
}

impl IdGenerator {
    /// Create a generator with a fresh random base
    pub fn new() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self::with_base(&uuid[..BASE_LEN])
    }

    /// Create a generator with a fixed base
    pub fn with_base(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Produce the next id
    pub fn next_id(&self) -> String {
        let counter = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(if current >= COUNTER_MAX { 0 } else { current + 1 })
            })
            .unwrap_or_default();

        format!("{}{:012x}", self.base, counter)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
