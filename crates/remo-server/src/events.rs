//! Bounded ring of recent request events, the contract surface for the
//! operator dashboard. Oldest entries are overwritten when the ring fills.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default ring capacity.
pub const DEFAULT_CAPACITY: usize = 100;

/// One completed public request, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEvent {
    pub time: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: u64,
    pub remote: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

pub struct EventRing {
    events: Mutex<VecDeque<RequestEvent>>,
    capacity: usize,
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, event: RequestEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Copy of the ring, oldest first.
    pub fn snapshot(&self) -> Vec<RequestEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for EventRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
