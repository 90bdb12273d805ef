//! Per-peer load state.
//!
//! Counters and a latency EWMA that weight subsequent selections. Updates
//! replace the whole map behind an `Arc` swap, so readers always see a
//! consistent snapshot, never a half-applied update.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use agora_primitives::{PeerId, unix_ms};

/// Cap on `total_requests`, against counter overflow on long-lived peers.
pub const MAX_TRACKED_REQUESTS: u64 = 1_000_000;

const EWMA_KEEP: f64 = 0.8;
const EWMA_SAMPLE: f64 = 0.2;

/// One peer's load counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentLoadState {
    /// Requests currently in flight; never negative.
    pub active_requests: u32,
    /// Lifetime requests, capped at [`MAX_TRACKED_REQUESTS`].
    pub total_requests: u64,
    /// Lifetime failures; at most `total_requests`.
    pub total_errors: u64,
    /// Latency EWMA in milliseconds (`0.8 * prev + 0.2 * sample`).
    pub average_latency: f64,
    /// When this peer was last selected, unix-ms.
    pub last_request_time: u64,
    /// `(total_requests - total_errors) / total_requests`.
    pub success_rate: f64,
}

impl Default for AgentLoadState {
    fn default() -> Self {
        Self {
            active_requests: 0,
            total_requests: 0,
            total_errors: 0,
            average_latency: 0.0,
            last_request_time: 0,
            success_rate: 1.0,
        }
    }
}

/// Process-wide load map with snapshot-replace semantics.
#[derive(Default)]
pub struct LoadTracker {
    map: RwLock<Arc<HashMap<PeerId, AgentLoadState>>>,
}

impl LoadTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// A consistent snapshot of every peer's state.
    pub fn snapshot(&self) -> Arc<HashMap<PeerId, AgentLoadState>> {
        Arc::clone(&self.map.read())
    }

    /// One peer's state (default when untracked).
    pub fn get(&self, peer: &PeerId) -> AgentLoadState {
        self.map.read().get(peer).copied().unwrap_or_default()
    }

    fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut HashMap<PeerId, AgentLoadState>),
    {
        let mut guard = self.map.write();
        let mut next: HashMap<PeerId, AgentLoadState> = (**guard).clone();
        mutate(&mut next);
        *guard = Arc::new(next);
    }

    /// Mark `peers` as selected: bump active and total counts, stamp the
    /// selection time.
    pub fn begin_request(&self, peers: &[PeerId]) {
        let now = unix_ms();
        self.update(|map| {
            for peer in peers {
                let state = map.entry(*peer).or_default();
                state.active_requests += 1;
                state.total_requests = (state.total_requests + 1).min(MAX_TRACKED_REQUESTS);
                state.last_request_time = now;
            }
        });
    }

    /// Fold one response into the peer's EWMA and error counters.
    pub fn record_response(&self, peer: PeerId, latency_ms: f64, success: bool) {
        self.update(|map| {
            let state = map.entry(peer).or_default();
            state.average_latency = if state.average_latency == 0.0 {
                latency_ms
            } else {
                EWMA_KEEP * state.average_latency + EWMA_SAMPLE * latency_ms
            };
            if !success {
                state.total_errors = (state.total_errors + 1).min(state.total_requests);
            }
            if state.total_requests > 0 {
                state.success_rate = (state.total_requests - state.total_errors) as f64
                    / state.total_requests as f64;
            }
        });
    }

    /// Release the active slots taken by [`begin_request`](Self::begin_request).
    ///
    /// Runs on every orchestration exit path; floored at zero.
    pub fn finalize(&self, peers: &[PeerId]) {
        self.update(|map| {
            for peer in peers {
                if let Some(state) = map.get_mut(peer) {
                    state.active_requests = state.active_requests.saturating_sub(1);
                }
            }
        });
    }

    /// Drop all state.
    pub fn reset(&self) {
        *self.map.write() = Arc::new(HashMap::new());
    }
}
