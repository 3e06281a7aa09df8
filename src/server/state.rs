//! Server state.

use std::time::{Duration, Instant};

use crate::batch::BatchOrchestrator;

/// Application state shared across handlers
pub struct AppState {
    /// The gateway
    pub gateway: BatchOrchestrator,
    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    /// Wrap a gateway
    pub fn new(gateway: BatchOrchestrator) -> Self {
        Self {
            gateway,
            start_time: Instant::now(),
        }
    }

    /// Get server uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}
