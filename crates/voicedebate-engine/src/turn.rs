//! End-of-turn detection from provider activity reports.

use std::time::Duration;
use tracing::info;

/// Decides when a listening phase is over.
///
/// Fires once per phase, the first time the provider reports the speaker as
/// silent for at least `threshold`. A phase with no speech at all still ends
/// this way; the empty transcript is handled downstream.
#[derive(Debug, Clone)]
pub struct TurnEndpointer {
    threshold: Duration,
    fired: bool,
}

impl TurnEndpointer {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            fired: false,
        }
    }

    /// Observe one event's activity fields. Returns true exactly once per phase.
    pub fn observe(&mut self, is_speaking: bool, silence: Duration) -> bool {
        if self.fired || is_speaking || silence < self.threshold {
            return false;
        }
        self.fired = true;
        info!("✅ {:?} of silence, ending turn", silence);
        true
    }

    /// Arm for a new listening phase.
    pub fn reset(&mut self) {
        self.fired = false;
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }
}
