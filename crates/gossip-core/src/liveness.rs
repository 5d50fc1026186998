//! Per-connection liveness state machine.
//!
//! Each connection is probed on a fixed interval. Consecutive failures move it
//! through `Alive → Suspect → … → Dead`:
//! 1. A successful probe resets the failure counter to 0 (state `Alive`)
//! 2. A failed or timed-out probe increments the counter (state `Suspect`)
//! 3. Reaching `failure_threshold` consecutive failures marks it `Dead`
//!
//! `Dead` is terminal. The caller owns the probe loop and acts on the emitted
//! [`LivenessEvent`]s (dead-node reports, removal from the active set).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of consecutive failures before a connection is dead.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Configuration for liveness probing.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// How often to probe each connection (default: 13s)
    pub probe_interval: Duration,
    /// How long one probe may take before counting as a failure (default: 2s)
    pub probe_timeout: Duration,
    /// Consecutive failures before declaring the peer dead (default: 3)
    pub failure_threshold: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(13),
            probe_timeout: Duration::from_secs(2),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// Liveness of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LivenessState {
    /// Last probe succeeded (or none has run yet)
    Alive,
    /// At least one, but fewer than `failure_threshold`, consecutive failures
    Suspect,
    /// Threshold reached; never leaves this state
    Dead,
}

/// Result of one probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failure,
    /// No answer within the probe timeout. Counts as a failure.
    Timeout,
}

impl From<bool> for ProbeOutcome {
    fn from(ok: bool) -> Self {
        if ok {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

/// Event emitted when a probe outcome changes something worth acting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// A failure below the threshold
    Failed { consecutive: u32 },
    /// A success after one or more failures
    Recovered { previous_failures: u32 },
    /// The threshold was reached on this probe
    Died { consecutive: u32 },
}

/// Consecutive-failure tracker for one connection.
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    threshold: u32,
    failures: u32,
    state: LivenessState,
}

impl LivenessTracker {
    /// Create a tracker. A threshold of 0 is treated as 1.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            threshold: failure_threshold.max(1),
            failures: 0,
            state: LivenessState::Alive,
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    /// Current consecutive-failure count.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_dead(&self) -> bool {
        self.state == LivenessState::Dead
    }

    /// Feed one probe outcome.
    ///
    /// Returns `None` for a success on a healthy connection and for any
    /// outcome after the connection is already dead.
    pub fn record(&mut self, outcome: ProbeOutcome) -> Option<LivenessEvent> {
        if self.is_dead() {
            return None;
        }

        match outcome {
            ProbeOutcome::Success => {
                let previous_failures = std::mem::take(&mut self.failures);
                self.state = LivenessState::Alive;
                (previous_failures > 0).then_some(LivenessEvent::Recovered { previous_failures })
            }
            ProbeOutcome::Failure | ProbeOutcome::Timeout => {
                self.failures += 1;
                if self.failures >= self.threshold {
                    self.state = LivenessState::Dead;
                    Some(LivenessEvent::Died {
                        consecutive: self.failures,
                    })
                } else {
                    self.state = LivenessState::Suspect;
                    Some(LivenessEvent::Failed {
                        consecutive: self.failures,
                    })
                }
            }
        }
    }
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}
