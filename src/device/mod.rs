pub mod client;
pub mod worker;

use std::time::Duration;

use tokio::time::Instant;

/// Which fields of a `/report` read were filled in from defaults instead of
/// coming from the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fallbacks {
    pub relay: bool,
    pub power: bool,
}

impl Fallbacks {
    pub fn any(&self) -> bool {
        self.relay || self.power
    }
}

/// Result of a single `/report` read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusReport {
    pub relay_state: bool,
    pub power_watts: f64,
    pub fallbacks: Fallbacks,
}

/// Normalized snapshot of the plug, shared between the device side and the
/// bridge. Never mutated after construction; the bridge swaps whole values.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    /// true = closed/energized
    pub relay_state: bool,
    /// None when the power reading failed.
    pub power_watts: Option<f64>,
    pub temperature_celsius: Option<f64>,
    pub last_updated: Instant,
    /// Fields produced by a fallback rather than a real reading. These are
    /// never published.
    pub fallbacks: Fallbacks,
}

impl DeviceStatus {
    pub fn new(
        report: Option<StatusReport>,
        temperature_celsius: Option<f64>,
        previous_relay: Option<bool>,
    ) -> Self {
        match report {
            Some(report) => Self {
                relay_state: report.relay_state,
                power_watts: Some(report.power_watts),
                temperature_celsius,
                last_updated: Instant::now(),
                fallbacks: report.fallbacks,
            },
            None => Self {
                relay_state: previous_relay.unwrap_or(false),
                power_watts: None,
                temperature_celsius,
                last_updated: Instant::now(),
                fallbacks: Fallbacks {
                    relay: true,
                    power: true,
                },
            },
        }
    }

    /// Copy of this snapshot with a relay state confirmed by a command.
    pub fn with_relay(&self, relay_state: bool) -> Self {
        Self {
            relay_state,
            last_updated: Instant::now(),
            fallbacks: Fallbacks {
                relay: false,
                ..self.fallbacks
            },
            ..self.clone()
        }
    }

    /// Copy of this snapshot that keeps `cached`'s relay state, for a reading
    /// that a command has since superseded.
    pub fn with_relay_of(&self, cached: &DeviceStatus) -> Self {
        Self {
            relay_state: cached.relay_state,
            fallbacks: Fallbacks {
                relay: cached.fallbacks.relay,
                ..self.fallbacks
            },
            ..self.clone()
        }
    }

    /// Power value worth publishing, if any.
    pub fn publishable_power(&self) -> Option<f64> {
        self.power_watts.filter(|_| !self.fallbacks.power)
    }

    /// Relay state worth publishing, if any.
    pub fn publishable_relay(&self) -> Option<bool> {
        (!self.fallbacks.relay).then_some(self.relay_state)
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.last_updated.elapsed() > max_age
    }
}

/// Text used for the relay on the broker: `true` is "open", `false` is "close".
pub fn relay_text(relay_state: bool) -> &'static str {
    if relay_state { "open" } else { "close" }
}
