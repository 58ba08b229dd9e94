//! User and operator quota policies, read-only to the budget engine.

pub mod cycle;

use serde::{Deserialize, Serialize};

pub use cycle::{current_window, current_window_at, CyclePeriod, CycleWindow, RecurrenceRule};

/// State of a policy's warning or limit threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Threshold {
    /// No threshold configured.
    Disabled,
    /// Acknowledged by the user and suppressed until the next cycle.
    Snoozed,
    /// Active threshold in bytes.
    Bytes(u64),
}

impl Threshold {
    /// Bytes of an active threshold; `None` when disabled or snoozed.
    pub fn usable(&self) -> Option<u64> {
        match self {
            Threshold::Bytes(bytes) => Some(*bytes),
            Threshold::Disabled | Threshold::Snoozed => None,
        }
    }
}

/// A monthly (or other recurring) cap for one subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    #[serde(default)]
    pub subscriber_id: Option<String>,
    pub cycle: RecurrenceRule,
    pub warning: Threshold,
    pub limit: Threshold,
    #[serde(default = "default_metered")]
    pub metered: bool,
}

fn default_metered() -> bool {
    true
}

impl QuotaPolicy {
    /// The threshold that bounds opportunistic use: the limit when active,
    /// otherwise the warning when active.
    pub fn effective_threshold(&self) -> Option<u64> {
        self.limit.usable().or_else(|| self.warning.usable())
    }

    /// Whether this policy applies to `subscriber_id` and `metered`.
    pub fn applies_to(&self, subscriber_id: Option<&str>, metered: bool) -> bool {
        self.metered == metered
            && match (&self.subscriber_id, subscriber_id) {
                (None, _) => true,
                (Some(own), Some(other)) => own == other,
                (Some(_), None) => false,
            }
    }
}
