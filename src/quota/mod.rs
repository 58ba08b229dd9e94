//! Opportunistic quota tracking: resolution, budgeting, and the single
//! armed usage threshold.

pub mod budget;
pub mod events;
pub mod metrics;
pub mod monitor;
pub mod resolver;
pub mod tracker;

pub use budget::{daily_budget, daily_remaining, OPPORTUNISTIC_FRACTION};
pub use events::{ArmToken, EventSink, ThresholdNotifier, TrackerEvent};
pub use metrics::{MetricsSnapshot, TrackerMetrics};
pub use monitor::{ArmedThreshold, UsageMonitor};
pub use resolver::{QuotaSource, QuotaSourceResolver, ResolveStep, PRECEDENCE};
pub use tracker::{
    MultipathPreference, QuotaTracker, QuotaTrackerBuilder, TrackerPhase, TrackerSnapshot,
};
