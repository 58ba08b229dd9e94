//! Daily budget engine for opportunistic use of a metered secondary network.
//!
//! The engine picks the most authoritative quota figure for the tracked
//! network, turns it into today's remaining allowance, and keeps exactly one
//! usage-threshold registration armed for it. Everything outside that loop
//! (usage statistics, policy storage, settings, the network stack) is
//! reached through the collaborator traits in [`providers`].

pub mod clock;
pub mod config;
pub mod error;
pub mod network;
pub mod policy;
pub mod providers;
pub mod quota;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{BudgetConfig, ConfigWatcher, FileResourceConfig, TrackerConfig};
pub use error::{BudgetError, Result};
pub use network::{NetworkCapabilities, NetworkId, NetworkRequest, TrackedNetwork, TransportKind};
pub use policy::{CyclePeriod, QuotaPolicy, RecurrenceRule, Threshold};
pub use quota::{
    ArmedThreshold, EventSink, MultipathPreference, QuotaSource, QuotaTracker, TrackerPhase,
    TrackerSnapshot,
};
