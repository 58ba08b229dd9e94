//! `multipath-budget simulate` handler.
//!
//! Wires in-memory collaborators from a scenario file, starts a tracker,
//! delivers a qualifying capability event and then any scripted steps,
//! printing the tracker state after each one.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Deserialize;

use multipath_budget::clock::start_of_day;
use multipath_budget::network::{NetworkCapabilities, NetworkId};
use multipath_budget::providers::memory::{
    MemoryNetworkEvents, MemoryPolicyStore, MemorySettings, MemorySubscriptionQuota,
    MemoryUsageStats, StaticResourceConfig,
};
use multipath_budget::{BudgetConfig, FixedClock, QuotaPolicy, QuotaTracker, TrackerSnapshot};

fn default_network() -> NetworkId {
    NetworkId(100)
}

fn default_capabilities() -> NetworkCapabilities {
    NetworkCapabilities::cellular("SIM_IMSI")
}

/// Scenario file contents.
#[derive(Debug, Deserialize)]
pub(crate) struct Scenario {
    pub now: DateTime<FixedOffset>,
    #[serde(default = "default_network")]
    pub network: NetworkId,
    #[serde(default = "default_capabilities")]
    pub capabilities: NetworkCapabilities,
    #[serde(default)]
    pub subscription_quota: Option<u64>,
    #[serde(default)]
    pub policies: Vec<QuotaPolicy>,
    /// Bytes used since local midnight.
    #[serde(default)]
    pub usage_today: u64,
    /// Bytes reported for any other window (policy cycles).
    #[serde(default)]
    pub cycle_usage: u64,
    #[serde(default)]
    pub global_default: Option<i64>,
    /// Overrides the configured resource default.
    #[serde(default)]
    pub resource_default: Option<u64>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A scripted change applied after the initial capability event.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Step {
    /// Change the global default and notify settings observers.
    GlobalDefault { bytes: Option<i64> },
    /// Change the resource default and notify configuration observers.
    ResourceDefault { bytes: u64 },
    /// Change the subscription quota without notifying anyone.
    SubscriptionQuota { bytes: Option<u64> },
    /// Change today's usage without notifying anyone.
    UsageToday { bytes: u64 },
    /// Fire the currently armed threshold.
    ThresholdReached,
    /// Deliver new capabilities for the scenario network.
    Capabilities { capabilities: NetworkCapabilities },
    NetworkLost,
}

impl Step {
    fn label(&self) -> String {
        match self {
            Step::GlobalDefault { bytes } => format!("global default -> {bytes:?}"),
            Step::ResourceDefault { bytes } => format!("resource default -> {bytes}"),
            Step::SubscriptionQuota { bytes } => format!("subscription quota -> {bytes:?}"),
            Step::UsageToday { bytes } => format!("usage today -> {bytes}"),
            Step::ThresholdReached => "threshold reached".to_string(),
            Step::Capabilities { capabilities } => {
                format!("capabilities (roaming {})", capabilities.roaming)
            }
            Step::NetworkLost => "network lost".to_string(),
        }
    }
}

/// Handle `multipath-budget simulate`.
pub(crate) async fn cmd_simulate(path: &Path, config: &BudgetConfig) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read scenario {}", path.display()))?;
    let scenario: Scenario = serde_json::from_str(&raw)
        .with_context(|| format!("invalid scenario {}", path.display()))?;

    for (label, snapshot) in run_scenario(scenario, config).await? {
        println!("== {label}");
        println!("{snapshot}");
        println!();
    }
    Ok(())
}

/// Run `scenario` and return the tracker state after each step.
pub(crate) async fn run_scenario(
    scenario: Scenario,
    config: &BudgetConfig,
) -> Result<Vec<(String, TrackerSnapshot)>> {
    let now = scenario.now.with_timezone(&Utc);
    let tz = *scenario.now.offset();
    let today = (start_of_day(now, tz), now);

    let subscriptions = Arc::new(MemorySubscriptionQuota::new());
    subscriptions.set_quota(scenario.network, scenario.subscription_quota);
    let policies = Arc::new(MemoryPolicyStore::new());
    policies.set_policies(scenario.policies);
    let stats = Arc::new(MemoryUsageStats::new());
    stats.set_default_usage(scenario.cycle_usage);
    stats.set_usage(today.0, today.1, scenario.usage_today);
    let settings = Arc::new(MemorySettings::new());
    settings.set_global_default(scenario.global_default);
    let resources = Arc::new(StaticResourceConfig::new(
        scenario
            .resource_default
            .unwrap_or(config.resources.default_daily_quota_bytes),
    ));
    let network_events = Arc::new(MemoryNetworkEvents::new());

    let mut tracker = QuotaTracker::builder()
        .clock(Arc::new(FixedClock::new(now, tz)))
        .subscription_quota(subscriptions.clone())
        .policy_store(policies)
        .usage_stats(stats.clone())
        .settings(settings.clone())
        .resources(resources.clone())
        .network_events(network_events.clone())
        .config(config.tracker.clone())
        .build()?;
    tracker.start()?;

    let mut states = Vec::with_capacity(scenario.steps.len() + 1);
    network_events.emit_capabilities(scenario.network, &scenario.capabilities);
    tracker.flush().await?;
    states.push((format!("network {} available", scenario.network), tracker.snapshot()));

    for step in scenario.steps {
        let label = step.label();
        match step {
            Step::GlobalDefault { bytes } => {
                settings.set_global_default(bytes);
                settings.notify_changed();
            }
            Step::ResourceDefault { bytes } => {
                resources.set_default_quota(bytes);
                resources.notify_changed();
            }
            Step::SubscriptionQuota { bytes } => subscriptions.set_quota(scenario.network, bytes),
            Step::UsageToday { bytes } => stats.set_usage(today.0, today.1, bytes),
            Step::ThresholdReached => {
                if let Some(armed) = tracker.armed_threshold() {
                    stats.fire(armed.registration);
                }
            }
            Step::Capabilities { capabilities } => {
                network_events.emit_capabilities(scenario.network, &capabilities)
            }
            Step::NetworkLost => network_events.emit_lost(scenario.network),
        }
        tracker.flush().await?;
        states.push((label, tracker.snapshot()));
    }

    tracker.stop().await;
    Ok(states)
}
