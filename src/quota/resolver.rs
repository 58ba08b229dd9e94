//! Quota source resolution.
//!
//! Several sources compete to define the opportunistic quota of a network.
//! They are tried in the fixed order of [`PRECEDENCE`]; the first step that
//! yields a value wins. A step whose collaborator fails or has nothing to
//! say falls through to the next one. Only a malformed recurrence rule
//! aborts the pass.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::metrics::TrackerMetrics;
use crate::clock::Clock;
use crate::error::{BudgetError, Result};
use crate::network::{QuotaKind, TrackedNetwork};
use crate::policy::current_window_at;
use crate::providers::{
    PolicyStore, ResourceConfig, SettingsStore, SubscriptionQuotaProvider, UsageStatisticsService,
};

/// The quota figure a daily budget is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "quota", rename_all = "snake_case")]
pub enum QuotaSource {
    /// Opportunistic quota reported by the data plan.
    SubscriptionQuota(u64),
    /// Remainder of a policy cycle.
    CyclePolicy {
        remaining_bytes: u64,
        remaining_days: u64,
    },
    /// Operator/global default daily quota.
    DefaultSetting(u64),
    /// Platform-shipped fallback.
    ResourceDefault(u64),
}

impl fmt::Display for QuotaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaSource::SubscriptionQuota(b) => write!(f, "subscription quota {b} B"),
            QuotaSource::CyclePolicy {
                remaining_bytes,
                remaining_days,
            } => write!(
                f,
                "cycle policy {remaining_bytes} B over {remaining_days} day(s)"
            ),
            QuotaSource::DefaultSetting(b) => write!(f, "global default {b} B"),
            QuotaSource::ResourceDefault(b) => write!(f, "resource default {b} B"),
        }
    }
}

/// One step of the precedence chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStep {
    Subscription,
    CyclePolicy,
    GlobalSetting,
    ResourceDefault,
}

/// Resolution order, most authoritative first.
pub const PRECEDENCE: [ResolveStep; 4] = [
    ResolveStep::Subscription,
    ResolveStep::CyclePolicy,
    ResolveStep::GlobalSetting,
    ResolveStep::ResourceDefault,
];

/// Resolves the authoritative [`QuotaSource`] for a tracked network.
pub struct QuotaSourceResolver {
    clock: Arc<dyn Clock>,
    subscriptions: Arc<dyn SubscriptionQuotaProvider>,
    policies: Arc<dyn PolicyStore>,
    stats: Arc<dyn UsageStatisticsService>,
    settings: Arc<dyn SettingsStore>,
    resources: Arc<dyn ResourceConfig>,
    metrics: Arc<TrackerMetrics>,
}

impl QuotaSourceResolver {
    pub fn new(
        clock: Arc<dyn Clock>,
        subscriptions: Arc<dyn SubscriptionQuotaProvider>,
        policies: Arc<dyn PolicyStore>,
        stats: Arc<dyn UsageStatisticsService>,
        settings: Arc<dyn SettingsStore>,
        resources: Arc<dyn ResourceConfig>,
    ) -> Self {
        Self {
            clock,
            subscriptions,
            policies,
            stats,
            settings,
            resources,
            metrics: Arc::new(TrackerMetrics::new()),
        }
    }

    /// Count collaborator failures into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<TrackerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Walk [`PRECEDENCE`] and return the first source that applies.
    pub async fn resolve(&self, network: &TrackedNetwork) -> Result<QuotaSource> {
        let now = self.clock.now();
        let tz = self.clock.timezone();
        for step in PRECEDENCE {
            if let Some(source) = self.try_step(step, network, now, tz).await? {
                debug!(network = %network.id, ?step, %source, "Resolved quota source");
                return Ok(source);
            }
        }
        // The resource default always applies; kept for exhaustiveness.
        Ok(self.resource_default())
    }

    /// Run a single step. `Ok(None)` means "try the next step".
    pub async fn try_step(
        &self,
        step: ResolveStep,
        network: &TrackedNetwork,
        now: DateTime<Utc>,
        tz: FixedOffset,
    ) -> Result<Option<QuotaSource>> {
        match step {
            ResolveStep::Subscription => Ok(self.subscription_quota(network).await),
            ResolveStep::CyclePolicy => self.cycle_policy_quota(network, now, tz).await,
            ResolveStep::GlobalSetting => Ok(self.global_setting_quota().await),
            ResolveStep::ResourceDefault => Ok(Some(self.resource_default())),
        }
    }

    async fn subscription_quota(&self, network: &TrackedNetwork) -> Option<QuotaSource> {
        match self
            .subscriptions
            .opportunistic_quota(network.id, QuotaKind::Multipath)
            .await
        {
            Ok(quota) => quota.map(QuotaSource::SubscriptionQuota),
            Err(err) => {
                self.collaborator_failed("subscription quota", &err);
                None
            }
        }
    }

    /// Pick the matching policy leaving the smallest daily share.
    async fn cycle_policy_quota(
        &self,
        network: &TrackedNetwork,
        now: DateTime<Utc>,
        tz: FixedOffset,
    ) -> Result<Option<QuotaSource>> {
        let policies = match self
            .policies
            .policies_for(network.subscriber_id(), network.is_metered())
            .await
        {
            Ok(policies) => policies,
            Err(err) => {
                self.collaborator_failed("policy store", &err);
                return Ok(None);
            }
        };

        let template = network.template();
        let mut best: Option<(u64, u64)> = None;

        for policy in &policies {
            let Some(threshold) = policy.effective_threshold() else {
                continue;
            };
            let Some(window) = current_window_at(&policy.cycle, now, tz)? else {
                debug!(network = %network.id, "Policy has no active cycle; skipping");
                continue;
            };
            let used = match self
                .stats
                .bytes_used(&template, window.lower, window.upper)
                .await
            {
                Ok(used) => used,
                Err(err) => {
                    self.collaborator_failed("usage statistics", &err);
                    continue;
                }
            };

            let candidate = (threshold.saturating_sub(used), window.remaining_days);
            best = match best {
                Some(current) if !smaller_share(candidate, current) => Some(current),
                _ => Some(candidate),
            };
        }

        Ok(best.map(|(remaining_bytes, remaining_days)| QuotaSource::CyclePolicy {
            remaining_bytes,
            remaining_days,
        }))
    }

    async fn global_setting_quota(&self) -> Option<QuotaSource> {
        match self.settings.global_default_quota_bytes().await {
            Ok(Some(bytes)) if bytes > 0 => {
                u64::try_from(bytes).ok().map(QuotaSource::DefaultSetting)
            }
            Ok(_) => None,
            Err(err) => {
                self.collaborator_failed("settings", &err);
                None
            }
        }
    }

    fn resource_default(&self) -> QuotaSource {
        QuotaSource::ResourceDefault(self.resources.default_quota_bytes())
    }

    fn collaborator_failed(&self, collaborator: &'static str, err: &BudgetError) {
        TrackerMetrics::bump(&self.metrics.collaborator_failures);
        warn!(
            collaborator,
            error = %err,
            "Quota source unavailable; falling through"
        );
    }
}

/// Whether `a` leaves less per day than `b`, each given as (bytes, days).
fn smaller_share(a: (u64, u64), b: (u64, u64)) -> bool {
    let (a_bytes, a_days) = (u128::from(a.0), u128::from(a.1.max(1)));
    let (b_bytes, b_days) = (u128::from(b.0), u128::from(b.1.max(1)));
    a_bytes * b_days < b_bytes * a_days
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::network::{NetworkCapabilities, NetworkId};
    use crate::policy::{QuotaPolicy, RecurrenceRule, Threshold};
    use crate::providers::memory::{
        MemoryPolicyStore, MemorySettings, MemorySubscriptionQuota, MemoryUsageStats,
        StaticResourceConfig,
    };
    use crate::providers::{MockSettingsStore, MockSubscriptionQuotaProvider};

    const MB: u64 = 1_000_000;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn network() -> TrackedNetwork {
        TrackedNetwork::new(NetworkId(123), NetworkCapabilities::cellular("TEST_IMSI1"))
    }

    fn policy(warning: Threshold, limit: Threshold) -> QuotaPolicy {
        QuotaPolicy {
            subscriber_id: Some("TEST_IMSI1".into()),
            cycle: RecurrenceRule::monthly(
                DateTime::parse_from_rfc3339("2017-04-01T00:00:00Z").unwrap(),
            ),
            warning,
            limit,
            metered: true,
        }
    }

    struct Fixture {
        subscriptions: Arc<MemorySubscriptionQuota>,
        policies: Arc<MemoryPolicyStore>,
        stats: Arc<MemoryUsageStats>,
        settings: Arc<MemorySettings>,
        resources: Arc<StaticResourceConfig>,
        metrics: Arc<TrackerMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            let stats = Arc::new(MemoryUsageStats::new());
            // Usage within the April 2017 cycle.
            stats.set_usage(at("2017-04-01T00:00:00Z"), at("2017-05-01T00:00:00Z"), 7 * MB);
            Self {
                subscriptions: Arc::new(MemorySubscriptionQuota::new()),
                policies: Arc::new(MemoryPolicyStore::new()),
                stats,
                settings: Arc::new(MemorySettings::new()),
                resources: Arc::new(StaticResourceConfig::new(2_500_000)),
                metrics: Arc::new(TrackerMetrics::new()),
            }
        }

        fn resolver(&self) -> QuotaSourceResolver {
            QuotaSourceResolver::new(
                Arc::new(FixedClock::utc(at("2017-04-02T10:11:12Z"))),
                self.subscriptions.clone(),
                self.policies.clone(),
                self.stats.clone(),
                self.settings.clone(),
                self.resources.clone(),
            )
            .with_metrics(self.metrics.clone())
        }
    }

    #[tokio::test]
    async fn test_subscription_quota_wins() {
        let fx = Fixture::new();
        fx.subscriptions.set_quota(NetworkId(123), Some(14 * MB));
        fx.policies
            .set_policies(vec![policy(Threshold::Bytes(100 * MB), Threshold::Disabled)]);
        fx.settings.set_global_default(Some(12 * MB as i64));

        let source = fx.resolver().resolve(&network()).await.unwrap();
        assert_eq!(source, QuotaSource::SubscriptionQuota(14 * MB));
    }

    #[tokio::test]
    async fn test_subscription_quota_ignores_policy_and_settings_via_mock() {
        let fx = Fixture::new();
        let mut mock = MockSubscriptionQuotaProvider::new();
        mock.expect_opportunistic_quota()
            .times(2)
            .returning(|_, _| Ok(Some(14 * MB)));
        let mock = Arc::new(mock);

        let build = |policies: Arc<MemoryPolicyStore>, settings: Arc<MemorySettings>| {
            QuotaSourceResolver::new(
                Arc::new(FixedClock::utc(at("2017-04-02T10:11:12Z"))),
                mock.clone(),
                policies,
                fx.stats.clone(),
                settings,
                fx.resources.clone(),
            )
        };

        let first = build(fx.policies.clone(), fx.settings.clone())
            .resolve(&network())
            .await
            .unwrap();

        let other_policies = Arc::new(MemoryPolicyStore::new());
        other_policies.set_policies(vec![policy(Threshold::Bytes(MB), Threshold::Bytes(MB))]);
        let other_settings = Arc::new(MemorySettings::new());
        other_settings.set_global_default(Some(99 * MB as i64));
        let second = build(other_policies, other_settings)
            .resolve(&network())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first, QuotaSource::SubscriptionQuota(14 * MB));
    }

    #[tokio::test]
    async fn test_warning_policy_used_when_subscription_unknown() {
        let fx = Fixture::new();
        fx.policies.set_policies(vec![policy(
            Threshold::Bytes((15 * 29 * 20 + 7) * MB),
            Threshold::Disabled,
        )]);

        let source = fx.resolver().resolve(&network()).await.unwrap();
        assert_eq!(
            source,
            QuotaSource::CyclePolicy {
                remaining_bytes: 15 * 29 * 20 * MB,
                remaining_days: 29,
            }
        );
    }

    #[tokio::test]
    async fn test_limit_used_when_warning_snoozed() {
        let fx = Fixture::new();
        fx.policies.set_policies(vec![policy(
            Threshold::Snoozed,
            Threshold::Bytes((15 * 29 * 20 + 7) * MB),
        )]);

        let source = fx.resolver().resolve(&network()).await.unwrap();
        assert!(matches!(
            source,
            QuotaSource::CyclePolicy {
                remaining_bytes,
                remaining_days: 29
            } if remaining_bytes == 15 * 29 * 20 * MB
        ));
    }

    #[tokio::test]
    async fn test_both_snoozed_falls_to_global_setting() {
        let fx = Fixture::new();
        fx.policies
            .set_policies(vec![policy(Threshold::Snoozed, Threshold::Snoozed)]);
        fx.settings.set_global_default(Some(12 * MB as i64));

        let source = fx.resolver().resolve(&network()).await.unwrap();
        assert_eq!(source, QuotaSource::DefaultSetting(12 * MB));
    }

    #[tokio::test]
    async fn test_non_positive_setting_falls_to_resource_default() {
        let fx = Fixture::new();
        fx.settings.set_global_default(Some(-1));

        let source = fx.resolver().resolve(&network()).await.unwrap();
        assert_eq!(source, QuotaSource::ResourceDefault(2_500_000));
    }

    #[tokio::test]
    async fn test_used_beyond_threshold_clamps_to_zero() {
        let fx = Fixture::new();
        fx.policies
            .set_policies(vec![policy(Threshold::Bytes(MB), Threshold::Disabled)]);

        let source = fx.resolver().resolve(&network()).await.unwrap();
        assert_eq!(
            source,
            QuotaSource::CyclePolicy {
                remaining_bytes: 0,
                remaining_days: 29,
            }
        );
    }

    #[tokio::test]
    async fn test_smallest_daily_share_wins_across_policies() {
        let fx = Fixture::new();
        let mut weekly = policy(Threshold::Bytes(107 * MB), Threshold::Disabled);
        weekly.cycle = RecurrenceRule::new(
            DateTime::parse_from_rfc3339("2017-03-30T00:00:00Z").unwrap(),
            crate::policy::CyclePeriod::days(7),
        );
        fx.stats
            .set_usage(at("2017-03-30T00:00:00Z"), at("2017-04-06T00:00:00Z"), 7 * MB);
        fx.policies.set_policies(vec![
            policy(Threshold::Bytes(10_007 * MB), Threshold::Disabled),
            weekly,
        ]);

        let source = fx.resolver().resolve(&network()).await.unwrap();
        assert_eq!(
            source,
            QuotaSource::CyclePolicy {
                remaining_bytes: 100 * MB,
                remaining_days: 4,
            }
        );
    }

    #[tokio::test]
    async fn test_collaborator_failures_fall_through() {
        let fx = Fixture::new();
        fx.subscriptions.set_failing(true);
        fx.policies.set_failing(true);
        fx.settings.set_failing(true);

        let source = fx.resolver().resolve(&network()).await.unwrap();
        assert_eq!(source, QuotaSource::ResourceDefault(2_500_000));
        assert_eq!(fx.metrics.snapshot().collaborator_failures, 3);
    }

    #[tokio::test]
    async fn test_cycle_usage_failure_skips_policy() {
        let fx = Fixture::new();
        fx.policies
            .set_policies(vec![policy(Threshold::Bytes(100 * MB), Threshold::Disabled)]);
        fx.stats.set_failing_queries(true);
        fx.settings.set_global_default(Some(12 * MB as i64));

        let source = fx.resolver().resolve(&network()).await.unwrap();
        assert_eq!(source, QuotaSource::DefaultSetting(12 * MB));
    }

    #[tokio::test]
    async fn test_invalid_recurrence_aborts_pass() {
        let fx = Fixture::new();
        let mut broken = policy(Threshold::Bytes(100 * MB), Threshold::Disabled);
        broken.cycle.period = crate::policy::CyclePeriod::days(0);
        fx.policies.set_policies(vec![broken]);
        fx.settings.set_global_default(Some(12 * MB as i64));

        let err = fx.resolver().resolve(&network()).await.unwrap_err();
        assert!(matches!(err, BudgetError::InvalidRecurrence(_)));
    }

    #[tokio::test]
    async fn test_global_setting_step_in_isolation() {
        let fx = Fixture::new();
        let mut settings = MockSettingsStore::new();
        settings
            .expect_global_default_quota_bytes()
            .returning(|| Ok(Some(5 * MB as i64)));
        let resolver = QuotaSourceResolver::new(
            Arc::new(FixedClock::utc(at("2017-04-02T10:11:12Z"))),
            fx.subscriptions.clone(),
            fx.policies.clone(),
            fx.stats.clone(),
            Arc::new(settings),
            fx.resources.clone(),
        );

        let step = resolver
            .try_step(
                ResolveStep::GlobalSetting,
                &network(),
                at("2017-04-02T10:11:12Z"),
                chrono::Offset::fix(&Utc),
            )
            .await
            .unwrap();
        assert_eq!(step, Some(QuotaSource::DefaultSetting(5 * MB)));
    }

    #[test]
    fn test_precedence_order() {
        assert_eq!(PRECEDENCE[0], ResolveStep::Subscription);
        assert_eq!(PRECEDENCE[3], ResolveStep::ResourceDefault);
    }

    #[test]
    fn test_quota_source_serde_tagging() {
        let json = serde_json::to_string(&QuotaSource::CyclePolicy {
            remaining_bytes: 10,
            remaining_days: 2,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"source":"cycle_policy","quota":{"remaining_bytes":10,"remaining_days":2}}"#
        );
    }
}
