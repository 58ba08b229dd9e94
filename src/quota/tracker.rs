//! The quota tracker coordinator.
//!
//! `QuotaTracker` owns a single spawned task that reads every notification
//! (capability changes, settings and configuration changes, threshold
//! callbacks) from one channel and handles them strictly one at a time. Each
//! relevant event runs a resolve → compute → rearm pass for the tracked
//! network, so at most one threshold registration is ever live.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut tracker = QuotaTracker::builder()
//!     .subscription_quota(subscriptions)
//!     .policy_store(policies)
//!     .usage_stats(stats)
//!     .settings(settings)
//!     .resources(resources)
//!     .network_events(network_events)
//!     .build()?;
//!
//! tracker.start()?;
//! // ... collaborators deliver events ...
//! tracker.flush().await?;
//! println!("{}", tracker.snapshot());
//! tracker.stop().await;
//! ```

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::budget::daily_remaining;
use super::events::{Command, EventSink, TrackerEvent};
use super::metrics::{MetricsSnapshot, TrackerMetrics};
use super::monitor::{ArmedThreshold, UsageMonitor};
use super::resolver::{QuotaSource, QuotaSourceResolver};
use crate::clock::{start_of_day, Clock, SystemClock};
use crate::config::TrackerConfig;
use crate::error::{BudgetError, Result};
use crate::network::{NetworkCapabilities, NetworkId, NetworkRequest, TrackedNetwork};
use crate::providers::{
    NetworkEventSource, PolicyStore, ResourceConfig, SettingsStore, SubscriptionId,
    SubscriptionQuotaProvider, UsageStatisticsService,
};

// ============================================================================
// Public state types
// ============================================================================

/// Lifecycle state of a [`QuotaTracker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackerPhase {
    #[default]
    Stopped,
    StartedNoNetwork,
    StartedTracking,
}

impl fmt::Display for TrackerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrackerPhase::Stopped => "stopped",
            TrackerPhase::StartedNoNetwork => "started-no-network",
            TrackerPhase::StartedTracking => "started-tracking",
        };
        f.write_str(s)
    }
}

/// Bit set telling the connectivity layer how eagerly a network may be used
/// alongside the primary one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MultipathPreference(u32);

impl MultipathPreference {
    pub const NONE: Self = Self(0);
    /// Use the network to hand over when the primary one degrades.
    pub const HANDOVER: Self = Self(1);
    /// Use the network to improve reliability alongside the primary one.
    pub const RELIABILITY: Self = Self(1 << 1);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for MultipathPreference {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Read-only view of the tracker state, republished after every event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerSnapshot {
    pub phase: TrackerPhase,
    pub network: Option<TrackedNetwork>,
    pub armed: Option<ArmedThreshold>,
    pub last_source: Option<QuotaSource>,
}

impl TrackerSnapshot {
    fn started() -> Self {
        Self {
            phase: TrackerPhase::StartedNoNetwork,
            ..Self::default()
        }
    }
}

impl fmt::Display for TrackerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "phase:       {}", self.phase)?;
        match &self.network {
            Some(net) => writeln!(
                f,
                "network:     {} (subscriber {}, roaming {})",
                net.id,
                net.subscriber_id().unwrap_or("unknown"),
                net.capabilities.roaming
            )?,
            None => writeln!(f, "network:     none")?,
        }
        match &self.armed {
            Some(armed) => writeln!(
                f,
                "armed:       {} B on {} [{}, {}{}]",
                armed.threshold_bytes,
                armed.template,
                armed.token,
                armed.registration,
                if armed.fired { ", fired" } else { "" }
            )?,
            None => writeln!(f, "armed:       none")?,
        }
        match &self.last_source {
            Some(source) => write!(f, "last source: {source}"),
            None => write!(f, "last source: none"),
        }
    }
}

// ============================================================================
// QuotaTracker
// ============================================================================

struct Registrations {
    network: SubscriptionId,
    settings: SubscriptionId,
    resources: SubscriptionId,
}

struct Running {
    tx: mpsc::UnboundedSender<Command>,
    handle: JoinHandle<()>,
    registrations: Registrations,
}

/// Keeps one usage-threshold registration in sync with the tracked network
/// and its resolved quota source.
pub struct QuotaTracker {
    clock: Arc<dyn Clock>,
    subscriptions: Arc<dyn SubscriptionQuotaProvider>,
    policies: Arc<dyn PolicyStore>,
    stats: Arc<dyn UsageStatisticsService>,
    settings: Arc<dyn SettingsStore>,
    resources: Arc<dyn ResourceConfig>,
    network_events: Arc<dyn NetworkEventSource>,
    config: TrackerConfig,
    metrics: Arc<TrackerMetrics>,
    state: Arc<watch::Sender<TrackerSnapshot>>,
    running: Option<Running>,
}

impl QuotaTracker {
    pub fn builder() -> QuotaTrackerBuilder {
        QuotaTrackerBuilder::new()
    }

    /// `Stopped → Started-NoNetwork`: spawn the event loop and subscribe to
    /// every notification source.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(BudgetError::Lifecycle("tracker already started".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx.clone());

        let resolver = QuotaSourceResolver::new(
            self.clock.clone(),
            self.subscriptions.clone(),
            self.policies.clone(),
            self.stats.clone(),
            self.settings.clone(),
            self.resources.clone(),
        )
        .with_metrics(self.metrics.clone());

        let worker = Worker {
            clock: self.clock.clone(),
            stats: self.stats.clone(),
            resolver,
            monitor: UsageMonitor::new(self.stats.clone(), sink.clone()),
            request: NetworkRequest::metered_cellular(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            state: self.state.clone(),
            network: None,
            armed_source: None,
            last_source: None,
        };

        self.state.send_replace(TrackerSnapshot::started());
        let handle = tokio::spawn(worker.run(rx));

        let registrations = Registrations {
            network: self
                .network_events
                .register(&NetworkRequest::metered_cellular(), sink.clone()),
            settings: self.settings.subscribe(sink.clone()),
            resources: self.resources.subscribe(sink),
        };

        info!(
            track_roaming = self.config.track_roaming,
            "Quota tracker started"
        );
        self.running = Some(Running {
            tx,
            handle,
            registrations,
        });
        Ok(())
    }

    /// Any state `→ Stopped`: unsubscribe, tear down the armed threshold,
    /// and forget the tracked network. Events already queued are handled
    /// first. A no-op when already stopped.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            debug!("Quota tracker already stopped");
            return;
        };

        self.network_events
            .unregister(running.registrations.network);
        self.settings.unsubscribe(running.registrations.settings);
        self.resources.unsubscribe(running.registrations.resources);

        let (done_tx, done_rx) = oneshot::channel();
        if running.tx.send(Command::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        if let Err(err) = running.handle.await {
            warn!(error = %err, "Quota tracker task ended abnormally");
        }

        self.state.send_replace(TrackerSnapshot::default());
        self.metrics.emit_summary("stop");
        info!("Quota tracker stopped");
    }

    /// Wait until every event enqueued before this call has been handled.
    pub async fn flush(&self) -> Result<()> {
        let running = self
            .running
            .as_ref()
            .ok_or_else(|| BudgetError::Lifecycle("tracker not started".into()))?;
        let (done_tx, done_rx) = oneshot::channel();
        running
            .tx
            .send(Command::Flush(done_tx))
            .map_err(|_| BudgetError::ChannelClosed)?;
        done_rx.await.map_err(|_| BudgetError::ChannelClosed)
    }

    /// Handle for delivering events directly, while started.
    pub fn sink(&self) -> Option<EventSink> {
        self.running
            .as_ref()
            .map(|running| EventSink::new(running.tx.clone()))
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver notified after every handled event.
    pub fn subscribe(&self) -> watch::Receiver<TrackerSnapshot> {
        self.state.subscribe()
    }

    pub fn phase(&self) -> TrackerPhase {
        self.state.borrow().phase
    }

    pub fn tracked_network(&self) -> Option<TrackedNetwork> {
        self.state.borrow().network.clone()
    }

    pub fn armed_threshold(&self) -> Option<ArmedThreshold> {
        self.state.borrow().armed.clone()
    }

    pub fn last_source(&self) -> Option<QuotaSource> {
        self.state.borrow().last_source
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// How eagerly `network` may be used for multipath traffic.
    ///
    /// `None` when `network` is not the tracked network. Otherwise
    /// `HANDOVER | RELIABILITY` while budget remains today, and the empty
    /// preference once it is spent.
    pub fn multipath_preference(&self, network: NetworkId) -> Option<MultipathPreference> {
        let state = self.state.borrow();
        if state.network.as_ref().map(|n| n.id) != Some(network) {
            return None;
        }
        let has_budget = state
            .armed
            .as_ref()
            .is_some_and(|a| a.network == network && !a.fired && a.threshold_bytes > 0);
        Some(if has_budget {
            MultipathPreference::HANDOVER | MultipathPreference::RELIABILITY
        } else {
            MultipathPreference::NONE
        })
    }
}

impl Drop for QuotaTracker {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            self.network_events
                .unregister(running.registrations.network);
            self.settings.unsubscribe(running.registrations.settings);
            self.resources.unsubscribe(running.registrations.resources);
            running.handle.abort();
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`QuotaTracker`]. Every collaborator except the clock is
/// required.
#[derive(Default)]
pub struct QuotaTrackerBuilder {
    clock: Option<Arc<dyn Clock>>,
    subscriptions: Option<Arc<dyn SubscriptionQuotaProvider>>,
    policies: Option<Arc<dyn PolicyStore>>,
    stats: Option<Arc<dyn UsageStatisticsService>>,
    settings: Option<Arc<dyn SettingsStore>>,
    resources: Option<Arc<dyn ResourceConfig>>,
    network_events: Option<Arc<dyn NetworkEventSource>>,
    config: TrackerConfig,
    metrics: Option<Arc<TrackerMetrics>>,
}

impl QuotaTrackerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn subscription_quota(mut self, provider: Arc<dyn SubscriptionQuotaProvider>) -> Self {
        self.subscriptions = Some(provider);
        self
    }

    pub fn policy_store(mut self, store: Arc<dyn PolicyStore>) -> Self {
        self.policies = Some(store);
        self
    }

    pub fn usage_stats(mut self, stats: Arc<dyn UsageStatisticsService>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn resources(mut self, resources: Arc<dyn ResourceConfig>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn network_events(mut self, source: Arc<dyn NetworkEventSource>) -> Self {
        self.network_events = Some(source);
        self
    }

    pub fn config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    /// Share counters with the caller.
    pub fn metrics(mut self, metrics: Arc<TrackerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns `Err` if a required collaborator was not set.
    pub fn build(self) -> Result<QuotaTracker> {
        let (state, _) = watch::channel(TrackerSnapshot::default());
        Ok(QuotaTracker {
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            subscriptions: require(self.subscriptions, "subscription_quota")?,
            policies: require(self.policies, "policy_store")?,
            stats: require(self.stats, "usage_stats")?,
            settings: require(self.settings, "settings")?,
            resources: require(self.resources, "resources")?,
            network_events: require(self.network_events, "network_events")?,
            config: self.config,
            metrics: self.metrics.unwrap_or_default(),
            state: Arc::new(state),
            running: None,
        })
    }
}

fn require<T: ?Sized>(value: Option<Arc<T>>, name: &str) -> Result<Arc<T>> {
    value.ok_or_else(|| {
        BudgetError::config(format!(
            "QuotaTracker requires {name}. Call .{name}() on the builder."
        ))
    })
}

// ============================================================================
// Event loop
// ============================================================================

/// State owned by the spawned task. Nothing else mutates it.
struct Worker {
    clock: Arc<dyn Clock>,
    stats: Arc<dyn UsageStatisticsService>,
    resolver: QuotaSourceResolver,
    monitor: UsageMonitor,
    request: NetworkRequest,
    config: TrackerConfig,
    metrics: Arc<TrackerMetrics>,
    state: Arc<watch::Sender<TrackerSnapshot>>,
    network: Option<TrackedNetwork>,
    /// Source the live registration was computed from.
    armed_source: Option<QuotaSource>,
    last_source: Option<QuotaSource>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Event(event) => self.handle(event).await,
                Command::Flush(done) => {
                    let _ = done.send(());
                }
                Command::Shutdown(done) => {
                    self.shutdown().await;
                    let _ = done.send(());
                    return;
                }
            }
        }
        self.shutdown().await;
    }

    async fn handle(&mut self, event: TrackerEvent) {
        debug!(event = event.kind(), "Handling tracker event");
        match event {
            TrackerEvent::CapabilitiesChanged {
                network,
                capabilities,
            } => {
                if self.qualifies(&capabilities) {
                    self.track(TrackedNetwork::new(network, capabilities));
                    self.update_budget().await;
                } else if self.is_tracked(network) {
                    info!(%network, "Tracked network no longer qualifies");
                    self.untrack().await;
                } else {
                    debug!(%network, "Ignoring non-qualifying network");
                }
            }
            TrackerEvent::NetworkLost { network } => {
                if self.is_tracked(network) {
                    info!(%network, "Tracked network lost");
                    self.untrack().await;
                }
            }
            TrackerEvent::SettingsChanged | TrackerEvent::ConfigChanged => {
                if self.network.is_some() {
                    self.update_budget().await;
                }
            }
            TrackerEvent::ThresholdReached { token } => {
                if !self.monitor.mark_fired(token) {
                    TrackerMetrics::bump(&self.metrics.stale_callbacks);
                    debug!(%token, "Ignoring stale threshold callback");
                    return;
                }
                info!(%token, "Usage threshold reached");
                self.update_budget().await;
            }
        }
    }

    fn qualifies(&self, capabilities: &NetworkCapabilities) -> bool {
        self.request.matches(capabilities) && (self.config.track_roaming || !capabilities.roaming)
    }

    fn is_tracked(&self, network: NetworkId) -> bool {
        self.network.as_ref().is_some_and(|n| n.id == network)
    }

    fn track(&mut self, network: TrackedNetwork) {
        if !self.is_tracked(network.id) {
            info!(
                network = %network.id,
                subscriber = network.subscriber_id().unwrap_or("unknown"),
                roaming = network.capabilities.roaming,
                "Tracking network"
            );
        }
        self.network = Some(network);
    }

    async fn untrack(&mut self) {
        self.network = None;
        self.armed_source = None;
        self.monitor.teardown().await;
        self.publish();
    }

    /// One resolve → compute → rearm pass for the tracked network.
    async fn update_budget(&mut self) {
        let Some(network) = self.network.clone() else {
            return;
        };
        TrackerMetrics::bump(&self.metrics.passes);

        let source = match self.resolver.resolve(&network).await {
            Ok(source) => source,
            Err(err) => {
                TrackerMetrics::bump(&self.metrics.failed_resolutions);
                warn!(
                    network = %network.id,
                    error = %err,
                    configuration = err.is_fatal_to_pass(),
                    "Quota resolution failed; keeping armed threshold"
                );
                self.publish();
                return;
            }
        };
        self.last_source = Some(source);

        if self.armed_is_current(&network, &source) {
            self.skip_rearm(&network, &source);
            return;
        }

        let used_today = self.usage_today(&network).await;
        let threshold = daily_remaining(&source, used_today);
        debug!(
            network = %network.id,
            %source,
            used_today,
            threshold,
            "Computed daily remaining budget"
        );

        if self.exhausted_is_current(&network, &source, threshold) {
            self.skip_rearm(&network, &source);
            return;
        }

        match self.monitor.rearm(&network, threshold).await {
            Ok(_) => {
                TrackerMetrics::bump(&self.metrics.rearms);
                self.armed_source = Some(source);
            }
            Err(err) => {
                TrackerMetrics::bump(&self.metrics.collaborator_failures);
                warn!(
                    network = %network.id,
                    threshold,
                    error = %err,
                    "Failed to arm usage threshold"
                );
                self.armed_source = None;
            }
        }
        self.publish();
    }

    /// A registration that has not fired, for the same network and source,
    /// needs no replacement.
    fn armed_is_current(&self, network: &TrackedNetwork, source: &QuotaSource) -> bool {
        self.monitor.armed().is_some_and(|armed| {
            !armed.fired
                && armed.network == network.id
                && armed.template == network.template()
                && self.armed_source.as_ref() == Some(source)
        })
    }

    /// A fired zero-byte registration stays armed while the budget is still
    /// exhausted for the same network and source. Replacing it would only
    /// fire again.
    fn exhausted_is_current(
        &self,
        network: &TrackedNetwork,
        source: &QuotaSource,
        threshold: u64,
    ) -> bool {
        threshold == 0
            && self.monitor.armed().is_some_and(|armed| {
                armed.fired
                    && armed.threshold_bytes == 0
                    && armed.network == network.id
                    && armed.template == network.template()
                    && self.armed_source.as_ref() == Some(source)
            })
    }

    fn skip_rearm(&self, network: &TrackedNetwork, source: &QuotaSource) {
        TrackerMetrics::bump(&self.metrics.skipped_rearms);
        debug!(network = %network.id, %source, "Armed threshold still current");
        self.publish();
    }

    /// Bytes used since local midnight. Unreadable usage counts as the whole
    /// budget spent.
    async fn usage_today(&self, network: &TrackedNetwork) -> u64 {
        let now = self.clock.now();
        let start = start_of_day(now, self.clock.timezone());
        match self.stats.bytes_used(&network.template(), start, now).await {
            Ok(bytes) => bytes,
            Err(err) => {
                TrackerMetrics::bump(&self.metrics.collaborator_failures);
                warn!(
                    network = %network.id,
                    error = %err,
                    "Cannot read today's usage; arming a zero threshold"
                );
                u64::MAX
            }
        }
    }

    async fn shutdown(&mut self) {
        self.monitor.teardown().await;
        self.network = None;
        self.armed_source = None;
        self.last_source = None;
        self.state.send_replace(TrackerSnapshot::default());
    }

    fn publish(&self) {
        let phase = if self.network.is_some() {
            TrackerPhase::StartedTracking
        } else {
            TrackerPhase::StartedNoNetwork
        };
        self.state.send_replace(TrackerSnapshot {
            phase,
            network: self.network.clone(),
            armed: self.monitor.armed().cloned(),
            last_source: self.last_source,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::policy::{CyclePeriod, QuotaPolicy, RecurrenceRule, Threshold};
    use crate::providers::memory::{
        MemoryNetworkEvents, MemoryPolicyStore, MemorySettings, MemorySubscriptionQuota,
        MemoryUsageStats, StaticResourceConfig,
    };
    use chrono::{DateTime, Utc};

    const MB: u64 = 1_000_000;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    struct Harness {
        subscriptions: Arc<MemorySubscriptionQuota>,
        policies: Arc<MemoryPolicyStore>,
        stats: Arc<MemoryUsageStats>,
        settings: Arc<MemorySettings>,
        resources: Arc<StaticResourceConfig>,
        network_events: Arc<MemoryNetworkEvents>,
    }

    impl Harness {
        fn new() -> Self {
            let stats = Arc::new(MemoryUsageStats::new());
            stats.set_default_usage(2 * MB);
            Self {
                subscriptions: Arc::new(MemorySubscriptionQuota::new()),
                policies: Arc::new(MemoryPolicyStore::new()),
                stats,
                settings: Arc::new(MemorySettings::new()),
                resources: Arc::new(StaticResourceConfig::new(10 * MB)),
                network_events: Arc::new(MemoryNetworkEvents::new()),
            }
        }

        fn builder(&self) -> QuotaTrackerBuilder {
            QuotaTracker::builder()
                .clock(Arc::new(FixedClock::utc(at("2017-04-02T10:11:12Z"))))
                .subscription_quota(self.subscriptions.clone())
                .policy_store(self.policies.clone())
                .usage_stats(self.stats.clone())
                .settings(self.settings.clone())
                .resources(self.resources.clone())
                .network_events(self.network_events.clone())
        }

        fn tracker(&self) -> QuotaTracker {
            self.builder().build().unwrap()
        }
    }

    fn cellular() -> NetworkCapabilities {
        NetworkCapabilities::cellular("TEST_IMSI1")
    }

    #[test]
    fn test_build_requires_collaborators() {
        let err = QuotaTracker::builder().build().err().unwrap();
        assert!(matches!(err, BudgetError::Config(_)));
        assert!(err.to_string().contains("subscription_quota"));
    }

    #[test]
    fn test_multipath_preference_bits() {
        let both = MultipathPreference::HANDOVER | MultipathPreference::RELIABILITY;
        assert_eq!(both.bits(), 3);
        assert!(both.contains(MultipathPreference::RELIABILITY));
        assert!(MultipathPreference::NONE.is_empty());
    }

    #[tokio::test]
    async fn test_phase_transitions() {
        let h = Harness::new();
        let mut tracker = h.tracker();
        assert_eq!(tracker.phase(), TrackerPhase::Stopped);

        tracker.start().unwrap();
        assert_eq!(tracker.phase(), TrackerPhase::StartedNoNetwork);
        assert_eq!(h.network_events.callback_count(), 1);
        assert_eq!(h.settings.observer_count(), 1);
        assert_eq!(h.resources.receiver_count(), 1);

        h.network_events.emit_capabilities(NetworkId(123), &cellular());
        tracker.flush().await.unwrap();
        assert_eq!(tracker.phase(), TrackerPhase::StartedTracking);
        assert_eq!(tracker.armed_threshold().unwrap().threshold_bytes, 8 * MB);
        assert_eq!(
            tracker.last_source(),
            Some(QuotaSource::ResourceDefault(10 * MB))
        );

        tracker.stop().await;
        assert_eq!(tracker.phase(), TrackerPhase::Stopped);
        assert!(tracker.armed_threshold().is_none());
        assert!(h.stats.active().is_empty());
        assert_eq!(h.network_events.callback_count(), 0);
        assert_eq!(h.settings.observer_count(), 0);
        assert_eq!(h.resources.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let h = Harness::new();
        let mut tracker = h.tracker();
        tracker.start().unwrap();
        assert!(matches!(tracker.start(), Err(BudgetError::Lifecycle(_))));
        tracker.stop().await;
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_flush_before_start_fails() {
        let h = Harness::new();
        let tracker = h.tracker();
        assert!(matches!(
            tracker.flush().await,
            Err(BudgetError::Lifecycle(_))
        ));
    }

    #[tokio::test]
    async fn test_non_qualifying_network_is_ignored() {
        let h = Harness::new();
        let mut tracker = h.tracker();
        tracker.start().unwrap();

        let mut caps = cellular();
        caps.internet = false;
        tracker
            .sink()
            .unwrap()
            .capabilities_changed(NetworkId(5), caps);
        tracker.flush().await.unwrap();

        assert_eq!(tracker.phase(), TrackerPhase::StartedNoNetwork);
        assert!(h.stats.calls().is_empty());
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_roaming_excluded_when_disabled() {
        let h = Harness::new();
        let mut tracker = h
            .builder()
            .config(TrackerConfig {
                track_roaming: false,
            })
            .build()
            .unwrap();
        tracker.start().unwrap();

        h.network_events
            .emit_capabilities(NetworkId(123), &cellular());
        tracker.flush().await.unwrap();
        assert_eq!(h.stats.active().len(), 1);

        h.network_events
            .emit_capabilities(NetworkId(123), &cellular().with_roaming(true));
        tracker.flush().await.unwrap();
        assert_eq!(tracker.phase(), TrackerPhase::StartedNoNetwork);
        assert!(h.stats.active().is_empty());
        assert_eq!(tracker.multipath_preference(NetworkId(123)), None);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_roaming_tracked_by_default() {
        let h = Harness::new();
        let mut tracker = h.tracker();
        tracker.start().unwrap();

        h.network_events
            .emit_capabilities(NetworkId(123), &cellular().with_roaming(true));
        tracker.flush().await.unwrap();
        assert_eq!(tracker.phase(), TrackerPhase::StartedTracking);
        assert_eq!(h.stats.active().len(), 1);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_stale_threshold_callback_is_ignored() {
        let h = Harness::new();
        let mut tracker = h.tracker();
        tracker.start().unwrap();

        h.network_events.emit_capabilities(NetworkId(123), &cellular());
        tracker.flush().await.unwrap();
        let stale = h.stats.active()[0].notifier.clone();

        h.resources.set_default_quota(16 * MB);
        h.resources.notify_changed();
        tracker.flush().await.unwrap();
        let calls_before = h.stats.calls().len();

        stale.notify();
        tracker.flush().await.unwrap();

        assert_eq!(h.stats.calls().len(), calls_before);
        assert_eq!(tracker.metrics().stale_callbacks, 1);
        assert_eq!(tracker.armed_threshold().unwrap().threshold_bytes, 14 * MB);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_fired_registration_is_replaced_even_when_source_unchanged() {
        let h = Harness::new();
        let mut tracker = h.tracker();
        tracker.start().unwrap();

        h.network_events.emit_capabilities(NetworkId(123), &cellular());
        tracker.flush().await.unwrap();
        let first = tracker.armed_threshold().unwrap();

        h.stats.fire(first.registration);
        tracker.flush().await.unwrap();

        let second = tracker.armed_threshold().unwrap();
        assert_ne!(first.token, second.token);
        assert_eq!(h.stats.unregistered(), vec![first.registration]);
        assert_eq!(h.stats.active().len(), 1);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_resolution_failure_keeps_armed_threshold() {
        let h = Harness::new();
        let mut tracker = h.tracker();
        tracker.start().unwrap();

        h.network_events.emit_capabilities(NetworkId(123), &cellular());
        tracker.flush().await.unwrap();
        let armed = tracker.armed_threshold().unwrap();

        h.policies.set_policies(vec![QuotaPolicy {
            subscriber_id: Some("TEST_IMSI1".into()),
            cycle: RecurrenceRule::new(
                DateTime::parse_from_rfc3339("2017-04-01T00:00:00Z").unwrap(),
                CyclePeriod::days(0),
            ),
            warning: Threshold::Bytes(100 * MB),
            limit: Threshold::Disabled,
            metered: true,
        }]);
        h.settings.notify_changed();
        tracker.flush().await.unwrap();

        assert_eq!(tracker.armed_threshold(), Some(armed));
        assert_eq!(h.stats.active().len(), 1);
        assert_eq!(tracker.metrics().failed_resolutions, 1);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_usage_today_failure_arms_zero() {
        let h = Harness::new();
        h.stats.set_failing_queries(true);
        let mut tracker = h.tracker();
        tracker.start().unwrap();

        h.network_events.emit_capabilities(NetworkId(123), &cellular());
        tracker.flush().await.unwrap();

        assert_eq!(tracker.armed_threshold().unwrap().threshold_bytes, 0);
        assert_eq!(
            tracker.multipath_preference(NetworkId(123)),
            Some(MultipathPreference::NONE)
        );
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_exhausted_threshold_firing_does_not_rearm_again() {
        let h = Harness::new();
        h.stats.set_default_usage(20 * MB);
        h.stats.set_fire_exhausted(true);
        let mut tracker = h.tracker();
        tracker.start().unwrap();

        h.network_events.emit_capabilities(NetworkId(123), &cellular());
        for _ in 0..5 {
            tracker.flush().await.unwrap();
            tokio::task::yield_now().await;
        }

        assert_eq!(h.stats.registered_thresholds(), vec![0]);
        let armed = tracker.armed_threshold().unwrap();
        assert!(armed.fired);
        assert_eq!(h.stats.active().len(), 1);
        let metrics = tracker.metrics();
        assert_eq!(metrics.rearms, 1);
        assert_eq!(metrics.skipped_rearms, 1);

        // Same source on a settings change: still exhausted, kept.
        h.settings.notify_changed();
        tracker.flush().await.unwrap();
        assert_eq!(h.stats.registered_thresholds(), vec![0]);

        // A larger default changes the source and leaves budget for today.
        h.settings.set_global_default(Some(30 * MB as i64));
        h.settings.notify_changed();
        tracker.flush().await.unwrap();
        assert_eq!(h.stats.registered_thresholds(), vec![0, 10 * MB]);
        assert_eq!(h.stats.unregistered(), vec![armed.registration]);
        assert!(!tracker.armed_threshold().unwrap().fired);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_failed_registration_leaves_nothing_armed() {
        let h = Harness::new();
        h.stats.set_failing_registrations(true);
        let mut tracker = h.tracker();
        tracker.start().unwrap();

        h.network_events.emit_capabilities(NetworkId(123), &cellular());
        tracker.flush().await.unwrap();

        assert_eq!(tracker.phase(), TrackerPhase::StartedTracking);
        assert!(tracker.armed_threshold().is_none());
        assert!(h.stats.active().is_empty());
        assert_eq!(tracker.metrics().collaborator_failures, 1);
        assert_eq!(tracker.metrics().rearms, 0);

        // The next event retries.
        h.stats.set_failing_registrations(false);
        h.settings.notify_changed();
        tracker.flush().await.unwrap();
        assert_eq!(tracker.armed_threshold().unwrap().threshold_bytes, 8 * MB);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_multipath_preference_while_budget_remains() {
        let h = Harness::new();
        let mut tracker = h.tracker();
        tracker.start().unwrap();
        assert_eq!(tracker.multipath_preference(NetworkId(123)), None);

        h.network_events.emit_capabilities(NetworkId(123), &cellular());
        tracker.flush().await.unwrap();

        assert_eq!(
            tracker.multipath_preference(NetworkId(123)),
            Some(MultipathPreference::HANDOVER | MultipathPreference::RELIABILITY)
        );
        assert_eq!(tracker.multipath_preference(NetworkId(7)), None);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_snapshot_watch_and_display() {
        let h = Harness::new();
        let mut tracker = h.tracker();
        let mut rx = tracker.subscribe();
        tracker.start().unwrap();

        h.network_events.emit_capabilities(NetworkId(123), &cellular());
        tracker.flush().await.unwrap();
        assert!(rx.has_changed().unwrap());

        let snapshot = rx.borrow_and_update().clone();
        let dump = snapshot.to_string();
        assert!(dump.contains("started-tracking"));
        assert!(dump.contains("net:123"));
        assert!(dump.contains("8000000 B"));
        assert!(dump.contains("resource default"));
        tracker.stop().await;
    }
}
