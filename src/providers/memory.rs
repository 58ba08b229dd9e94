//! In-process collaborators.
//!
//! Each type stores its state behind a `Mutex` and records the calls the
//! tracker makes, so tests and the simulator can drive the tracker without
//! a real network stack or statistics service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{
    NetworkEventSource, PolicyStore, RegistrationId, ResourceConfig, SettingsStore,
    SubscriptionId, SubscriptionQuotaProvider, Subscribers, UsageStatisticsService,
};
use crate::error::{BudgetError, Result};
use crate::network::{NetworkCapabilities, NetworkId, NetworkRequest, NetworkTemplate, QuotaKind};
use crate::policy::QuotaPolicy;
use crate::quota::events::{EventSink, ThresholdNotifier};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Subscription quota
// ---------------------------------------------------------------------------

/// Data-plan quotas keyed by network.
#[derive(Debug, Default)]
pub struct MemorySubscriptionQuota {
    quotas: Mutex<HashMap<NetworkId, u64>>,
    failing: AtomicBool,
}

impl MemorySubscriptionQuota {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` makes the quota unknown for `network`.
    pub fn set_quota(&self, network: NetworkId, quota: Option<u64>) {
        let mut quotas = lock(&self.quotas);
        match quota {
            Some(bytes) => quotas.insert(network, bytes),
            None => quotas.remove(&network),
        };
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SubscriptionQuotaProvider for MemorySubscriptionQuota {
    async fn opportunistic_quota(
        &self,
        network: NetworkId,
        _kind: QuotaKind,
    ) -> Result<Option<u64>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BudgetError::collaborator("subscription quota", "unavailable"));
        }
        Ok(lock(&self.quotas).get(&network).copied())
    }
}

// ---------------------------------------------------------------------------
// Policy store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryPolicyStore {
    policies: Mutex<Vec<QuotaPolicy>>,
    failing: AtomicBool,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_policies(&self, policies: Vec<QuotaPolicy>) {
        *lock(&self.policies) = policies;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn policies_for(
        &self,
        subscriber_id: Option<&str>,
        metered: bool,
    ) -> Result<Vec<QuotaPolicy>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BudgetError::collaborator("policy store", "unavailable"));
        }
        Ok(lock(&self.policies)
            .iter()
            .filter(|p| p.applies_to(subscriber_id, metered))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Usage statistics
// ---------------------------------------------------------------------------

/// A threshold registration currently held by [`MemoryUsageStats`].
#[derive(Debug, Clone)]
pub struct ActiveRegistration {
    pub id: RegistrationId,
    pub template: NetworkTemplate,
    pub threshold_bytes: u64,
    pub notifier: ThresholdNotifier,
}

/// Call log entry of [`MemoryUsageStats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsCall {
    Register {
        id: RegistrationId,
        threshold_bytes: u64,
    },
    Unregister {
        id: RegistrationId,
    },
}

/// Usage totals per queried window plus the threshold watchdog.
#[derive(Debug, Default)]
pub struct MemoryUsageStats {
    windows: Mutex<HashMap<(DateTime<Utc>, DateTime<Utc>), u64>>,
    default_usage: AtomicU64,
    registrations: Mutex<HashMap<RegistrationId, ActiveRegistration>>,
    calls: Mutex<Vec<StatsCall>>,
    next_id: AtomicU64,
    failing_queries: AtomicBool,
    failing_registrations: AtomicBool,
    failing_unregisters: AtomicBool,
    fire_exhausted: AtomicBool,
}

impl MemoryUsageStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Usage reported for exactly the window `[start, end)`.
    pub fn set_usage(&self, start: DateTime<Utc>, end: DateTime<Utc>, bytes: u64) {
        lock(&self.windows).insert((start, end), bytes);
    }

    /// Usage reported for any window without an explicit entry.
    pub fn set_default_usage(&self, bytes: u64) {
        self.default_usage.store(bytes, Ordering::SeqCst);
    }

    pub fn set_failing_queries(&self, failing: bool) {
        self.failing_queries.store(failing, Ordering::SeqCst);
    }

    pub fn set_failing_registrations(&self, failing: bool) {
        self.failing_registrations.store(failing, Ordering::SeqCst);
    }

    /// Reject unregister calls while leaving the registration in place.
    pub fn set_failing_unregisters(&self, failing: bool) {
        self.failing_unregisters.store(failing, Ordering::SeqCst);
    }

    /// Fire zero-byte thresholds as soon as they are registered, the way a
    /// watchdog with nothing left to count would.
    pub fn set_fire_exhausted(&self, eager: bool) {
        self.fire_exhausted.store(eager, Ordering::SeqCst);
    }

    pub fn active(&self) -> Vec<ActiveRegistration> {
        let mut active: Vec<_> = lock(&self.registrations).values().cloned().collect();
        active.sort_by_key(|r| r.id.0);
        active
    }

    pub fn calls(&self) -> Vec<StatsCall> {
        lock(&self.calls).clone()
    }

    /// Thresholds of every registration ever made, in order.
    pub fn registered_thresholds(&self) -> Vec<u64> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                StatsCall::Register {
                    threshold_bytes, ..
                } => Some(*threshold_bytes),
                StatsCall::Unregister { .. } => None,
            })
            .collect()
    }

    pub fn unregistered(&self) -> Vec<RegistrationId> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                StatsCall::Unregister { id } => Some(*id),
                StatsCall::Register { .. } => None,
            })
            .collect()
    }

    /// Fire the callback of `id`, as if usage crossed its threshold.
    /// Returns `false` when `id` is not registered.
    pub fn fire(&self, id: RegistrationId) -> bool {
        let notifier = lock(&self.registrations)
            .get(&id)
            .map(|r| r.notifier.clone());
        match notifier {
            Some(notifier) => {
                notifier.notify();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl UsageStatisticsService for MemoryUsageStats {
    async fn bytes_used(
        &self,
        _template: &NetworkTemplate,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        if self.failing_queries.load(Ordering::SeqCst) {
            return Err(BudgetError::collaborator("usage statistics", "query failed"));
        }
        Ok(lock(&self.windows)
            .get(&(start, end))
            .copied()
            .unwrap_or_else(|| self.default_usage.load(Ordering::SeqCst)))
    }

    async fn register_threshold(
        &self,
        template: &NetworkTemplate,
        threshold_bytes: u64,
        notifier: ThresholdNotifier,
    ) -> Result<RegistrationId> {
        if self.failing_registrations.load(Ordering::SeqCst) {
            return Err(BudgetError::collaborator(
                "usage statistics",
                "registration rejected",
            ));
        }
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let fire_now = threshold_bytes == 0 && self.fire_exhausted.load(Ordering::SeqCst);
        lock(&self.registrations).insert(
            id,
            ActiveRegistration {
                id,
                template: template.clone(),
                threshold_bytes,
                notifier: notifier.clone(),
            },
        );
        lock(&self.calls).push(StatsCall::Register {
            id,
            threshold_bytes,
        });
        debug!(registration = %id, threshold_bytes, "Registered usage threshold");
        if fire_now {
            notifier.notify();
        }
        Ok(id)
    }

    async fn unregister(&self, registration: RegistrationId) -> Result<()> {
        lock(&self.calls).push(StatsCall::Unregister { id: registration });
        if self.failing_unregisters.load(Ordering::SeqCst) {
            return Err(BudgetError::collaborator(
                "usage statistics",
                "unregister rejected",
            ));
        }
        if lock(&self.registrations).remove(&registration).is_none() {
            return Err(BudgetError::collaborator(
                "usage statistics",
                format!("unknown registration {registration}"),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemorySettings {
    global_default: Mutex<Option<i64>>,
    subscribers: Subscribers,
    failing: AtomicBool,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the value without notifying observers.
    pub fn set_global_default(&self, bytes: Option<i64>) {
        *lock(&self.global_default) = bytes;
    }

    /// Notify every observer that the setting changed.
    pub fn notify_changed(&self) {
        for sink in self.subscribers.sinks() {
            sink.settings_changed();
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn observer_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn global_default_quota_bytes(&self) -> Result<Option<i64>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BudgetError::collaborator("settings", "unavailable"));
        }
        Ok(*lock(&self.global_default))
    }

    fn subscribe(&self, sink: EventSink) -> SubscriptionId {
        self.subscribers.add(sink)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.remove(id);
    }
}

// ---------------------------------------------------------------------------
// Resource config
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct StaticResourceConfig {
    default_quota: AtomicU64,
    subscribers: Subscribers,
}

impl StaticResourceConfig {
    pub fn new(default_quota_bytes: u64) -> Self {
        Self {
            default_quota: AtomicU64::new(default_quota_bytes),
            subscribers: Subscribers::new(),
        }
    }

    /// Store the value without notifying receivers.
    pub fn set_default_quota(&self, bytes: u64) {
        self.default_quota.store(bytes, Ordering::SeqCst);
    }

    /// Broadcast a configuration change.
    pub fn notify_changed(&self) {
        for sink in self.subscribers.sinks() {
            sink.config_changed();
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl ResourceConfig for StaticResourceConfig {
    fn default_quota_bytes(&self) -> u64 {
        self.default_quota.load(Ordering::SeqCst)
    }

    fn subscribe(&self, sink: EventSink) -> SubscriptionId {
        self.subscribers.add(sink)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.remove(id);
    }
}

// ---------------------------------------------------------------------------
// Network events
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryNetworkEvents {
    callbacks: Mutex<HashMap<SubscriptionId, (NetworkRequest, EventSink)>>,
    next_id: AtomicU64,
}

impl MemoryNetworkEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a capability change. Callbacks whose request no longer
    /// matches see the network as lost.
    pub fn emit_capabilities(&self, network: NetworkId, capabilities: &NetworkCapabilities) {
        let callbacks: Vec<_> = lock(&self.callbacks).values().cloned().collect();
        for (request, sink) in callbacks {
            if request.matches(capabilities) {
                sink.capabilities_changed(network, capabilities.clone());
            } else {
                sink.network_lost(network);
            }
        }
    }

    pub fn emit_lost(&self, network: NetworkId) {
        let callbacks: Vec<_> = lock(&self.callbacks).values().cloned().collect();
        for (_, sink) in callbacks {
            sink.network_lost(network);
        }
    }

    pub fn callback_count(&self) -> usize {
        lock(&self.callbacks).len()
    }
}

impl NetworkEventSource for MemoryNetworkEvents {
    fn register(&self, request: &NetworkRequest, sink: EventSink) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.callbacks).insert(id, (request.clone(), sink));
        id
    }

    fn unregister(&self, id: SubscriptionId) {
        lock(&self.callbacks).remove(&id);
    }
}
