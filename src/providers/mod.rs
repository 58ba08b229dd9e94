//! External collaborators the budget engine consumes.
//!
//! Every collaborator is injected explicitly into the tracker. Query methods
//! are async because they may block on another service; subscription methods
//! are sync and only install or remove an [`EventSink`].
//!
//! [`memory`] holds in-process implementations for tests and the simulator.

pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::network::{NetworkId, NetworkRequest, NetworkTemplate, QuotaKind};
use crate::policy::QuotaPolicy;
use crate::quota::events::{EventSink, ThresholdNotifier};

/// Handle of a notification subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle of a threshold registration, as issued by the statistics service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(pub u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg#{}", self.0)
    }
}

/// Opportunistic quota reported by the subscription (data plan) layer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriptionQuotaProvider: Send + Sync {
    /// `Ok(None)` means the plan does not report a quota for this network.
    async fn opportunistic_quota(&self, network: NetworkId, kind: QuotaKind)
        -> Result<Option<u64>>;
}

/// Storage of user/operator quota policies.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn policies_for(
        &self,
        subscriber_id: Option<&str>,
        metered: bool,
    ) -> Result<Vec<QuotaPolicy>>;
}

/// Usage statistics and the low-level usage-threshold watchdog.
#[async_trait]
pub trait UsageStatisticsService: Send + Sync {
    /// Bytes (rx + tx) used by `template` within `[start, end)`.
    async fn bytes_used(
        &self,
        template: &NetworkTemplate,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64>;

    /// Call `notifier` once `threshold_bytes` more bytes have been used on
    /// `template`.
    async fn register_threshold(
        &self,
        template: &NetworkTemplate,
        threshold_bytes: u64,
        notifier: ThresholdNotifier,
    ) -> Result<RegistrationId>;

    async fn unregister(&self, registration: RegistrationId) -> Result<()>;
}

/// Global settings holding the operator's default daily quota.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// `Ok(None)` when the setting is unset.
    async fn global_default_quota_bytes(&self) -> Result<Option<i64>>;

    fn subscribe(&self, sink: EventSink) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);
}

/// Platform-shipped configuration, reloadable at runtime.
pub trait ResourceConfig: Send + Sync {
    fn default_quota_bytes(&self) -> u64;

    fn subscribe(&self, sink: EventSink) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);
}

/// Network stack capability notifications.
pub trait NetworkEventSource: Send + Sync {
    /// Deliver a capability event for every change on networks matching
    /// `request`.
    fn register(&self, request: &NetworkRequest, sink: EventSink) -> SubscriptionId;

    fn unregister(&self, id: SubscriptionId);
}

/// Registry of subscribed sinks, shared by notification-producing
/// collaborators.
#[derive(Debug, Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    sinks: Mutex<HashMap<SubscriptionId, EventSink>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, sink: EventSink) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, sink);
        id
    }

    /// Returns `false` when `id` was not subscribed.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    /// Snapshot of the current sinks, so callers notify without holding the
    /// lock.
    pub fn sinks(&self) -> Vec<EventSink> {
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
