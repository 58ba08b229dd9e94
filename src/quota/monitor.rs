//! Ownership of the single usage-threshold registration.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::events::{ArmToken, EventSink, ThresholdNotifier};
use crate::error::Result;
use crate::network::{NetworkId, NetworkTemplate, TrackedNetwork};
use crate::providers::{RegistrationId, UsageStatisticsService};

/// The live usage-watchdog registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmedThreshold {
    pub token: ArmToken,
    pub network: NetworkId,
    pub template: NetworkTemplate,
    pub threshold_bytes: u64,
    pub registration: RegistrationId,
    /// The statistics service reported the threshold as reached.
    pub fired: bool,
}

/// Holds at most one [`ArmedThreshold`].
///
/// Every [`rearm`](Self::rearm) cancels the previous registration before
/// installing the next, and each registration carries a fresh
/// [`ArmToken`]. Callbacks for any other token are stale.
///
/// A registration whose unregister failed is kept as orphaned and retried
/// once on the next teardown, before anything new is installed.
pub struct UsageMonitor {
    stats: Arc<dyn UsageStatisticsService>,
    sink: EventSink,
    next_token: u64,
    armed: Option<ArmedThreshold>,
    orphaned: Option<RegistrationId>,
}

impl UsageMonitor {
    pub fn new(stats: Arc<dyn UsageStatisticsService>, sink: EventSink) -> Self {
        Self {
            stats,
            sink,
            next_token: 1,
            armed: None,
            orphaned: None,
        }
    }

    pub fn armed(&self) -> Option<&ArmedThreshold> {
        self.armed.as_ref()
    }

    /// Registration whose unregister failed and is awaiting a retry.
    pub fn orphaned(&self) -> Option<RegistrationId> {
        self.orphaned
    }

    /// Whether `token` belongs to the live registration.
    pub fn is_current(&self, token: ArmToken) -> bool {
        self.armed.as_ref().is_some_and(|a| a.token == token)
    }

    /// Record that the live registration fired. Returns `false` for a stale
    /// token.
    pub fn mark_fired(&mut self, token: ArmToken) -> bool {
        match self.armed.as_mut() {
            Some(armed) if armed.token == token => {
                armed.fired = true;
                true
            }
            _ => false,
        }
    }

    /// Replace the current registration with one for `network` at
    /// `threshold_bytes`.
    ///
    /// On registration failure nothing stays armed and the error is
    /// returned.
    pub async fn rearm(
        &mut self,
        network: &TrackedNetwork,
        threshold_bytes: u64,
    ) -> Result<&ArmedThreshold> {
        self.teardown().await;

        let token = ArmToken(self.next_token);
        self.next_token += 1;
        let template = network.template();
        let notifier = ThresholdNotifier::new(token, self.sink.clone());

        let registration = self
            .stats
            .register_threshold(&template, threshold_bytes, notifier)
            .await?;

        info!(
            network = %network.id,
            %token,
            %registration,
            threshold_bytes,
            "Armed usage threshold"
        );

        Ok(&*self.armed.insert(ArmedThreshold {
            token,
            network: network.id,
            template,
            threshold_bytes,
            registration,
            fired: false,
        }))
    }

    /// Cancel the current registration, if any.
    pub async fn teardown(&mut self) {
        self.retry_orphaned().await;
        let Some(previous) = self.armed.take() else {
            debug!("No usage threshold armed; nothing to tear down");
            return;
        };
        // Taken out before unregistering: a callback racing the unregister
        // no longer matches the armed token.
        if let Err(err) = self.stats.unregister(previous.registration).await {
            warn!(
                registration = %previous.registration,
                error = %err,
                "Failed to unregister usage threshold; will retry"
            );
            self.orphaned = Some(previous.registration);
            return;
        }
        info!(
            network = %previous.network,
            token = %previous.token,
            registration = %previous.registration,
            "Tore down usage threshold"
        );
    }

    async fn retry_orphaned(&mut self) {
        let Some(registration) = self.orphaned.take() else {
            return;
        };
        match self.stats.unregister(registration).await {
            Ok(()) => info!(%registration, "Unregistered orphaned usage threshold"),
            Err(err) => warn!(
                %registration,
                error = %err,
                "Abandoning orphaned usage threshold; it may still be registered"
            ),
        }
    }
}
