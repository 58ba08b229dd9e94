//! Events funnelled into the tracker's single serialization point.

use std::fmt;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::network::{NetworkCapabilities, NetworkId};

/// Monotonic tag of one threshold arming. A callback carrying a token other
/// than the currently armed one is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArmToken(pub u64);

impl fmt::Display for ArmToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arm#{}", self.0)
    }
}

/// Notification delivered to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    CapabilitiesChanged {
        network: NetworkId,
        capabilities: NetworkCapabilities,
    },
    NetworkLost {
        network: NetworkId,
    },
    SettingsChanged,
    ConfigChanged,
    ThresholdReached {
        token: ArmToken,
    },
}

impl TrackerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerEvent::CapabilitiesChanged { .. } => "capabilities_changed",
            TrackerEvent::NetworkLost { .. } => "network_lost",
            TrackerEvent::SettingsChanged => "settings_changed",
            TrackerEvent::ConfigChanged => "config_changed",
            TrackerEvent::ThresholdReached { .. } => "threshold_reached",
        }
    }
}

/// Messages read by the tracker loop.
#[derive(Debug)]
pub(crate) enum Command {
    Event(TrackerEvent),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle collaborators use to deliver notifications.
///
/// Sending after the tracker stopped is silently dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Command>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    pub fn send(&self, event: TrackerEvent) {
        let kind = event.kind();
        if self.tx.send(Command::Event(event)).is_err() {
            debug!(event = kind, "Tracker stopped; dropping event");
        }
    }

    pub fn capabilities_changed(&self, network: NetworkId, capabilities: NetworkCapabilities) {
        self.send(TrackerEvent::CapabilitiesChanged {
            network,
            capabilities,
        });
    }

    pub fn network_lost(&self, network: NetworkId) {
        self.send(TrackerEvent::NetworkLost { network });
    }

    pub fn settings_changed(&self) {
        self.send(TrackerEvent::SettingsChanged);
    }

    pub fn config_changed(&self) {
        self.send(TrackerEvent::ConfigChanged);
    }

    /// Whether the tracker loop behind this sink has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Callback handed to the usage statistics service with each threshold
/// registration.
#[derive(Debug, Clone)]
pub struct ThresholdNotifier {
    token: ArmToken,
    sink: EventSink,
}

impl ThresholdNotifier {
    pub(crate) fn new(token: ArmToken, sink: EventSink) -> Self {
        Self { token, sink }
    }

    pub fn token(&self) -> ArmToken {
        self.token
    }

    /// Report that usage crossed the registered threshold.
    pub fn notify(&self) {
        self.sink
            .send(TrackerEvent::ThresholdReached { token: self.token });
    }
}
