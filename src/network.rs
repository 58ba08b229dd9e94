//! Network identity, capabilities, and the template used to query usage.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a network as handed out by the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(pub u64);

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net:{}", self.0)
    }
}

/// Physical transport backing a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Cellular,
    Wifi,
    Ethernet,
    Bluetooth,
    Vpn,
}

/// Capabilities observed on a network at its last capability change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCapabilities {
    pub transports: Vec<TransportKind>,
    #[serde(default)]
    pub internet: bool,
    #[serde(default)]
    pub roaming: bool,
    #[serde(default = "default_metered")]
    pub metered: bool,
    /// Subscriber backing the network, when the stack could resolve one.
    #[serde(default)]
    pub subscriber_id: Option<String>,
}

fn default_metered() -> bool {
    true
}

impl NetworkCapabilities {
    /// Capabilities of a metered, non-roaming cellular network with internet.
    pub fn cellular(subscriber_id: impl Into<String>) -> Self {
        Self {
            transports: vec![TransportKind::Cellular],
            internet: true,
            roaming: false,
            metered: true,
            subscriber_id: Some(subscriber_id.into()),
        }
    }

    pub fn with_roaming(mut self, roaming: bool) -> Self {
        self.roaming = roaming;
        self
    }

    pub fn has_transport(&self, transport: TransportKind) -> bool {
        self.transports.contains(&transport)
    }
}

/// Filter registered with the network event source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    pub transport: TransportKind,
    pub require_internet: bool,
}

impl NetworkRequest {
    /// The request the tracker registers: cellular with internet.
    pub fn metered_cellular() -> Self {
        Self {
            transport: TransportKind::Cellular,
            require_internet: true,
        }
    }

    pub fn matches(&self, caps: &NetworkCapabilities) -> bool {
        caps.has_transport(self.transport) && (!self.require_internet || caps.internet)
    }
}

/// Kind of opportunistic quota asked of the subscription layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaKind {
    Multipath,
}

/// Which usage records a query or threshold registration covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkTemplate {
    pub transport: TransportKind,
    pub subscriber_id: Option<String>,
    pub metered: bool,
}

impl fmt::Display for NetworkTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{}/{}",
            self.transport,
            self.subscriber_id.as_deref().unwrap_or("*"),
            if self.metered { "metered" } else { "unmetered" }
        )
    }
}

/// The network currently eligible for opportunistic budgeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedNetwork {
    pub id: NetworkId,
    pub capabilities: NetworkCapabilities,
}

impl TrackedNetwork {
    pub fn new(id: NetworkId, capabilities: NetworkCapabilities) -> Self {
        Self { id, capabilities }
    }

    pub fn subscriber_id(&self) -> Option<&str> {
        self.capabilities.subscriber_id.as_deref()
    }

    pub fn is_metered(&self) -> bool {
        self.capabilities.metered
    }

    /// Template matching this network's traffic in the usage statistics.
    pub fn template(&self) -> NetworkTemplate {
        NetworkTemplate {
            transport: TransportKind::Cellular,
            subscriber_id: self.capabilities.subscriber_id.clone(),
            metered: self.capabilities.metered,
        }
    }
}
