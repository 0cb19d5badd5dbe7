//! Session configuration
//!
//! Every negotiation window is a timeout, not a lock; the values here bound
//! how long each side waits in each state. Defaults suit interactive use
//! against a live counterparty; `quick()` presets keep tests fast.

use crate::domain::discovery::SelectionPolicy;
use crate::protocol::{CapabilityKind, Network};
use crate::relay::DEFAULT_RELAY;
use serde::{Deserialize, Serialize};

/// Per-state negotiation windows, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Consumer: how long to wait for an `Invoice` after requesting
    pub invoice_secs: u64,
    /// Provider: how long to wait for a payment action after invoicing
    pub payment_secs: u64,
    /// Consumer: how long to wait for execution signs after paying
    pub pay_ack_secs: u64,
    /// Both: how long execution may run before it counts as failed
    pub execution_secs: u64,
    /// Provider: how long to wait for a release before reminding once
    pub release_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            invoice_secs: 30,
            payment_secs: 60,
            pay_ack_secs: 30,
            execution_secs: 120,
            release_secs: 60,
        }
    }
}

impl TimeoutConfig {
    /// Short windows for tests
    pub fn quick() -> Self {
        Self {
            invoice_secs: 2,
            payment_secs: 2,
            pay_ack_secs: 2,
            execution_secs: 5,
            release_secs: 2,
        }
    }
}

/// Discovery and announcement cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Consumer: how long to collect announcements before selecting
    pub window_secs: u64,
    /// Provider: seconds between re-announcements
    pub announce_interval_secs: u64,
    /// Consumer: drop listings not re-announced within this many seconds
    pub listing_ttl_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            window_secs: 5,
            announce_interval_secs: 30,
            listing_ttl_secs: 300,
        }
    }
}

impl DiscoveryConfig {
    /// Short windows for tests
    pub fn quick() -> Self {
        Self {
            window_secs: 1,
            announce_interval_secs: 1,
            listing_ttl_secs: 60,
        }
    }
}

/// Conditional payment parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowConfig {
    /// Seconds until a lock expires and funds refund to the consumer
    pub expiry_secs: u64,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self { expiry_secs: 3600 }
    }
}

impl EscrowConfig {
    pub fn with_expiry(mut self, expiry_secs: u64) -> Self {
        self.expiry_secs = expiry_secs;
        self
    }
}

/// Provider session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Channel the provider serves
    pub channel_id: String,
    /// Relays named in announcements
    pub relay_urls: Vec<String>,
    /// What kind of work is offered
    pub capability: CapabilityKind,
    /// Advertised price in millisatoshis
    pub price_msats: u64,
    /// Settlement network
    pub network: Network,
    /// Models named in announcements
    pub models: Vec<String>,
    /// Also publish a global handler advertisement
    pub announce: bool,
    /// Deliver results incrementally as stream chunks
    pub stream: bool,
    /// Require a verified lock before executing; otherwise a plain
    /// `PaymentSent` is accepted
    pub require_htlc: bool,
    pub timeouts: TimeoutConfig,
    pub discovery: DiscoveryConfig,
}

impl ProviderConfig {
    pub fn new(channel_id: impl Into<String>, price_msats: u64) -> Self {
        Self {
            channel_id: channel_id.into(),
            relay_urls: vec![DEFAULT_RELAY.to_string()],
            capability: CapabilityKind::TextGeneration,
            price_msats,
            network: Network::Regtest,
            models: Vec::new(),
            announce: true,
            stream: false,
            require_htlc: true,
            timeouts: TimeoutConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }

    pub fn with_capability(mut self, capability: CapabilityKind) -> Self {
        self.capability = capability;
        self
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_require_htlc(mut self, require_htlc: bool) -> Self {
        self.require_htlc = require_htlc;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }
}

/// Consumer session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Channel to negotiate on
    pub channel_id: String,
    /// Settlement network; invoices from other networks are rejected
    pub network: Network,
    /// How to pick among discovered providers
    pub policy: SelectionPolicy,
    /// Refuse invoices above this price
    pub max_price_msats: Option<u64>,
    /// Token budget forwarded with requests
    pub max_tokens: u32,
    /// Lock funds conditionally instead of paying the invoice outright
    pub use_htlc: bool,
    /// Run a discovery window before selecting; otherwise the first
    /// announcement on the channel wins
    pub discover: bool,
    pub timeouts: TimeoutConfig,
    pub discovery: DiscoveryConfig,
    pub escrow: EscrowConfig,
}

impl ConsumerConfig {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            network: Network::Regtest,
            policy: SelectionPolicy::Cheapest,
            max_price_msats: None,
            max_tokens: 1024,
            use_htlc: true,
            discover: true,
            timeouts: TimeoutConfig::default(),
            discovery: DiscoveryConfig::default(),
            escrow: EscrowConfig::default(),
        }
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_price(mut self, max_price_msats: u64) -> Self {
        self.max_price_msats = Some(max_price_msats);
        self
    }

    pub fn with_use_htlc(mut self, use_htlc: bool) -> Self {
        self.use_htlc = use_htlc;
        self
    }

    pub fn with_discover(mut self, discover: bool) -> Self {
        self.discover = discover;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_escrow(mut self, escrow: EscrowConfig) -> Self {
        self.escrow = escrow;
        self
    }
}
