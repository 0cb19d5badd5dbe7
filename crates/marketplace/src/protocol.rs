//! Wire protocol for the compute marketplace
//!
//! Every negotiation message is one variant of [`MarketMessage`], serialized
//! as JSON into the payload of a signed transport record. The flow between a
//! consumer and a provider sharing a channel:
//!
//! 1. Provider publishes a handler advertisement (kind:31990) and a
//!    `ServiceAnnouncement` into the channel
//! 2. Consumer discovers providers, selects one, sends `JobRequest`
//! 3. Provider replies with `Invoice`
//! 4. Consumer locks a conditional payment (`HtlcLocked`; `PaymentSent`
//!    on the simple-payment path)
//! 5. Provider verifies the lock, executes, streams `StreamChunk`s and
//!    delivers `JobResult`
//! 6. Consumer releases the preimage (`PreimageRelease`); provider claims
//!
//! Job ids are derived deterministically from the request content (see
//! [`derive_job_id`]) so both sides agree on the id without a central
//! issuer.
//!
//! Inbound payloads are untrusted: a malformed message parses to `None`,
//! never a panic.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Record Kinds
// ============================================================================

/// Channel creation record (NIP-28 style)
pub const KIND_CHANNEL_CREATE: u16 = 40;

/// Channel message record carrying a serialized [`MarketMessage`]
pub const KIND_CHANNEL_MESSAGE: u16 = 42;

/// Global handler advertisement record (NIP-89 style)
pub const KIND_HANDLER_AD: u16 = 31990;

/// Width of the timestamp bucket used in job id derivation, in seconds
pub const JOB_ID_COARSE_SECS: u64 = 60;

/// What kind of work a provider sells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityKind {
    /// Prompt in, completion out
    TextGeneration,
    /// Long-running agentic tasks
    AgentTask,
}

impl CapabilityKind {
    /// Job request kind number for this capability
    pub fn job_kind(&self) -> u16 {
        match self {
            CapabilityKind::TextGeneration => 5050,
            CapabilityKind::AgentTask => 5930,
        }
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityKind::TextGeneration => write!(f, "text-generation"),
            CapabilityKind::AgentTask => write!(f, "agent-task"),
        }
    }
}

/// Lightning network a provider operates on
///
/// Providers advertise their network so consumers can filter before
/// requesting jobs; invoices whose bolt11 prefix disagrees with the
/// session's network are rejected before payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Bitcoin mainnet (production)
    Mainnet,
    /// Bitcoin testnet
    Testnet,
    /// Bitcoin signet
    Signet,
    /// Bitcoin regtest (local development)
    Regtest,
}

impl Network {
    /// Returns the bolt11 invoice prefix for this network
    pub fn bolt11_prefix(&self) -> &'static str {
        match self {
            Network::Mainnet => "lnbc",
            Network::Testnet => "lntb",
            Network::Signet => "lntbs",
            Network::Regtest => "lnbcrt",
        }
    }

    /// Parse network from a bolt11 invoice prefix
    pub fn from_bolt11(invoice: &str) -> Option<Self> {
        if invoice.starts_with("lnbcrt") {
            Some(Network::Regtest)
        } else if invoice.starts_with("lntbs") {
            Some(Network::Signet)
        } else if invoice.starts_with("lntb") {
            Some(Network::Testnet)
        } else if invoice.starts_with("lnbc") {
            Some(Network::Mainnet)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Signet => write!(f, "signet"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

/// The shared venue for a negotiation
///
/// Immutable once created; the channel id plus the relays it lives on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub channel_id: String,
    pub relay_urls: Vec<String>,
}

impl ChannelRef {
    pub fn new(channel_id: impl Into<String>, relay_urls: Vec<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            relay_urls,
        }
    }
}

impl std::fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.channel_id)
    }
}

// ============================================================================
// Message Envelope
// ============================================================================

/// Messages exchanged between marketplace participants
///
/// One message per transport record, tagged union on `type`. Every variant
/// except `ServiceAnnouncement` carries the job id it belongs to; the sender
/// identity is bound by the transport's signature, not repeated here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum MarketMessage {
    /// Provider announces an available service
    ServiceAnnouncement {
        provider_id: String,
        capability: CapabilityKind,
        price_msats: u64,
        /// Lightning network the provider settles on
        network: Network,
        /// Available models
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        models: Vec<String>,
        /// Where to negotiate
        channel: ChannelRef,
    },
    /// Consumer requests a job
    JobRequest {
        /// Deterministic id; receivers re-derive and drop mismatches
        job_id: String,
        kind: u16,
        prompt: String,
        max_tokens: u32,
        /// Pin a specific provider in a multi-provider channel
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_provider: Option<String>,
    },
    /// Provider quotes a price for the job
    Invoice {
        job_id: String,
        bolt11: String,
        amount_msats: u64,
        /// Payment hash for conditional payment verification (hex)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payment_hash: Option<String>,
    },
    /// Consumer confirms a payment action was taken
    PaymentSent { job_id: String, payment_id: String },
    /// Consumer notifies the provider that a conditional payment is locked
    ///
    /// Funds are held under `payment_hash` until the preimage is revealed or
    /// the lock expires. The provider must verify the lock through its own
    /// wallet before doing any work.
    HtlcLocked {
        job_id: String,
        /// Payment hash (hex) the lock is conditioned on
        payment_hash: String,
        /// Amount locked in millisatoshis
        amount_msats: u64,
        /// Seconds until the lock expires and funds refund to the consumer
        expiry_secs: u64,
    },
    /// Incremental result delivery while the job is processing
    ///
    /// Chunks never transition job state; only the terminal `JobResult`
    /// does, no matter how many chunks preceded it.
    StreamChunk {
        job_id: String,
        chunk: String,
        is_final: bool,
    },
    /// Provider delivers the final result
    JobResult { job_id: String, result: String },
    /// Consumer releases the preimage after accepting the result
    ///
    /// This is the unlock: with the preimage in hand the provider can claim
    /// the locked funds unilaterally.
    PreimageRelease {
        job_id: String,
        /// Preimage (hex) matching the invoice's payment hash
        preimage: String,
    },
    /// Provider reports that the job cannot be completed
    JobFailure { job_id: String, reason: String },
}

impl MarketMessage {
    /// Job id this message belongs to, if any
    pub fn job_id(&self) -> Option<&str> {
        match self {
            MarketMessage::ServiceAnnouncement { .. } => None,
            MarketMessage::JobRequest { job_id, .. }
            | MarketMessage::Invoice { job_id, .. }
            | MarketMessage::PaymentSent { job_id, .. }
            | MarketMessage::HtlcLocked { job_id, .. }
            | MarketMessage::StreamChunk { job_id, .. }
            | MarketMessage::JobResult { job_id, .. }
            | MarketMessage::PreimageRelease { job_id, .. }
            | MarketMessage::JobFailure { job_id, .. } => Some(job_id),
        }
    }

    /// Short name for logs
    pub fn kind_name(&self) -> &'static str {
        match self {
            MarketMessage::ServiceAnnouncement { .. } => "ServiceAnnouncement",
            MarketMessage::JobRequest { .. } => "JobRequest",
            MarketMessage::Invoice { .. } => "Invoice",
            MarketMessage::PaymentSent { .. } => "PaymentSent",
            MarketMessage::HtlcLocked { .. } => "HtlcLocked",
            MarketMessage::StreamChunk { .. } => "StreamChunk",
            MarketMessage::JobResult { .. } => "JobResult",
            MarketMessage::PreimageRelease { .. } => "PreimageRelease",
            MarketMessage::JobFailure { .. } => "JobFailure",
        }
    }
}

/// Parse a marketplace message from a record payload
///
/// Returns None for anything that is not a valid message; callers log and
/// drop. Inbound payloads are adversarial input.
pub fn parse_market_message(content: &str) -> Option<MarketMessage> {
    serde_json::from_str(content).ok()
}

/// Serialize a message for publishing
pub fn encode_market_message(msg: &MarketMessage) -> String {
    // MarketMessage contains no map keys that can fail to serialize
    serde_json::to_string(msg).unwrap_or_default()
}

// ============================================================================
// Job Id Derivation
// ============================================================================

/// Derive the deterministic job id for a request
///
/// Both sides compute `SHA-256(requester || target || SHA-256(prompt) ||
/// created_at / 60)` over the same signed record, so they agree on the id
/// without coordination. `target` is the pinned provider id, or the channel
/// id for open requests. Collisions collapse into the duplicate-request
/// no-op path.
pub fn derive_job_id(requester_id: &str, target: &str, prompt: &str, created_at: u64) -> String {
    let content_digest = Sha256::digest(prompt.as_bytes());
    let coarse = created_at / JOB_ID_COARSE_SECS;

    let mut hasher = Sha256::new();
    hasher.update(requester_id.as_bytes());
    hasher.update(b"|");
    hasher.update(target.as_bytes());
    hasher.update(b"|");
    hasher.update(content_digest);
    hasher.update(b"|");
    hasher.update(coarse.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// Current unix timestamp in seconds
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
