//! Audit events for marketplace sessions
//!
//! Sessions emit these as negotiations progress; callers use them for
//! logging, balance reconciliation and test assertions. The stream is
//! observational only and never feeds back into state transitions.

use crate::domain::job::JobState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events emitted while a marketplace session runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketEvent {
    // Discovery events
    /// A provider announcement entered the discovery index
    ProviderDiscovered {
        provider_id: String,
        price_msats: u64,
        timestamp: DateTime<Utc>,
    },
    /// Discovery finished and a provider was selected
    ProviderSelected {
        provider_id: String,
        price_msats: u64,
        timestamp: DateTime<Utc>,
    },

    // Negotiation events
    /// The consumer sent a job request
    JobRequested {
        job_id: String,
        provider_id: String,
        timestamp: DateTime<Utc>,
    },
    /// The provider received a job request
    JobReceived {
        job_id: String,
        requester_id: String,
        timestamp: DateTime<Utc>,
    },
    /// The provider quoted a price
    InvoiceIssued {
        job_id: String,
        amount_msats: u64,
        timestamp: DateTime<Utc>,
    },
    /// The consumer paid an invoice directly (no escrow)
    PaymentDispatched {
        job_id: String,
        amount_msats: u64,
        timestamp: DateTime<Utc>,
    },

    // Escrow events
    /// Funds were locked under a payment hash
    EscrowLocked {
        job_id: String,
        amount_msats: u64,
        expiry_secs: u64,
        timestamp: DateTime<Utc>,
    },
    /// The provider verified the lock through its wallet
    LockVerified {
        job_id: String,
        timestamp: DateTime<Utc>,
    },
    /// The locked funds were claimed with the preimage
    EscrowClaimed {
        job_id: String,
        amount_msats: u64,
        timestamp: DateTime<Utc>,
    },
    /// The locked funds were returned after expiry
    EscrowRefunded {
        job_id: String,
        amount_msats: u64,
        timestamp: DateTime<Utc>,
    },

    // Execution events
    /// Work began on the backend
    ExecutionStarted {
        job_id: String,
        timestamp: DateTime<Utc>,
    },
    /// The final result was delivered
    ResultDelivered {
        job_id: String,
        bytes: usize,
        timestamp: DateTime<Utc>,
    },
    /// The consumer revealed the preimage
    PreimageReleased {
        job_id: String,
        timestamp: DateTime<Utc>,
    },

    // Terminal events
    /// A record changed state
    StateChanged {
        job_id: String,
        from: JobState,
        to: JobState,
        timestamp: DateTime<Utc>,
    },
    /// The negotiation failed
    JobFailed {
        job_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// A negotiation window lapsed without its qualifying event
    JobExpired {
        job_id: String,
        state: JobState,
        timestamp: DateTime<Utc>,
    },
}

impl MarketEvent {
    /// Get the timestamp of the event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            MarketEvent::ProviderDiscovered { timestamp, .. } => *timestamp,
            MarketEvent::ProviderSelected { timestamp, .. } => *timestamp,
            MarketEvent::JobRequested { timestamp, .. } => *timestamp,
            MarketEvent::JobReceived { timestamp, .. } => *timestamp,
            MarketEvent::InvoiceIssued { timestamp, .. } => *timestamp,
            MarketEvent::PaymentDispatched { timestamp, .. } => *timestamp,
            MarketEvent::EscrowLocked { timestamp, .. } => *timestamp,
            MarketEvent::LockVerified { timestamp, .. } => *timestamp,
            MarketEvent::EscrowClaimed { timestamp, .. } => *timestamp,
            MarketEvent::EscrowRefunded { timestamp, .. } => *timestamp,
            MarketEvent::ExecutionStarted { timestamp, .. } => *timestamp,
            MarketEvent::ResultDelivered { timestamp, .. } => *timestamp,
            MarketEvent::PreimageReleased { timestamp, .. } => *timestamp,
            MarketEvent::StateChanged { timestamp, .. } => *timestamp,
            MarketEvent::JobFailed { timestamp, .. } => *timestamp,
            MarketEvent::JobExpired { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job id the event concerns, if any
    pub fn job_id(&self) -> Option<&str> {
        match self {
            MarketEvent::ProviderDiscovered { .. } | MarketEvent::ProviderSelected { .. } => None,
            MarketEvent::JobRequested { job_id, .. }
            | MarketEvent::JobReceived { job_id, .. }
            | MarketEvent::InvoiceIssued { job_id, .. }
            | MarketEvent::PaymentDispatched { job_id, .. }
            | MarketEvent::EscrowLocked { job_id, .. }
            | MarketEvent::LockVerified { job_id, .. }
            | MarketEvent::EscrowClaimed { job_id, .. }
            | MarketEvent::EscrowRefunded { job_id, .. }
            | MarketEvent::ExecutionStarted { job_id, .. }
            | MarketEvent::ResultDelivered { job_id, .. }
            | MarketEvent::PreimageReleased { job_id, .. }
            | MarketEvent::StateChanged { job_id, .. }
            | MarketEvent::JobFailed { job_id, .. }
            | MarketEvent::JobExpired { job_id, .. } => Some(job_id),
        }
    }

    /// Get a short description of the event for logging
    pub fn description(&self) -> String {
        match self {
            MarketEvent::ProviderDiscovered {
                provider_id,
                price_msats,
                ..
            } => {
                format!(
                    "Provider discovered: {} at {} msats",
                    short(provider_id),
                    price_msats
                )
            }
            MarketEvent::ProviderSelected {
                provider_id,
                price_msats,
                ..
            } => {
                format!(
                    "Provider selected: {} at {} msats",
                    short(provider_id),
                    price_msats
                )
            }
            MarketEvent::JobRequested {
                job_id,
                provider_id,
                ..
            } => {
                format!("Job requested: {} from {}", short(job_id), short(provider_id))
            }
            MarketEvent::JobReceived {
                job_id,
                requester_id,
                ..
            } => {
                format!("Job received: {} from {}", short(job_id), short(requester_id))
            }
            MarketEvent::InvoiceIssued {
                job_id,
                amount_msats,
                ..
            } => {
                format!("Invoice issued: {} for {} msats", short(job_id), amount_msats)
            }
            MarketEvent::PaymentDispatched {
                job_id,
                amount_msats,
                ..
            } => {
                format!("Payment sent: {} for {} msats", short(job_id), amount_msats)
            }
            MarketEvent::EscrowLocked {
                job_id,
                amount_msats,
                expiry_secs,
                ..
            } => {
                format!(
                    "Escrow locked: {} for {} msats, expires in {}s",
                    short(job_id),
                    amount_msats,
                    expiry_secs
                )
            }
            MarketEvent::LockVerified { job_id, .. } => {
                format!("Lock verified: {}", short(job_id))
            }
            MarketEvent::EscrowClaimed {
                job_id,
                amount_msats,
                ..
            } => {
                format!("Escrow claimed: {} for {} msats", short(job_id), amount_msats)
            }
            MarketEvent::EscrowRefunded {
                job_id,
                amount_msats,
                ..
            } => {
                format!("Escrow refunded: {} for {} msats", short(job_id), amount_msats)
            }
            MarketEvent::ExecutionStarted { job_id, .. } => {
                format!("Execution started: {}", short(job_id))
            }
            MarketEvent::ResultDelivered { job_id, bytes, .. } => {
                format!("Result delivered: {} ({} bytes)", short(job_id), bytes)
            }
            MarketEvent::PreimageReleased { job_id, .. } => {
                format!("Preimage released: {}", short(job_id))
            }
            MarketEvent::StateChanged {
                job_id, from, to, ..
            } => {
                format!("State changed: {} {} -> {}", short(job_id), from, to)
            }
            MarketEvent::JobFailed { job_id, reason, .. } => {
                format!("Job failed: {} - {}", short(job_id), reason)
            }
            MarketEvent::JobExpired { job_id, state, .. } => {
                format!("Job expired: {} while {}", short(job_id), state)
            }
        }
    }
}

// Ids come off the wire as arbitrary strings; never byte-slice them.
fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
