//! Session-level errors
//!
//! Failures inside a negotiation end up as terminal record states, not
//! errors; `MarketError` covers what prevents a negotiation from running
//! or settling at all, plus pass-through from the collaborator seams.

use crate::backends::BackendError;
use crate::domain::job::JobError;
use crate::escrow::EscrowError;
use crate::relay::RelayError;
use crate::wallet::WalletError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("No provider found matching the filter")]
    NoProviderFound,

    #[error("No invoice within {0}s")]
    InvoiceTimeout(u64),

    #[error("Payment verification failed: {0}")]
    PaymentVerificationFailed(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("No result within {0}s")]
    ResultTimeout(u64),

    #[error("Claim after escrow expiry for job {0}")]
    ClaimAfterExpiry(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Duplicate job id {0}")]
    DuplicateJobId(String),

    #[error("Invoice for {quoted} msats exceeds budget of {budget} msats")]
    OverBudget { quoted: u64, budget: u64 },

    #[error("Invoice network mismatch: expected {expected}, got {actual}")]
    NetworkMismatch { expected: String, actual: String },

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, MarketError>;
