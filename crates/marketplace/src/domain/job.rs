//! Job records and the negotiation state machine
//!
//! One [`JobRecord`] exists per `job_id` on each side of a negotiation.
//! Inbound messages and local timers are normalized into [`JobEvent`]s;
//! [`JobRecord::apply`] maps `(side, state, event)` to the next state and
//! drops anything unmatched, so adversarial or out-of-order traffic can
//! never push a record backward or crash a session.

use crate::protocol::CapabilityKind;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition { from: JobState, to: JobState },

    #[error("Payment hash already recorded for job {0}")]
    PaymentHashChanged(String),
}

pub type Result<T> = std::result::Result<T, JobError>;

/// Which end of the negotiation a record belongs to
///
/// Both peers track the same job under the same id, but some transitions
/// are side-specific: a request timeout fails the consumer's record while
/// an unpaid invoice expires the provider's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSide {
    Provider,
    Consumer,
}

/// Lifecycle state of a negotiation
///
/// Every edge is one-directional; see [`JobState::can_advance`] for the
/// full table. `Claimed`, `Refunded`, `Failed` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Request sent (consumer) or received (provider), no invoice yet
    Requested,
    /// Provider has quoted a price
    Invoiced,
    /// Consumer has started payment or lock placement
    PaymentPending,
    /// Funds held under the payment hash
    EscrowLocked,
    /// Provider verified the lock and is executing
    Processing,
    /// Final result delivered, awaiting preimage release
    ResultDelivered,
    /// Consumer revealed the preimage
    Released,
    /// Provider redeemed the locked funds
    Claimed,
    /// Funds returned to the consumer after expiry
    Refunded,
    /// Negotiation failed before settling
    Failed,
    /// A negotiation window lapsed without the qualifying event
    Expired,
}

impl JobState {
    /// Terminal states absorb all further events
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Claimed | JobState::Refunded | JobState::Failed | JobState::Expired
        )
    }

    /// Whether `self -> to` is a legal edge
    ///
    /// Any non-terminal state may fail; everything else follows the
    /// negotiation order. `PaymentPending -> Processing` is the simple
    /// payment path where no lock is placed.
    pub fn can_advance(self, to: JobState) -> bool {
        use JobState as S;
        matches!(
            (self, to),
            (S::Requested, S::Invoiced)
                | (S::Invoiced, S::PaymentPending)
                | (S::Invoiced, S::Expired)
                | (S::PaymentPending, S::EscrowLocked)
                | (S::PaymentPending, S::Processing)
                | (S::EscrowLocked, S::Processing)
                | (S::EscrowLocked, S::Refunded)
                | (S::Processing, S::ResultDelivered)
                | (S::Processing, S::Refunded)
                | (S::ResultDelivered, S::Released)
                | (S::ResultDelivered, S::Refunded)
                | (S::ResultDelivered, S::Expired)
                | (S::Released, S::Claimed)
                | (S::Released, S::Refunded)
        ) || (!self.is_terminal() && to == JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Requested => "requested",
            JobState::Invoiced => "invoiced",
            JobState::PaymentPending => "payment_pending",
            JobState::EscrowLocked => "escrow_locked",
            JobState::Processing => "processing",
            JobState::ResultDelivered => "result_delivered",
            JobState::Released => "released",
            JobState::Claimed => "claimed",
            JobState::Refunded => "refunded",
            JobState::Failed => "failed",
            JobState::Expired => "expired",
        };
        write!(f, "{name}")
    }
}

/// Normalized trigger for a state transition
///
/// Sessions translate wire messages, wallet outcomes and timer expirations
/// into these before touching a record.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// An invoice was sent or received
    InvoiceReady,
    /// The consumer began settling the invoice
    PaymentStarted,
    /// A conditional lock was placed or announced
    LockPlaced,
    /// Execution began (after lock verification, or directly on simple payment)
    ExecutionStarted,
    /// A streaming chunk arrived
    ChunkArrived,
    /// The final result was sent or received
    ResultReady { content: String },
    /// The preimage was revealed
    PreimageReleased,
    /// The wallet settled a claim
    ClaimSettled,
    /// The wallet settled a refund
    RefundSettled,
    /// The counterparty or the local backend reported failure
    FailureReported { reason: String },
    /// The current state's negotiation window lapsed
    TimedOut,
    /// The escrow lock's expiry passed
    EscrowExpired,
}

/// One negotiation, tracked by one side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Which side owns this record
    pub side: JobSide,
    /// Deterministic id shared by both sides
    pub job_id: String,
    /// What kind of work was requested
    pub kind: CapabilityKind,
    /// Public key of the consumer
    pub requester_id: String,
    /// Public key of the selected provider
    pub provider_id: String,
    /// The prompt being paid for
    pub prompt: String,
    /// Token ceiling the requester put on the work order
    pub max_tokens: u32,
    /// Invoiced price in millisatoshis
    pub price_msats: Option<u64>,
    /// Lightning invoice from the provider
    pub bolt11: Option<String>,
    /// Hash the conditional payment is locked under; immutable once set
    pub payment_hash: Option<String>,
    /// Hash preimage; consumer-only until released
    pub preimage: Option<String>,
    /// Current lifecycle state
    pub state: JobState,
    /// Final result, populated at `ResultDelivered` or later
    pub result: Option<String>,
    /// Failure reason, populated at `Failed`
    pub error: Option<String>,
    /// When this record was created
    pub created_at: DateTime<Utc>,
    /// Last transition time
    pub updated_at: DateTime<Utc>,
    /// Deadline for the current state's expected event
    pub deadline_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a record in `Requested` for a fresh job
    pub fn new(
        side: JobSide,
        job_id: impl Into<String>,
        kind: CapabilityKind,
        requester_id: impl Into<String>,
        provider_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            side,
            job_id: job_id.into(),
            kind,
            requester_id: requester_id.into(),
            provider_id: provider_id.into(),
            prompt: prompt.into(),
            max_tokens: 1024,
            price_msats: None,
            bolt11: None,
            payment_hash: None,
            preimage: None,
            state: JobState::Requested,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            deadline_at: None,
        }
    }

    /// Apply a normalized event, returning the state after it
    ///
    /// `None` means the event did not match the current `(side, state)` and
    /// was dropped; the record is untouched. A `ChunkArrived` in
    /// `Processing` returns `Some(Processing)` without transitioning, since
    /// only the final result moves a streaming job forward.
    pub fn apply(&mut self, event: JobEvent) -> Option<JobState> {
        let target = self.target_for(&event)?;
        match &event {
            JobEvent::ResultReady { content } => self.result = Some(content.clone()),
            JobEvent::FailureReported { reason } => self.error = Some(reason.clone()),
            _ => {}
        }
        self.state = target;
        self.updated_at = Utc::now();
        Some(target)
    }

    fn target_for(&self, event: &JobEvent) -> Option<JobState> {
        use JobEvent as E;
        use JobState as S;
        match (self.side, self.state, event) {
            (_, S::Requested, E::InvoiceReady) => Some(S::Invoiced),
            (_, S::Invoiced, E::PaymentStarted) => Some(S::PaymentPending),
            (_, S::PaymentPending, E::LockPlaced) => Some(S::EscrowLocked),
            (_, S::EscrowLocked, E::ExecutionStarted) => Some(S::Processing),
            // Simple payment: no lock, execution follows payment directly
            (_, S::PaymentPending, E::ExecutionStarted) => Some(S::Processing),
            // A chunk observed before the execution signal still means work began
            (_, S::EscrowLocked | S::Processing, E::ChunkArrived) => Some(S::Processing),
            (_, S::Processing, E::ResultReady { .. }) => Some(S::ResultDelivered),
            (_, S::ResultDelivered, E::PreimageReleased) => Some(S::Released),
            (_, S::Released, E::ClaimSettled) => Some(S::Claimed),
            (
                _,
                S::EscrowLocked | S::Processing | S::ResultDelivered | S::Released,
                E::RefundSettled,
            ) => Some(S::Refunded),
            // A claim bounced off an expired lock; the funds went back
            (_, S::Released, E::EscrowExpired) => Some(S::Refunded),
            (JobSide::Consumer, S::Requested, E::TimedOut) => Some(S::Failed),
            (JobSide::Provider, S::Invoiced, E::TimedOut) => Some(S::Expired),
            (_, S::Processing, E::TimedOut) => Some(S::Failed),
            (JobSide::Provider, S::ResultDelivered, E::EscrowExpired) => Some(S::Expired),
            (_, state, E::FailureReported { .. }) if !state.is_terminal() => Some(S::Failed),
            _ => None,
        }
    }

    /// Force a transition along a legal edge
    pub fn advance(&mut self, to: JobState) -> Result<()> {
        if !self.state.can_advance(to) {
            return Err(JobError::IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Set the token ceiling from the work order
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Record the provider's quote
    pub fn set_invoice(&mut self, amount_msats: u64, bolt11: impl Into<String>) {
        self.price_msats = Some(amount_msats);
        self.bolt11 = Some(bolt11.into());
    }

    /// Record the escrow payment hash; rejected if a different one is set
    ///
    /// This is the hash the lock is conditioned on, generated by the
    /// consumer. It is distinct from any hash the payee's invoice carries.
    pub fn set_payment_hash(&mut self, payment_hash: &str) -> Result<()> {
        match &self.payment_hash {
            Some(existing) if existing != payment_hash => {
                Err(JobError::PaymentHashChanged(self.short_id()))
            }
            _ => {
                self.payment_hash = Some(payment_hash.to_string());
                Ok(())
            }
        }
    }

    /// Record the preimage (generated locally or learned from a release)
    pub fn set_preimage(&mut self, preimage: impl Into<String>) {
        self.preimage = Some(preimage.into());
    }

    /// Arm the deadline for the current state's expected event
    pub fn set_deadline(&mut self, secs: u64) {
        self.deadline_at = Some(Utc::now() + Duration::seconds(secs as i64));
    }

    /// Disarm the deadline after the qualifying event
    pub fn clear_deadline(&mut self) {
        self.deadline_at = None;
    }

    /// Whether the armed deadline has lapsed
    pub fn deadline_passed(&self) -> bool {
        self.deadline_at.map(|d| Utc::now() >= d).unwrap_or(false)
    }

    /// Check if the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Get a short display ID
    pub fn short_id(&self) -> String {
        self.job_id.get(..8).unwrap_or(&self.job_id).to_string()
    }
}
