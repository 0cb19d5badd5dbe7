//! Escrow coordination over hash-locked conditional payments
//!
//! The coordinator does not move funds; the [`Wallet`] collaborator does.
//! What lives here is the protocol discipline around the hash lock:
//!
//! - the consumer generates a random 32-byte preimage and shares only its
//!   SHA-256 (`payment_hash`)
//! - funds lock under the hash with an expiry; the provider must verify the
//!   lock through its own wallet before doing any work
//! - the preimage is revealed only after the result is delivered; claiming
//!   with it is a one-step atomic wallet operation
//! - if the expiry passes unclaimed, the consumer reclaims the funds
//!
//! Claim and refund are safe to retry: a network partition can hide a
//! success, so the caller may repeat a call whose prior attempt already
//! settled. Every settled transition lands in the audit history.

use crate::wallet::{LockHandle, Wallet, WalletError};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Preimage length in bytes, fixed by the lock construction
pub const PREIMAGE_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("No escrow tracked for job {0}")]
    UnknownJob(String),

    #[error("Job {job_id} already has a lock under a different payment hash")]
    LockMismatch { job_id: String },

    #[error("Preimage does not match the recorded payment hash")]
    HashMismatch,

    #[error("Invalid payment hash: {0}")]
    InvalidPaymentHash(String),

    #[error(transparent)]
    Wallet(#[from] WalletError),
}

pub type Result<T> = std::result::Result<T, EscrowError>;

/// Where a tracked lock stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    /// Funds held under the payment hash
    Locked,
    /// Funds settled to the payee
    Claimed,
    /// Funds returned to the payer after expiry
    Refunded,
}

/// Per-job escrow book-keeping
#[derive(Debug, Clone)]
pub struct EscrowState {
    pub job_id: String,
    pub payment_hash: String,
    pub amount_msats: u64,
    pub lock_handle: LockHandle,
    pub expiry_secs: u64,
    pub status: EscrowStatus,
    pub locked_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// One settled escrow transition, retained for audit
#[derive(Debug, Clone)]
pub struct EscrowAuditEntry {
    pub job_id: String,
    pub status: EscrowStatus,
    pub amount_msats: u64,
    pub at: DateTime<Utc>,
}

/// Generate a fresh preimage and its payment hash, both hex-encoded
///
/// Consumer-only: the provider must never learn the preimage before the
/// result is delivered and released.
pub fn generate_preimage() -> (String, String) {
    let bytes: [u8; PREIMAGE_LEN] = rand::rng().random();
    let payment_hash = hex::encode(Sha256::digest(bytes));
    (hex::encode(bytes), payment_hash)
}

/// Check a hex preimage against a hex payment hash
///
/// Malformed hex is simply a non-match; adversarial input must never panic
/// here.
pub fn verify_preimage(preimage: &str, payment_hash: &str) -> bool {
    let Ok(bytes) = hex::decode(preimage) else {
        return false;
    };
    if bytes.len() != PREIMAGE_LEN {
        return false;
    }
    hex::encode(Sha256::digest(&bytes)).eq_ignore_ascii_case(payment_hash)
}

/// A payment hash is exactly 32 bytes of hex
pub fn validate_payment_hash(payment_hash: &str) -> bool {
    payment_hash.len() == 64 && hex::decode(payment_hash).map(|b| b.len() == 32).unwrap_or(false)
}

/// Tracks every conditional payment one side participates in
///
/// Both sides run one: the consumer drives `lock`/`release`/
/// `refund_if_expired`, the provider drives `track`/`verify_lock`/`claim`.
pub struct EscrowCoordinator {
    wallet: Arc<dyn Wallet>,
    states: Mutex<HashMap<String, EscrowState>>,
    history: Mutex<Vec<EscrowAuditEntry>>,
}

impl EscrowCoordinator {
    pub fn new(wallet: Arc<dyn Wallet>) -> Self {
        Self {
            wallet,
            states: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Lock funds for a job (consumer side)
    ///
    /// Idempotent per job: repeating the call with the same payment hash
    /// returns the existing handle; a different hash for a known job is
    /// rejected.
    pub async fn lock(
        &self,
        job_id: &str,
        payment_hash: &str,
        amount_msats: u64,
        expiry_secs: u64,
    ) -> Result<LockHandle> {
        if !validate_payment_hash(payment_hash) {
            return Err(EscrowError::InvalidPaymentHash(payment_hash.to_string()));
        }

        {
            let states = self.states.lock().await;
            if let Some(existing) = states.get(job_id) {
                if existing.payment_hash != payment_hash {
                    return Err(EscrowError::LockMismatch {
                        job_id: job_id.to_string(),
                    });
                }
                return Ok(existing.lock_handle.clone());
            }
        }

        let handle = self
            .wallet
            .lock_conditional(amount_msats, payment_hash, expiry_secs)
            .await?;
        tracing::info!(
            "escrow locked: job {} amount {} msats expiry {}s",
            job_id.get(..8).unwrap_or(job_id),
            amount_msats,
            expiry_secs
        );

        let mut states = self.states.lock().await;
        states.entry(job_id.to_string()).or_insert_with(|| EscrowState {
            job_id: job_id.to_string(),
            payment_hash: payment_hash.to_string(),
            amount_msats,
            lock_handle: handle.clone(),
            expiry_secs,
            status: EscrowStatus::Locked,
            locked_at: Utc::now(),
            settled_at: None,
        });
        Ok(handle)
    }

    /// Start tracking a lock announced by the counterparty (provider side)
    ///
    /// The provider cannot create the lock, only observe the announcement;
    /// `verify_lock` then checks it against the wallet before execution.
    pub async fn track(
        &self,
        job_id: &str,
        payment_hash: &str,
        amount_msats: u64,
        expiry_secs: u64,
    ) -> Result<()> {
        if !validate_payment_hash(payment_hash) {
            return Err(EscrowError::InvalidPaymentHash(payment_hash.to_string()));
        }

        let mut states = self.states.lock().await;
        if let Some(existing) = states.get(job_id) {
            if existing.payment_hash != payment_hash {
                return Err(EscrowError::LockMismatch {
                    job_id: job_id.to_string(),
                });
            }
            return Ok(());
        }
        states.insert(
            job_id.to_string(),
            EscrowState {
                job_id: job_id.to_string(),
                payment_hash: payment_hash.to_string(),
                amount_msats,
                lock_handle: LockHandle::for_payment_hash(payment_hash),
                expiry_secs,
                status: EscrowStatus::Locked,
                locked_at: Utc::now(),
                settled_at: None,
            },
        );
        Ok(())
    }

    /// Mandatory provider-side check: are the funds actually locked?
    ///
    /// Goes through the wallet. A provider that skips this is vulnerable to
    /// a consumer who announces a lock that was never placed.
    pub async fn verify_lock(&self, job_id: &str) -> Result<bool> {
        let (payment_hash, amount_msats) = {
            let states = self.states.lock().await;
            let state = states
                .get(job_id)
                .ok_or_else(|| EscrowError::UnknownJob(job_id.to_string()))?;
            (state.payment_hash.clone(), state.amount_msats)
        };
        Ok(self
            .wallet
            .verify_conditional(&payment_hash, amount_msats)
            .await?)
    }

    /// Validate a preimage against a job's recorded hash before revealing it
    ///
    /// Consumer side; guards against releasing a secret that does not match
    /// what was locked.
    pub async fn release(&self, job_id: &str, preimage: &str) -> Result<()> {
        let states = self.states.lock().await;
        let state = states
            .get(job_id)
            .ok_or_else(|| EscrowError::UnknownJob(job_id.to_string()))?;
        if !verify_preimage(preimage, &state.payment_hash) {
            return Err(EscrowError::HashMismatch);
        }
        Ok(())
    }

    /// Redeem the lock with a revealed preimage (provider side)
    ///
    /// Returns false when the wallet rejects the claim (hash mismatch or
    /// expiry). Safe to retry after success.
    pub async fn claim(&self, job_id: &str, preimage: &str) -> Result<bool> {
        let (handle, amount_msats) = {
            let states = self.states.lock().await;
            let state = states
                .get(job_id)
                .ok_or_else(|| EscrowError::UnknownJob(job_id.to_string()))?;
            (state.lock_handle.clone(), state.amount_msats)
        };

        let claimed = self.wallet.claim_conditional(&handle, preimage).await?;
        if claimed {
            self.settle(job_id, EscrowStatus::Claimed, amount_msats).await;
        }
        Ok(claimed)
    }

    /// Reclaim funds once the lock's expiry has passed (consumer side)
    ///
    /// Returns false while the lock is live or already claimed. Safe to
    /// retry after success; funds move at most once.
    pub async fn refund_if_expired(&self, job_id: &str) -> Result<bool> {
        let (handle, amount_msats) = {
            let states = self.states.lock().await;
            let state = states
                .get(job_id)
                .ok_or_else(|| EscrowError::UnknownJob(job_id.to_string()))?;
            (state.lock_handle.clone(), state.amount_msats)
        };

        let refunded = self.wallet.refund_conditional(&handle).await?;
        if refunded {
            self.settle(job_id, EscrowStatus::Refunded, amount_msats).await;
        }
        Ok(refunded)
    }

    /// Snapshot of a job's escrow state
    pub async fn state(&self, job_id: &str) -> Option<EscrowState> {
        self.states.lock().await.get(job_id).cloned()
    }

    /// Settled transitions, oldest first
    pub async fn history(&self) -> Vec<EscrowAuditEntry> {
        self.history.lock().await.clone()
    }

    async fn settle(&self, job_id: &str, status: EscrowStatus, amount_msats: u64) {
        let mut states = self.states.lock().await;
        let already = states
            .get(job_id)
            .map(|s| s.status == status)
            .unwrap_or(false);
        if let Some(state) = states.get_mut(job_id) {
            state.status = status;
            if state.settled_at.is_none() {
                state.settled_at = Some(Utc::now());
            }
        }
        drop(states);

        // Record each settlement once, even under retries
        if !already {
            self.history.lock().await.push(EscrowAuditEntry {
                job_id: job_id.to_string(),
                status,
                amount_msats,
                at: Utc::now(),
            });
        }
    }
}
