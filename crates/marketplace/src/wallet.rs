//! Wallet collaborator
//!
//! The engine never moves funds itself; it drives a [`Wallet`] through six
//! operations plus a read-only lock check. The trust-critical ones are the
//! conditional transfers: funds locked under a payment hash release to
//! whoever presents the matching preimage before expiry, and refund to the
//! payer afterwards. The wallet is the arbiter of both the hash check and
//! the clock.
//!
//! [`MemoryLedger`] is the reference rail: one shared balance sheet with
//! per-party [`LedgerWallet`] handles, synthetic bolt11-prefixed invoices
//! and real SHA-256 verification on claims. It backs the binaries' local
//! mode and every escrow test.

use crate::protocol::Network;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Insufficient balance: available {available} msats, required {required} msats")]
    InsufficientBalance { available: u64, required: u64 },

    #[error("Unknown invoice: {0}")]
    UnknownInvoice(String),

    #[error("Invoice expired: {0}")]
    InvoiceExpired(String),

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Invalid payment hash: {0}")]
    InvalidPaymentHash(String),

    #[error("Lock already exists for payment hash {0} with different terms")]
    ConflictingLock(String),

    #[error("Wallet backend failure: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, WalletError>;

/// A payment request minted by the payee's wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    pub bolt11: String,
    pub amount_msats: u64,
    /// Hash the invoice settles against, when the rail exposes it
    pub payment_hash: Option<String>,
    pub memo: String,
    pub expiry_secs: u64,
}

/// Proof that a payment settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentProof {
    pub payment_id: String,
    pub amount_msats: u64,
}

/// Opaque reference to a conditional lock
///
/// The protocol never inspects it. The reference rail keys locks by payment
/// hash, which lets the payee side reconstruct a handle from the hash it
/// was quoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub id: String,
}

impl LockHandle {
    pub fn for_payment_hash(payment_hash: impl Into<String>) -> Self {
        Self {
            id: payment_hash.into(),
        }
    }
}

/// The payment rail contract
///
/// `claim_conditional` and `refund_conditional` are idempotent: a retry
/// after success reports success again without moving funds twice. All
/// amounts are millisatoshis.
#[async_trait]
pub trait Wallet: Send + Sync {
    async fn create_invoice(
        &self,
        amount_msats: u64,
        memo: &str,
        expiry_secs: u64,
    ) -> Result<Invoice>;

    async fn pay(&self, bolt11: &str) -> Result<PaymentProof>;

    /// Place funds in a conditional state claimable only by a preimage
    /// matching `payment_hash`, before `expiry_secs` elapse
    async fn lock_conditional(
        &self,
        amount_msats: u64,
        payment_hash: &str,
        expiry_secs: u64,
    ) -> Result<LockHandle>;

    /// Redeem a lock by revealing the preimage; false on hash mismatch,
    /// expiry or a completed refund
    async fn claim_conditional(&self, lock: &LockHandle, preimage: &str) -> Result<bool>;

    /// Reclaim an expired lock; false while the lock is live or claimed
    async fn refund_conditional(&self, lock: &LockHandle) -> Result<bool>;

    /// True iff a live, unexpired lock for at least `amount_msats` exists
    /// under `payment_hash`
    async fn verify_conditional(&self, payment_hash: &str, amount_msats: u64) -> Result<bool>;

    async fn balance(&self) -> Result<u64>;
}

// ============================================================================
// In-Memory Reference Rail
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockStatus {
    Held,
    Claimed,
    Refunded,
}

struct InvoiceRow {
    payee: String,
    amount_msats: u64,
    expires_at: DateTime<Utc>,
    paid: bool,
}

struct LockRow {
    payer: String,
    amount_msats: u64,
    expires_at: DateTime<Utc>,
    status: LockStatus,
    claimed_preimage: Option<String>,
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<String, u64>,
    invoices: HashMap<String, InvoiceRow>,
    locks: HashMap<String, LockRow>,
}

/// Shared in-memory payment rail
///
/// One instance per process; every party opens a [`LedgerWallet`] handle on
/// it. Balances move atomically under a single lock, so Scenario-style
/// assertions ("consumer -10,000, provider +10,000") hold exactly.
pub struct MemoryLedger {
    network: Network,
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new(network: Network) -> Arc<Self> {
        Arc::new(Self {
            network,
            state: Mutex::new(LedgerState::default()),
        })
    }

    /// Open an account with an initial balance and return its wallet handle
    pub fn wallet(self: &Arc<Self>, owner: impl Into<String>, initial_msats: u64) -> LedgerWallet {
        let owner = owner.into();
        if let Ok(mut state) = self.state.lock() {
            state.accounts.entry(owner.clone()).or_insert(initial_msats);
        }
        LedgerWallet {
            ledger: self.clone(),
            owner,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    fn mint_bolt11(&self, amount_msats: u64) -> String {
        let nonce: [u8; 8] = rand::rng().random();
        format!(
            "{}{}n1{}",
            self.network.bolt11_prefix(),
            amount_msats,
            hex::encode(nonce)
        )
    }
}

/// One party's handle onto a [`MemoryLedger`]
#[derive(Clone)]
pub struct LedgerWallet {
    ledger: Arc<MemoryLedger>,
    owner: String,
}

impl LedgerWallet {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>> {
        self.ledger
            .state
            .lock()
            .map_err(|_| WalletError::Backend("ledger poisoned".to_string()))
    }
}

fn decode_payment_hash(payment_hash: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(payment_hash)
        .map_err(|_| WalletError::InvalidPaymentHash(payment_hash.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| WalletError::InvalidPaymentHash(payment_hash.to_string()))
}

fn preimage_matches(preimage: &str, payment_hash: &str) -> bool {
    let Ok(preimage_bytes) = hex::decode(preimage) else {
        return false;
    };
    let digest = hex::encode(Sha256::digest(&preimage_bytes));
    digest.eq_ignore_ascii_case(payment_hash)
}

#[async_trait]
impl Wallet for LedgerWallet {
    async fn create_invoice(
        &self,
        amount_msats: u64,
        memo: &str,
        expiry_secs: u64,
    ) -> Result<Invoice> {
        let bolt11 = self.ledger.mint_bolt11(amount_msats);
        let mut state = self.lock_state()?;
        state.invoices.insert(
            bolt11.clone(),
            InvoiceRow {
                payee: self.owner.clone(),
                amount_msats,
                expires_at: Utc::now() + ChronoDuration::seconds(expiry_secs as i64),
                paid: false,
            },
        );
        Ok(Invoice {
            bolt11,
            amount_msats,
            payment_hash: None,
            memo: memo.to_string(),
            expiry_secs,
        })
    }

    async fn pay(&self, bolt11: &str) -> Result<PaymentProof> {
        let mut state = self.lock_state()?;

        let (payee, amount_msats) = {
            let invoice = state
                .invoices
                .get(bolt11)
                .ok_or_else(|| WalletError::UnknownInvoice(bolt11.to_string()))?;
            if invoice.paid {
                return Err(WalletError::UnknownInvoice(bolt11.to_string()));
            }
            if Utc::now() > invoice.expires_at {
                return Err(WalletError::InvoiceExpired(bolt11.to_string()));
            }
            (invoice.payee.clone(), invoice.amount_msats)
        };

        let available = *state
            .accounts
            .get(&self.owner)
            .ok_or_else(|| WalletError::UnknownAccount(self.owner.clone()))?;
        if available < amount_msats {
            return Err(WalletError::InsufficientBalance {
                available,
                required: amount_msats,
            });
        }

        *state.accounts.entry(self.owner.clone()).or_default() -= amount_msats;
        *state.accounts.entry(payee).or_default() += amount_msats;
        if let Some(invoice) = state.invoices.get_mut(bolt11) {
            invoice.paid = true;
        }

        Ok(PaymentProof {
            payment_id: Uuid::new_v4().to_string(),
            amount_msats,
        })
    }

    async fn lock_conditional(
        &self,
        amount_msats: u64,
        payment_hash: &str,
        expiry_secs: u64,
    ) -> Result<LockHandle> {
        decode_payment_hash(payment_hash)?;
        let mut state = self.lock_state()?;

        if let Some(existing) = state.locks.get(payment_hash) {
            // Retried lock with identical terms is a no-op
            if existing.payer == self.owner
                && existing.amount_msats == amount_msats
                && existing.status == LockStatus::Held
            {
                return Ok(LockHandle::for_payment_hash(payment_hash));
            }
            return Err(WalletError::ConflictingLock(payment_hash.to_string()));
        }

        let available = *state
            .accounts
            .get(&self.owner)
            .ok_or_else(|| WalletError::UnknownAccount(self.owner.clone()))?;
        if available < amount_msats {
            return Err(WalletError::InsufficientBalance {
                available,
                required: amount_msats,
            });
        }

        *state.accounts.entry(self.owner.clone()).or_default() -= amount_msats;
        state.locks.insert(
            payment_hash.to_string(),
            LockRow {
                payer: self.owner.clone(),
                amount_msats,
                expires_at: Utc::now() + ChronoDuration::seconds(expiry_secs as i64),
                status: LockStatus::Held,
                claimed_preimage: None,
            },
        );

        Ok(LockHandle::for_payment_hash(payment_hash))
    }

    async fn claim_conditional(&self, lock: &LockHandle, preimage: &str) -> Result<bool> {
        let mut state = self.lock_state()?;
        let Some(row) = state.locks.get(&lock.id) else {
            return Ok(false);
        };

        match row.status {
            LockStatus::Claimed => {
                // Idempotent retry with the same preimage
                return Ok(row.claimed_preimage.as_deref() == Some(preimage));
            }
            LockStatus::Refunded => return Ok(false),
            LockStatus::Held => {}
        }

        if !preimage_matches(preimage, &lock.id) {
            return Ok(false);
        }
        if Utc::now() > row.expires_at {
            return Ok(false);
        }

        let amount = row.amount_msats;
        if let Some(row) = state.locks.get_mut(&lock.id) {
            row.status = LockStatus::Claimed;
            row.claimed_preimage = Some(preimage.to_string());
        }
        *state.accounts.entry(self.owner.clone()).or_default() += amount;
        Ok(true)
    }

    async fn refund_conditional(&self, lock: &LockHandle) -> Result<bool> {
        let mut state = self.lock_state()?;
        let Some(row) = state.locks.get(&lock.id) else {
            return Ok(false);
        };

        match row.status {
            LockStatus::Refunded => return Ok(true),
            LockStatus::Claimed => return Ok(false),
            LockStatus::Held => {}
        }
        if Utc::now() < row.expires_at {
            return Ok(false);
        }

        let (payer, amount) = (row.payer.clone(), row.amount_msats);
        if let Some(row) = state.locks.get_mut(&lock.id) {
            row.status = LockStatus::Refunded;
        }
        *state.accounts.entry(payer).or_default() += amount;
        Ok(true)
    }

    async fn verify_conditional(&self, payment_hash: &str, amount_msats: u64) -> Result<bool> {
        let state = self.lock_state()?;
        Ok(state
            .locks
            .get(payment_hash)
            .map(|row| {
                row.status == LockStatus::Held
                    && row.amount_msats >= amount_msats
                    && Utc::now() <= row.expires_at
            })
            .unwrap_or(false))
    }

    async fn balance(&self) -> Result<u64> {
        let state = self.lock_state()?;
        state
            .accounts
            .get(&self.owner)
            .copied()
            .ok_or_else(|| WalletError::UnknownAccount(self.owner.clone()))
    }
}
