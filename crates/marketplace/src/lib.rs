//! Agent compute marketplace
//!
//! Autonomous agents buying and selling compute over a signed pub/sub
//! relay, with payment held in a hash-locked escrow until the work is
//! delivered. Providers announce a capability and a price in a market
//! channel; consumers collect the announcements, pick a provider, and
//! negotiate one job at a time:
//!
//! ```text
//! consumer                          provider
//!    |------- JobRequest --------------->|
//!    |<------ Invoice -------------------|
//!    |------- HtlcLocked --------------->|   funds locked, not paid
//!    |<------ StreamChunk* --------------|
//!    |<------ JobResult -----------------|   result before payment
//!    |------- PreimageRelease ---------->|   provider claims the lock
//! ```
//!
//! Neither side trusts the other: the provider will not execute until its
//! wallet verifies the lock, the consumer will not release the preimage
//! until the result is in hand, and an unreleased lock expires back to
//! the consumer. Job ids are derived from the request content so both
//! sides can re-check them and replays collapse into no-ops.
//!
//! The relay, wallet and compute backend are trait seams; in-memory
//! implementations ([`MemoryRelay`], [`MemoryLedger`], [`CannedBackend`])
//! run the whole protocol in a single process for tests and demos.

pub mod backends;
pub mod config;
pub mod domain;
pub mod error;
pub mod escrow;
pub mod protocol;
pub mod relay;
pub mod services;
pub mod wallet;

pub use backends::{
    BackendError, CannedBackend, ComputeBackend, ExecutionOutput, ExecutionRequest, FailingBackend,
    StallingBackend,
};
pub use config::{ConsumerConfig, DiscoveryConfig, EscrowConfig, ProviderConfig, TimeoutConfig};
pub use domain::{
    DiscoveryFilter, DiscoveryIndex, JobEvent, JobRecord, JobSide, JobState, MarketEvent,
    ProviderListing, SelectionPolicy,
};
pub use error::{MarketError, Result};
pub use escrow::{EscrowCoordinator, EscrowState, EscrowStatus, generate_preimage, verify_preimage};
pub use protocol::{CapabilityKind, ChannelRef, MarketMessage, Network, derive_job_id};
pub use relay::{MemoryRelay, MemoryRelayHandle, Record, RecordFilter, RelayBus, RelayError};
pub use services::{ConsumerSession, JobSupervisor, ProviderSession};
pub use wallet::{Invoice, LedgerWallet, LockHandle, MemoryLedger, PaymentProof, Wallet, WalletError};
