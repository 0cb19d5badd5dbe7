//! Domain types for marketplace negotiations
//!
//! Pure protocol state, independent of transport and wallet: the per-job
//! record and its state machine, the discovery index built from provider
//! announcements, and the audit event stream.

pub mod discovery;
pub mod events;
pub mod job;

pub use discovery::{DiscoveryFilter, DiscoveryIndex, ProviderListing, SelectionPolicy};
pub use events::MarketEvent;
pub use job::{JobError, JobEvent, JobRecord, JobSide, JobState};
