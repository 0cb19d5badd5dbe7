//! Marketplace sessions
//!
//! A session wires the collaborator seams together and runs one side of
//! the protocol: [`ProviderSession`] announces, invoices and executes;
//! [`ConsumerSession`] discovers, pays and collects. The supervisor keeps
//! each active negotiation in its own task so a stalled job never blocks
//! another.

mod consumer;
mod provider;
mod supervisor;

pub use consumer::ConsumerSession;
pub use provider::ProviderSession;
pub use supervisor::JobSupervisor;
