//! Consumer session
//!
//! Collects provider announcements, picks one under the configured
//! policy, then drives a single job through request, invoice, payment,
//! result and release. With `use_htlc` set (the default) the payment is
//! a conditional lock the consumer only opens after the result arrives;
//! the provider is never trusted with funds up front.
//!
//! Protocol outcomes, including failures and refunds, come back as the
//! final [`JobRecord`] snapshot. `Err` is reserved for the cases where
//! no negotiation could run at all: an empty market or a dead relay.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::ConsumerConfig;
use crate::domain::{
    DiscoveryFilter, DiscoveryIndex, JobEvent, JobRecord, JobSide, JobState, MarketEvent,
    ProviderListing, SelectionPolicy,
};
use crate::error::{MarketError, Result};
use crate::escrow::{EscrowCoordinator, generate_preimage};
use crate::protocol::{self, MarketMessage, Network, derive_job_id, parse_market_message};
use crate::relay::{
    Record, RelayBus, RelayError, publish_market_message, subscribe_channel, subscribe_handler_ads,
};
use crate::wallet::Wallet;

/// One consumer's side of the marketplace: discover, request, pay,
/// collect, release.
pub struct ConsumerSession {
    relay: Arc<dyn RelayBus>,
    wallet: Arc<dyn Wallet>,
    escrow: Arc<EscrowCoordinator>,
    config: ConsumerConfig,
    events: Option<mpsc::UnboundedSender<MarketEvent>>,
}

impl ConsumerSession {
    pub fn new(relay: Arc<dyn RelayBus>, wallet: Arc<dyn Wallet>, config: ConsumerConfig) -> Self {
        let escrow = Arc::new(EscrowCoordinator::new(wallet.clone()));
        Self {
            relay,
            wallet,
            escrow,
            config,
            events: None,
        }
    }

    /// Attach an audit event sink.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<MarketEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// The escrow coordinator tracking this consumer's outgoing locks.
    ///
    /// Funds left locked after a failed negotiation can be recovered
    /// here with `refund_if_expired` once the expiry passes.
    pub fn escrow(&self) -> Arc<EscrowCoordinator> {
        self.escrow.clone()
    }

    /// This consumer's identity on the relay.
    pub fn consumer_id(&self) -> &str {
        self.relay.sender_id()
    }

    /// Collect announcements for the discovery window and pick a provider.
    ///
    /// With `discover` off the first announcement that passes the network
    /// and budget filter wins immediately; otherwise the full window is
    /// collected and the configured policy ranks the field.
    pub async fn discover(&self) -> Result<ProviderListing> {
        let mut filter = DiscoveryFilter::new().with_network(self.config.network);
        if let Some(max) = self.config.max_price_msats {
            filter = filter.with_max_price(max);
        }

        let mut channel_rx = subscribe_channel(self.relay.as_ref(), &self.config.channel_id).await?;
        let mut ad_rx = subscribe_handler_ads(self.relay.as_ref()).await?;
        let mut index = DiscoveryIndex::new();
        let mut announced: HashSet<String> = HashSet::new();
        let deadline = Instant::now() + Duration::from_secs(self.config.discovery.window_secs);
        info!(
            "discovering providers in channel {} for {}s",
            self.config.channel_id, self.config.discovery.window_secs
        );

        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                break;
            }
            let received = tokio::select! {
                _ = sleep(wait) => break,
                received = channel_rx.recv() => received,
                received = ad_rx.recv() => received,
            };
            let Some(record) = received else { break };
            if record.sender == self.relay.sender_id() {
                continue;
            }
            let Some(msg) = parse_market_message(&record.payload) else {
                continue;
            };
            if !index.observe(&msg) {
                continue;
            }
            if let MarketMessage::ServiceAnnouncement {
                provider_id,
                price_msats,
                ..
            } = &msg
            {
                if announced.insert(provider_id.clone()) {
                    info!(
                        "discovered provider {} at {} msats",
                        short(provider_id),
                        price_msats
                    );
                    self.emit(MarketEvent::ProviderDiscovered {
                        provider_id: provider_id.clone(),
                        price_msats: *price_msats,
                        timestamp: Utc::now(),
                    });
                }
                if !self.config.discover {
                    if let Some(listing) = index.select(&SelectionPolicy::First, &filter) {
                        self.emit(MarketEvent::ProviderSelected {
                            provider_id: listing.provider_id.clone(),
                            price_msats: listing.price_msats,
                            timestamp: Utc::now(),
                        });
                        return Ok(listing);
                    }
                }
            }
        }

        index.prune(chrono::Duration::seconds(
            self.config.discovery.listing_ttl_secs as i64,
        ));
        let listing = index
            .select(&self.config.policy, &filter)
            .ok_or(MarketError::NoProviderFound)?;
        info!(
            "selected provider {} at {} msats",
            short(&listing.provider_id),
            listing.price_msats
        );
        self.emit(MarketEvent::ProviderSelected {
            provider_id: listing.provider_id.clone(),
            price_msats: listing.price_msats,
            timestamp: Utc::now(),
        });
        Ok(listing)
    }

    /// Discover a provider and run one job end to end.
    ///
    /// The returned record is the consumer's final view: `Released` (or
    /// `ResultDelivered` without escrow) on success, `Refunded`, `Failed`
    /// or `Expired` otherwise, with `result` and `error` filled in.
    pub async fn run_job(&self, prompt: &str) -> Result<JobRecord> {
        let listing = self.discover().await?;
        self.negotiate(&listing, prompt).await
    }

    /// Run one job against an already-selected provider.
    pub async fn negotiate(&self, listing: &ProviderListing, prompt: &str) -> Result<JobRecord> {
        if let Some(budget) = self.config.max_price_msats {
            if listing.price_msats > budget {
                return Err(MarketError::OverBudget {
                    quoted: listing.price_msats,
                    budget,
                });
            }
        }
        if listing.network != self.config.network {
            return Err(MarketError::NetworkMismatch {
                expected: self.config.network.to_string(),
                actual: listing.network.to_string(),
            });
        }

        let channel = listing.channel.clone();
        // Subscribe before requesting so the invoice cannot race past us.
        let mut inbox = subscribe_channel(self.relay.as_ref(), &channel.channel_id).await?;

        let started_at = protocol::now();
        let job_id = derive_job_id(
            self.relay.sender_id(),
            &listing.provider_id,
            prompt,
            started_at,
        );
        let mut record = JobRecord::new(
            JobSide::Consumer,
            &job_id,
            listing.capability,
            self.relay.sender_id(),
            &listing.provider_id,
            prompt,
        )
        .with_max_tokens(self.config.max_tokens);

        let request = MarketMessage::JobRequest {
            job_id: job_id.clone(),
            kind: listing.capability.job_kind(),
            prompt: prompt.to_string(),
            max_tokens: self.config.max_tokens,
            target_provider: Some(listing.provider_id.clone()),
        };
        publish_market_message(self.relay.as_ref(), &channel, &request).await?;
        info!(
            "job {}: requested from {}",
            record.short_id(),
            short(&listing.provider_id)
        );
        self.emit(MarketEvent::JobRequested {
            job_id: job_id.clone(),
            provider_id: listing.provider_id.clone(),
            timestamp: Utc::now(),
        });

        let Some((bolt11, amount)) = self
            .await_invoice(&mut record, &mut inbox, &listing.provider_id, started_at)
            .await?
        else {
            return Ok(record);
        };

        self.apply(&mut record, JobEvent::PaymentStarted);
        let mut preimage: Option<String> = None;
        if self.config.use_htlc {
            let (secret, payment_hash) = generate_preimage();
            record.set_preimage(&secret);
            if record.set_payment_hash(&payment_hash).is_err() {
                self.fail(&mut record, "payment hash already pinned".to_string());
                return Ok(record);
            }
            let expiry = self.config.escrow.expiry_secs;
            if let Err(e) = self.escrow.lock(&job_id, &payment_hash, amount, expiry).await {
                self.fail(&mut record, format!("escrow lock failed: {e}"));
                return Ok(record);
            }
            self.apply(&mut record, JobEvent::LockPlaced);
            self.emit(MarketEvent::EscrowLocked {
                job_id: job_id.clone(),
                amount_msats: amount,
                expiry_secs: expiry,
                timestamp: Utc::now(),
            });
            info!(
                "job {}: locked {} msats under {}",
                record.short_id(),
                amount,
                short(&payment_hash)
            );

            let msg = MarketMessage::HtlcLocked {
                job_id: job_id.clone(),
                payment_hash,
                amount_msats: amount,
                expiry_secs: expiry,
            };
            if let Err(e) = publish_market_message(self.relay.as_ref(), &channel, &msg).await {
                warn!("job {}: could not publish lock: {}", record.short_id(), e);
                self.refund_or_fail(&mut record, format!("could not publish lock: {e}"))
                    .await;
                return Ok(record);
            }
            preimage = Some(secret);
        } else {
            let proof = match self.wallet.pay(&bolt11).await {
                Ok(proof) => proof,
                Err(e) => {
                    self.fail(&mut record, format!("payment failed: {e}"));
                    return Ok(record);
                }
            };
            let msg = MarketMessage::PaymentSent {
                job_id: job_id.clone(),
                payment_id: proof.payment_id.clone(),
            };
            if let Err(e) = publish_market_message(self.relay.as_ref(), &channel, &msg).await {
                warn!("job {}: paid but could not report it: {}", record.short_id(), e);
            }
            self.apply(&mut record, JobEvent::ExecutionStarted);
            self.emit(MarketEvent::PaymentDispatched {
                job_id: job_id.clone(),
                amount_msats: proof.amount_msats,
                timestamp: Utc::now(),
            });
            info!(
                "job {}: paid {} msats direct",
                record.short_id(),
                proof.amount_msats
            );
        }

        let delivered = self
            .await_result(
                &mut record,
                &mut inbox,
                &listing.provider_id,
                started_at,
                preimage.is_some(),
            )
            .await?;
        if !delivered {
            return Ok(record);
        }

        if let Some(secret) = preimage {
            if let Err(e) = self.escrow.release(&job_id, &secret).await {
                warn!(
                    "job {}: release validation failed: {}",
                    record.short_id(),
                    e
                );
                return Ok(record);
            }
            let msg = MarketMessage::PreimageRelease {
                job_id: job_id.clone(),
                preimage: secret,
            };
            if let Err(e) = publish_market_message(self.relay.as_ref(), &channel, &msg).await {
                warn!("job {}: could not publish release: {}", record.short_id(), e);
                return Ok(record);
            }
            self.apply(&mut record, JobEvent::PreimageReleased);
            self.emit(MarketEvent::PreimageReleased {
                job_id: job_id.clone(),
                timestamp: Utc::now(),
            });
            info!("job {}: preimage released", record.short_id());
        }

        Ok(record)
    }

    /// Wait for the selected provider's invoice.
    ///
    /// `Ok(None)` means the negotiation already settled into the record;
    /// the caller returns the snapshot as-is.
    async fn await_invoice(
        &self,
        record: &mut JobRecord,
        inbox: &mut mpsc::Receiver<Record>,
        provider_id: &str,
        started_at: u64,
    ) -> Result<Option<(String, u64)>> {
        let deadline = Instant::now() + Duration::from_secs(self.config.timeouts.invoice_secs);
        record.set_deadline(self.config.timeouts.invoice_secs);
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let received = match timeout(wait, inbox.recv()).await {
                Ok(Some(received)) => received,
                Ok(None) => return Err(RelayError::Closed.into()),
                Err(_) => {
                    let reason = format!(
                        "no invoice within {}s",
                        self.config.timeouts.invoice_secs
                    );
                    info!("job {}: {}", record.short_id(), reason);
                    self.apply(record, JobEvent::TimedOut);
                    record.error = Some(reason.clone());
                    self.emit(MarketEvent::JobFailed {
                        job_id: record.job_id.clone(),
                        reason,
                        timestamp: Utc::now(),
                    });
                    return Ok(None);
                }
            };
            let Some(msg) = self.message_for(record, &received, provider_id, started_at) else {
                continue;
            };
            match msg {
                MarketMessage::Invoice {
                    bolt11,
                    amount_msats,
                    ..
                } => {
                    if let Some(budget) = self.config.max_price_msats {
                        if amount_msats > budget {
                            self.fail(
                                record,
                                format!(
                                    "invoice of {amount_msats} msats exceeds the {budget} msat budget"
                                ),
                            );
                            return Ok(None);
                        }
                    }
                    match Network::from_bolt11(&bolt11) {
                        Some(network) if network == self.config.network => {}
                        Some(network) => {
                            self.fail(record, format!("invoice is for {network}"));
                            return Ok(None);
                        }
                        None => {
                            self.fail(record, "invoice is unparseable".to_string());
                            return Ok(None);
                        }
                    }
                    record.set_invoice(amount_msats, &bolt11);
                    self.apply(record, JobEvent::InvoiceReady);
                    self.emit(MarketEvent::InvoiceIssued {
                        job_id: record.job_id.clone(),
                        amount_msats,
                        timestamp: Utc::now(),
                    });
                    info!(
                        "job {}: invoice for {} msats",
                        record.short_id(),
                        amount_msats
                    );
                    return Ok(Some((bolt11, amount_msats)));
                }
                MarketMessage::JobFailure { reason, .. } => {
                    self.fail(record, format!("provider declined: {reason}"));
                    return Ok(None);
                }
                other => {
                    debug!(
                        "job {}: unexpected {} while awaiting invoice",
                        record.short_id(),
                        other.kind_name()
                    );
                }
            }
        }
    }

    /// Wait for the result, folding stream chunks in as they arrive.
    ///
    /// Returns whether a full result was delivered. The window covers
    /// lock verification plus execution, since the provider's first
    /// signal may be a chunk, the result itself, or a failure.
    async fn await_result(
        &self,
        record: &mut JobRecord,
        inbox: &mut mpsc::Receiver<Record>,
        provider_id: &str,
        started_at: u64,
        escrowed: bool,
    ) -> Result<bool> {
        let window = self.config.timeouts.pay_ack_secs + self.config.timeouts.execution_secs;
        let deadline = Instant::now() + Duration::from_secs(window);
        record.set_deadline(window);
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let received = match timeout(wait, inbox.recv()).await {
                Ok(Some(received)) => received,
                Ok(None) => return Err(RelayError::Closed.into()),
                Err(_) => {
                    let reason = format!("no result within {window}s");
                    info!("job {}: {}", record.short_id(), reason);
                    if escrowed {
                        self.refund_or_fail(record, reason).await;
                    } else if record.state == JobState::Processing {
                        self.apply(record, JobEvent::TimedOut);
                        record.error = Some(reason.clone());
                        self.emit(MarketEvent::JobFailed {
                            job_id: record.job_id.clone(),
                            reason,
                            timestamp: Utc::now(),
                        });
                    } else {
                        self.fail(record, reason);
                    }
                    return Ok(false);
                }
            };
            let Some(msg) = self.message_for(record, &received, provider_id, started_at) else {
                continue;
            };
            match msg {
                MarketMessage::StreamChunk {
                    chunk, is_final, ..
                } => {
                    self.apply(record, JobEvent::ChunkArrived);
                    debug!(
                        "job {}: chunk of {} bytes{}",
                        record.short_id(),
                        chunk.len(),
                        if is_final { " (final)" } else { "" }
                    );
                }
                MarketMessage::JobResult { result, .. } => {
                    if record.state == JobState::EscrowLocked {
                        // The result doubles as the execution signal.
                        self.apply(record, JobEvent::ExecutionStarted);
                    }
                    let bytes = result.len();
                    self.apply(record, JobEvent::ResultReady { content: result });
                    record.clear_deadline();
                    self.emit(MarketEvent::ResultDelivered {
                        job_id: record.job_id.clone(),
                        bytes,
                        timestamp: Utc::now(),
                    });
                    info!(
                        "job {}: result received ({} bytes)",
                        record.short_id(),
                        bytes
                    );
                    return Ok(true);
                }
                MarketMessage::JobFailure { reason, .. } => {
                    warn!(
                        "job {}: provider reported failure: {}",
                        record.short_id(),
                        reason
                    );
                    if escrowed {
                        self.refund_or_fail(record, format!("provider failure: {reason}"))
                            .await;
                    } else {
                        self.fail(record, format!("provider failure: {reason}"));
                    }
                    return Ok(false);
                }
                MarketMessage::Invoice { .. } => {
                    debug!("job {}: repeated invoice, already paid", record.short_id());
                }
                other => {
                    debug!(
                        "job {}: unexpected {} while awaiting result",
                        record.short_id(),
                        other.kind_name()
                    );
                }
            }
        }
    }

    /// Keep only fresh messages from the selected provider for this job.
    fn message_for(
        &self,
        record: &JobRecord,
        received: &Record,
        provider_id: &str,
        started_at: u64,
    ) -> Option<MarketMessage> {
        if received.sender == self.relay.sender_id() {
            return None;
        }
        if received.sender != provider_id {
            debug!(
                "job {}: message from third party {}, skipping",
                record.short_id(),
                short(&received.sender)
            );
            return None;
        }
        // Replayed history from an earlier run of the same derived id.
        if received.created_at < started_at {
            return None;
        }
        match received.job_id.as_deref() {
            Some(id) if id == record.job_id => {}
            _ => return None,
        }
        let parsed = parse_market_message(&received.payload);
        if parsed.is_none() {
            warn!("job {}: unparseable payload, skipping", record.short_id());
        }
        parsed
    }

    /// One refund attempt on the failure path.
    ///
    /// A lock that has not expired yet cannot be refunded; the record
    /// fails instead and the funds stay recoverable through [`Self::escrow`]
    /// once the expiry passes.
    async fn refund_or_fail(&self, record: &mut JobRecord, reason: String) {
        match self.escrow.refund_if_expired(&record.job_id).await {
            Ok(true) => {
                let amount = record.price_msats.unwrap_or(0);
                record.error = Some(reason.clone());
                self.apply(record, JobEvent::RefundSettled);
                self.emit(MarketEvent::EscrowRefunded {
                    job_id: record.job_id.clone(),
                    amount_msats: amount,
                    timestamp: Utc::now(),
                });
                info!(
                    "job {}: escrow refunded after {}",
                    record.short_id(),
                    reason
                );
            }
            Ok(false) => {
                self.fail(
                    record,
                    format!("{reason}; escrow not yet expired, refund later"),
                );
            }
            Err(e) => {
                self.fail(record, format!("{reason}; refund attempt failed: {e}"));
            }
        }
    }

    fn fail(&self, record: &mut JobRecord, reason: String) {
        warn!("job {}: {}", record.short_id(), reason);
        self.apply(record, JobEvent::FailureReported {
            reason: reason.clone(),
        });
        self.emit(MarketEvent::JobFailed {
            job_id: record.job_id.clone(),
            reason,
            timestamp: Utc::now(),
        });
    }

    fn apply(&self, record: &mut JobRecord, event: JobEvent) {
        let from = record.state;
        if let Some(to) = record.apply(event) {
            if to != from {
                if to.is_terminal() {
                    record.clear_deadline();
                }
                debug!("job {}: {} -> {}", record.short_id(), from, to);
                self.emit(MarketEvent::StateChanged {
                    job_id: record.job_id.clone(),
                    from,
                    to,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    fn emit(&self, event: MarketEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

// Ids come off the wire as arbitrary strings; never byte-slice them.
fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
