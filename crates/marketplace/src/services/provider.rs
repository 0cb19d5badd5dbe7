//! Provider session
//!
//! Announces capability and price on the market channel, accepts targeted
//! job requests, invoices them, and executes against the configured
//! backend once payment is secured. With `require_htlc` set (the default)
//! the provider refuses to run until it has verified a conditional lock
//! through its own wallet; the result is delivered first and the funds
//! are claimed only after the requester releases the preimage.
//!
//! Each accepted job runs in its own supervised task, so one requester
//! who never pays cannot hold up the channel for everyone else.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval, timeout};
use tracing::{debug, info, warn};

use crate::backends::{self, ComputeBackend, ExecutionRequest};
use crate::config::ProviderConfig;
use crate::domain::{JobEvent, JobRecord, JobSide, MarketEvent};
use crate::error::Result;
use crate::escrow::{EscrowCoordinator, verify_preimage};
use crate::protocol::{
    self, ChannelRef, JOB_ID_COARSE_SECS, MarketMessage, derive_job_id, parse_market_message,
};
use crate::relay::{
    Record, RelayBus, RelayError, publish_handler_ad, publish_market_message, subscribe_channel,
};
use crate::services::JobSupervisor;
use crate::wallet::Wallet;

/// Expiry stamped on wallet invoices, independent of the escrow expiry.
const INVOICE_EXPIRY_SECS: u64 = 3600;

/// Longest requester-announced lock expiry the provider will honor.
const MAX_LOCK_EXPIRY_SECS: u64 = 86_400;

/// One provider's side of the marketplace: announce, invoice, execute,
/// claim.
pub struct ProviderSession {
    relay: Arc<dyn RelayBus>,
    wallet: Arc<dyn Wallet>,
    backend: Arc<dyn ComputeBackend>,
    escrow: Arc<EscrowCoordinator>,
    supervisor: Arc<JobSupervisor>,
    config: ProviderConfig,
    events: Option<mpsc::UnboundedSender<MarketEvent>>,
}

impl ProviderSession {
    pub fn new(
        relay: Arc<dyn RelayBus>,
        wallet: Arc<dyn Wallet>,
        backend: Arc<dyn ComputeBackend>,
        config: ProviderConfig,
    ) -> Self {
        let escrow = Arc::new(EscrowCoordinator::new(wallet.clone()));
        Self {
            relay,
            wallet,
            backend,
            escrow,
            supervisor: Arc::new(JobSupervisor::new()),
            config,
            events: None,
        }
    }

    /// Attach an audit event sink.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<MarketEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// The escrow coordinator tracking this provider's incoming locks.
    pub fn escrow(&self) -> Arc<EscrowCoordinator> {
        self.escrow.clone()
    }

    /// The supervisor owning the per-job tasks.
    pub fn supervisor(&self) -> Arc<JobSupervisor> {
        self.supervisor.clone()
    }

    /// This provider's identity on the relay.
    pub fn provider_id(&self) -> &str {
        self.relay.sender_id()
    }

    /// Serve the channel until the relay drops.
    ///
    /// Subscribes first, then announces, so no request published in
    /// response to the announcement can slip past the subscription.
    pub async fn run(&self) -> Result<()> {
        let channel = ChannelRef::new(&self.config.channel_id, self.config.relay_urls.clone());
        let mut inbox = subscribe_channel(self.relay.as_ref(), &self.config.channel_id).await?;
        let started_at = protocol::now();

        // A dead payment rail means nothing we invoice can settle.
        let balance = self.wallet.balance().await?;
        self.announce(&channel).await?;
        info!(
            "provider {} serving channel {} at {} msats, wallet holds {} msats",
            short(self.relay.sender_id()),
            self.config.channel_id,
            self.config.price_msats,
            balance
        );

        let mut announce_timer = interval(Duration::from_secs(
            self.config.discovery.announce_interval_secs.max(1),
        ));
        // The first tick completes immediately and we just announced.
        announce_timer.tick().await;

        loop {
            tokio::select! {
                _ = announce_timer.tick() => {
                    if let Err(e) = self.announce(&channel).await {
                        warn!("re-announce failed: {}", e);
                    }
                }
                received = inbox.recv() => {
                    match received {
                        Some(record) => self.handle_record(record, started_at, &channel).await,
                        None => return Err(RelayError::Closed.into()),
                    }
                }
            }
        }
    }

    async fn announce(&self, channel: &ChannelRef) -> Result<()> {
        let msg = MarketMessage::ServiceAnnouncement {
            provider_id: self.relay.sender_id().to_string(),
            capability: self.config.capability,
            price_msats: self.config.price_msats,
            network: self.config.network,
            models: self.config.models.clone(),
            channel: channel.clone(),
        };
        publish_market_message(self.relay.as_ref(), channel, &msg).await?;
        if self.config.announce {
            publish_handler_ad(self.relay.as_ref(), &msg).await?;
        }
        debug!(
            "announced {} msats in channel {}",
            self.config.price_msats, channel.channel_id
        );
        Ok(())
    }

    async fn handle_record(&self, record: Record, started_at: u64, channel: &ChannelRef) {
        if record.sender == self.relay.sender_id() {
            return;
        }
        // Replayed history must not restart settled negotiations.
        if record.created_at < started_at {
            return;
        }
        let Some(msg) = parse_market_message(&record.payload) else {
            warn!("unparseable payload from {}, dropping", short(&record.sender));
            return;
        };
        match msg {
            MarketMessage::JobRequest {
                job_id,
                kind,
                prompt,
                max_tokens,
                target_provider,
            } => {
                if let Some(target) = &target_provider {
                    if target != self.relay.sender_id() {
                        debug!("job {}: targeted elsewhere, skipping", short(&job_id));
                        return;
                    }
                }
                if kind != self.config.capability.job_kind() {
                    debug!("job {}: kind {} not served here, skipping", short(&job_id), kind);
                    return;
                }
                let target = target_provider.as_deref().unwrap_or(&self.config.channel_id);
                if !job_id_checks_out(&job_id, &record.sender, target, &prompt, record.created_at)
                {
                    warn!(
                        "job {}: id does not match its content, dropping",
                        short(&job_id)
                    );
                    return;
                }
                let ctx = JobContext {
                    relay: self.relay.clone(),
                    wallet: self.wallet.clone(),
                    backend: self.backend.clone(),
                    escrow: self.escrow.clone(),
                    config: self.config.clone(),
                    channel: channel.clone(),
                    events: self.events.clone(),
                    requester: record.sender,
                    job_id: job_id.clone(),
                    prompt,
                    max_tokens,
                };
                if !self
                    .supervisor
                    .spawn(&job_id, move |mailbox| ctx.run(mailbox))
                    .await
                {
                    debug!(
                        "job {}: already tracked, ignoring duplicate request",
                        short(&job_id)
                    );
                }
            }
            MarketMessage::ServiceAnnouncement { .. } => {
                // Peer providers sharing the channel.
            }
            _ => {
                if !self.supervisor.dispatch(record).await {
                    debug!("no active job for message, dropping");
                }
            }
        }
    }
}

/// Re-derive the deterministic job id, tolerating one coarse bucket of
/// clock skew on either side of the sender's stamp.
fn job_id_checks_out(
    job_id: &str,
    requester: &str,
    target: &str,
    prompt: &str,
    created_at: u64,
) -> bool {
    [
        created_at.saturating_sub(JOB_ID_COARSE_SECS),
        created_at,
        created_at.saturating_add(JOB_ID_COARSE_SECS),
    ]
    .into_iter()
    .any(|stamp| derive_job_id(requester, target, prompt, stamp) == job_id)
}

// Ids come off the wire as arbitrary strings; never byte-slice them.
fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// How a job got funded, decided while awaiting payment.
enum PaymentPath {
    /// Conditional lock verified through the wallet; claim after release.
    Escrow {
        expiry_secs: u64,
        locked_at: Instant,
    },
    /// Plain invoice payment, nothing left to claim.
    Direct,
}

/// Everything one job's task needs, detached from the session so the
/// pump never blocks on a slow negotiation.
struct JobContext {
    relay: Arc<dyn RelayBus>,
    wallet: Arc<dyn Wallet>,
    backend: Arc<dyn ComputeBackend>,
    escrow: Arc<EscrowCoordinator>,
    config: ProviderConfig,
    channel: ChannelRef,
    events: Option<mpsc::UnboundedSender<MarketEvent>>,
    requester: String,
    job_id: String,
    prompt: String,
    max_tokens: u32,
}

impl JobContext {
    async fn run(self, mut mailbox: mpsc::Receiver<Record>) {
        let mut record = JobRecord::new(
            JobSide::Provider,
            &self.job_id,
            self.config.capability,
            &self.requester,
            self.relay.sender_id(),
            &self.prompt,
        )
        .with_max_tokens(self.max_tokens);
        info!(
            "job {}: request from {}",
            record.short_id(),
            short(&self.requester)
        );
        self.emit(MarketEvent::JobReceived {
            job_id: self.job_id.clone(),
            requester_id: self.requester.clone(),
            timestamp: Utc::now(),
        });

        if !self.issue_invoice(&mut record).await {
            return;
        }
        let Some(path) = self.await_payment(&mut record, &mut mailbox).await else {
            return;
        };
        let Some(result) = self.execute(&mut record).await else {
            return;
        };
        if !self.deliver(&mut record, result).await {
            return;
        }
        match path {
            PaymentPath::Direct => {
                info!(
                    "job {}: complete, {} msats paid direct",
                    record.short_id(),
                    record.price_msats.unwrap_or(0)
                );
            }
            PaymentPath::Escrow {
                expiry_secs,
                locked_at,
            } => {
                self.await_release(&mut record, &mut mailbox, expiry_secs, locked_at)
                    .await;
            }
        }
    }

    async fn issue_invoice(&self, record: &mut JobRecord) -> bool {
        let memo = format!("job {}", record.short_id());
        let invoice = match self
            .wallet
            .create_invoice(self.config.price_msats, &memo, INVOICE_EXPIRY_SECS)
            .await
        {
            Ok(invoice) => invoice,
            Err(e) => {
                warn!("job {}: invoice creation failed: {}", record.short_id(), e);
                self.fail(record, format!("invoice creation failed: {e}"));
                return false;
            }
        };
        let msg = MarketMessage::Invoice {
            job_id: self.job_id.clone(),
            bolt11: invoice.bolt11.clone(),
            amount_msats: invoice.amount_msats,
            payment_hash: invoice.payment_hash.clone(),
        };
        if let Err(e) = self.send(&msg).await {
            warn!("job {}: could not publish invoice: {}", record.short_id(), e);
            return false;
        }
        record.set_invoice(invoice.amount_msats, invoice.bolt11);
        self.apply(record, JobEvent::InvoiceReady);
        self.emit(MarketEvent::InvoiceIssued {
            job_id: self.job_id.clone(),
            amount_msats: invoice.amount_msats,
            timestamp: Utc::now(),
        });
        info!(
            "job {}: invoiced {} msats",
            record.short_id(),
            invoice.amount_msats
        );
        true
    }

    /// Wait for the requester to fund the job.
    ///
    /// A verified lock wins; a `PaymentSent` claim is accepted only when
    /// `require_htlc` is off. The invoice lapses quietly when the payment
    /// window closes.
    async fn await_payment(
        &self,
        record: &mut JobRecord,
        mailbox: &mut mpsc::Receiver<Record>,
    ) -> Option<PaymentPath> {
        let deadline = Instant::now() + Duration::from_secs(self.config.timeouts.payment_secs);
        record.set_deadline(self.config.timeouts.payment_secs);
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let received = match timeout(wait, mailbox.recv()).await {
                Ok(Some(received)) => received,
                Ok(None) => return None,
                Err(_) => {
                    info!(
                        "job {}: no payment within {}s, letting the invoice lapse",
                        record.short_id(),
                        self.config.timeouts.payment_secs
                    );
                    let state = record.state;
                    self.apply(record, JobEvent::TimedOut);
                    self.emit(MarketEvent::JobExpired {
                        job_id: self.job_id.clone(),
                        state,
                        timestamp: Utc::now(),
                    });
                    return None;
                }
            };
            if received.sender != self.requester {
                debug!(
                    "job {}: message from third party {}, skipping",
                    record.short_id(),
                    short(&received.sender)
                );
                continue;
            }
            let Some(msg) = parse_market_message(&received.payload) else {
                warn!("job {}: unparseable payload, skipping", record.short_id());
                continue;
            };
            match msg {
                MarketMessage::HtlcLocked {
                    payment_hash,
                    amount_msats,
                    expiry_secs,
                    ..
                } => {
                    // The announced expiry feeds deadline arithmetic; cap it
                    // before anything downstream adds it to an Instant.
                    let expiry_secs = expiry_secs.min(MAX_LOCK_EXPIRY_SECS);
                    let invoiced = record.price_msats.unwrap_or(self.config.price_msats);
                    if amount_msats < invoiced {
                        self.publish_failure(
                            record,
                            format!("lock of {amount_msats} msats is below the invoiced amount"),
                        )
                        .await;
                        return None;
                    }
                    if record.set_payment_hash(&payment_hash).is_err() {
                        warn!(
                            "job {}: conflicting payment hash, skipping lock",
                            record.short_id()
                        );
                        continue;
                    }
                    if let Err(e) = self
                        .escrow
                        .track(&self.job_id, &payment_hash, amount_msats, expiry_secs)
                        .await
                    {
                        warn!("job {}: cannot track lock: {}", record.short_id(), e);
                        continue;
                    }
                    match self.escrow.verify_lock(&self.job_id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            self.publish_failure(
                                record,
                                "payment lock did not verify".to_string(),
                            )
                            .await;
                            return None;
                        }
                        Err(e) => {
                            self.publish_failure(
                                record,
                                format!("lock verification failed: {e}"),
                            )
                            .await;
                            return None;
                        }
                    }
                    self.apply(record, JobEvent::PaymentStarted);
                    self.apply(record, JobEvent::LockPlaced);
                    self.emit(MarketEvent::EscrowLocked {
                        job_id: self.job_id.clone(),
                        amount_msats,
                        expiry_secs,
                        timestamp: Utc::now(),
                    });
                    self.emit(MarketEvent::LockVerified {
                        job_id: self.job_id.clone(),
                        timestamp: Utc::now(),
                    });
                    info!(
                        "job {}: escrow of {} msats verified",
                        record.short_id(),
                        amount_msats
                    );
                    return Some(PaymentPath::Escrow {
                        expiry_secs,
                        locked_at: Instant::now(),
                    });
                }
                MarketMessage::PaymentSent { payment_id, .. } => {
                    if self.config.require_htlc {
                        debug!(
                            "job {}: direct payment claim ignored, lock required",
                            record.short_id()
                        );
                        continue;
                    }
                    self.apply(record, JobEvent::PaymentStarted);
                    info!(
                        "job {}: payment {} reported",
                        record.short_id(),
                        short(&payment_id)
                    );
                    return Some(PaymentPath::Direct);
                }
                MarketMessage::JobRequest { .. } => {
                    debug!(
                        "job {}: duplicate request, already in flight",
                        record.short_id()
                    );
                }
                other => {
                    debug!(
                        "job {}: unexpected {} while awaiting payment",
                        record.short_id(),
                        other.kind_name()
                    );
                }
            }
        }
    }

    async fn execute(&self, record: &mut JobRecord) -> Option<String> {
        self.apply(record, JobEvent::ExecutionStarted);
        record.set_deadline(self.config.timeouts.execution_secs);
        self.emit(MarketEvent::ExecutionStarted {
            job_id: self.job_id.clone(),
            timestamp: Utc::now(),
        });
        info!(
            "job {}: executing on {}",
            record.short_id(),
            self.backend.name()
        );

        let mut request = ExecutionRequest::new(&self.prompt).with_max_tokens(self.max_tokens);
        if let Some(model) = self.config.models.first() {
            request = request.with_model(model);
        }

        let window = Duration::from_secs(self.config.timeouts.execution_secs);
        let outcome = if self.config.stream {
            timeout(window, self.execute_streaming(request)).await
        } else {
            timeout(window, async {
                self.backend.execute(request).await.map(|output| output.text)
            })
            .await
        };
        match outcome {
            Ok(Ok(text)) => Some(text),
            Ok(Err(e)) => {
                self.publish_failure(record, format!("execution failed: {e}"))
                    .await;
                None
            }
            Err(_) => {
                let reason = "execution timed out".to_string();
                let msg = MarketMessage::JobFailure {
                    job_id: self.job_id.clone(),
                    reason: reason.clone(),
                };
                if let Err(e) = self.send(&msg).await {
                    warn!("job {}: could not publish failure: {}", record.short_id(), e);
                }
                self.apply(record, JobEvent::TimedOut);
                record.error = Some(reason.clone());
                self.emit(MarketEvent::JobFailed {
                    job_id: self.job_id.clone(),
                    reason,
                    timestamp: Utc::now(),
                });
                warn!(
                    "job {}: execution exceeded {}s",
                    record.short_id(),
                    self.config.timeouts.execution_secs
                );
                None
            }
        }
    }

    /// Forward deltas as they come, holding one back so the last can be
    /// flagged `is_final`.
    async fn execute_streaming(&self, request: ExecutionRequest) -> backends::Result<String> {
        let mut stream = self.backend.execute_stream(request).await?;
        let mut full = String::new();
        let mut held: Option<String> = None;
        while let Some(delta) = stream.recv().await {
            let delta = delta?;
            if let Some(chunk) = held.replace(delta) {
                self.forward_chunk(&chunk, false).await;
                full.push_str(&chunk);
            }
        }
        if let Some(chunk) = held {
            self.forward_chunk(&chunk, true).await;
            full.push_str(&chunk);
        }
        Ok(full)
    }

    async fn forward_chunk(&self, chunk: &str, is_final: bool) {
        let msg = MarketMessage::StreamChunk {
            job_id: self.job_id.clone(),
            chunk: chunk.to_string(),
            is_final,
        };
        if let Err(e) = self.send(&msg).await {
            warn!("job {}: dropped stream chunk: {}", short(&self.job_id), e);
        }
    }

    async fn deliver(&self, record: &mut JobRecord, result: String) -> bool {
        let msg = MarketMessage::JobResult {
            job_id: self.job_id.clone(),
            result: result.clone(),
        };
        if let Err(e) = self.send(&msg).await {
            warn!("job {}: could not publish result: {}", record.short_id(), e);
            return false;
        }
        let bytes = result.len();
        self.apply(record, JobEvent::ResultReady { content: result });
        record.clear_deadline();
        self.emit(MarketEvent::ResultDelivered {
            job_id: self.job_id.clone(),
            bytes,
            timestamp: Utc::now(),
        });
        info!(
            "job {}: result delivered ({} bytes)",
            record.short_id(),
            bytes
        );
        true
    }

    /// Hold for the preimage after delivering the result.
    ///
    /// The result is re-sent once if the release window lapses. When the
    /// escrow itself expires the job is written off; the funds return to
    /// the requester on their wallet's clock, not ours.
    async fn await_release(
        &self,
        record: &mut JobRecord,
        mailbox: &mut mpsc::Receiver<Record>,
        expiry_secs: u64,
        locked_at: Instant,
    ) {
        let escrow_deadline = locked_at + Duration::from_secs(expiry_secs);
        let reminder_at = Instant::now() + Duration::from_secs(self.config.timeouts.release_secs);
        record.set_deadline(
            escrow_deadline
                .saturating_duration_since(Instant::now())
                .as_secs(),
        );
        let mut reminded = false;
        loop {
            let wake = if reminded {
                escrow_deadline
            } else {
                escrow_deadline.min(reminder_at)
            };
            let wait = wake.saturating_duration_since(Instant::now());
            let received = match timeout(wait, mailbox.recv()).await {
                Ok(Some(received)) => received,
                Ok(None) => return,
                Err(_) => {
                    if !reminded && Instant::now() < escrow_deadline {
                        reminded = true;
                        if let Some(result) = record.result.clone() {
                            let msg = MarketMessage::JobResult {
                                job_id: self.job_id.clone(),
                                result,
                            };
                            let _ = self.send(&msg).await;
                            info!(
                                "job {}: re-sent result, still awaiting release",
                                record.short_id()
                            );
                        }
                        continue;
                    }
                    let state = record.state;
                    self.apply(record, JobEvent::EscrowExpired);
                    self.emit(MarketEvent::JobExpired {
                        job_id: self.job_id.clone(),
                        state,
                        timestamp: Utc::now(),
                    });
                    info!(
                        "job {}: escrow expired before release, funds return to the requester",
                        record.short_id()
                    );
                    return;
                }
            };
            if received.sender != self.requester {
                continue;
            }
            match parse_market_message(&received.payload) {
                Some(MarketMessage::PreimageRelease { preimage, .. }) => {
                    let opens = record
                        .payment_hash
                        .as_deref()
                        .map(|hash| verify_preimage(&preimage, hash))
                        .unwrap_or(false);
                    if !opens {
                        warn!(
                            "job {}: preimage does not open the lock, ignoring",
                            record.short_id()
                        );
                        continue;
                    }
                    match self.escrow.claim(&self.job_id, &preimage).await {
                        Ok(true) => {
                            record.set_preimage(&preimage);
                            self.apply(record, JobEvent::PreimageReleased);
                            self.apply(record, JobEvent::ClaimSettled);
                            let amount = record.price_msats.unwrap_or(0);
                            self.emit(MarketEvent::EscrowClaimed {
                                job_id: self.job_id.clone(),
                                amount_msats: amount,
                                timestamp: Utc::now(),
                            });
                            info!("job {}: claimed {} msats", record.short_id(), amount);
                            return;
                        }
                        Ok(false) => {
                            // Valid preimage, lock already expired.
                            self.apply(record, JobEvent::PreimageReleased);
                            self.apply(record, JobEvent::EscrowExpired);
                            warn!(
                                "job {}: release arrived after escrow expiry, claim bounced",
                                record.short_id()
                            );
                            return;
                        }
                        Err(e) => {
                            warn!("job {}: claim attempt failed: {}", record.short_id(), e);
                        }
                    }
                }
                Some(other) => {
                    debug!(
                        "job {}: unexpected {} while awaiting release",
                        record.short_id(),
                        other.kind_name()
                    );
                }
                None => {
                    warn!("job {}: unparseable payload, skipping", record.short_id());
                }
            }
        }
    }

    async fn send(&self, msg: &MarketMessage) -> crate::relay::Result<String> {
        publish_market_message(self.relay.as_ref(), &self.channel, msg).await
    }

    async fn publish_failure(&self, record: &mut JobRecord, reason: String) {
        let msg = MarketMessage::JobFailure {
            job_id: self.job_id.clone(),
            reason: reason.clone(),
        };
        if let Err(e) = self.send(&msg).await {
            warn!("job {}: could not publish failure: {}", record.short_id(), e);
        }
        self.fail(record, reason);
    }

    fn fail(&self, record: &mut JobRecord, reason: String) {
        warn!("job {}: {}", record.short_id(), reason);
        self.apply(record, JobEvent::FailureReported {
            reason: reason.clone(),
        });
        self.emit(MarketEvent::JobFailed {
            job_id: self.job_id.clone(),
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

// ============================================================================
// Tests
// ============================================================================
