//! End-to-end negotiation scenarios over the in-memory relay and ledger
//!
//! Each test wires real sessions onto a shared [`MemoryRelay`] and
//! [`MemoryLedger`] and drives complete negotiations through the wire
//! protocol: discovery, invoicing, conditional payment, execution,
//! release and settlement, with balance assertions on both sides.
//!
//! The manual-requester tests speak raw [`MarketMessage`]s at a live
//! provider session to exercise its defenses: duplicate requests, locks
//! that were never placed, wrong preimages, releases that arrive after
//! the escrow has lapsed, and schema-valid messages carrying hostile
//! field values.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};

use marketplace::protocol::{self, parse_market_message};
use marketplace::relay::{publish_market_message, subscribe_channel};
use marketplace::{
    CannedBackend, CapabilityKind, ChannelRef, ComputeBackend, ConsumerConfig, ConsumerSession,
    DiscoveryConfig, EscrowConfig, EscrowStatus, FailingBackend, JobState, MarketError,
    MarketEvent, MarketMessage, MemoryLedger, MemoryRelay, Network, ProviderConfig,
    ProviderListing, ProviderSession, Record, StallingBackend, TimeoutConfig, Wallet,
    derive_job_id, generate_preimage,
};

const CHANNEL: &str = "chan_market";
const PROMPT: &str = "What is 6 * 7?";

fn quick_provider(price_msats: u64) -> ProviderConfig {
    ProviderConfig::new(CHANNEL, price_msats)
        .with_timeouts(TimeoutConfig::quick())
        .with_discovery(DiscoveryConfig::quick())
}

fn quick_consumer() -> ConsumerConfig {
    ConsumerConfig::new(CHANNEL)
        .with_timeouts(TimeoutConfig::quick())
        .with_discovery(DiscoveryConfig::quick())
}

/// Spawn a provider session serving the market channel, returning the
/// session handle and its audit event stream.
fn spawn_provider(
    relay: &MemoryRelay,
    ledger: &Arc<MemoryLedger>,
    name: &str,
    backend: impl ComputeBackend + 'static,
    config: ProviderConfig,
) -> (Arc<ProviderSession>, mpsc::UnboundedReceiver<MarketEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let session = Arc::new(
        ProviderSession::new(
            Arc::new(relay.handle(name)),
            Arc::new(ledger.wallet(name, 0)),
            Arc::new(backend),
            config,
        )
        .with_events(events_tx),
    );
    let server = session.clone();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    (session, events_rx)
}

fn consumer_session(
    relay: &MemoryRelay,
    ledger: &Arc<MemoryLedger>,
    name: &str,
    funds_msats: u64,
    config: ConsumerConfig,
) -> (ConsumerSession, mpsc::UnboundedReceiver<MarketEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let session = ConsumerSession::new(
        Arc::new(relay.handle(name)),
        Arc::new(ledger.wallet(name, funds_msats)),
        config,
    )
    .with_events(events_tx);
    (session, events_rx)
}

async fn balance_of(ledger: &Arc<MemoryLedger>, owner: &str) -> u64 {
    ledger
        .wallet(owner, 0)
        .balance()
        .await
        .expect("ledger should know the account")
}

async fn balance_is(ledger: &Arc<MemoryLedger>, owner: &str, expected: u64) -> bool {
    balance_of(ledger, owner).await == expected
}

/// Poll until the check passes; settlement runs in the provider's task,
/// so balance changes trail the consumer's return by a beat.
async fn eventually<F, Fut>(label: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {label}");
        }
        sleep(Duration::from_millis(25)).await;
    }
}

fn drain_events(rx: &mut mpsc::UnboundedReceiver<MarketEvent>) -> Vec<MarketEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn event_index(events: &[MarketEvent], label: &str, pred: impl Fn(&MarketEvent) -> bool) -> usize {
    events.iter().position(|e| pred(e)).unwrap_or_else(|| {
        let seen: Vec<String> = events.iter().map(|e| e.description()).collect();
        panic!("missing {label}; saw {seen:?}")
    })
}

/// Wait for the next message from a counterparty that the predicate
/// accepts, skipping our own publishes and anything unparseable.
async fn await_message<F>(
    inbox: &mut mpsc::Receiver<Record>,
    own_id: &str,
    mut want: F,
) -> MarketMessage
where
    F: FnMut(&MarketMessage) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let record = inbox
                .recv()
                .await
                .expect("relay subscription should stay open");
            if record.sender == own_id {
                continue;
            }
            let Some(msg) = parse_market_message(&record.payload) else {
                continue;
            };
            if want(&msg) {
                return msg;
            }
        }
    })
    .await
    .expect("expected message within 5s")
}

// ============================================================================
// Full Session Scenarios
// ============================================================================

/// Happy path: request, invoice, lock, execute, deliver, release, claim.
/// 10,000 msats move from the consumer to the provider and nobody else.
#[tokio::test]
async fn test_escrowed_job_settles_end_to_end() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let (provider, mut provider_events) = spawn_provider(
        &relay,
        &ledger,
        "provider_a",
        CannedBackend::new("42"),
        quick_provider(10_000),
    );
    let (consumer, mut consumer_events) =
        consumer_session(&relay, &ledger, "consumer_1", 50_000, quick_consumer());

    let record = consumer.run_job(PROMPT).await.expect("negotiation should run");

    assert_eq!(record.state, JobState::Released);
    assert_eq!(record.result.as_deref(), Some("42"));
    assert_eq!(record.price_msats, Some(10_000));
    assert_eq!(record.provider_id, "provider_a");

    // The provider claims once it observes the release.
    eventually("provider claim", || balance_is(&ledger, "provider_a", 10_000)).await;
    assert_eq!(balance_of(&ledger, "consumer_1").await, 40_000);

    let escrow = provider
        .escrow()
        .state(&record.job_id)
        .await
        .expect("tracked escrow");
    assert_eq!(escrow.status, EscrowStatus::Claimed);

    let events = drain_events(&mut consumer_events);
    let discovered = event_index(&events, "ProviderDiscovered", |e| {
        matches!(e, MarketEvent::ProviderDiscovered { .. })
    });
    let selected = event_index(&events, "ProviderSelected", |e| {
        matches!(e, MarketEvent::ProviderSelected { .. })
    });
    let requested = event_index(&events, "JobRequested", |e| {
        matches!(e, MarketEvent::JobRequested { .. })
    });
    let invoiced = event_index(&events, "InvoiceIssued", |e| {
        matches!(e, MarketEvent::InvoiceIssued { amount_msats: 10_000, .. })
    });
    let locked = event_index(&events, "EscrowLocked", |e| {
        matches!(e, MarketEvent::EscrowLocked { amount_msats: 10_000, .. })
    });
    let delivered = event_index(&events, "ResultDelivered", |e| {
        matches!(e, MarketEvent::ResultDelivered { .. })
    });
    let released = event_index(&events, "PreimageReleased", |e| {
        matches!(e, MarketEvent::PreimageReleased { .. })
    });
    assert!(discovered < selected && selected < requested && requested < invoiced);
    assert!(invoiced < locked && locked < delivered && delivered < released);
    assert!(events.iter().any(|e| matches!(
        e,
        MarketEvent::StateChanged { to: JobState::Released, .. }
    )));

    // Provider side: verification precedes execution, delivery precedes claim.
    sleep(Duration::from_millis(100)).await;
    let events = drain_events(&mut provider_events);
    let verified = event_index(&events, "LockVerified", |e| {
        matches!(e, MarketEvent::LockVerified { .. })
    });
    let executing = event_index(&events, "ExecutionStarted", |e| {
        matches!(e, MarketEvent::ExecutionStarted { .. })
    });
    let delivered = event_index(&events, "ResultDelivered", |e| {
        matches!(e, MarketEvent::ResultDelivered { .. })
    });
    let claimed = event_index(&events, "EscrowClaimed", |e| {
        matches!(e, MarketEvent::EscrowClaimed { amount_msats: 10_000, .. })
    });
    assert!(verified < executing && executing < delivered && delivered < claimed);
}

/// Streaming delivery: chunks cross the wire in order, only the last one
/// carries the final flag, and the consumer's result is the full text.
#[tokio::test]
async fn test_streamed_result_reassembles_at_the_consumer() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let reply = "the quick brown fox jumps over the lazy dog";
    let _provider = spawn_provider(
        &relay,
        &ledger,
        "provider_a",
        CannedBackend::new(reply).with_chunk_size(8),
        quick_provider(10_000).with_streaming(true),
    );

    // Wiretap the channel to observe the chunks as published.
    let observer = relay.handle("observer");
    let mut tap = subscribe_channel(&observer, CHANNEL).await.expect("subscribe");

    let (consumer, _) = consumer_session(&relay, &ledger, "consumer_1", 50_000, quick_consumer());
    let record = consumer.run_job(PROMPT).await.expect("negotiation should run");

    assert_eq!(record.state, JobState::Released);
    assert_eq!(record.result.as_deref(), Some(reply));

    sleep(Duration::from_millis(100)).await;
    let mut chunks: Vec<(String, bool)> = Vec::new();
    while let Ok(received) = tap.try_recv() {
        if received.job_id.as_deref() != Some(record.job_id.as_str()) {
            continue;
        }
        if let Some(MarketMessage::StreamChunk { chunk, is_final, .. }) =
            parse_market_message(&received.payload)
        {
            chunks.push((chunk, is_final));
        }
    }
    assert!(chunks.len() > 1, "expected several chunks, got {}", chunks.len());
    let assembled: String = chunks.iter().map(|(chunk, _)| chunk.as_str()).collect();
    assert_eq!(assembled, reply);
    assert!(chunks.iter().rev().skip(1).all(|(_, is_final)| !*is_final));
    assert_eq!(chunks.last().map(|(_, is_final)| *is_final), Some(true));
}

/// A listing with nobody behind it: the request times out waiting for an
/// invoice and no funds ever move.
#[tokio::test]
async fn test_unresponsive_provider_fails_the_job_without_moving_funds() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);

    let ghost = relay.handle("ghost_provider");
    let channel = ChannelRef::new(CHANNEL, vec![]);
    publish_market_message(
        &ghost,
        &channel,
        &MarketMessage::ServiceAnnouncement {
            provider_id: "ghost_provider".to_string(),
            capability: CapabilityKind::TextGeneration,
            price_msats: 10_000,
            network: Network::Regtest,
            models: vec![],
            channel: channel.clone(),
        },
    )
    .await
    .expect("publish");

    let (consumer, mut events) =
        consumer_session(&relay, &ledger, "consumer_1", 50_000, quick_consumer());
    let record = consumer.run_job(PROMPT).await.expect("negotiation should run");

    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.error.as_deref(), Some("no invoice within 2s"));
    assert!(record.result.is_none());
    assert_eq!(balance_of(&ledger, "consumer_1").await, 50_000);

    let events = drain_events(&mut events);
    assert!(events.iter().any(|e| matches!(e, MarketEvent::JobFailed { .. })));
}

/// The provider verifies the lock and starts work but never finishes; the
/// execution window lapses, the escrow expires and the consumer refunds.
#[tokio::test]
async fn test_stalled_execution_refunds_the_escrow() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let timeouts = TimeoutConfig {
        execution_secs: 2,
        ..TimeoutConfig::quick()
    };

    let (_provider, mut provider_events) = spawn_provider(
        &relay,
        &ledger,
        "provider_a",
        StallingBackend,
        quick_provider(10_000).with_timeouts(timeouts.clone()),
    );

    let config = quick_consumer()
        .with_timeouts(timeouts)
        .with_escrow(EscrowConfig::default().with_expiry(1));
    let (consumer, mut events) =
        consumer_session(&relay, &ledger, "consumer_1", 50_000, config);

    let record = consumer.run_job(PROMPT).await.expect("negotiation should run");

    assert_eq!(record.state, JobState::Refunded);
    let error = record.error.expect("refund reason");
    assert!(error.contains("execution timed out"), "unexpected reason: {error}");

    // Everyone got their money back; nobody got paid.
    assert_eq!(balance_of(&ledger, "consumer_1").await, 50_000);
    assert_eq!(balance_of(&ledger, "provider_a").await, 0);

    let events = drain_events(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        MarketEvent::EscrowRefunded { amount_msats: 10_000, .. }
    )));

    let provider_events = drain_events(&mut provider_events);
    assert!(provider_events
        .iter()
        .any(|e| matches!(e, MarketEvent::JobFailed { .. })));
}

/// The backend rejects the job before the lock can expire, so the inline
/// refund is refused; the funds stay recoverable through the escrow
/// coordinator once the expiry passes, and the refund settles only once.
#[tokio::test]
async fn test_failed_execution_leaves_funds_recoverable_after_expiry() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let _provider = spawn_provider(
        &relay,
        &ledger,
        "provider_a",
        FailingBackend::new("model not loaded"),
        quick_provider(10_000),
    );

    let config = quick_consumer().with_escrow(EscrowConfig::default().with_expiry(1));
    let (consumer, _) = consumer_session(&relay, &ledger, "consumer_1", 50_000, config);

    let record = consumer.run_job(PROMPT).await.expect("negotiation should run");

    assert_eq!(record.state, JobState::Failed);
    let error = record.error.expect("failure reason");
    assert!(error.contains("model not loaded"), "unexpected reason: {error}");
    assert!(error.contains("refund later"), "unexpected reason: {error}");
    assert_eq!(balance_of(&ledger, "consumer_1").await, 40_000);

    sleep(Duration::from_millis(1_200)).await;
    let refunded = consumer
        .escrow()
        .refund_if_expired(&record.job_id)
        .await
        .expect("refund attempt");
    assert!(refunded);
    assert_eq!(balance_of(&ledger, "consumer_1").await, 50_000);

    // A retry reports success without moving funds twice.
    assert!(consumer
        .escrow()
        .refund_if_expired(&record.job_id)
        .await
        .expect("refund retry"));
    assert_eq!(balance_of(&ledger, "consumer_1").await, 50_000);
}

/// Two providers at 8,000 and 10,000 msats; the cheapest policy picks the
/// 8,000 one, and repeated discovery keeps picking it.
#[tokio::test]
async fn test_cheapest_provider_wins_the_selection() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let _steep = spawn_provider(
        &relay,
        &ledger,
        "provider_steep",
        CannedBackend::new("42"),
        quick_provider(10_000),
    );
    let _cheap = spawn_provider(
        &relay,
        &ledger,
        "provider_cheap",
        CannedBackend::new("42"),
        quick_provider(8_000),
    );

    let (consumer, _) = consumer_session(&relay, &ledger, "consumer_1", 50_000, quick_consumer());
    let record = consumer.run_job(PROMPT).await.expect("negotiation should run");

    assert_eq!(record.provider_id, "provider_cheap");
    assert_eq!(record.price_msats, Some(8_000));
    assert_eq!(record.state, JobState::Released);

    eventually("cheap provider claim", || {
        balance_is(&ledger, "provider_cheap", 8_000)
    })
    .await;
    assert_eq!(balance_of(&ledger, "provider_steep").await, 0);
    assert_eq!(balance_of(&ledger, "consumer_1").await, 42_000);

    // Same field, same winner, every time.
    for _ in 0..3 {
        let listing = consumer.discover().await.expect("discovery");
        assert_eq!(listing.provider_id, "provider_cheap");
    }
}

/// With escrow off on both sides the invoice is paid outright and the job
/// completes at delivery; there is no lock and nothing to release.
#[tokio::test]
async fn test_direct_payment_without_escrow() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let (_provider, mut provider_events) = spawn_provider(
        &relay,
        &ledger,
        "provider_a",
        CannedBackend::new("42"),
        quick_provider(10_000).with_require_htlc(false),
    );

    let (consumer, mut events) = consumer_session(
        &relay,
        &ledger,
        "consumer_1",
        50_000,
        quick_consumer().with_use_htlc(false),
    );
    let record = consumer.run_job(PROMPT).await.expect("negotiation should run");

    assert_eq!(record.state, JobState::ResultDelivered);
    assert_eq!(record.result.as_deref(), Some("42"));
    assert!(record.preimage.is_none());
    assert!(record.payment_hash.is_none());

    assert_eq!(balance_of(&ledger, "consumer_1").await, 40_000);
    assert_eq!(balance_of(&ledger, "provider_a").await, 10_000);

    let events = drain_events(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        MarketEvent::PaymentDispatched { amount_msats: 10_000, .. }
    )));
    assert!(!events.iter().any(|e| matches!(e, MarketEvent::EscrowLocked { .. })));

    sleep(Duration::from_millis(100)).await;
    let provider_events = drain_events(&mut provider_events);
    assert!(!provider_events
        .iter()
        .any(|e| matches!(e, MarketEvent::LockVerified { .. })));
}

#[tokio::test]
async fn test_empty_market_reports_no_provider() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let (consumer, _) = consumer_session(&relay, &ledger, "consumer_1", 50_000, quick_consumer());

    let err = consumer.run_job(PROMPT).await.expect_err("no market");
    assert!(matches!(err, MarketError::NoProviderFound));
    assert_eq!(balance_of(&ledger, "consumer_1").await, 50_000);
}

/// Negotiation refuses listings it could never settle before touching the
/// wire: quotes over the budget and listings on the wrong network.
#[tokio::test]
async fn test_negotiate_rejects_unaffordable_and_foreign_listings() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let config = quick_consumer().with_max_price(10_000);
    let (consumer, _) = consumer_session(&relay, &ledger, "consumer_1", 50_000, config);

    let listing = ProviderListing {
        provider_id: "provider_steep".to_string(),
        capability: CapabilityKind::TextGeneration,
        price_msats: 12_000,
        network: Network::Regtest,
        models: vec![],
        channel: ChannelRef::new(CHANNEL, vec![]),
        first_seen: 0,
        last_seen: chrono::Utc::now(),
    };
    let err = consumer
        .negotiate(&listing, PROMPT)
        .await
        .expect_err("over budget");
    assert!(matches!(
        err,
        MarketError::OverBudget { quoted: 12_000, budget: 10_000 }
    ));

    let listing = ProviderListing {
        price_msats: 9_000,
        network: Network::Mainnet,
        ..listing
    };
    let err = consumer
        .negotiate(&listing, PROMPT)
        .await
        .expect_err("wrong network");
    assert!(matches!(err, MarketError::NetworkMismatch { .. }));

    assert_eq!(balance_of(&ledger, "consumer_1").await, 50_000);
}

/// With discovery off, the first matching announcement wins immediately
/// instead of waiting out the collection window.
#[tokio::test]
async fn test_first_announcement_wins_when_discovery_is_off() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let _provider = spawn_provider(
        &relay,
        &ledger,
        "provider_a",
        CannedBackend::new("42"),
        quick_provider(10_000),
    );

    let mut config = quick_consumer().with_discover(false);
    // A window this long only ends early because the first match wins.
    config.discovery.window_secs = 30;
    let (consumer, _) = consumer_session(&relay, &ledger, "consumer_1", 50_000, config);

    let started = Instant::now();
    let record = consumer.run_job(PROMPT).await.expect("negotiation should run");
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "selection should not wait out the window"
    );
    assert_eq!(record.state, JobState::Released);
}

// ============================================================================
// Manual Requester Scenarios
// ============================================================================

/// Publishing the same request twice yields one tracked job and one
/// invoice; the duplicate is a no-op.
#[tokio::test]
async fn test_duplicate_requests_yield_one_invoice() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let (provider, _) = spawn_provider(
        &relay,
        &ledger,
        "provider_a",
        CannedBackend::new("42"),
        quick_provider(10_000),
    );

    let requester = relay.handle("manual_consumer");
    let channel = ChannelRef::new(CHANNEL, vec![]);
    let mut inbox = subscribe_channel(&requester, CHANNEL).await.expect("subscribe");
    // The announcement proves the provider is serving before we publish.
    await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::ServiceAnnouncement { .. })
    })
    .await;

    let job_id = derive_job_id("manual_consumer", "provider_a", PROMPT, protocol::now());
    let request = MarketMessage::JobRequest {
        job_id: job_id.clone(),
        kind: CapabilityKind::TextGeneration.job_kind(),
        prompt: PROMPT.to_string(),
        max_tokens: 256,
        target_provider: Some("provider_a".to_string()),
    };
    publish_market_message(&requester, &channel, &request)
        .await
        .expect("publish");
    publish_market_message(&requester, &channel, &request)
        .await
        .expect("publish");

    let msg = await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::Invoice { .. })
    })
    .await;
    let MarketMessage::Invoice { amount_msats, .. } = msg else {
        unreachable!()
    };
    assert_eq!(amount_msats, 10_000);

    sleep(Duration::from_millis(300)).await;
    let mut invoices = 1;
    while let Ok(received) = inbox.try_recv() {
        if received.sender == "manual_consumer" {
            continue;
        }
        if let Some(MarketMessage::Invoice { job_id: id, .. }) =
            parse_market_message(&received.payload)
        {
            if id == job_id {
                invoices += 1;
            }
        }
    }
    assert_eq!(invoices, 1, "duplicate request must not be re-invoiced");
    assert!(provider.supervisor().contains(&job_id).await);
    assert_eq!(provider.supervisor().active().await, 1);
}

/// Announcing a lock that was never placed in the ledger gets the job
/// declined; the provider does no work for an unverified lock.
#[tokio::test]
async fn test_announced_lock_that_was_never_placed_is_rejected() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let _provider = spawn_provider(
        &relay,
        &ledger,
        "provider_a",
        CannedBackend::new("42"),
        quick_provider(10_000),
    );

    let requester = relay.handle("manual_consumer");
    ledger.wallet("manual_consumer", 50_000);
    let channel = ChannelRef::new(CHANNEL, vec![]);
    let mut inbox = subscribe_channel(&requester, CHANNEL).await.expect("subscribe");
    await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::ServiceAnnouncement { .. })
    })
    .await;

    let job_id = derive_job_id("manual_consumer", "provider_a", PROMPT, protocol::now());
    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::JobRequest {
            job_id: job_id.clone(),
            kind: CapabilityKind::TextGeneration.job_kind(),
            prompt: PROMPT.to_string(),
            max_tokens: 256,
            target_provider: Some("provider_a".to_string()),
        },
    )
    .await
    .expect("publish");
    await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::Invoice { .. })
    })
    .await;

    // A payment hash with no lock behind it.
    let (_, payment_hash) = generate_preimage();
    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::HtlcLocked {
            job_id: job_id.clone(),
            payment_hash,
            amount_msats: 10_000,
            expiry_secs: 3600,
        },
    )
    .await
    .expect("publish");

    let msg = await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::JobFailure { .. })
    })
    .await;
    let MarketMessage::JobFailure { reason, .. } = msg else {
        unreachable!()
    };
    assert!(reason.contains("did not verify"), "unexpected reason: {reason}");

    sleep(Duration::from_millis(300)).await;
    while let Ok(received) = inbox.try_recv() {
        if let Some(msg) = parse_market_message(&received.payload) {
            assert!(
                !matches!(
                    msg,
                    MarketMessage::JobResult { .. } | MarketMessage::StreamChunk { .. }
                ),
                "provider must not execute an unverified job"
            );
        }
    }
    assert_eq!(balance_of(&ledger, "provider_a").await, 0);
    assert_eq!(balance_of(&ledger, "manual_consumer").await, 50_000);
}

/// A preimage for some other lock opens nothing; the matching one settles
/// the claim.
#[tokio::test]
async fn test_wrong_preimage_cannot_claim_the_lock() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let (provider, _) = spawn_provider(
        &relay,
        &ledger,
        "provider_a",
        CannedBackend::new("42"),
        quick_provider(10_000),
    );

    let requester = relay.handle("manual_consumer");
    let wallet = ledger.wallet("manual_consumer", 50_000);
    let channel = ChannelRef::new(CHANNEL, vec![]);
    let mut inbox = subscribe_channel(&requester, CHANNEL).await.expect("subscribe");
    await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::ServiceAnnouncement { .. })
    })
    .await;

    let job_id = derive_job_id("manual_consumer", "provider_a", PROMPT, protocol::now());
    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::JobRequest {
            job_id: job_id.clone(),
            kind: CapabilityKind::TextGeneration.job_kind(),
            prompt: PROMPT.to_string(),
            max_tokens: 256,
            target_provider: Some("provider_a".to_string()),
        },
    )
    .await
    .expect("publish");
    let msg = await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::Invoice { .. })
    })
    .await;
    let MarketMessage::Invoice { amount_msats, .. } = msg else {
        unreachable!()
    };

    let (preimage, payment_hash) = generate_preimage();
    wallet
        .lock_conditional(amount_msats, &payment_hash, 3600)
        .await
        .expect("lock");
    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::HtlcLocked {
            job_id: job_id.clone(),
            payment_hash,
            amount_msats,
            expiry_secs: 3600,
        },
    )
    .await
    .expect("publish");

    await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::JobResult { .. })
    })
    .await;

    let (wrong, _) = generate_preimage();
    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::PreimageRelease {
            job_id: job_id.clone(),
            preimage: wrong,
        },
    )
    .await
    .expect("publish");
    sleep(Duration::from_millis(300)).await;
    assert_eq!(balance_of(&ledger, "provider_a").await, 0);

    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::PreimageRelease {
            job_id: job_id.clone(),
            preimage,
        },
    )
    .await
    .expect("publish");
    eventually("claim after the real release", || {
        balance_is(&ledger, "provider_a", amount_msats)
    })
    .await;
    assert_eq!(balance_of(&ledger, "manual_consumer").await, 50_000 - amount_msats);

    let escrow = provider.escrow().state(&job_id).await.expect("tracked escrow");
    assert_eq!(escrow.status, EscrowStatus::Claimed);
}

/// The requester sits on the result past the escrow expiry. The provider
/// writes the job off, the late release claims nothing, and the refund
/// belongs to the requester.
#[tokio::test]
async fn test_late_release_cannot_beat_the_expiry_clock() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let (_provider, mut provider_events) = spawn_provider(
        &relay,
        &ledger,
        "provider_a",
        CannedBackend::new("42"),
        quick_provider(10_000),
    );

    let requester = relay.handle("manual_consumer");
    let wallet = ledger.wallet("manual_consumer", 50_000);
    let channel = ChannelRef::new(CHANNEL, vec![]);
    let mut inbox = subscribe_channel(&requester, CHANNEL).await.expect("subscribe");
    await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::ServiceAnnouncement { .. })
    })
    .await;

    let job_id = derive_job_id("manual_consumer", "provider_a", PROMPT, protocol::now());
    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::JobRequest {
            job_id: job_id.clone(),
            kind: CapabilityKind::TextGeneration.job_kind(),
            prompt: PROMPT.to_string(),
            max_tokens: 256,
            target_provider: Some("provider_a".to_string()),
        },
    )
    .await
    .expect("publish");
    await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::Invoice { .. })
    })
    .await;

    let (preimage, payment_hash) = generate_preimage();
    let lock = wallet
        .lock_conditional(10_000, &payment_hash, 1)
        .await
        .expect("lock");
    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::HtlcLocked {
            job_id: job_id.clone(),
            payment_hash,
            amount_msats: 10_000,
            expiry_secs: 1,
        },
    )
    .await
    .expect("publish");

    await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::JobResult { .. })
    })
    .await;

    // Sit on the result until the lock has lapsed.
    sleep(Duration::from_millis(1_500)).await;
    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::PreimageRelease {
            job_id: job_id.clone(),
            preimage,
        },
    )
    .await
    .expect("publish");
    sleep(Duration::from_millis(300)).await;

    assert_eq!(balance_of(&ledger, "provider_a").await, 0);
    assert!(wallet.refund_conditional(&lock).await.expect("refund"));
    assert_eq!(balance_of(&ledger, "manual_consumer").await, 50_000);

    let events = drain_events(&mut provider_events);
    assert!(events.iter().any(|e| matches!(
        e,
        MarketEvent::JobExpired { state: JobState::ResultDelivered, .. }
    )));
}

// ============================================================================
// Manual Provider Scenarios
// ============================================================================

/// A provider that baits with a low announcement and invoices above the
/// budget gets refused before any payment.
#[tokio::test]
async fn test_invoice_above_the_budget_is_refused() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let scalper = relay.handle("scalper");
    let channel = ChannelRef::new(CHANNEL, vec![]);
    let mut scalper_inbox = subscribe_channel(&scalper, CHANNEL).await.expect("subscribe");
    publish_market_message(
        &scalper,
        &channel,
        &MarketMessage::ServiceAnnouncement {
            provider_id: "scalper".to_string(),
            capability: CapabilityKind::TextGeneration,
            price_msats: 9_000,
            network: Network::Regtest,
            models: vec![],
            channel: channel.clone(),
        },
    )
    .await
    .expect("publish");

    let config = quick_consumer().with_max_price(10_000);
    let (consumer, _) = consumer_session(&relay, &ledger, "consumer_1", 50_000, config);
    let consumer_task = tokio::spawn(async move { consumer.run_job(PROMPT).await });

    let msg = await_message(&mut scalper_inbox, "scalper", |m| {
        matches!(m, MarketMessage::JobRequest { .. })
    })
    .await;
    let MarketMessage::JobRequest { job_id, .. } = msg else {
        unreachable!()
    };
    publish_market_message(
        &scalper,
        &channel,
        &MarketMessage::Invoice {
            job_id,
            bolt11: format!("{}12000n1scalp", Network::Regtest.bolt11_prefix()),
            amount_msats: 12_000,
            payment_hash: None,
        },
    )
    .await
    .expect("publish");

    let record = consumer_task
        .await
        .expect("join")
        .expect("negotiation should run");
    assert_eq!(record.state, JobState::Failed);
    let error = record.error.expect("failure reason");
    assert!(error.contains("exceeds"), "unexpected reason: {error}");
    assert_eq!(balance_of(&ledger, "consumer_1").await, 50_000);
}

/// An invoice whose bolt11 is for another network is refused before
/// payment, whatever the quoted amount.
#[tokio::test]
async fn test_invoice_from_another_network_is_refused() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let scalper = relay.handle("scalper");
    let channel = ChannelRef::new(CHANNEL, vec![]);
    let mut scalper_inbox = subscribe_channel(&scalper, CHANNEL).await.expect("subscribe");
    publish_market_message(
        &scalper,
        &channel,
        &MarketMessage::ServiceAnnouncement {
            provider_id: "scalper".to_string(),
            capability: CapabilityKind::TextGeneration,
            price_msats: 9_000,
            network: Network::Regtest,
            models: vec![],
            channel: channel.clone(),
        },
    )
    .await
    .expect("publish");

    let (consumer, _) = consumer_session(&relay, &ledger, "consumer_1", 50_000, quick_consumer());
    let consumer_task = tokio::spawn(async move { consumer.run_job(PROMPT).await });

    let msg = await_message(&mut scalper_inbox, "scalper", |m| {
        matches!(m, MarketMessage::JobRequest { .. })
    })
    .await;
    let MarketMessage::JobRequest { job_id, .. } = msg else {
        unreachable!()
    };
    publish_market_message(
        &scalper,
        &channel,
        &MarketMessage::Invoice {
            job_id,
            // Mainnet prefix against a regtest session.
            bolt11: "lnbc9000n1scalp".to_string(),
            amount_msats: 9_000,
            payment_hash: None,
        },
    )
    .await
    .expect("publish");

    let record = consumer_task
        .await
        .expect("join")
        .expect("negotiation should run");
    assert_eq!(record.state, JobState::Failed);
    let error = record.error.expect("failure reason");
    assert!(error.contains("mainnet"), "unexpected reason: {error}");
    assert_eq!(balance_of(&ledger, "consumer_1").await, 50_000);
}

// ============================================================================
// Hostile Inputs
// ============================================================================

/// A request whose job id is arbitrary multibyte text fails the
/// derivation check and is dropped; the session stays up and serves the
/// next well-formed request.
#[tokio::test]
async fn test_multibyte_job_id_is_dropped_and_service_continues() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let (provider, _) = spawn_provider(
        &relay,
        &ledger,
        "provider_a",
        CannedBackend::new("42"),
        quick_provider(10_000),
    );

    let requester = relay.handle("manual_consumer");
    let channel = ChannelRef::new(CHANNEL, vec![]);
    let mut inbox = subscribe_channel(&requester, CHANNEL).await.expect("subscribe");
    await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::ServiceAnnouncement { .. })
    })
    .await;

    // Schema-valid, but eight bytes into this id is mid-codepoint.
    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::JobRequest {
            job_id: "ジョブ識別子".to_string(),
            kind: CapabilityKind::TextGeneration.job_kind(),
            prompt: PROMPT.to_string(),
            max_tokens: 256,
            target_provider: Some("provider_a".to_string()),
        },
    )
    .await
    .expect("publish");

    let job_id = derive_job_id("manual_consumer", "provider_a", PROMPT, protocol::now());
    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::JobRequest {
            job_id: job_id.clone(),
            kind: CapabilityKind::TextGeneration.job_kind(),
            prompt: PROMPT.to_string(),
            max_tokens: 256,
            target_provider: Some("provider_a".to_string()),
        },
    )
    .await
    .expect("publish");

    let msg = await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::Invoice { .. })
    })
    .await;
    let MarketMessage::Invoice { job_id: invoiced, .. } = msg else {
        unreachable!()
    };
    assert_eq!(invoiced, job_id, "only the well-formed request is invoiced");
    assert!(!provider.supervisor().contains("ジョブ識別子").await);
}

/// An announcement under a multibyte provider id joins discovery like any
/// other; selection still lands on the cheaper real provider and every
/// audit line renders.
#[tokio::test]
async fn test_multibyte_provider_id_rides_through_discovery() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let _provider = spawn_provider(
        &relay,
        &ledger,
        "provider_a",
        CannedBackend::new("42"),
        quick_provider(10_000),
    );

    let decoy = relay.handle("プロバイダ壱号");
    let channel = ChannelRef::new(CHANNEL, vec![]);
    publish_market_message(
        &decoy,
        &channel,
        &MarketMessage::ServiceAnnouncement {
            provider_id: "プロバイダ壱号".to_string(),
            capability: CapabilityKind::TextGeneration,
            price_msats: 99_000,
            network: Network::Regtest,
            models: vec![],
            channel: channel.clone(),
        },
    )
    .await
    .expect("publish");

    let (consumer, mut events) =
        consumer_session(&relay, &ledger, "consumer_1", 50_000, quick_consumer());
    let record = consumer.run_job(PROMPT).await.expect("negotiation should run");

    assert_eq!(record.provider_id, "provider_a");
    assert_eq!(record.state, JobState::Released);
    eventually("provider claim", || balance_is(&ledger, "provider_a", 10_000)).await;

    let events = drain_events(&mut events);
    event_index(&events, "decoy ProviderDiscovered", |e| {
        matches!(
            e,
            MarketEvent::ProviderDiscovered { provider_id, .. } if provider_id == "プロバイダ壱号"
        )
    });
    for event in &events {
        assert!(!event.description().is_empty());
    }
}

/// The ledger lock is real but the announcement claims an absurd expiry.
/// The provider's deadline math must survive it and the flow settles
/// normally.
#[tokio::test]
async fn test_overstated_lock_expiry_still_settles() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let _provider = spawn_provider(
        &relay,
        &ledger,
        "provider_a",
        CannedBackend::new("42"),
        quick_provider(10_000),
    );

    let requester = relay.handle("manual_consumer");
    let wallet = ledger.wallet("manual_consumer", 50_000);
    let channel = ChannelRef::new(CHANNEL, vec![]);
    let mut inbox = subscribe_channel(&requester, CHANNEL).await.expect("subscribe");
    await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::ServiceAnnouncement { .. })
    })
    .await;

    let job_id = derive_job_id("manual_consumer", "provider_a", PROMPT, protocol::now());
    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::JobRequest {
            job_id: job_id.clone(),
            kind: CapabilityKind::TextGeneration.job_kind(),
            prompt: PROMPT.to_string(),
            max_tokens: 256,
            target_provider: Some("provider_a".to_string()),
        },
    )
    .await
    .expect("publish");
    let msg = await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::Invoice { .. })
    })
    .await;
    let MarketMessage::Invoice { amount_msats, .. } = msg else {
        unreachable!()
    };

    let (preimage, payment_hash) = generate_preimage();
    wallet
        .lock_conditional(amount_msats, &payment_hash, 3600)
        .await
        .expect("lock");
    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::HtlcLocked {
            job_id: job_id.clone(),
            payment_hash,
            amount_msats,
            expiry_secs: u64::MAX,
        },
    )
    .await
    .expect("publish");

    await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::JobResult { .. })
    })
    .await;

    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::PreimageRelease {
            job_id: job_id.clone(),
            preimage,
        },
    )
    .await
    .expect("publish");
    eventually("claim despite the overstated expiry", || {
        balance_is(&ledger, "provider_a", amount_msats)
    })
    .await;
    assert_eq!(balance_of(&ledger, "manual_consumer").await, 50_000 - amount_msats);
}

/// An announcement claiming a u64::MAX lock with nothing behind it is
/// refused at verification, and the session keeps serving honest traffic
/// afterwards.
#[tokio::test]
async fn test_oversized_lock_announcement_is_refused_without_stopping_service() {
    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(Network::Regtest);
    let _provider = spawn_provider(
        &relay,
        &ledger,
        "provider_a",
        CannedBackend::new("42"),
        quick_provider(10_000),
    );

    let requester = relay.handle("manual_consumer");
    let wallet = ledger.wallet("manual_consumer", 50_000);
    let channel = ChannelRef::new(CHANNEL, vec![]);
    let mut inbox = subscribe_channel(&requester, CHANNEL).await.expect("subscribe");
    await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::ServiceAnnouncement { .. })
    })
    .await;

    let job_id = derive_job_id("manual_consumer", "provider_a", PROMPT, protocol::now());
    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::JobRequest {
            job_id: job_id.clone(),
            kind: CapabilityKind::TextGeneration.job_kind(),
            prompt: PROMPT.to_string(),
            max_tokens: 256,
            target_provider: Some("provider_a".to_string()),
        },
    )
    .await
    .expect("publish");
    await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::Invoice { .. })
    })
    .await;

    // The largest claimable lock, with no ledger entry behind it.
    let (_, payment_hash) = generate_preimage();
    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::HtlcLocked {
            job_id: job_id.clone(),
            payment_hash,
            amount_msats: u64::MAX,
            expiry_secs: u64::MAX,
        },
    )
    .await
    .expect("publish");

    let msg = await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::JobFailure { .. })
    })
    .await;
    let MarketMessage::JobFailure { reason, .. } = msg else {
        unreachable!()
    };
    assert!(reason.contains("did not verify"), "unexpected reason: {reason}");

    // The session still settles a well-formed purchase end to end.
    let second_prompt = "What is 7 * 8?";
    let job2 = derive_job_id("manual_consumer", "provider_a", second_prompt, protocol::now());
    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::JobRequest {
            job_id: job2.clone(),
            kind: CapabilityKind::TextGeneration.job_kind(),
            prompt: second_prompt.to_string(),
            max_tokens: 256,
            target_provider: Some("provider_a".to_string()),
        },
    )
    .await
    .expect("publish");
    let msg = await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::Invoice { job_id, .. } if job_id == &job2)
    })
    .await;
    let MarketMessage::Invoice { amount_msats, .. } = msg else {
        unreachable!()
    };

    let (preimage, payment_hash) = generate_preimage();
    wallet
        .lock_conditional(amount_msats, &payment_hash, 3600)
        .await
        .expect("lock");
    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::HtlcLocked {
            job_id: job2.clone(),
            payment_hash,
            amount_msats,
            expiry_secs: 3600,
        },
    )
    .await
    .expect("publish");
    await_message(&mut inbox, "manual_consumer", |m| {
        matches!(m, MarketMessage::JobResult { job_id, .. } if job_id == &job2)
    })
    .await;
    publish_market_message(
        &requester,
        &channel,
        &MarketMessage::PreimageRelease {
            job_id: job2.clone(),
            preimage,
        },
    )
    .await
    .expect("publish");

    eventually("claim after the refused lock", || {
        balance_is(&ledger, "provider_a", amount_msats)
    })
    .await;
    assert_eq!(balance_of(&ledger, "manual_consumer").await, 50_000 - amount_msats);
}
