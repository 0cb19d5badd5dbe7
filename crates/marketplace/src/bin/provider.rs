//! Provider agent binary
//!
//! Serves compute in a marketplace channel, paid through hash-locked
//! escrow. Runs over the in-process relay and ledger, so the full
//! protocol can be exercised with an in-process buyer:
//!
//!   cargo run --bin provider -- --demo
//!
//! Without `--demo` the session serves its channel until killed:
//!
//!   cargo run --bin provider -- --channel agent-market --price 10000
//!
//! Set RUST_LOG=info (or debug) to watch the session logs on stderr.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rand::Rng;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use marketplace::relay::{DEFAULT_RELAY, create_channel};
use marketplace::{
    CannedBackend, ChannelRef, ConsumerConfig, ConsumerSession, DiscoveryConfig, JobState,
    MarketEvent, MemoryLedger, MemoryRelay, Network, ProviderConfig, ProviderSession,
    TimeoutConfig, Wallet,
};

#[derive(Parser)]
#[command(name = "provider")]
#[command(about = "Marketplace provider agent - sells compute for escrowed Lightning payments")]
struct Args {
    /// Market channel to serve
    #[arg(long, default_value = "agent-market")]
    channel: String,

    /// Relay URL (repeat or comma-delimit to use multiple relays)
    #[arg(long = "relay", value_delimiter = ',', default_value = DEFAULT_RELAY)]
    relays: Vec<String>,

    /// Price per job in millisatoshis
    #[arg(long, default_value = "10000")]
    price: u64,

    /// Payment network (mainnet, testnet, signet, regtest)
    #[arg(long, default_value = "regtest")]
    network: Network,

    /// Model name to advertise and execute with
    #[arg(long)]
    model: Option<String>,

    /// Stream results chunk by chunk instead of one final message
    #[arg(long)]
    stream: bool,

    /// Accept direct invoice payment without an escrow lock
    #[arg(long)]
    accept_direct: bool,

    /// Seconds between repeat announcements
    #[arg(long, default_value = "30")]
    announce_interval: u64,

    /// Reply text served by the canned backend
    #[arg(long, default_value = "42")]
    reply: String,

    /// Run one in-process purchase against this provider, then exit
    #[arg(long)]
    demo: bool,

    /// Prompt the demo buyer sends
    #[arg(long, default_value = "What do you get when you multiply six by nine?")]
    prompt: String,
}

fn init_logging() {
    let default_level = "warn";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    println!("=== Marketplace Provider ===\n");

    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(args.network);
    let provider_id = hex::encode(rand::rng().random::<[u8; 16]>());
    println!("[PROVIDER] Identity: {}", provider_id);
    println!(
        "[PROVIDER] Serving channel {} at {} msats on {}",
        args.channel, args.price, args.network
    );
    if args.accept_direct {
        println!("[PROVIDER] Escrow optional: direct payments accepted");
    } else {
        println!("[PROVIDER] Escrow required: executing only after a verified lock");
    }

    let mut config = ProviderConfig::new(&args.channel, args.price)
        .with_network(args.network)
        .with_streaming(args.stream)
        .with_require_htlc(!args.accept_direct);
    config.relay_urls = args.relays.clone();
    config.discovery.announce_interval_secs = args.announce_interval;
    if let Some(model) = &args.model {
        config = config.with_models(vec![model.clone()]);
    }

    // Mark the venue open; browsers resolve the channel metadata from this.
    let channel_ref = ChannelRef::new(&args.channel, args.relays.clone());
    create_channel(&relay.handle(&provider_id), &channel_ref, &args.channel).await?;

    let provider_wallet = ledger.wallet(&provider_id, 0);
    println!(
        "[PROVIDER] Wallet balance: {} msats",
        provider_wallet.balance().await?
    );

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<MarketEvent>();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            println!("[EVENT] {}", event.description());
        }
    });

    let session = Arc::new(
        ProviderSession::new(
            Arc::new(relay.handle(&provider_id)),
            Arc::new(provider_wallet.clone()),
            Arc::new(CannedBackend::new(&args.reply)),
            config,
        )
        .with_events(events_tx.clone()),
    );

    if !args.demo {
        session.run().await?;
        return Ok(());
    }

    // Demo: serve in the background and buy one job in-process.
    let server = session.clone();
    let serving = tokio::spawn(async move { server.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let consumer_id = hex::encode(rand::rng().random::<[u8; 16]>());
    let consumer_wallet = ledger.wallet(&consumer_id, args.price * 5);
    println!("[DEMO] Buyer {} funded with {} msats", consumer_id, args.price * 5);

    let consumer_config = ConsumerConfig::new(&args.channel)
        .with_network(args.network)
        .with_use_htlc(!args.accept_direct)
        .with_timeouts(TimeoutConfig::quick())
        .with_discovery(DiscoveryConfig::quick());
    let consumer = ConsumerSession::new(
        Arc::new(relay.handle(&consumer_id)),
        Arc::new(consumer_wallet.clone()),
        consumer_config,
    )
    .with_events(events_tx);

    let record = consumer.run_job(&args.prompt).await?;

    // Let the claim settle on the provider side before reading balances.
    tokio::time::sleep(Duration::from_millis(100)).await;
    serving.abort();

    println!("\n=== Outcome ===");
    println!("Job:      {}", record.short_id());
    println!("State:    {}", record.state);
    if let Some(result) = &record.result {
        println!("Result:   {}", result);
    }
    if let Some(error) = &record.error {
        println!("Error:    {}", error);
    }
    println!("Provider balance: {} msats", provider_wallet.balance().await?);
    println!("Consumer balance: {} msats", consumer_wallet.balance().await?);

    let settled = matches!(record.state, JobState::Released | JobState::Claimed)
        || (args.accept_direct && record.state == JobState::ResultDelivered);
    if !settled {
        std::process::exit(1);
    }
    Ok(())
}
