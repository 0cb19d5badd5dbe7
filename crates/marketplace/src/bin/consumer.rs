//! Consumer agent binary
//!
//! Discovers a provider in a marketplace channel, locks the payment in
//! escrow, and releases it only after the result arrives. Runs over the
//! in-process relay and ledger; `--local-provider` spawns a provider in
//! the same process so a full purchase can run end to end:
//!
//!   cargo run --bin consumer -- --prompt "What is the answer?" --local-provider
//!
//! Exit code 0 means the job settled (`released`, or delivered when
//! paying direct); anything else exits non-zero.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rand::Rng;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use marketplace::relay::DEFAULT_RELAY;
use marketplace::{
    CannedBackend, ConsumerConfig, ConsumerSession, JobState, MarketEvent, MemoryLedger,
    MemoryRelay, Network, ProviderConfig, ProviderSession, SelectionPolicy, Wallet,
};

#[derive(Parser)]
#[command(name = "consumer")]
#[command(about = "Marketplace consumer agent - buys compute with escrowed Lightning payments")]
struct Args {
    /// Market channel to buy from
    #[arg(long, default_value = "agent-market")]
    channel: String,

    /// The prompt to have executed
    #[arg(long)]
    prompt: String,

    /// Relay URL (repeat or comma-delimit to use multiple relays)
    #[arg(long = "relay", value_delimiter = ',', default_value = DEFAULT_RELAY)]
    relays: Vec<String>,

    /// Payment network (mainnet, testnet, signet, regtest)
    #[arg(long, default_value = "regtest")]
    network: Network,

    /// Selection policy: cheapest, first, or a provider id to pin
    #[arg(long, default_value = "cheapest")]
    select: SelectionPolicy,

    /// Spend ceiling per job in millisatoshis
    #[arg(long)]
    max_price: Option<u64>,

    /// Seconds to collect announcements before selecting
    #[arg(long, default_value = "5")]
    discovery_time: u64,

    /// Pay the invoice directly instead of locking escrow
    #[arg(long)]
    no_htlc: bool,

    /// Escrow expiry in seconds
    #[arg(long, default_value = "3600")]
    escrow_expiry: u64,

    /// Opening wallet balance in millisatoshis
    #[arg(long, default_value = "50000")]
    balance: u64,

    /// Serve the job from an in-process provider
    #[arg(long)]
    local_provider: bool,

    /// Price the in-process provider charges
    #[arg(long, default_value = "10000")]
    provider_price: u64,

    /// Reply text the in-process provider serves
    #[arg(long, default_value = "42")]
    reply: String,
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

    println!("=== Marketplace Consumer ===\n");

    let relay = MemoryRelay::new();
    let ledger = MemoryLedger::new(args.network);
    let consumer_id = hex::encode(rand::rng().random::<[u8; 16]>());
    println!("[CONSUMER] Identity: {}", consumer_id);
    println!(
        "[CONSUMER] Channel {} on {}, policy {}, balance {} msats",
        args.channel, args.network, args.select, args.balance
    );
    println!("[CONSUMER] Venue relays: {}", args.relays.join(", "));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<MarketEvent>();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            println!("[EVENT] {}", event.description());
        }
    });

    if args.local_provider {
        let provider_id = hex::encode(rand::rng().random::<[u8; 16]>());
        println!(
            "[LOCAL] Provider {} serving at {} msats",
            provider_id, args.provider_price
        );
        let provider_config = ProviderConfig::new(&args.channel, args.provider_price)
            .with_network(args.network)
            .with_require_htlc(!args.no_htlc);
        let provider = ProviderSession::new(
            Arc::new(relay.handle(&provider_id)),
            Arc::new(ledger.wallet(&provider_id, 0)),
            Arc::new(CannedBackend::new(&args.reply)),
            provider_config,
        )
        .with_events(events_tx.clone());
        tokio::spawn(async move { provider.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let consumer_wallet = ledger.wallet(&consumer_id, args.balance);
    let mut config = ConsumerConfig::new(&args.channel)
        .with_network(args.network)
        .with_policy(args.select.clone())
        .with_use_htlc(!args.no_htlc);
    if let Some(max) = args.max_price {
        config = config.with_max_price(max);
    }
    config.discovery.window_secs = args.discovery_time;
    config.escrow.expiry_secs = args.escrow_expiry;

    let session = ConsumerSession::new(
        Arc::new(relay.handle(&consumer_id)),
        Arc::new(consumer_wallet.clone()),
        config,
    )
    .with_events(events_tx);

    let record = session.run_job(&args.prompt).await?;

    // Let the provider's claim settle before reading the balance.
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("\n=== Outcome ===");
    println!("Job:      {}", record.short_id());
    println!("Provider: {}", record.provider_id);
    println!("State:    {}", record.state);
    if let Some(price) = record.price_msats {
        println!("Price:    {} msats", price);
    }
    if let Some(result) = &record.result {
        println!("Result:   {}", result);
    }
    if let Some(error) = &record.error {
        println!("Error:    {}", error);
    }
    println!(
        "Balance:  {} msats (started with {})",
        consumer_wallet.balance().await?,
        args.balance
    );

    let settled = matches!(record.state, JobState::Released | JobState::Claimed)
        || (args.no_htlc && record.state == JobState::ResultDelivered);
    if !settled {
        std::process::exit(1);
    }
    Ok(())
}
