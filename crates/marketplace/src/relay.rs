//! Relay bus collaborator
//!
//! The marketplace engine never talks to a relay directly; it goes through
//! the [`RelayBus`] trait: publish a payload into a channel, subscribe with a
//! filter, get a stream of signed records back. No ordering or delivery
//! guarantee beyond "eventually, if the relay is reachable". Sender identity
//! is bound by the transport's signature and surfaced as `Record::sender`.
//!
//! [`MemoryRelay`] is the reference bus: an append-only record store with
//! broadcast fan-out. `subscribe` replays matching history before streaming
//! live records, matching how real relays serve stored events to late
//! subscribers. Every participant gets its own handle stamped with its
//! identity.

use crate::protocol::{
    self, ChannelRef, KIND_CHANNEL_CREATE, KIND_CHANNEL_MESSAGE, KIND_HANDLER_AD, MarketMessage,
    encode_market_message,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Default relay URL for channel references in local runs
pub const DEFAULT_RELAY: &str = "wss://relay.damus.io";

const BROADCAST_CAPACITY: usize = 1024;
const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscription failed: {0}")]
    Subscribe(String),

    #[error("Relay connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// One signed, append-only transport record
#[derive(Debug, Clone)]
pub struct Record {
    pub record_id: String,
    /// Identity of the publisher, bound by the transport signature
    pub sender: String,
    pub kind: u16,
    /// Channel tag, when the record belongs to a channel
    pub channel_id: Option<String>,
    /// Job tag, when the record belongs to a negotiation
    pub job_id: Option<String>,
    /// Unix seconds, stamped at publish time
    pub created_at: u64,
    pub payload: String,
}

/// Filter predicate for subscriptions
///
/// Matches on record kind and channel/job tags. Empty `kinds` matches every
/// kind.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub kinds: Vec<u16>,
    pub channel_id: Option<String>,
    pub job_id: Option<String>,
    pub since: Option<u64>,
}

impl RecordFilter {
    pub fn kinds(kinds: &[u16]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            ..Default::default()
        }
    }

    pub fn channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&record.kind) {
            return false;
        }
        if let Some(ref channel_id) = self.channel_id {
            if record.channel_id.as_deref() != Some(channel_id.as_str()) {
                return false;
            }
        }
        if let Some(ref job_id) = self.job_id {
            if record.job_id.as_deref() != Some(job_id.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.created_at < since {
                return false;
            }
        }
        true
    }
}

/// The signed pub/sub transport every protocol message travels over
#[async_trait]
pub trait RelayBus: Send + Sync {
    /// Identity this handle publishes as
    fn sender_id(&self) -> &str;

    /// Publish a payload as a signed record; returns the record id
    async fn publish(
        &self,
        kind: u16,
        channel_id: Option<&str>,
        job_id: Option<&str>,
        payload: &str,
    ) -> Result<String>;

    /// Subscribe to records matching the filter
    ///
    /// Stored records matching the filter are replayed first, then live
    /// records stream in as they are published.
    async fn subscribe(&self, filter: RecordFilter) -> Result<mpsc::Receiver<Record>>;
}

/// Publish a channel creation record marking the venue open
///
/// Channels work by agreement on the id alone; the creation record carries
/// the venue metadata so late subscribers can resolve what they joined.
pub async fn create_channel(
    bus: &dyn RelayBus,
    channel: &ChannelRef,
    name: &str,
) -> Result<String> {
    let metadata = serde_json::json!({
        "name": name,
        "relays": channel.relay_urls,
    });
    bus.publish(
        KIND_CHANNEL_CREATE,
        Some(&channel.channel_id),
        None,
        &metadata.to_string(),
    )
    .await
}

/// Publish a [`MarketMessage`] into a negotiation channel
pub async fn publish_market_message(
    bus: &dyn RelayBus,
    channel: &ChannelRef,
    msg: &MarketMessage,
) -> Result<String> {
    bus.publish(
        KIND_CHANNEL_MESSAGE,
        Some(&channel.channel_id),
        msg.job_id(),
        &encode_market_message(msg),
    )
    .await
}

/// Publish a global handler advertisement carrying the announcement payload
pub async fn publish_handler_ad(bus: &dyn RelayBus, msg: &MarketMessage) -> Result<String> {
    bus.publish(KIND_HANDLER_AD, None, None, &encode_market_message(msg))
        .await
}

/// Subscribe to all marketplace messages in a channel
pub async fn subscribe_channel(
    bus: &dyn RelayBus,
    channel_id: &str,
) -> Result<mpsc::Receiver<Record>> {
    bus.subscribe(RecordFilter::kinds(&[KIND_CHANNEL_MESSAGE]).channel(channel_id))
        .await
}

/// Subscribe to the global handler advertisement feed
pub async fn subscribe_handler_ads(bus: &dyn RelayBus) -> Result<mpsc::Receiver<Record>> {
    bus.subscribe(RecordFilter::kinds(&[KIND_HANDLER_AD])).await
}

// ============================================================================
// In-Memory Reference Bus
// ============================================================================

struct RelayCore {
    history: Mutex<Vec<Record>>,
    live: broadcast::Sender<Record>,
}

/// Append-only in-memory relay shared by every participant in a process
#[derive(Clone)]
pub struct MemoryRelay {
    core: Arc<RelayCore>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            core: Arc::new(RelayCore {
                history: Mutex::new(Vec::new()),
                live,
            }),
        }
    }

    /// A bus handle publishing under the given identity
    pub fn handle(&self, sender: impl Into<String>) -> MemoryRelayHandle {
        MemoryRelayHandle {
            core: self.core.clone(),
            sender: sender.into(),
        }
    }

    /// Number of stored records, for tests and diagnostics
    pub fn record_count(&self) -> usize {
        self.core.history.lock().map(|h| h.len()).unwrap_or(0)
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-participant handle onto a [`MemoryRelay`]
#[derive(Clone)]
pub struct MemoryRelayHandle {
    core: Arc<RelayCore>,
    sender: String,
}

#[async_trait]
impl RelayBus for MemoryRelayHandle {
    fn sender_id(&self) -> &str {
        &self.sender
    }

    async fn publish(
        &self,
        kind: u16,
        channel_id: Option<&str>,
        job_id: Option<&str>,
        payload: &str,
    ) -> Result<String> {
        let record = Record {
            record_id: Uuid::new_v4().to_string(),
            sender: self.sender.clone(),
            kind,
            channel_id: channel_id.map(String::from),
            job_id: job_id.map(String::from),
            created_at: protocol::now(),
            payload: payload.to_string(),
        };
        let record_id = record.record_id.clone();

        // Append and broadcast under the same lock so a subscriber sees every
        // record exactly once: either in its history snapshot or on the live
        // stream, never both, never neither.
        let mut history = self
            .core
            .history
            .lock()
            .map_err(|_| RelayError::Publish("relay store poisoned".to_string()))?;
        history.push(record.clone());
        let _ = self.core.live.send(record);

        Ok(record_id)
    }

    async fn subscribe(&self, filter: RecordFilter) -> Result<mpsc::Receiver<Record>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let (snapshot, mut live) = {
            let history = self
                .core
                .history
                .lock()
                .map_err(|_| RelayError::Subscribe("relay store poisoned".to_string()))?;
            let live = self.core.live.subscribe();
            let snapshot: Vec<Record> = history.iter().filter(|r| filter.matches(r)).cloned().collect();
            (snapshot, live)
        };

        tokio::spawn(async move {
            for record in snapshot {
                if tx.send(record).await.is_err() {
                    return;
                }
            }
            loop {
                match live.recv().await {
                    Ok(record) => {
                        if filter.matches(&record) && tx.send(record).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("relay subscriber lagged, skipped {} records", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }
}
