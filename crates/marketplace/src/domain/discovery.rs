//! Provider discovery from service announcements
//!
//! The consumer session feeds every announcement it observes into a
//! [`DiscoveryIndex`] during its discovery window, then selects one
//! provider under a [`SelectionPolicy`]. Ordering is deterministic:
//! price ascending, observation order breaking ties, so the same set of
//! announcements always yields the same selection.

use crate::protocol::{CapabilityKind, ChannelRef, MarketMessage, Network};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// One provider's current offer, last write wins per provider id
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderListing {
    pub provider_id: String,
    pub capability: CapabilityKind,
    pub price_msats: u64,
    pub network: Network,
    pub models: Vec<String>,
    pub channel: ChannelRef,
    /// Observation sequence of the first announcement; stable across updates
    pub first_seen: u64,
    /// When the latest announcement arrived
    pub last_seen: DateTime<Utc>,
}

/// Constraints a listing must satisfy to be considered
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    pub capability: Option<CapabilityKind>,
    pub network: Option<Network>,
    pub max_price_msats: Option<u64>,
}

impl DiscoveryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capability(mut self, capability: CapabilityKind) -> Self {
        self.capability = Some(capability);
        self
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_max_price(mut self, max_price_msats: u64) -> Self {
        self.max_price_msats = Some(max_price_msats);
        self
    }

    fn matches(&self, listing: &ProviderListing) -> bool {
        if let Some(capability) = self.capability {
            if listing.capability != capability {
                return false;
            }
        }
        if let Some(network) = self.network {
            if listing.network != network {
                return false;
            }
        }
        if let Some(max) = self.max_price_msats {
            if listing.price_msats > max {
                return false;
            }
        }
        true
    }
}

/// How the consumer picks among matching providers
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionPolicy {
    /// Lowest price, earliest observation breaking ties
    Cheapest,
    /// Earliest observed matching provider
    First,
    /// A specific provider id
    Pinned(String),
}

impl std::str::FromStr for SelectionPolicy {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "cheapest" => SelectionPolicy::Cheapest,
            "first" => SelectionPolicy::First,
            other => SelectionPolicy::Pinned(other.to_string()),
        })
    }
}

impl std::fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionPolicy::Cheapest => write!(f, "cheapest"),
            SelectionPolicy::First => write!(f, "first"),
            SelectionPolicy::Pinned(id) => write!(f, "{id}"),
        }
    }
}

/// Accumulates announcements into a queryable provider table
#[derive(Debug, Default)]
pub struct DiscoveryIndex {
    listings: HashMap<String, ProviderListing>,
    seq: u64,
}

impl DiscoveryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an observed message into the index
    ///
    /// Non-announcement messages are ignored. Re-announcements replace the
    /// provider's offer but keep its original observation order, so a
    /// provider cannot jump the tie-break queue by re-announcing.
    pub fn observe(&mut self, msg: &MarketMessage) -> bool {
        let MarketMessage::ServiceAnnouncement {
            provider_id,
            capability,
            price_msats,
            network,
            models,
            channel,
        } = msg
        else {
            return false;
        };

        let first_seen = self
            .listings
            .get(provider_id)
            .map(|l| l.first_seen)
            .unwrap_or_else(|| {
                let seq = self.seq;
                self.seq += 1;
                seq
            });

        self.listings.insert(
            provider_id.clone(),
            ProviderListing {
                provider_id: provider_id.clone(),
                capability: *capability,
                price_msats: *price_msats,
                network: *network,
                models: models.clone(),
                channel: channel.clone(),
                first_seen,
                last_seen: Utc::now(),
            },
        );
        true
    }

    /// Matching listings, cheapest first, observation order breaking ties
    pub fn query(&self, filter: &DiscoveryFilter) -> Vec<ProviderListing> {
        let mut matches: Vec<ProviderListing> = self
            .listings
            .values()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect();
        matches.sort_by_key(|l| (l.price_msats, l.first_seen));
        matches
    }

    /// Pick one provider under the policy, or None if nothing matches
    pub fn select(
        &self,
        policy: &SelectionPolicy,
        filter: &DiscoveryFilter,
    ) -> Option<ProviderListing> {
        match policy {
            SelectionPolicy::Cheapest => self.query(filter).into_iter().next(),
            SelectionPolicy::First => self
                .query(filter)
                .into_iter()
                .min_by_key(|l| l.first_seen),
            SelectionPolicy::Pinned(id) => self
                .listings
                .get(id)
                .filter(|l| filter.matches(l))
                .cloned(),
        }
    }

    /// Drop listings not re-announced within `ttl`, returning how many
    pub fn prune(&mut self, ttl: Duration) -> usize {
        let cutoff = Utc::now() - ttl;
        let before = self.listings.len();
        self.listings.retain(|_, l| l.last_seen >= cutoff);
        before - self.listings.len()
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }
}
