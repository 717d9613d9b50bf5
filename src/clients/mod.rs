//! One trait, three book-specific implementations. Each wraps a
//! `reqwest::Client` with a bounded timeout and enforces its own rate
//! limit internally via a counting semaphore, behind a shared trait so
//! the Coordinator can fan out over all three uniformly.

pub mod competitor_a;
pub mod competitor_b;
pub mod primary;
pub mod retry;

use crate::errors::ScrapeError;
use crate::types::BookSlug;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Decoded event from a book's discovery call. The primary book
/// supplies `shared_key` directly; competitor clients populate it from
/// whatever upstream field carries the cross-book match id and return
/// `None` when they can't extract one — the Coordinator drops those
/// during its discovery merge, since an event lacking a `shared_key` on
/// a competitor book can't be joined across platforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub shared_key: Option<String>,
    pub external_id: String,
    pub kickoff: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
    pub tournament_name: String,
    pub tournament_country: String,
    pub tournament_external_id: String,
}

/// One raw market record as returned by a book's per-event fetch,
/// before the Mapper translates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMarketRecord {
    pub raw_market_id: String,
    pub raw_market_name: Option<String>,
    pub line: Option<f64>,
    pub handicap_home: Option<f64>,
    pub outcomes: Vec<RawOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOutcome {
    pub name: String,
    pub price: f64,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMarkets {
    pub records: Vec<RawMarketRecord>,
}

#[async_trait]
pub trait BookClient: Send + Sync {
    fn book(&self) -> BookSlug;

    /// Discover all known upcoming events, keyed by shared event key
    /// when the book can supply one (competitor books must).
    async fn discover_events(&self) -> Result<HashMap<String, RawEvent>, ScrapeError>;

    /// Fetch the per-event market snapshot. `external_id` must be the
    /// verbatim id returned by `discover_events` (Competitor A's
    /// URL-encoded token in particular must not be normalized).
    async fn fetch_event_markets(&self, external_id: &str) -> Result<RawMarkets, ScrapeError>;
}
