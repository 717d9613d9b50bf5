//! Primary book client. Supplies `shared_key` directly on each
//! discovered event. Bounded-timeout `reqwest::Client`, header-based
//! API key auth, JSON decode with structured error reporting instead
//! of silently skipping.

use crate::clients::retry::with_retry;
use crate::clients::{BookClient, RawEvent, RawMarketRecord, RawMarkets, RawOutcome};
use crate::errors::ScrapeError;
use crate::types::BookSlug;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Semaphore;

pub struct PrimaryBookClient {
    client: Client,
    base_url: String,
    api_key: String,
    semaphore: Semaphore,
    retry_max_attempts: u32,
}

impl PrimaryBookClient {
    pub fn new(base_url: String, api_key: String, max_in_flight: usize, timeout: Duration, retry_max_attempts: u32) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_default();
        Self {
            client,
            base_url,
            api_key,
            semaphore: Semaphore::new(max_in_flight.max(1)),
            retry_max_attempts,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    events: Vec<DiscoveryEvent>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryEvent {
    shared_key: String,
    event_id: String,
    kickoff: DateTime<Utc>,
    home: String,
    away: String,
    tournament_name: String,
    tournament_country: String,
    tournament_id: String,
}

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    markets: Vec<MarketRecord>,
}

#[derive(Debug, Deserialize)]
struct MarketRecord {
    market_id: String,
    market_name: Option<String>,
    line: Option<f64>,
    handicap_home: Option<f64>,
    outcomes: Vec<OutcomeRecord>,
}

#[derive(Debug, Deserialize)]
struct OutcomeRecord {
    name: String,
    price: f64,
    is_active: Option<bool>,
}

#[async_trait]
impl BookClient for PrimaryBookClient {
    fn book(&self) -> BookSlug {
        BookSlug::Primary
    }

    async fn discover_events(&self) -> Result<HashMap<String, RawEvent>, ScrapeError> {
        let _permit = self.semaphore.acquire().await.expect("semaphore closed");
        let url = format!("{}/v1/events", self.base_url);

        let resp = with_retry(self.retry_max_attempts, || async {
            self.client
                .get(&url)
                .header("x-api-key", &self.api_key)
                .send()
                .await?
                .error_for_status()
        })
        .await
        .map_err(|source| ScrapeError::Transport { book: self.book(), source })?;

        let text = resp.text().await.map_err(|source| ScrapeError::Transport { book: self.book(), source })?;
        let parsed: DiscoveryResponse = serde_json::from_str(&text)
            .map_err(|source| ScrapeError::Decode { book: self.book(), raw: text.clone(), source })?;

        Ok(parsed
            .events
            .into_iter()
            .map(|e| {
                (
                    e.shared_key.clone(),
                    RawEvent {
                        shared_key: Some(e.shared_key),
                        external_id: e.event_id,
                        kickoff: e.kickoff,
                        home_team: e.home,
                        away_team: e.away,
                        tournament_name: e.tournament_name,
                        tournament_country: e.tournament_country,
                        tournament_external_id: e.tournament_id,
                    },
                )
            })
            .collect())
    }

    async fn fetch_event_markets(&self, external_id: &str) -> Result<RawMarkets, ScrapeError> {
        let _permit = self.semaphore.acquire().await.expect("semaphore closed");
        let url = format!("{}/v1/events/{}/markets", self.base_url, external_id);

        let resp = with_retry(self.retry_max_attempts, || async {
            self.client
                .get(&url)
                .header("x-api-key", &self.api_key)
                .send()
                .await?
                .error_for_status()
        })
        .await
        .map_err(|source| ScrapeError::Transport { book: self.book(), source })?;

        let text = resp.text().await.map_err(|source| ScrapeError::Transport { book: self.book(), source })?;
        let parsed: MarketsResponse = serde_json::from_str(&text)
            .map_err(|source| ScrapeError::Decode { book: self.book(), raw: text.clone(), source })?;

        Ok(RawMarkets {
            records: parsed
                .markets
                .into_iter()
                .map(|m| RawMarketRecord {
                    raw_market_id: m.market_id,
                    raw_market_name: m.market_name,
                    line: m.line,
                    handicap_home: m.handicap_home,
                    outcomes: m
                        .outcomes
                        .into_iter()
                        .map(|o| RawOutcome {
                            name: o.name,
                            price: o.price,
                            is_active: o.is_active,
                        })
                        .collect(),
                })
                .collect(),
        })
    }
}
