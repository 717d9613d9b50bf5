//! Competitor A book client. Supplies the shared event key embedded in
//! the event's external id as a URL-encoded token of form
//! `<prefix>:match:<digits>` which must be preserved verbatim when
//! fetching markets — the upstream API rejects
//! normalized forms, so `external_id` is never re-encoded or
//! re-derived after discovery, only passed straight through.

use crate::clients::retry::with_retry;
use crate::clients::{BookClient, RawEvent, RawMarketRecord, RawMarkets, RawOutcome};
use crate::errors::ScrapeError;
use crate::types::BookSlug;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Semaphore;

static MATCH_TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r":match:(\d+)").unwrap());

/// Extract the shared key (the digit run) from a `<prefix>:match:<digits>` token.
pub fn shared_key_from_token(token: &str) -> Option<String> {
    MATCH_TOKEN_RE.captures(token).map(|c| c[1].to_string())
}

pub struct CompetitorAClient {
    client: Client,
    base_url: String,
    api_key: String,
    semaphore: Semaphore,
    retry_max_attempts: u32,
}

impl CompetitorAClient {
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
    data: Vec<DiscoveryEvent>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryEvent {
    /// URL-encoded token of form `<prefix>:match:<digits>`.
    id: String,
    start_time: DateTime<Utc>,
    home_name: String,
    away_name: String,
    competition_name: String,
    competition_country: String,
    competition_id: String,
}

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    markets: Vec<MarketRecord>,
}

#[derive(Debug, Deserialize)]
struct MarketRecord {
    id: String,
    name: Option<String>,
    line: Option<f64>,
    handicap_home: Option<f64>,
    selections: Vec<SelectionRecord>,
}

#[derive(Debug, Deserialize)]
struct SelectionRecord {
    name: String,
    odds: f64,
    active: Option<bool>,
}

#[async_trait]
impl BookClient for CompetitorAClient {
    fn book(&self) -> BookSlug {
        BookSlug::CompetitorA
    }

    async fn discover_events(&self) -> Result<HashMap<String, RawEvent>, ScrapeError> {
        let _permit = self.semaphore.acquire().await.expect("semaphore closed");
        let url = format!("{}/discovery/events", self.base_url);

        let resp = with_retry(self.retry_max_attempts, || async {
            self.client
                .get(&url)
                .bearer_auth(&self.api_key)
                .send()
                .await?
                .error_for_status()
        })
        .await
        .map_err(|source| ScrapeError::Transport { book: self.book(), source })?;

        let text = resp.text().await.map_err(|source| ScrapeError::Transport { book: self.book(), source })?;
        let parsed: DiscoveryResponse = serde_json::from_str(&text)
            .map_err(|source| ScrapeError::Decode { book: self.book(), raw: text.clone(), source })?;

        let mut out = HashMap::new();
        for e in parsed.data {
            // Events without an extractable shared key are dropped by the
            // Coordinator during discovery merge, not here — we still hand
            // back `shared_key: None` so that decision stays centralized.
            let shared_key = shared_key_from_token(&e.id);
            let raw = RawEvent {
                shared_key: shared_key.clone(),
                external_id: e.id,
                kickoff: e.start_time,
                home_team: e.home_name,
                away_team: e.away_name,
                tournament_name: e.competition_name,
                tournament_country: e.competition_country,
                tournament_external_id: e.competition_id,
            };
            if let Some(key) = shared_key {
                out.insert(key, raw);
            }
        }
        Ok(out)
    }

    async fn fetch_event_markets(&self, external_id: &str) -> Result<RawMarkets, ScrapeError> {
        let _permit = self.semaphore.acquire().await.expect("semaphore closed");
        // external_id is the verbatim URL-encoded token from discovery;
        // it is never decoded or re-encoded before this request.
        let url = format!("{}/events/{}/markets", self.base_url, external_id);

        let resp = with_retry(self.retry_max_attempts, || async {
            self.client
                .get(&url)
                .bearer_auth(&self.api_key)
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
                    raw_market_id: m.id,
                    raw_market_name: m.name,
                    line: m.line,
                    handicap_home: m.handicap_home,
                    outcomes: m
                        .selections
                        .into_iter()
                        .map(|s| RawOutcome {
                            name: s.name,
                            price: s.odds,
                            is_active: s.active,
                        })
                        .collect(),
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_shared_key_from_match_token() {
        assert_eq!(shared_key_from_token("sr:match:123456"), Some("123456".to_string()));
        assert_eq!(shared_key_from_token("no-token-here"), None);
    }
}
