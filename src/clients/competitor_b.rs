//! Competitor B book client. Supplies the shared event key as a
//! distinct `external_ref` field, while its own per-event fetch uses a
//! different internal id than discovery returned. Additionally
//! enforces a minimum inter-request delay on top of the counting
//! semaphore, because its upstream throttles bursts — tracked as a
//! single last-issue `Instant` since only a fixed spacing (not a
//! sliding window) is required here.

use crate::clients::retry::with_retry;
use crate::clients::{BookClient, RawEvent, RawMarketRecord, RawMarkets, RawOutcome};
use crate::errors::ScrapeError;
use crate::types::BookSlug;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};

pub struct CompetitorBClient {
    client: Client,
    base_url: String,
    api_key: String,
    semaphore: Semaphore,
    min_spacing: Duration,
    last_issued_at: Mutex<Option<Instant>>,
    retry_max_attempts: u32,
}

impl CompetitorBClient {
    pub fn new(
        base_url: String,
        api_key: String,
        max_in_flight: usize,
        min_spacing: Duration,
        timeout: Duration,
        retry_max_attempts: u32,
    ) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_default();
        Self {
            client,
            base_url,
            api_key,
            semaphore: Semaphore::new(max_in_flight.max(1)),
            min_spacing,
            last_issued_at: Mutex::new(None),
            retry_max_attempts,
        }
    }

    /// Blocks until at least `min_spacing` has elapsed since the last
    /// request was *issued* (not completed), then records this issue.
    async fn throttle_issue(&self) {
        let mut guard = self.last_issued_at.lock().await;
        if let Some(last) = *guard {
            let elapsed = last.elapsed();
            if elapsed < self.min_spacing {
                tokio::time::sleep(self.min_spacing - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    fixtures: Vec<DiscoveryEvent>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryEvent {
    internal_id: String,
    external_ref: String,
    kickoff_utc: DateTime<Utc>,
    home: String,
    away: String,
    league_name: String,
    league_country: String,
    league_id: String,
}

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    markets: Vec<MarketRecord>,
}

#[derive(Debug, Deserialize)]
struct MarketRecord {
    market_code: String,
    market_label: Option<String>,
    line: Option<f64>,
    handicap_home: Option<f64>,
    runners: Vec<RunnerRecord>,
}

#[derive(Debug, Deserialize)]
struct RunnerRecord {
    label: String,
    price: f64,
    suspended: Option<bool>,
}

#[async_trait]
impl BookClient for CompetitorBClient {
    fn book(&self) -> BookSlug {
        BookSlug::CompetitorB
    }

    async fn discover_events(&self) -> Result<HashMap<String, RawEvent>, ScrapeError> {
        self.throttle_issue().await;
        let _permit = self.semaphore.acquire().await.expect("semaphore closed");
        let url = format!("{}/api/fixtures", self.base_url);

        let resp = with_retry(self.retry_max_attempts, || async {
            self.client
                .get(&url)
                .header("Authorization", format!("ApiKey {}", self.api_key))
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
            .fixtures
            .into_iter()
            .map(|e| {
                (
                    e.external_ref.clone(),
                    RawEvent {
                        shared_key: Some(e.external_ref),
                        // Per-event fetch uses internal_id, not external_ref.
                        external_id: e.internal_id,
                        kickoff: e.kickoff_utc,
                        home_team: e.home,
                        away_team: e.away,
                        tournament_name: e.league_name,
                        tournament_country: e.league_country,
                        tournament_external_id: e.league_id,
                    },
                )
            })
            .collect())
    }

    async fn fetch_event_markets(&self, external_id: &str) -> Result<RawMarkets, ScrapeError> {
        self.throttle_issue().await;
        let _permit = self.semaphore.acquire().await.expect("semaphore closed");
        let url = format!("{}/api/fixtures/{}/markets", self.base_url, external_id);

        let resp = with_retry(self.retry_max_attempts, || async {
            self.client
                .get(&url)
                .header("Authorization", format!("ApiKey {}", self.api_key))
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
                    raw_market_id: m.market_code,
                    raw_market_name: m.market_label,
                    line: m.line,
                    handicap_home: m.handicap_home,
                    outcomes: m
                        .runners
                        .into_iter()
                        .map(|r| RawOutcome {
                            name: r.label,
                            price: r.price,
                            is_active: r.suspended.map(|s| !s),
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

    #[tokio::test]
    async fn throttle_enforces_minimum_spacing() {
        let client = CompetitorBClient::new(
            "http://example.invalid".into(),
            "key".into(),
            15,
            Duration::from_millis(30),
            Duration::from_secs(5),
            1,
        );
        let start = Instant::now();
        client.throttle_issue().await;
        client.throttle_issue().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
