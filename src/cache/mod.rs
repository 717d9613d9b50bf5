//! In-process read model every WS subscriber and (out-of-scope) REST
//! layer reads from. Keyed by `(event_id, book)` in a concurrent map,
//! with each entry replaced wholesale on update rather than mutated in
//! place.

use crate::detector::{market_key, MarketKey, WriteBatch};
use crate::types::{CurrentMarket, Event};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

/// One book's worth of markets for one event. Replaced wholesale (new
/// `Arc`) on every write so readers never observe a torn update.
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    pub markets: HashMap<MarketKey, CurrentMarket>,
}

pub struct Cache {
    events: DashMap<i64, Arc<Event>>,
    entries: DashMap<(i64, crate::types::BookSlug), Arc<CacheEntry>>,
    pool: PgPool,
}

impl Cache {
    pub fn new(pool: PgPool) -> Self {
        Self { events: DashMap::new(), entries: DashMap::new(), pool }
    }

    /// Loads every event and market whose kickoff is still within the
    /// serving window into memory. Must complete before the WS listener
    /// binds.
    pub async fn warmup(&self, grace: chrono::Duration) -> Result<(), sqlx::Error> {
        let cutoff = Utc::now() - grace;

        let events = sqlx::query_as::<_, EventRow>(
            "SELECT event_id, shared_key, home_team, away_team, kickoff, tournament_ref, primary_book_external_id \
             FROM events WHERE kickoff > $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        for row in &events {
            self.events.insert(
                row.event_id,
                Arc::new(Event {
                    event_id: row.event_id,
                    shared_key: row.shared_key.clone(),
                    home_team: row.home_team.clone(),
                    away_team: row.away_team.clone(),
                    kickoff: row.kickoff,
                    tournament_ref: row.tournament_ref,
                    primary_book_external_id: row.primary_book_external_id.clone(),
                    competitor_external_ids: HashMap::new(),
                }),
            );
        }

        let markets = sqlx::query_as::<_, CurrentMarketRow>(
            "SELECT cm.event_id, cm.book, cm.canonical_market_id, cm.line, cm.outcomes, \
                    cm.last_updated_at, cm.last_confirmed_at, cm.unavailable_since \
             FROM current_markets cm JOIN events e ON e.event_id = cm.event_id \
             WHERE e.kickoff > $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<(i64, crate::types::BookSlug), CacheEntry> = HashMap::new();
        for row in markets {
            let market: CurrentMarket = row.into();
            let key = (market.event_id, market.book);
            grouped.entry(key).or_default().markets.insert(
                market_key(market.book, &market.canonical_market_id, market.line),
                market,
            );
        }
        for (key, entry) in grouped {
            self.entries.insert(key, Arc::new(entry));
        }

        tracing::info!(events = self.events.len(), entries = self.entries.len(), "cache warmup complete");
        Ok(())
    }

    pub fn insert_event(&self, event: Event) {
        self.events.insert(event.event_id, Arc::new(event));
    }

    /// All markets this process currently knows about for `event_id`,
    /// across every book — what the Detector diffs fresh scrapes
    /// against.
    pub fn existing_for_event(&self, event_id: i64) -> HashMap<MarketKey, CurrentMarket> {
        let mut merged = HashMap::new();
        for book in crate::types::BookSlug::ALL {
            if let Some(entry) = self.entries.get(&(event_id, book)) {
                merged.extend(entry.markets.clone());
            }
        }
        merged
    }

    /// Applies a committed `WriteBatch` to the in-memory view. Must
    /// only be called after the owning transaction has committed.
    pub fn apply_batch(&self, batch: &WriteBatch) {
        let mut by_key: HashMap<(i64, crate::types::BookSlug), Vec<&CurrentMarket>> = HashMap::new();
        for m in &batch.current_upserts {
            by_key.entry((m.event_id, m.book)).or_default().push(m);
        }
        for (key, markets) in by_key {
            let mut entry = self
                .entries
                .get(&key)
                .map(|e| (**e).clone())
                .unwrap_or_default();
            for m in markets {
                entry.markets.insert(market_key(m.book, &m.canonical_market_id, m.line), m.clone());
            }
            self.entries.insert(key, Arc::new(entry));
        }
    }

    pub fn event_list(&self) -> Vec<Arc<Event>> {
        self.events.iter().map(|e| e.value().clone()).collect()
    }

    pub fn event_detail(&self, event_id: i64) -> Option<(Arc<Event>, Vec<CurrentMarket>)> {
        let event = self.events.get(&event_id)?.value().clone();
        let markets = self.existing_for_event(event_id).into_values().collect();
        Some((event, markets))
    }

    /// Historical snapshots for one market; reads through to
    /// `history_markets` since the in-memory view holds only current
    /// state. History is append-only and unbounded, so it stays out of
    /// the in-process cache.
    pub async fn history(
        &self,
        event_id: i64,
        book: crate::types::BookSlug,
        canonical_market_id: &str,
        line: Option<f64>,
    ) -> Result<Vec<crate::types::HistoricalMarketRow>, sqlx::Error> {
        let line_value = crate::types::line_or_sentinel(line);
        let rows = sqlx::query_as::<_, HistoryRow>(
            "SELECT event_id, book, canonical_market_id, line, outcomes, captured_at \
             FROM history_markets \
             WHERE event_id = $1 AND book = $2 AND canonical_market_id = $3 AND line = $4 \
             ORDER BY captured_at DESC",
        )
        .bind(event_id)
        .bind(book.as_str())
        .bind(canonical_market_id)
        .bind(line_value)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Drops every event (and its per-book entries) whose kickoff is
    /// more than `grace` in the past, run once at the end of a cycle so
    /// the cache doesn't grow unbounded with long-finished fixtures.
    pub fn evict_expired(&self, grace: chrono::Duration) -> usize {
        let now = Utc::now();
        let expired: Vec<i64> = self
            .events
            .iter()
            .filter(|e| is_expired(e.value().kickoff, now, grace))
            .map(|e| *e.key())
            .collect();

        for event_id in &expired {
            self.events.remove(event_id);
            for book in crate::types::BookSlug::ALL {
                self.entries.remove(&(*event_id, book));
            }
        }
        expired.len()
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: i64,
    shared_key: String,
    home_team: String,
    away_team: String,
    kickoff: DateTime<Utc>,
    tournament_ref: i64,
    primary_book_external_id: Option<String>,
}

#[derive(sqlx::FromRow)]
struct CurrentMarketRow {
    event_id: i64,
    book: String,
    canonical_market_id: String,
    line: f64,
    outcomes: serde_json::Value,
    last_updated_at: DateTime<Utc>,
    last_confirmed_at: DateTime<Utc>,
    unavailable_since: Option<DateTime<Utc>>,
}

impl From<CurrentMarketRow> for CurrentMarket {
    fn from(row: CurrentMarketRow) -> Self {
        CurrentMarket {
            event_id: row.event_id,
            book: parse_book(&row.book),
            canonical_market_id: row.canonical_market_id,
            line: if row.line == crate::types::NULL_LINE_SENTINEL { None } else { Some(row.line) },
            outcomes: serde_json::from_value(row.outcomes).unwrap_or_default(),
            last_updated_at: row.last_updated_at,
            last_confirmed_at: row.last_confirmed_at,
            unavailable_since: row.unavailable_since,
        }
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    event_id: i64,
    book: String,
    canonical_market_id: String,
    line: f64,
    outcomes: serde_json::Value,
    captured_at: DateTime<Utc>,
}

impl From<HistoryRow> for crate::types::HistoricalMarketRow {
    fn from(row: HistoryRow) -> Self {
        crate::types::HistoricalMarketRow {
            event_id: row.event_id,
            book: parse_book(&row.book),
            canonical_market_id: row.canonical_market_id,
            line: if row.line == crate::types::NULL_LINE_SENTINEL { None } else { Some(row.line) },
            outcomes: serde_json::from_value(row.outcomes).unwrap_or_default(),
            captured_at: row.captured_at,
        }
    }
}

fn parse_book(s: &str) -> crate::types::BookSlug {
    use crate::types::BookSlug::*;
    match s {
        "competitor_a" => CompetitorA,
        "competitor_b" => CompetitorB,
        _ => Primary,
    }
}

fn is_expired(kickoff: DateTime<Utc>, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
    kickoff < now - grace
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BookSlug, Outcome};

    fn market(event_id: i64, book: BookSlug) -> CurrentMarket {
        CurrentMarket {
            event_id,
            book,
            canonical_market_id: "1x2".into(),
            line: None,
            outcomes: vec![Outcome { name: "Home".into(), price: 2.0, active: true }],
            last_updated_at: Utc::now(),
            last_confirmed_at: Utc::now(),
            unavailable_since: None,
        }
    }

    #[test]
    fn apply_batch_merges_markets_per_book_without_clobbering_other_books() {
        // Exercises the pure merge logic directly, without a live pool.
        let mut by_book: HashMap<BookSlug, CacheEntry> = HashMap::new();
        let m1 = market(1, BookSlug::Primary);
        let m2 = market(1, BookSlug::CompetitorA);
        for m in [m1.clone(), m2.clone()] {
            by_book
                .entry(m.book)
                .or_default()
                .markets
                .insert(market_key(m.book, &m.canonical_market_id, m.line), m);
        }
        assert_eq!(by_book.len(), 2);
        assert!(by_book[&BookSlug::Primary].markets.contains_key(&market_key(BookSlug::Primary, "1x2", None)));
    }

    #[test]
    fn kickoff_within_grace_window_is_not_expired() {
        let now = Utc::now();
        let grace = chrono::Duration::hours(2);
        assert!(!is_expired(now - chrono::Duration::hours(1), now, grace));
    }

    #[test]
    fn kickoff_past_grace_window_is_expired() {
        let now = Utc::now();
        let grace = chrono::Duration::hours(2);
        assert!(is_expired(now - chrono::Duration::hours(3), now, grace));
    }
}
