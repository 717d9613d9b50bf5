//! Three detection passes run once per scraped event, comparing the
//! markets already known to the Cache against the markets freshly
//! mapped this cycle: change detection, availability detection, and
//! risk detection. `detect_event` produces one `EventDetection`; the
//! Coordinator folds every event in a batch into a single `WriteBatch`
//! (one per batch, not per event) before handing it to the Write
//! Queue. Each pass is a pure function taking both snapshots as plain
//! arguments rather than reading process-global state.

use crate::mapper::UnmappedObservation;
use crate::types::{
    AlertStatus, BookSlug, CurrentMarket, Direction, Event, HistoricalMarketRow, MappedMarket,
    RiskAlert, RiskAlertType, Settings,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

/// Uniquely identifies one market within an event: book, canonical id,
/// and the line (NULL collapsed to the sentinel, per glossary).
pub type MarketKey = (BookSlug, String, u64);

pub fn market_key(book: BookSlug, canonical_market_id: &str, line: Option<f64>) -> MarketKey {
    (book, canonical_market_id.to_string(), crate::types::line_or_sentinel(line).to_bits())
}

#[derive(Debug, Clone)]
pub struct EventScrapeStatus {
    pub event_id: i64,
    pub books_attempted: Vec<BookSlug>,
    pub books_succeeded: Vec<BookSlug>,
    pub scraped_at: DateTime<Utc>,
}

/// Result of running the three detection passes for one event.
#[derive(Debug, Clone, Default)]
pub struct EventDetection {
    pub current_upserts: Vec<CurrentMarket>,
    pub history_inserts: Vec<HistoricalMarketRow>,
    pub risk_alerts: Vec<RiskAlert>,
    pub event_scrape_status: Option<EventScrapeStatus>,
    /// Markets that are new, repriced, reappeared, or newly unavailable
    /// this cycle — excludes plain reconfirmations of unchanged markets.
    pub changed_markets: usize,
}

/// One batch's worth of detection output — every event in a drained
/// priority-queue batch folds into exactly one of these before it is
/// handed to the Write Queue as a single transaction.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub batch_id: u64,
    pub current_upserts: Vec<CurrentMarket>,
    pub history_inserts: Vec<HistoricalMarketRow>,
    pub risk_alerts: Vec<RiskAlert>,
    pub unmapped: Vec<UnmappedObservation>,
    pub event_scrape_statuses: Vec<EventScrapeStatus>,
    pub changed_markets: usize,
}

impl WriteBatch {
    pub fn new(batch_id: u64) -> Self {
        Self { batch_id, ..Default::default() }
    }

    pub fn fold_event(&mut self, detection: EventDetection) {
        self.current_upserts.extend(detection.current_upserts);
        self.history_inserts.extend(detection.history_inserts);
        self.risk_alerts.extend(detection.risk_alerts);
        self.changed_markets += detection.changed_markets;
        if let Some(status) = detection.event_scrape_status {
            self.event_scrape_statuses.push(status);
        }
    }

    pub fn event_ids(&self) -> Vec<i64> {
        self.event_scrape_statuses.iter().map(|s| s.event_id).collect()
    }
}

/// Per-book market observations produced by the Mapper this cycle, for
/// one event. A book absent from this map was not scraped this cycle
/// (request failure) and must not be treated as "market gone".
pub type FreshByBook = HashMap<BookSlug, Vec<MappedMarket>>;

/// Runs all three detection passes for one event. `existing` holds the
/// Cache's current view of every market for this event, keyed by
/// `market_key`.
pub fn detect_event(
    event: &Event,
    now: DateTime<Utc>,
    settings: &Settings,
    existing: &HashMap<MarketKey, CurrentMarket>,
    fresh_by_book: &FreshByBook,
    books_attempted: &[BookSlug],
) -> EventDetection {
    let mut batch = EventDetection::default();
    let mut seen_keys: HashSet<MarketKey> = HashSet::new();

    // Pass 1: change detection, per (book, market). A market that
    // reappears after being marked unavailable is always treated as
    // "changed" (it gets a fresh history row), independent of whether
    // the numbers themselves moved.
    for (&book, markets) in fresh_by_book {
        for m in markets {
            let key = market_key(book, &m.canonical_market_id, m.line);
            seen_keys.insert(key.clone());
            match existing.get(&key) {
                None => insert_new(event, now, book, m, &mut batch),
                Some(old) if old.is_available() && old.outcomes == m.outcomes => {
                    let mut confirmed = old.clone();
                    confirmed.last_confirmed_at = now;
                    batch.current_upserts.push(confirmed);
                }
                Some(_old) => {
                    batch.current_upserts.push(CurrentMarket {
                        event_id: event.event_id,
                        book,
                        canonical_market_id: m.canonical_market_id.clone(),
                        line: m.line,
                        outcomes: m.outcomes.clone(),
                        last_updated_at: now,
                        last_confirmed_at: now,
                        unavailable_since: None,
                    });
                    batch.history_inserts.push(HistoricalMarketRow {
                        event_id: event.event_id,
                        book,
                        canonical_market_id: m.canonical_market_id.clone(),
                        line: m.line,
                        outcomes: m.outcomes.clone(),
                        captured_at: now,
                    });
                    batch.changed_markets += 1;
                }
            }
        }
    }

    // Pass 2: availability detection — markets known to the Cache for a
    // book that WAS scraped this cycle but didn't reappear in the fresh
    // set are now unavailable. Books that failed to respond at all are
    // excluded: a transient fetch failure must never look like every
    // market on that book going unavailable.
    for (key, old) in existing {
        if !books_attempted.contains(&key.0) || seen_keys.contains(key) {
            continue;
        }
        if old.is_available() {
            let mut flipped = old.clone();
            flipped.unavailable_since = Some(now);
            batch.current_upserts.push(flipped);
            batch.changed_markets += 1;
            batch.risk_alerts.push(RiskAlert {
                event_id: event.event_id,
                book: old.book,
                canonical_market_id: old.canonical_market_id.clone(),
                line: old.line,
                outcome_name: String::new(),
                alert_type: RiskAlertType::Availability,
                severity: crate::types::AlertSeverity::Warning,
                old_value: None,
                new_value: None,
                change_percent: None,
                competitor_direction: None,
                detected_at: now,
                status: AlertStatus::New,
                kickoff: event.kickoff,
            });
        }
    }

    // Pass 3: risk detection — price-change and direction-disagreement
    // alerts, restricted to markets that exist on both the primary book
    // and at least one competitor in the new state ("matched markets
    // only").
    if settings.alerts_enabled {
        detect_price_and_direction(event, now, settings, existing, fresh_by_book, &mut batch);
    }

    batch.event_scrape_status = Some(EventScrapeStatus {
        event_id: event.event_id,
        books_attempted: books_attempted.to_vec(),
        books_succeeded: fresh_by_book.keys().copied().collect(),
        scraped_at: now,
    });

    batch
}

fn insert_new(event: &Event, now: DateTime<Utc>, book: BookSlug, m: &MappedMarket, batch: &mut EventDetection) {
    batch.changed_markets += 1;
    batch.current_upserts.push(CurrentMarket {
        event_id: event.event_id,
        book,
        canonical_market_id: m.canonical_market_id.clone(),
        line: m.line,
        outcomes: m.outcomes.clone(),
        last_updated_at: now,
        last_confirmed_at: now,
        unavailable_since: None,
    });
    batch.history_inserts.push(HistoricalMarketRow {
        event_id: event.event_id,
        book,
        canonical_market_id: m.canonical_market_id.clone(),
        line: m.line,
        outcomes: m.outcomes.clone(),
        captured_at: now,
    });
}

fn pct_change(old_price: f64, new_price: f64) -> Option<f64> {
    if old_price <= 0.0 {
        // A zero previous price must never divide-by-zero; such a
        // market is treated as new, not as a price change, by simply
        // never reporting a movement.
        return None;
    }
    Some((new_price - old_price) / old_price * 100.0)
}

fn direction_of(pct: f64) -> Direction {
    if pct >= 0.0 {
        Direction::Up
    } else {
        Direction::Down
    }
}

/// The set of `(canonical_market_id, line)` pairs present on the
/// primary book AND at least one competitor book in this cycle's fresh
/// state — the restriction risk alerts are scoped to.
fn matched_markets(fresh_by_book: &FreshByBook) -> HashSet<(String, u64)> {
    let primary_keys: HashSet<(String, u64)> = fresh_by_book
        .get(&BookSlug::Primary)
        .into_iter()
        .flatten()
        .map(|m| (m.canonical_market_id.clone(), crate::types::line_or_sentinel(m.line).to_bits()))
        .collect();

    let mut matched = HashSet::new();
    for &book in &[BookSlug::CompetitorA, BookSlug::CompetitorB] {
        let Some(markets) = fresh_by_book.get(&book) else { continue };
        for m in markets {
            let k = (m.canonical_market_id.clone(), crate::types::line_or_sentinel(m.line).to_bits());
            if primary_keys.contains(&k) {
                matched.insert(k);
            }
        }
    }
    matched
}

fn detect_price_and_direction(
    event: &Event,
    now: DateTime<Utc>,
    settings: &Settings,
    existing: &HashMap<MarketKey, CurrentMarket>,
    fresh_by_book: &FreshByBook,
    batch: &mut EventDetection,
) {
    let matched = matched_markets(fresh_by_book);
    if matched.is_empty() {
        return;
    }

    // Per (canonical_market_id, line, outcome_name): book -> pct moved this cycle.
    let mut movements: HashMap<(String, u64, String), HashMap<BookSlug, f64>> = HashMap::new();

    for (&book, markets) in fresh_by_book {
        for m in markets {
            let market_id = (m.canonical_market_id.clone(), crate::types::line_or_sentinel(m.line).to_bits());
            if !matched.contains(&market_id) {
                continue;
            }
            let Some(old) = existing.get(&market_key(book, &m.canonical_market_id, m.line)) else { continue };
            for outcome in &m.outcomes {
                let Some(prev) = old.outcomes.iter().find(|o| o.name == outcome.name) else { continue };
                let Some(pct) = pct_change(prev.price, outcome.price) else { continue };
                if let Some(severity) = settings.severity_for_pct(pct.abs()) {
                    batch.risk_alerts.push(RiskAlert {
                        event_id: event.event_id,
                        book,
                        canonical_market_id: m.canonical_market_id.clone(),
                        line: m.line,
                        outcome_name: outcome.name.clone(),
                        alert_type: RiskAlertType::PriceChange,
                        severity,
                        old_value: Some(prev.price),
                        new_value: Some(outcome.price),
                        change_percent: Some(pct),
                        competitor_direction: None,
                        detected_at: now,
                        status: AlertStatus::New,
                        kickoff: event.kickoff,
                    });
                }
                if pct != 0.0 {
                    movements
                        .entry((m.canonical_market_id.clone(), crate::types::line_or_sentinel(m.line).to_bits(), outcome.name.clone()))
                        .or_default()
                        .insert(book, pct);
                }
            }
        }
    }

    // Direction disagreement: primary moved one way, a competitor moved
    // the other, regardless of magnitude.
    for ((canonical_market_id, line_bits, outcome_name), by_book) in movements {
        let Some(&primary_pct) = by_book.get(&BookSlug::Primary) else { continue };
        let primary_dir = direction_of(primary_pct);
        for &book in &[BookSlug::CompetitorA, BookSlug::CompetitorB] {
            let Some(&comp_pct) = by_book.get(&book) else { continue };
            if direction_of(comp_pct) == primary_dir {
                continue;
            }
            let line = if line_bits == crate::types::NULL_LINE_SENTINEL.to_bits() { None } else { Some(f64::from_bits(line_bits)) };
            batch.risk_alerts.push(RiskAlert {
                event_id: event.event_id,
                book,
                canonical_market_id: canonical_market_id.clone(),
                line,
                outcome_name: outcome_name.clone(),
                alert_type: RiskAlertType::DirectionDisagreement,
                severity: crate::types::AlertSeverity::Elevated,
                old_value: None,
                new_value: None,
                change_percent: Some(comp_pct),
                competitor_direction: Some(direction_of(comp_pct)),
                detected_at: now,
                status: AlertStatus::New,
                kickoff: event.kickoff,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Outcome;
    use std::collections::HashMap;

    fn event() -> Event {
        Event {
            event_id: 1,
            shared_key: "k1".into(),
            home_team: "A".into(),
            away_team: "B".into(),
            kickoff: Utc::now() + chrono::Duration::hours(3),
            tournament_ref: 1,
            primary_book_external_id: Some("e1".into()),
            competitor_external_ids: HashMap::new(),
        }
    }

    fn outcome(name: &str, price: f64) -> Outcome {
        Outcome { name: name.into(), price, active: true }
    }

    fn current(book: BookSlug, price: f64, unavailable_since: Option<DateTime<Utc>>) -> CurrentMarket {
        CurrentMarket {
            event_id: 1,
            book,
            canonical_market_id: "1x2".into(),
            line: None,
            outcomes: vec![outcome("Home", price)],
            last_updated_at: Utc::now(),
            last_confirmed_at: Utc::now(),
            unavailable_since,
        }
    }

    #[test]
    fn new_market_is_inserted_without_alert() {
        let ev = event();
        let settings = Settings::default();
        let existing = HashMap::new();
        let mut fresh = FreshByBook::new();
        fresh.insert(
            BookSlug::Primary,
            vec![MappedMarket { canonical_market_id: "1x2".into(), line: None, outcomes: vec![outcome("Home", 2.0)] }],
        );
        let batch = detect_event(&ev, Utc::now(), &settings, &existing, &fresh, &[BookSlug::Primary]);
        assert_eq!(batch.current_upserts.len(), 1);
        assert_eq!(batch.history_inserts.len(), 1);
        assert!(batch.risk_alerts.is_empty());
    }

    #[test]
    fn unchanged_market_only_bumps_confirmation() {
        let ev = event();
        let settings = Settings::default();
        let now = Utc::now();
        let mut existing = HashMap::new();
        existing.insert(market_key(BookSlug::Primary, "1x2", None), current(BookSlug::Primary, 2.0, None));
        let mut fresh = FreshByBook::new();
        fresh.insert(
            BookSlug::Primary,
            vec![MappedMarket { canonical_market_id: "1x2".into(), line: None, outcomes: vec![outcome("Home", 2.0)] }],
        );
        let batch = detect_event(&ev, now, &settings, &existing, &fresh, &[BookSlug::Primary]);
        assert_eq!(batch.current_upserts.len(), 1);
        assert!(batch.history_inserts.is_empty());
        assert_eq!(batch.current_upserts[0].last_confirmed_at, now);
        assert_eq!(batch.changed_markets, 0, "a plain reconfirmation is not a change");
    }

    #[test]
    fn repriced_market_counts_as_changed_but_unchanged_does_not() {
        let ev = event();
        let settings = Settings::default();
        let now = Utc::now();
        let mut existing = HashMap::new();
        existing.insert(market_key(BookSlug::Primary, "1x2", None), current(BookSlug::Primary, 2.0, None));
        let mut fresh = FreshByBook::new();
        fresh.insert(
            BookSlug::Primary,
            vec![MappedMarket { canonical_market_id: "1x2".into(), line: None, outcomes: vec![outcome("Home", 2.5)] }],
        );
        let batch = detect_event(&ev, now, &settings, &existing, &fresh, &[BookSlug::Primary]);
        assert_eq!(batch.changed_markets, 1);
    }

    #[test]
    fn price_move_without_a_competitor_match_raises_no_alert() {
        let ev = event();
        let settings = Settings::default();
        let now = Utc::now();
        let mut existing = HashMap::new();
        existing.insert(market_key(BookSlug::Primary, "1x2", None), current(BookSlug::Primary, 2.0, None));
        let mut fresh = FreshByBook::new();
        fresh.insert(
            BookSlug::Primary,
            vec![MappedMarket { canonical_market_id: "1x2".into(), line: None, outcomes: vec![outcome("Home", 3.0)] }],
        );
        let batch = detect_event(&ev, now, &settings, &existing, &fresh, &[BookSlug::Primary]);
        assert!(batch.risk_alerts.is_empty(), "no competitor offered this market, so it is unmatched");
    }

    #[test]
    fn large_price_move_on_matched_market_raises_alert() {
        let ev = event();
        let settings = Settings::default();
        let now = Utc::now();
        let mut existing = HashMap::new();
        existing.insert(market_key(BookSlug::Primary, "1x2", None), current(BookSlug::Primary, 2.0, None));
        existing.insert(market_key(BookSlug::CompetitorA, "1x2", None), current(BookSlug::CompetitorA, 2.0, None));
        let mut fresh = FreshByBook::new();
        fresh.insert(
            BookSlug::Primary,
            vec![MappedMarket { canonical_market_id: "1x2".into(), line: None, outcomes: vec![outcome("Home", 3.0)] }],
        );
        fresh.insert(
            BookSlug::CompetitorA,
            vec![MappedMarket { canonical_market_id: "1x2".into(), line: None, outcomes: vec![outcome("Home", 2.0)] }],
        );
        let batch = detect_event(&ev, now, &settings, &existing, &fresh, &[BookSlug::Primary, BookSlug::CompetitorA]);
        assert!(batch.risk_alerts.iter().any(|a| a.alert_type == RiskAlertType::PriceChange && a.book == BookSlug::Primary));
    }

    #[test]
    fn opposite_direction_moves_raise_disagreement_regardless_of_magnitude() {
        let ev = event();
        let settings = Settings::default();
        let now = Utc::now();
        let mut existing = HashMap::new();
        existing.insert(market_key(BookSlug::Primary, "1x2", None), current(BookSlug::Primary, 2.0, None));
        existing.insert(market_key(BookSlug::CompetitorA, "1x2", None), current(BookSlug::CompetitorA, 2.1, None));
        let mut fresh = FreshByBook::new();
        fresh.insert(
            BookSlug::Primary,
            vec![MappedMarket { canonical_market_id: "1x2".into(), line: None, outcomes: vec![outcome("Home", 2.2)] }],
        );
        fresh.insert(
            BookSlug::CompetitorA,
            vec![MappedMarket { canonical_market_id: "1x2".into(), line: None, outcomes: vec![outcome("Home", 2.0)] }],
        );
        let batch = detect_event(&ev, now, &settings, &existing, &fresh, &[BookSlug::Primary, BookSlug::CompetitorA]);
        assert!(batch.risk_alerts.iter().any(|a| a.alert_type == RiskAlertType::DirectionDisagreement));
    }

    #[test]
    fn market_missing_from_attempted_book_flips_unavailable() {
        let ev = event();
        let settings = Settings::default();
        let now = Utc::now();
        let mut existing = HashMap::new();
        existing.insert(market_key(BookSlug::Primary, "1x2", None), current(BookSlug::Primary, 2.0, None));
        let fresh = FreshByBook::new();
        let batch = detect_event(&ev, now, &settings, &existing, &fresh, &[BookSlug::Primary]);
        assert_eq!(batch.current_upserts.len(), 1);
        assert!(batch.current_upserts[0].unavailable_since.is_some());
        assert_eq!(batch.risk_alerts[0].alert_type, RiskAlertType::Availability);
    }

    #[test]
    fn failed_book_does_not_trigger_availability_alert() {
        let ev = event();
        let settings = Settings::default();
        let now = Utc::now();
        let mut existing = HashMap::new();
        existing.insert(market_key(BookSlug::Primary, "1x2", None), current(BookSlug::Primary, 2.0, None));
        let fresh = FreshByBook::new();
        let batch = detect_event(&ev, now, &settings, &existing, &fresh, &[]);
        assert!(batch.current_upserts.is_empty());
        assert!(batch.risk_alerts.is_empty());
    }

    #[test]
    fn reappearance_after_unavailability_is_treated_as_changed() {
        let ev = event();
        let settings = Settings::default();
        let now = Utc::now();
        let mut existing = HashMap::new();
        existing.insert(
            market_key(BookSlug::Primary, "1x2", None),
            current(BookSlug::Primary, 2.0, Some(now - chrono::Duration::minutes(1))),
        );
        let mut fresh = FreshByBook::new();
        fresh.insert(
            BookSlug::Primary,
            vec![MappedMarket { canonical_market_id: "1x2".into(), line: None, outcomes: vec![outcome("Home", 2.0)] }],
        );
        let batch = detect_event(&ev, now, &settings, &existing, &fresh, &[BookSlug::Primary]);
        assert_eq!(batch.history_inserts.len(), 1, "reappearance always gets a history row");
        assert!(batch.current_upserts[0].unavailable_since.is_none());
    }
}
