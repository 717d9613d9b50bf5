//! Core domain types shared across every module: events, tournaments,
//! markets, alerts and settings. Upstream book payloads decode through
//! plenty of `Option<T>` for fields that may be absent, but the
//! internal/DB-facing types here are first-class value objects, not
//! probed via map access.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Which of the three upstream books a piece of data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookSlug {
    Primary,
    CompetitorA,
    CompetitorB,
}

impl BookSlug {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookSlug::Primary => "primary",
            BookSlug::CompetitorA => "competitor_a",
            BookSlug::CompetitorB => "competitor_b",
        }
    }

    pub const ALL: [BookSlug; 3] = [BookSlug::Primary, BookSlug::CompetitorA, BookSlug::CompetitorB];
}

impl fmt::Display for BookSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque cross-book fixture identifier (originally a third-party match id).
pub type SharedEventKey = String;

/// Line sentinel: NULL lines collide with each other for uniqueness purposes.
pub const NULL_LINE_SENTINEL: f64 = 0.0;

pub fn line_or_sentinel(line: Option<f64>) -> f64 {
    line.unwrap_or(NULL_LINE_SENTINEL)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tournament {
    pub id: i64,
    pub name: String,
    pub country: String,
    pub sport: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: i64,
    pub shared_key: SharedEventKey,
    pub home_team: String,
    pub away_team: String,
    pub kickoff: DateTime<Utc>,
    pub tournament_ref: i64,
    pub primary_book_external_id: Option<String>,
    pub competitor_external_ids: HashMap<BookSlug, String>,
}

/// One selectable outcome within a market, with its current price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub name: String,
    pub price: f64,
    pub active: bool,
}

/// Canonical, mapped representation of one market as scraped this cycle.
/// Produced by the Mapper; consumed by the Detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedMarket {
    pub canonical_market_id: String,
    pub line: Option<f64>,
    pub outcomes: Vec<Outcome>,
}

/// Urgency tier used in priority-queue ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UrgencyTier {
    Imminent = 0,
    Soon = 1,
    Future = 2,
}

/// The latest known odds for one `(event, book, canonical_market_id, line)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentMarket {
    pub event_id: i64,
    pub book: BookSlug,
    pub canonical_market_id: String,
    pub line: Option<f64>,
    pub outcomes: Vec<Outcome>,
    pub last_updated_at: DateTime<Utc>,
    pub last_confirmed_at: DateTime<Utc>,
    pub unavailable_since: Option<DateTime<Utc>>,
}

impl CurrentMarket {
    pub fn is_available(&self) -> bool {
        self.unavailable_since.is_none()
    }
}

/// Append-only snapshot of a market whose numbers actually changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalMarketRow {
    pub event_id: i64,
    pub book: BookSlug,
    pub canonical_market_id: String,
    pub line: Option<f64>,
    pub outcomes: Vec<Outcome>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnmappedStatus {
    New,
    Acknowledged,
    Mapped,
    Ignored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmappedMarket {
    pub book: BookSlug,
    pub raw_market_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub occurrence_count: i64,
    pub sample_outcomes: Vec<String>,
    pub status: UnmappedStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskAlertType {
    PriceChange,
    DirectionDisagreement,
    Availability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    Warning,
    Elevated,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertStatus {
    New,
    Acknowledged,
    Past,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAlert {
    pub event_id: i64,
    pub book: BookSlug,
    pub canonical_market_id: String,
    pub line: Option<f64>,
    pub outcome_name: String,
    pub alert_type: RiskAlertType,
    pub severity: AlertSeverity,
    pub old_value: Option<f64>,
    pub new_value: Option<f64>,
    pub change_percent: Option<f64>,
    pub competitor_direction: Option<Direction>,
    pub detected_at: DateTime<Utc>,
    pub status: AlertStatus,
    pub kickoff: DateTime<Utc>,
}

impl RiskAlert {
    /// `PAST` is derived from `kickoff < now`, never stored as a separate flag.
    pub fn effective_status(&self, now: DateTime<Utc>) -> AlertStatus {
        if self.kickoff < now && self.status == AlertStatus::New {
            AlertStatus::Past
        } else {
            self.status
        }
    }
}

/// Single-row operator configuration, reloaded at the start of every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub scrape_interval_secs: u64,
    pub enabled_books: Vec<BookSlug>,
    pub retention_horizon_days: i64,
    pub warning_threshold_pct: f64,
    pub elevated_threshold_pct: f64,
    pub critical_threshold_pct: f64,
    pub alerts_enabled: bool,
    pub lookback_window_secs: i64,
    pub batch_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scrape_interval_secs: 60,
            enabled_books: vec![BookSlug::Primary, BookSlug::CompetitorA, BookSlug::CompetitorB],
            retention_horizon_days: 30,
            warning_threshold_pct: 5.0,
            elevated_threshold_pct: 10.0,
            critical_threshold_pct: 20.0,
            alerts_enabled: true,
            lookback_window_secs: 3600,
            batch_size: 50,
        }
    }
}

impl Settings {
    pub fn severity_for_pct(&self, pct_abs: f64) -> Option<AlertSeverity> {
        if pct_abs >= self.critical_threshold_pct {
            Some(AlertSeverity::Critical)
        } else if pct_abs >= self.elevated_threshold_pct {
            Some(AlertSeverity::Elevated)
        } else if pct_abs >= self.warning_threshold_pct {
            Some(AlertSeverity::Warning)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_line_collides_with_sentinel() {
        assert_eq!(line_or_sentinel(None), NULL_LINE_SENTINEL);
        assert_eq!(line_or_sentinel(Some(0.0)), 0.0);
    }

    #[test]
    fn severity_bands_are_half_open() {
        let s = Settings::default();
        assert_eq!(s.severity_for_pct(4.9), None);
        assert_eq!(s.severity_for_pct(5.0), Some(AlertSeverity::Warning));
        assert_eq!(s.severity_for_pct(9.99), Some(AlertSeverity::Warning));
        assert_eq!(s.severity_for_pct(10.0), Some(AlertSeverity::Elevated));
        assert_eq!(s.severity_for_pct(20.0), Some(AlertSeverity::Critical));
    }

    #[test]
    fn past_status_derived_from_kickoff() {
        let now = Utc::now();
        let mut alert = RiskAlert {
            event_id: 1,
            book: BookSlug::Primary,
            canonical_market_id: "1x2".into(),
            line: None,
            outcome_name: "Home".into(),
            alert_type: RiskAlertType::PriceChange,
            severity: AlertSeverity::Warning,
            old_value: Some(2.0),
            new_value: Some(2.2),
            change_percent: Some(10.0),
            competitor_direction: None,
            detected_at: now,
            status: AlertStatus::New,
            kickoff: now - chrono::Duration::hours(1),
        };
        assert_eq!(alert.effective_status(now), AlertStatus::Past);
        alert.kickoff = now + chrono::Duration::hours(1);
        assert_eq!(alert.effective_status(now), AlertStatus::New);
    }
}
