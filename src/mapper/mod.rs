//! Market Mapper: a pure function translating `(book, raw_market)`
//! into a canonical `(market_id, line, outcomes[])` or an `Unmapped`
//! record. Overrides win over the baseline table; highest `priority`
//! wins among competing overrides, earliest `created_at` breaks ties.

pub mod baseline;

use crate::clients::RawMarketRecord;
use crate::types::{BookSlug, MappedMarket, Outcome};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct MappingOverride {
    pub book: BookSlug,
    pub raw_market_id: String,
    pub canonical_market_id: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum NormalizeResult {
    Mapped(MappedMarket),
    Unmapped { sample_outcomes: Vec<String> },
}

/// Holds operator-supplied overrides, refreshed once per cycle
/// alongside `Settings` — both are snapshotted at cycle start.
pub struct Mapper {
    overrides: HashMap<(BookSlug, String), Vec<MappingOverride>>,
}

impl Mapper {
    pub fn new(overrides: Vec<MappingOverride>) -> Self {
        let mut map: HashMap<(BookSlug, String), Vec<MappingOverride>> = HashMap::new();
        for o in overrides {
            map.entry((o.book, o.raw_market_id.clone())).or_default().push(o);
        }
        for v in map.values_mut() {
            v.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        }
        Self { overrides: map }
    }

    fn resolve_canonical_id(&self, book: BookSlug, raw_market_id: &str) -> Option<String> {
        if let Some(candidates) = self.overrides.get(&(book, raw_market_id.to_string())) {
            if let Some(winner) = candidates.first() {
                return Some(winner.canonical_market_id.clone());
            }
        }
        baseline::BASELINE_TABLE
            .get(&(book, raw_market_id))
            .map(|s| s.to_string())
    }

    /// `Normalize(book, raw_market) → (canonical_market_id, line, outcomes[]) | Unmapped`.
    pub fn normalize(&self, book: BookSlug, raw: &RawMarketRecord) -> NormalizeResult {
        let Some(canonical_market_id) = self.resolve_canonical_id(book, &raw.raw_market_id) else {
            return NormalizeResult::Unmapped {
                sample_outcomes: raw.outcomes.iter().take(3).map(|o| o.name.clone()).collect(),
            };
        };

        let line = if raw.line.is_none() && baseline::is_line_bearing(&canonical_market_id) {
            raw.handicap_home
        } else {
            raw.line
        };

        let outcomes = raw
            .outcomes
            .iter()
            .map(|o| Outcome {
                name: normalize_outcome_name(&o.name),
                price: o.price,
                active: o.is_active.unwrap_or(true),
            })
            .collect();

        NormalizeResult::Mapped(MappedMarket {
            canonical_market_id,
            line,
            outcomes,
        })
    }
}

static SEPARATOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*(-|&|/|\+)\s*").unwrap());

/// Outcome names across books sometimes use different separators for
/// combined markets ("A - B" vs "A & B"); normalize all of them to a
/// single canonical form so outcomes cross-match.
pub fn normalize_outcome_name(name: &str) -> String {
    SEPARATOR_RE.replace_all(name.trim(), " & ").to_string()
}

/// In-memory buffer of unmapped observations for one cycle. Flushed
/// and cleared at the end of the cycle.
#[derive(Debug, Default)]
pub struct UnmappedBuffer {
    pub entries: Vec<UnmappedObservation>,
}

#[derive(Debug, Clone)]
pub struct UnmappedObservation {
    pub book: BookSlug,
    pub raw_market_id: String,
    pub sample_outcomes: Vec<String>,
}

impl UnmappedBuffer {
    pub fn push(&mut self, book: BookSlug, raw_market_id: String, sample_outcomes: Vec<String>) {
        self.entries.push(UnmappedObservation {
            book,
            raw_market_id,
            sample_outcomes,
        });
    }

    pub fn take(&mut self) -> Vec<UnmappedObservation> {
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::RawOutcome;

    fn raw(market_id: &str, line: Option<f64>, handicap_home: Option<f64>) -> RawMarketRecord {
        RawMarketRecord {
            raw_market_id: market_id.to_string(),
            raw_market_name: None,
            line,
            handicap_home,
            outcomes: vec![
                RawOutcome { name: "Home".into(), price: 2.0, is_active: Some(true) },
                RawOutcome { name: "Away".into(), price: 3.0, is_active: Some(true) },
            ],
        }
    }

    #[test]
    fn baseline_maps_known_market() {
        let mapper = Mapper::new(vec![]);
        let result = mapper.normalize(BookSlug::Primary, &raw("s;0;ml", None, None));
        match result {
            NormalizeResult::Mapped(m) => assert_eq!(m.canonical_market_id, "1x2"),
            NormalizeResult::Unmapped { .. } => panic!("expected mapped"),
        }
    }

    #[test]
    fn unknown_market_is_unmapped() {
        let mapper = Mapper::new(vec![]);
        let result = mapper.normalize(BookSlug::CompetitorA, &raw("800117", None, None));
        assert!(matches!(result, NormalizeResult::Unmapped { .. }));
    }

    #[test]
    fn handicap_home_substitutes_missing_line() {
        let mapper = Mapper::new(vec![]);
        let result = mapper.normalize(BookSlug::Primary, &raw("s;0;rh", None, Some(-1.5)));
        match result {
            NormalizeResult::Mapped(m) => assert_eq!(m.line, Some(-1.5)),
            _ => panic!("expected mapped"),
        }
    }

    #[test]
    fn override_wins_over_baseline_by_priority() {
        let now = Utc::now();
        let overrides = vec![
            MappingOverride {
                book: BookSlug::Primary,
                raw_market_id: "s;0;ml".into(),
                canonical_market_id: "custom_1x2".into(),
                priority: 1,
                created_at: now,
            },
            MappingOverride {
                book: BookSlug::Primary,
                raw_market_id: "s;0;ml".into(),
                canonical_market_id: "higher_priority_1x2".into(),
                priority: 5,
                created_at: now,
            },
        ];
        let mapper = Mapper::new(overrides);
        let result = mapper.normalize(BookSlug::Primary, &raw("s;0;ml", None, None));
        match result {
            NormalizeResult::Mapped(m) => assert_eq!(m.canonical_market_id, "higher_priority_1x2"),
            _ => panic!("expected mapped"),
        }
    }

    #[test]
    fn tied_priority_breaks_by_earliest_created_at() {
        let now = Utc::now();
        let overrides = vec![
            MappingOverride {
                book: BookSlug::Primary,
                raw_market_id: "s;0;ml".into(),
                canonical_market_id: "later".into(),
                priority: 1,
                created_at: now + chrono::Duration::seconds(10),
            },
            MappingOverride {
                book: BookSlug::Primary,
                raw_market_id: "s;0;ml".into(),
                canonical_market_id: "earlier".into(),
                priority: 1,
                created_at: now,
            },
        ];
        let mapper = Mapper::new(overrides);
        let result = mapper.normalize(BookSlug::Primary, &raw("s;0;ml", None, None));
        match result {
            NormalizeResult::Mapped(m) => assert_eq!(m.canonical_market_id, "earlier"),
            _ => panic!("expected mapped"),
        }
    }

    #[test]
    fn outcome_separators_normalize_to_canonical_form() {
        assert_eq!(normalize_outcome_name("A - B"), "A & B");
        assert_eq!(normalize_outcome_name("A & B"), "A & B");
        assert_eq!(normalize_outcome_name("A/B"), "A & B");
    }
}
