//! Compiled-in baseline `(book, raw_market_id) -> canonical_market_id`
//! table. A representative slice covering the core market families
//! (1X2, Asian handicap, totals, both-teams-to-score) — the exhaustive
//! real-world table is maintained by a separate mapping subsystem and
//! out of scope here. Lazily built once per process via
//! `once_cell::sync::Lazy`.

use crate::types::BookSlug;
use once_cell::sync::Lazy;
use std::collections::HashMap;

pub static BASELINE_TABLE: Lazy<HashMap<(BookSlug, &'static str), &'static str>> = Lazy::new(|| {
    use BookSlug::*;
    HashMap::from([
        ((Primary, "s;0;ml"), "1x2"),
        ((Primary, "s;0;rh"), "ah"),
        ((Primary, "s;0;ou"), "ou"),
        ((Primary, "s;0;btts"), "btts"),
        ((CompetitorA, "1"), "1x2"),
        ((CompetitorA, "2"), "ah"),
        ((CompetitorA, "3"), "ou"),
        ((CompetitorA, "29"), "btts"),
        ((CompetitorB, "WIN_DRAW_WIN"), "1x2"),
        ((CompetitorB, "HANDICAP"), "ah"),
        ((CompetitorB, "TOTAL_GOALS"), "ou"),
        ((CompetitorB, "BOTH_TEAMS_SCORE"), "btts"),
    ])
});

/// Market families whose `line` may need to be substituted from
/// `handicap_home` when the upstream record omits it.
pub fn is_line_bearing(canonical_market_id: &str) -> bool {
    matches!(canonical_market_id, "ah" | "ou")
}
