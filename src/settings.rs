//! Mutable, DB-backed `Settings`, reloaded at the start of every
//! cycle — mid-cycle mutations don't take effect until the next one.
//! Mapping overrides live beside it since both are snapshotted together
//! at the top of `run_cycle`.

use crate::mapper::MappingOverride;
use crate::types::{BookSlug, Settings};
use sqlx::{PgPool, Row};

pub async fn load_settings(pool: &PgPool) -> Result<Settings, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT scrape_interval_secs, enabled_books, retention_horizon_days,
               warning_threshold_pct, elevated_threshold_pct, critical_threshold_pct,
               alerts_enabled, lookback_window_secs, batch_size
        FROM settings
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(Settings::default());
    };

    let enabled_books_raw: Vec<String> = row.try_get("enabled_books").unwrap_or_default();
    let enabled_books = enabled_books_raw
        .iter()
        .filter_map(|s| match s.as_str() {
            "primary" => Some(BookSlug::Primary),
            "competitor_a" => Some(BookSlug::CompetitorA),
            "competitor_b" => Some(BookSlug::CompetitorB),
            _ => None,
        })
        .collect::<Vec<_>>();

    Ok(Settings {
        scrape_interval_secs: row.try_get::<i64, _>("scrape_interval_secs").unwrap_or(60) as u64,
        enabled_books: if enabled_books.is_empty() {
            Settings::default().enabled_books
        } else {
            enabled_books
        },
        retention_horizon_days: row.try_get("retention_horizon_days").unwrap_or(30),
        warning_threshold_pct: row.try_get("warning_threshold_pct").unwrap_or(5.0),
        elevated_threshold_pct: row.try_get("elevated_threshold_pct").unwrap_or(10.0),
        critical_threshold_pct: row.try_get("critical_threshold_pct").unwrap_or(20.0),
        alerts_enabled: row.try_get("alerts_enabled").unwrap_or(true),
        lookback_window_secs: row.try_get("lookback_window_secs").unwrap_or(3600),
        batch_size: row.try_get::<i32, _>("batch_size").unwrap_or(50) as usize,
    })
}

pub async fn load_overrides(pool: &PgPool) -> Result<Vec<MappingOverride>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT book, raw_market_id, canonical_market_id, priority, created_at FROM mapping_overrides",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let book_str: String = row.try_get("book").ok()?;
            let book = match book_str.as_str() {
                "primary" => BookSlug::Primary,
                "competitor_a" => BookSlug::CompetitorA,
                "competitor_b" => BookSlug::CompetitorB,
                _ => return None,
            };
            Some(MappingOverride {
                book,
                raw_market_id: row.try_get("raw_market_id").ok()?,
                canonical_market_id: row.try_get("canonical_market_id").ok()?,
                priority: row.try_get("priority").ok()?,
                created_at: row.try_get("created_at").ok()?,
            })
        })
        .collect())
}
