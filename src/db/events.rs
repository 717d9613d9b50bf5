//! Tournament/event upserts run during discovery, ahead of any market
//! scrape. Events are keyed directly by `shared_key` rather than
//! matched by fuzzy team/time comparison.

use crate::types::BookSlug;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;

pub async fn upsert_tournament(pool: &PgPool, name: &str, country: &str, sport: &str) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        "INSERT INTO tournaments (name, country, sport) VALUES ($1, $2, $3) \
         ON CONFLICT (name, country) DO UPDATE SET sport = EXCLUDED.sport \
         RETURNING id",
    )
    .bind(name)
    .bind(country)
    .bind(sport)
    .fetch_one(pool)
    .await?;
    row.try_get("id")
}

#[allow(clippy::too_many_arguments)]
pub async fn upsert_event(
    pool: &PgPool,
    shared_key: &str,
    home_team: &str,
    away_team: &str,
    kickoff: DateTime<Utc>,
    tournament_ref: i64,
    primary_external_id: Option<&str>,
) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        "INSERT INTO events (shared_key, home_team, away_team, kickoff, tournament_ref, primary_book_external_id) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (shared_key) DO UPDATE SET \
            kickoff = EXCLUDED.kickoff, \
            primary_book_external_id = COALESCE(EXCLUDED.primary_book_external_id, events.primary_book_external_id) \
         RETURNING event_id",
    )
    .bind(shared_key)
    .bind(home_team)
    .bind(away_team)
    .bind(kickoff)
    .bind(tournament_ref)
    .bind(primary_external_id)
    .fetch_one(pool)
    .await?;
    row.try_get("event_id")
}

pub async fn set_competitor_external_id(pool: &PgPool, event_id: i64, book: BookSlug, external_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE events SET competitor_external_ids = \
            jsonb_set(coalesce(competitor_external_ids, '{}'::jsonb), ARRAY[$2::text], to_jsonb($3::text), true) \
         WHERE event_id = $1",
    )
    .bind(event_id)
    .bind(book.as_str())
    .bind(external_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// `shared_key -> event_id` for every known event, loaded once at
/// startup so the Coordinator doesn't issue an upsert for events it
/// already knows about on every cycle it can avoid one for.
pub async fn known_shared_keys(pool: &PgPool) -> Result<HashMap<String, i64>, sqlx::Error> {
    let rows = sqlx::query("SELECT shared_key, event_id FROM events").fetch_all(pool).await?;
    let mut map = HashMap::new();
    for row in rows {
        let key: String = row.try_get("shared_key")?;
        let id: i64 = row.try_get("event_id")?;
        map.insert(key, id);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    // Exercised indirectly by the coordinator's discovery-merge tests;
    // these queries need a live Postgres instance to test directly.
}
