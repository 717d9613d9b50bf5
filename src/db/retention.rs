//! Retention cleanup: children deleted before parents, enumerated
//! explicitly rather than relying on `ON DELETE CASCADE`, since a
//! missed child-table FK dependency is an easy way to leave orphaned
//! rows behind. Runs on its own coarse cadence from the Scheduler,
//! independent of the scrape cycle.

use chrono::{Duration, Utc};
use sqlx::PgPool;
use tracing::info;

/// Deletes everything tied to events whose kickoff is more than
/// `retention_horizon_days` in the past. Order: `risk_alerts` and
/// `history_markets` (children of events), then `current_markets`,
/// then `events`/`tournaments` (parents). `unmapped_markets` has no FK
/// to events and is cleaned independently by its own `last_seen_at`
/// horizon.
pub async fn run_cleanup(pool: &PgPool, retention_horizon_days: i64, unmapped_horizon_days: i64) -> Result<(), sqlx::Error> {
    let cutoff = Utc::now() - Duration::days(retention_horizon_days);

    let mut tx = pool.begin().await?;

    let alerts = sqlx::query(
        "DELETE FROM risk_alerts WHERE event_id IN (SELECT event_id FROM events WHERE kickoff < $1)",
    )
    .bind(cutoff)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let history = sqlx::query(
        "DELETE FROM history_markets WHERE event_id IN (SELECT event_id FROM events WHERE kickoff < $1)",
    )
    .bind(cutoff)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let current = sqlx::query(
        "DELETE FROM current_markets WHERE event_id IN (SELECT event_id FROM events WHERE kickoff < $1)",
    )
    .bind(cutoff)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let status = sqlx::query(
        "DELETE FROM event_scrape_status WHERE event_id IN (SELECT event_id FROM events WHERE kickoff < $1)",
    )
    .bind(cutoff)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let events = sqlx::query("DELETE FROM events WHERE kickoff < $1").bind(cutoff).execute(&mut *tx).await?.rows_affected();

    let orphaned_tournaments = sqlx::query(
        "DELETE FROM tournaments t WHERE NOT EXISTS (SELECT 1 FROM events e WHERE e.tournament_ref = t.id)",
    )
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let unmapped_cutoff = Utc::now() - Duration::days(unmapped_horizon_days);
    let unmapped = sqlx::query("DELETE FROM unmapped_markets WHERE last_seen_at < $1 AND status != 'acknowledged'")
        .bind(unmapped_cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;

    info!(
        alerts, history, current, status, events, orphaned_tournaments, unmapped,
        "retention cleanup complete"
    );
    Ok(())
}
