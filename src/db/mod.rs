//! Database plumbing: pool construction, event/tournament persistence,
//! retention cleanup. Split out from the Write Queue since these
//! queries run outside the per-batch transaction (discovery upserts
//! happen before any market is scraped; retention runs on its own
//! schedule).

pub mod events;
pub mod retention;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}
