//! The single writer for every table the Detector touches. One `mpsc`
//! channel, one consumer task holding the pool, one `sqlx::Transaction`
//! per batch — a single batch-shaped transaction rather than several
//! market-type-specific update functions, since `CurrentMarket` is
//! already canonical across market families.

use crate::cache::Cache;
use crate::coordinator::ProgressEvent;
use crate::detector::WriteBatch;
use crate::types::{AlertStatus, CurrentMarket, HistoricalMarketRow, RiskAlert};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

const QUEUE_CAPACITY: usize = 10_000;

pub struct WriteQueue {
    sender: mpsc::Sender<WriteBatch>,
}

impl WriteQueue {
    /// Spawns the consumer task and returns a handle to enqueue batches
    /// plus the task's `JoinHandle`, for shutdown.
    pub fn spawn(pool: PgPool, cache: Arc<Cache>, progress_tx: broadcast::Sender<ProgressEvent>) -> (Self, tokio::task::JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let handle = tokio::spawn(run_consumer(pool, cache, progress_tx, receiver));
        (Self { sender }, handle)
    }

    pub async fn enqueue(&self, batch: WriteBatch) -> Result<(), crate::errors::ScrapeError> {
        self.sender
            .send(batch)
            .await
            .map_err(|_| crate::errors::ScrapeError::CycleFatal("write queue consumer has shut down".into()))
    }
}

async fn run_consumer(
    pool: PgPool,
    cache: Arc<Cache>,
    progress_tx: broadcast::Sender<ProgressEvent>,
    mut receiver: mpsc::Receiver<WriteBatch>,
) {
    while let Some(batch) = receiver.recv().await {
        let batch_id = batch.batch_id;
        let event_ids = batch.event_ids();
        match persist(&pool, &batch).await {
            Ok(()) => {
                // Cache and broadcast mutation strictly after commit:
                // the consumer owns both, so there is no window where a
                // reader sees an uncommitted write.
                cache.apply_batch(&batch);
                let _ = progress_tx.send(ProgressEvent::BatchCommitted {
                    batch_id,
                    event_ids: event_ids.clone(),
                    changed_markets: batch.changed_markets,
                });
                if !batch.risk_alerts.is_empty() {
                    let _ = progress_tx.send(ProgressEvent::RiskAlertsBatch(batch.risk_alerts.clone()));
                }
            }
            Err(e) => {
                error!(batch_id, error = %e, "write batch failed, discarding");
                let _ = progress_tx.send(ProgressEvent::BatchFailed { batch_id, event_ids, reason: e.to_string() });
            }
        }
    }
    info!("write queue consumer shutting down: channel closed");
}

async fn persist(pool: &PgPool, batch: &WriteBatch) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for market in &batch.current_upserts {
        upsert_current_market(&mut tx, market).await?;
    }
    for row in &batch.history_inserts {
        insert_history_row(&mut tx, row).await?;
    }
    for alert in &batch.risk_alerts {
        insert_risk_alert(&mut tx, alert).await?;
    }
    for obs in &batch.unmapped {
        upsert_unmapped(&mut tx, obs).await?;
    }
    for status in &batch.event_scrape_statuses {
        upsert_scrape_status(&mut tx, status).await?;
    }

    tx.commit().await
}

async fn upsert_current_market(tx: &mut Transaction<'_, Postgres>, market: &CurrentMarket) -> Result<(), sqlx::Error> {
    let outcomes = serde_json::to_value(&market.outcomes).unwrap_or(serde_json::Value::Null);
    let line = crate::types::line_or_sentinel(market.line);
    sqlx::query(
        "INSERT INTO current_markets \
            (event_id, book, canonical_market_id, line, outcomes, last_updated_at, last_confirmed_at, unavailable_since) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         ON CONFLICT (event_id, book, canonical_market_id, line) DO UPDATE SET \
            outcomes = EXCLUDED.outcomes, \
            last_updated_at = EXCLUDED.last_updated_at, \
            last_confirmed_at = EXCLUDED.last_confirmed_at, \
            unavailable_since = EXCLUDED.unavailable_since",
    )
    .bind(market.event_id)
    .bind(market.book.as_str())
    .bind(&market.canonical_market_id)
    .bind(line)
    .bind(outcomes)
    .bind(market.last_updated_at)
    .bind(market.last_confirmed_at)
    .bind(market.unavailable_since)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_history_row(tx: &mut Transaction<'_, Postgres>, row: &HistoricalMarketRow) -> Result<(), sqlx::Error> {
    let outcomes = serde_json::to_value(&row.outcomes).unwrap_or(serde_json::Value::Null);
    let line = crate::types::line_or_sentinel(row.line);
    sqlx::query(
        "INSERT INTO history_markets (event_id, book, canonical_market_id, line, outcomes, captured_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(row.event_id)
    .bind(row.book.as_str())
    .bind(&row.canonical_market_id)
    .bind(line)
    .bind(outcomes)
    .bind(row.captured_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_risk_alert(tx: &mut Transaction<'_, Postgres>, alert: &RiskAlert) -> Result<(), sqlx::Error> {
    let line = crate::types::line_or_sentinel(alert.line);
    let direction = alert.competitor_direction.map(|d| match d {
        crate::types::Direction::Up => "up",
        crate::types::Direction::Down => "down",
    });
    let alert_type = match alert.alert_type {
        crate::types::RiskAlertType::PriceChange => "price_change",
        crate::types::RiskAlertType::DirectionDisagreement => "direction_disagreement",
        crate::types::RiskAlertType::Availability => "availability",
    };
    let severity = match alert.severity {
        crate::types::AlertSeverity::Warning => "warning",
        crate::types::AlertSeverity::Elevated => "elevated",
        crate::types::AlertSeverity::Critical => "critical",
    };
    sqlx::query(
        "INSERT INTO risk_alerts \
            (event_id, book, canonical_market_id, line, outcome_name, alert_type, severity, \
             old_value, new_value, change_percent, competitor_direction, detected_at, status, kickoff) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
    )
    .bind(alert.event_id)
    .bind(alert.book.as_str())
    .bind(&alert.canonical_market_id)
    .bind(line)
    .bind(&alert.outcome_name)
    .bind(alert_type)
    .bind(severity)
    .bind(alert.old_value)
    .bind(alert.new_value)
    .bind(alert.change_percent)
    .bind(direction)
    .bind(alert.detected_at)
    .bind(match alert.status {
        AlertStatus::New => "new",
        AlertStatus::Acknowledged => "acknowledged",
        AlertStatus::Past => "past",
    })
    .bind(alert.kickoff)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_unmapped(tx: &mut Transaction<'_, Postgres>, obs: &crate::mapper::UnmappedObservation) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now();
    let samples = serde_json::to_value(&obs.sample_outcomes).unwrap_or(serde_json::Value::Null);
    sqlx::query(
        "INSERT INTO unmapped_markets (book, raw_market_id, first_seen_at, last_seen_at, occurrence_count, sample_outcomes, status) \
         VALUES ($1, $2, $3, $3, 1, $4, 'new') \
         ON CONFLICT (book, raw_market_id) DO UPDATE SET \
            last_seen_at = EXCLUDED.last_seen_at, \
            occurrence_count = unmapped_markets.occurrence_count + 1, \
            sample_outcomes = EXCLUDED.sample_outcomes",
    )
    .bind(obs.book.as_str())
    .bind(&obs.raw_market_id)
    .bind(now)
    .bind(samples)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_scrape_status(tx: &mut Transaction<'_, Postgres>, status: &crate::detector::EventScrapeStatus) -> Result<(), sqlx::Error> {
    let attempted: Vec<&str> = status.books_attempted.iter().map(|b| b.as_str()).collect();
    let succeeded: Vec<&str> = status.books_succeeded.iter().map(|b| b.as_str()).collect();
    sqlx::query(
        "INSERT INTO event_scrape_status (event_id, books_attempted, books_succeeded, scraped_at) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (event_id) DO UPDATE SET \
            books_attempted = EXCLUDED.books_attempted, \
            books_succeeded = EXCLUDED.books_succeeded, \
            scraped_at = EXCLUDED.scraped_at",
    )
    .bind(status.event_id)
    .bind(&attempted)
    .bind(&succeeded)
    .bind(status.scraped_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
