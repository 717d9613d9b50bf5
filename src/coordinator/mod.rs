//! The four-phase scrape cycle body: discovery, priority queueing,
//! batched parallel scraping, per-batch detection and write. A
//! `tokio::time::interval` tick loop drives repeated cycles, fanning
//! out over three books per event instead of polling a single book at
//! a fixed interval, and batching the detect/write pipeline instead of
//! writing each event as it completes.

pub mod priority;

use crate::cache::Cache;
use crate::clients::BookClient;
use crate::detector::{self, EventDetection, FreshByBook, WriteBatch};
use crate::errors::ScrapeError;
use crate::mapper::{Mapper, NormalizeResult, UnmappedBuffer, UnmappedObservation};
use crate::types::{BookSlug, Event, RiskAlert, Settings};
use crate::writequeue::WriteQueue;
use chrono::Utc;
use futures::future::join_all;
use priority::{urgency_tier, PriorityQueue, QueuedEvent};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// How far past kickoff a cached event is allowed to linger before the
/// end-of-cycle eviction pass drops it.
const EVICTION_GRACE: chrono::Duration = chrono::Duration::hours(2);

/// Progress/result events the WebSocket Broadcaster demuxes onto
/// separate topics. Write-queue-originated
/// variants (`BatchCommitted`/`BatchFailed`/`RiskAlertsBatch`/`UnmappedObserved`)
/// travel the same channel as Coordinator-phase progress so there's a
/// single fan-out point into the Broadcaster.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    DiscoveryStarted,
    DiscoveryComplete { per_book_counts: HashMap<BookSlug, usize> },
    BatchScraping { batch_id: u64, events: usize },
    BatchScraped { batch_id: u64, ms: u64 },
    BatchStored { batch_id: u64, ms: u64 },
    CycleComplete { events_scraped: usize, batches: usize },
    BatchCommitted { batch_id: u64, event_ids: Vec<i64>, changed_markets: usize },
    BatchFailed { batch_id: u64, event_ids: Vec<i64>, reason: String },
    RiskAlertsBatch(Vec<RiskAlert>),
    UnmappedObserved(Vec<UnmappedObservation>),
}

/// One scrape over all three books for a single event, fanned out
/// concurrently per book — a failed book never blocks the others.
struct EventScrapeResult {
    fresh_by_book: FreshByBook,
    books_attempted: Vec<BookSlug>,
}

pub struct Coordinator {
    pool: PgPool,
    cache: Arc<Cache>,
    write_queue: Arc<WriteQueue>,
    clients: HashMap<BookSlug, Arc<dyn BookClient>>,
    progress_tx: broadcast::Sender<ProgressEvent>,
    /// `shared_key -> event_id`, loaded at startup and grown during
    /// discovery; avoids an upsert round-trip for events already known.
    known_events: Mutex<HashMap<String, i64>>,
    next_batch_id: AtomicU64,
    /// Shared with the Scheduler so a triggered cycle can never overlap
    /// a periodic one.
    cycle_running: Arc<std::sync::atomic::AtomicBool>,
}

impl Coordinator {
    pub fn new(
        pool: PgPool,
        cache: Arc<Cache>,
        write_queue: Arc<WriteQueue>,
        clients: HashMap<BookSlug, Arc<dyn BookClient>>,
        progress_tx: broadcast::Sender<ProgressEvent>,
        known_events: HashMap<String, i64>,
        cycle_running: Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        Self {
            pool,
            cache,
            write_queue,
            clients,
            progress_tx,
            known_events: Mutex::new(known_events),
            next_batch_id: AtomicU64::new(0),
            cycle_running,
        }
    }

    /// Runs one full scrape cycle. Settings and mapping overrides are
    /// snapshotted once at the top; mid-cycle mutations to either don't
    /// take effect until the next cycle.
    pub async fn run_cycle(&self) -> Result<(), ScrapeError> {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("cycle requested while another is already running; skipping");
            return Ok(());
        }
        let result = self.run_cycle_inner().await;
        self.cycle_running.store(false, Ordering::Release);
        result
    }

    async fn run_cycle_inner(&self) -> Result<(), ScrapeError> {
        let settings = crate::settings::load_settings(&self.pool).await?;
        let overrides = crate::settings::load_overrides(&self.pool).await?;
        let mapper = Mapper::new(overrides);
        let mut unmapped_buffer = UnmappedBuffer::default();

        let events = self.discover(&settings).await?;
        if events.is_empty() {
            info!("no events discovered this cycle");
            return Ok(());
        }

        let now = Utc::now();
        let mut queue = PriorityQueue::new();
        for ev in &events {
            let coverage = (ev.primary_book_external_id.is_some() as u8
                + ev.competitor_external_ids.len() as u8)
                .min(3);
            queue.push(
                QueuedEvent {
                    shared_key: ev.shared_key.clone(),
                    kickoff: ev.kickoff,
                    coverage_count: coverage,
                    has_primary_book: ev.primary_book_external_id.is_some(),
                },
                now,
            );
        }
        let events_by_key: HashMap<String, Event> =
            events.into_iter().map(|e| (e.shared_key.clone(), e)).collect();

        let mut batches_run = 0usize;
        let mut events_scraped = 0usize;

        while !queue.is_empty() {
            let batch_id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
            let drained = queue.drain_batch(settings.batch_size);
            let batch_events: Vec<&Event> =
                drained.iter().filter_map(|q| events_by_key.get(&q.shared_key)).collect();

            let _ = self.progress_tx.send(ProgressEvent::BatchScraping { batch_id, events: batch_events.len() });
            let scrape_start = std::time::Instant::now();

            let scraped = join_all(batch_events.iter().map(|ev| self.scrape_event(ev, &mapper))).await;

            let _ = self.progress_tx.send(ProgressEvent::BatchScraped {
                batch_id,
                ms: scrape_start.elapsed().as_millis() as u64,
            });

            let store_start = std::time::Instant::now();
            let mut write_batch = WriteBatch::new(batch_id);

            for (ev, scraped) in batch_events.iter().zip(scraped.into_iter()) {
                let Some((result, mut per_event_unmapped)) = scraped else { continue };
                unmapped_buffer.entries.append(&mut per_event_unmapped);
                let existing = self.cache.existing_for_event(ev.event_id);
                // A bug or inconsistent previous state inside detection
                // drops just this event's contribution; the rest of the
                // batch still gets written.
                let detected = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    detector::detect_event(ev, now, &settings, &existing, &result.fresh_by_book, &result.books_attempted)
                }));
                match detected {
                    Ok(detection) => {
                        write_batch.fold_event(detection);
                        events_scraped += 1;
                    }
                    Err(_) => {
                        warn!(event_id = ev.event_id, "detection panicked for this event, dropping it from the batch");
                    }
                }
            }

            write_batch.unmapped = unmapped_buffer.take();
            if !write_batch.unmapped.is_empty() {
                let _ = self.progress_tx.send(ProgressEvent::UnmappedObserved(write_batch.unmapped.clone()));
            }

            self.write_queue.enqueue(write_batch).await?;
            let _ = self.progress_tx.send(ProgressEvent::BatchStored {
                batch_id,
                ms: store_start.elapsed().as_millis() as u64,
            });
            batches_run += 1;
        }

        let _ = self.progress_tx.send(ProgressEvent::CycleComplete { events_scraped, batches: batches_run });

        let evicted = self.cache.evict_expired(EVICTION_GRACE);
        if evicted > 0 {
            info!(evicted, "evicted cached events past their kickoff grace window");
        }

        Ok(())
    }

    /// Phase 1: concurrent per-book discovery, merged by shared key.
    /// Competitor events lacking a shared key never reach this map —
    /// the clients themselves drop them.
    async fn discover(&self, settings: &Settings) -> Result<Vec<Event>, ScrapeError> {
        let _ = self.progress_tx.send(ProgressEvent::DiscoveryStarted);

        let enabled: Vec<BookSlug> = settings.enabled_books.clone();
        let discovery_results = join_all(enabled.iter().filter_map(|book| {
            self.clients.get(book).map(|client| {
                let client = client.clone();
                async move { (client.book(), client.discover_events().await) }
            })
        }))
        .await;

        let mut per_book_counts = HashMap::new();
        let mut by_key: HashMap<String, Event> = HashMap::new();
        let mut failures = 0usize;

        for (book, result) in discovery_results {
            match result {
                Ok(raw_events) => {
                    per_book_counts.insert(book, raw_events.len());
                    for (shared_key, raw) in raw_events {
                        if raw.kickoff <= Utc::now() {
                            continue;
                        }
                        self.merge_discovered_event(&mut by_key, book, shared_key, raw).await?;
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(%book, error = %e, "discovery failed for book");
                }
            }
        }

        if failures == enabled.len() && !enabled.is_empty() {
            return Err(ScrapeError::CycleFatal("discovery failed on every enabled book".into()));
        }

        let _ = self.progress_tx.send(ProgressEvent::DiscoveryComplete { per_book_counts });
        Ok(by_key.into_values().collect())
    }

    async fn merge_discovered_event(
        &self,
        by_key: &mut HashMap<String, Event>,
        book: BookSlug,
        shared_key: String,
        raw: crate::clients::RawEvent,
    ) -> Result<(), ScrapeError> {
        // First book to report this shared key this cycle resolves (and,
        // if needed, creates) the tournament and event rows; later books
        // for the same key only attach their external id.
        if !by_key.contains_key(&shared_key) {
            let tournament_ref = crate::db::events::upsert_tournament(
                &self.pool,
                &raw.tournament_name,
                &raw.tournament_country,
                "football",
            )
            .await?;

            let event_id = if let Some(&id) = self.known_events.lock().unwrap().get(&shared_key) {
                id
            } else {
                let primary_external_id = if book == BookSlug::Primary { Some(raw.external_id.as_str()) } else { None };
                let id = crate::db::events::upsert_event(
                    &self.pool,
                    &shared_key,
                    &raw.home_team,
                    &raw.away_team,
                    raw.kickoff,
                    tournament_ref,
                    primary_external_id,
                )
                .await?;
                self.known_events.lock().unwrap().insert(shared_key.clone(), id);
                id
            };

            by_key.insert(
                shared_key.clone(),
                Event {
                    event_id,
                    shared_key: shared_key.clone(),
                    home_team: raw.home_team.clone(),
                    away_team: raw.away_team.clone(),
                    kickoff: raw.kickoff,
                    tournament_ref,
                    primary_book_external_id: None,
                    competitor_external_ids: HashMap::new(),
                },
            );
        }

        let entry = by_key.get_mut(&shared_key).expect("just inserted above");
        let event_id = entry.event_id;
        if book == BookSlug::Primary {
            entry.primary_book_external_id = Some(raw.external_id.clone());
        } else {
            entry.competitor_external_ids.insert(book, raw.external_id.clone());
            crate::db::events::set_competitor_external_id(&self.pool, event_id, book, &raw.external_id).await?;
        }
        self.cache.insert_event(entry.clone());
        Ok(())
    }

    /// Phase 3 (per event): fetch every attempted book concurrently,
    /// map each returned raw market, and bucket mapped markets by
    /// book. Unmapped observations are returned to the caller instead
    /// of written to a shared buffer directly, since concurrent events
    /// share one `Mapper` borrow.
    async fn scrape_event(
        &self,
        event: &Event,
        mapper: &Mapper,
    ) -> Option<(EventScrapeResult, Vec<crate::mapper::UnmappedObservation>)> {
        let mut attempts: Vec<(BookSlug, String)> = Vec::new();
        if let Some(id) = &event.primary_book_external_id {
            attempts.push((BookSlug::Primary, id.clone()));
        }
        for (&book, id) in &event.competitor_external_ids {
            attempts.push((book, id.clone()));
        }

        let fetches = join_all(attempts.iter().map(|(book, external_id)| {
            let client = self.clients.get(book).cloned();
            let external_id = external_id.clone();
            let book = *book;
            async move {
                match client {
                    Some(c) => (book, c.fetch_event_markets(&external_id).await),
                    None => (book, Err(ScrapeError::Configuration(format!("no client configured for {book}")))),
                }
            }
        }))
        .await;

        let mut fresh_by_book = FreshByBook::new();
        let mut books_attempted = Vec::new();
        let mut unmapped = Vec::new();

        for (book, outcome) in fetches {
            books_attempted.push(book);
            match outcome {
                Ok(raw_markets) => {
                    let mut mapped = Vec::new();
                    for record in &raw_markets.records {
                        match mapper.normalize(book, record) {
                            NormalizeResult::Mapped(m) => mapped.push(m),
                            NormalizeResult::Unmapped { sample_outcomes } => {
                                unmapped.push(crate::mapper::UnmappedObservation {
                                    book,
                                    raw_market_id: record.raw_market_id.clone(),
                                    sample_outcomes,
                                });
                            }
                        }
                    }
                    fresh_by_book.insert(book, mapped);
                }
                Err(e) => {
                    warn!(event_id = event.event_id, %book, error = %e, "per-event fetch failed");
                }
            }
        }

        Some((EventScrapeResult { fresh_by_book, books_attempted }, unmapped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urgency_tier_reexported_for_priority_module_tests() {
        let now = Utc::now();
        assert_eq!(urgency_tier(now + chrono::Duration::minutes(5), now), crate::types::UrgencyTier::Imminent);
    }
}
