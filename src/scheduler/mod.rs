//! Owns the periodic cycle tick and the coarser retention-cleanup
//! tick, plus the start/stop/pause/resume/trigger_now controls over a
//! fixed-interval loop that can be stopped or paused, with its reentry
//! guard shared by the `trigger_now` path so manual and scheduled
//! triggers never overlap.

use crate::coordinator::Coordinator;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};

const RETENTION_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const UNMAPPED_RETENTION_DAYS: i64 = 30;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped = 0,
    Running = 1,
    Paused = 2,
}

/// Floors a configured interval to 1s; otherwise passed through as-is,
/// with no upper bound.
fn normalize_interval_secs(secs: u64) -> u64 {
    secs.max(1)
}

impl From<u8> for SchedulerState {
    fn from(v: u8) -> Self {
        match v {
            1 => SchedulerState::Running,
            2 => SchedulerState::Paused,
            _ => SchedulerState::Stopped,
        }
    }
}

pub struct Scheduler {
    coordinator: Arc<Coordinator>,
    pool: sqlx::PgPool,
    state: AtomicU8,
    /// Shared with the Coordinator: prevents a triggered cycle from
    /// overlapping a periodic one.
    cycle_running: Arc<AtomicBool>,
    trigger: Notify,
    interval_secs: AtomicU64,
}

impl Scheduler {
    pub fn new(coordinator: Arc<Coordinator>, pool: sqlx::PgPool, cycle_running: Arc<AtomicBool>, scrape_interval_secs: u64) -> Self {
        Self {
            coordinator,
            pool,
            state: AtomicU8::new(SchedulerState::Stopped as u8),
            cycle_running,
            trigger: Notify::new(),
            interval_secs: AtomicU64::new(normalize_interval_secs(scrape_interval_secs)),
        }
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from(self.state.load(Ordering::Acquire))
    }

    /// Spawns the cycle loop and the retention-cleanup loop. Idempotent
    /// only in the sense that calling it twice spawns two loops — the
    /// caller (the composition root) is expected to call this once.
    pub fn start(self: &Arc<Self>) {
        self.state.store(SchedulerState::Running as u8, Ordering::Release);
        let cycle_self = self.clone();
        tokio::spawn(async move { cycle_self.run_cycle_loop().await });
        let cleanup_self = self.clone();
        tokio::spawn(async move { cleanup_self.run_cleanup_loop().await });
    }

    pub fn stop(&self) {
        self.state.store(SchedulerState::Stopped as u8, Ordering::Release);
    }

    /// Advisory pause: an in-flight cycle runs to completion, but no
    /// new cycle starts while paused.
    pub fn pause(&self) {
        if self.state() == SchedulerState::Running {
            self.state.store(SchedulerState::Paused as u8, Ordering::Release);
        }
    }

    pub fn resume(&self) {
        if self.state() == SchedulerState::Paused {
            self.state.store(SchedulerState::Running as u8, Ordering::Release);
        }
    }

    /// Wakes the cycle loop immediately instead of waiting for the next
    /// tick. A no-op while stopped or while a cycle is already running
    /// (the Coordinator's own reentry guard absorbs that case too).
    pub fn trigger_now(&self) {
        self.trigger.notify_one();
    }

    async fn run_cycle_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.interval_secs.load(Ordering::Acquire)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => {}
            }

            match self.state() {
                SchedulerState::Stopped => {
                    info!("scheduler stopped, exiting cycle loop");
                    break;
                }
                SchedulerState::Paused => continue,
                SchedulerState::Running => {}
            }
            if self.cycle_running.load(Ordering::Acquire) {
                continue;
            }

            if let Err(e) = self.coordinator.run_cycle().await {
                error!(error = %e, "scrape cycle failed");
            }
        }
    }

    async fn run_cleanup_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(RETENTION_CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            if self.state() == SchedulerState::Stopped {
                break;
            }
            let settings = match crate::settings::load_settings(&self.pool).await {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to load settings for retention cleanup");
                    continue;
                }
            };
            if let Err(e) = crate::db::retention::run_cleanup(&self.pool, settings.retention_horizon_days, UNMAPPED_RETENTION_DAYS).await {
                error!(error = %e, "retention cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_round_trip_through_u8() {
        assert_eq!(SchedulerState::from(SchedulerState::Running as u8), SchedulerState::Running);
        assert_eq!(SchedulerState::from(SchedulerState::Paused as u8), SchedulerState::Paused);
        assert_eq!(SchedulerState::from(SchedulerState::Stopped as u8), SchedulerState::Stopped);
    }

    #[test]
    fn interval_above_255_seconds_is_not_truncated() {
        assert_eq!(normalize_interval_secs(300), 300);
        assert_eq!(normalize_interval_secs(100_000), 100_000);
    }

    #[test]
    fn zero_interval_floors_to_one_second() {
        assert_eq!(normalize_interval_secs(0), 1);
    }
}
