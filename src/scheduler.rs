//! # Sync Scheduler
//!
//! Background task that runs scheduled syncs for integrations with an
//! explicit cadence. Each tick selects active integrations whose
//! `last_sync_at` (or creation time) plus interval plus jitter has passed and
//! dispatches them onto their own tasks without waiting for them, so a sync
//! stuck in retry backoff never delays the next tick. Dispatched syncs are
//! tracked per integration; an integration whose previous scheduled sync is
//! still running is not dispatched again. A semaphore shared across ticks
//! bounds how many provider calls run at once.
//!
//! Mutual exclusion with manual syncs and other instances is left to the
//! orchestrator: a sync that is already running or a breaker that is open is
//! skipped quietly.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge, histogram};
use rand::Rng;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::SchedulerConfig;
use crate::error::IntegrationError;
use crate::models::SyncType;
use crate::models::integration::Model as IntegrationModel;
use crate::repositories::IntegrationRepository;
use crate::sync::SyncOrchestrator;

/// Counters for one scheduler tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub candidates: u64,
    pub due: u64,
    pub dispatched: u64,
    /// Due, but the previous scheduled sync has not finished yet
    pub still_running: u64,
}

/// Outcomes of the dispatched syncs collected by [`SyncScheduler::drain`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Completed,
    Failed,
    Skipped,
    Error,
}

/// Background scheduler service.
#[derive(Clone)]
pub struct SyncScheduler {
    config: SchedulerConfig,
    integrations: IntegrationRepository,
    orchestrator: SyncOrchestrator,
    clock: SharedClock,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<Uuid, JoinHandle<Disposition>>>>,
}

impl SyncScheduler {
    pub fn new(
        config: SchedulerConfig,
        integrations: IntegrationRepository,
        orchestrator: SyncOrchestrator,
        clock: SharedClock,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1) as usize));
        Self {
            config,
            integrations,
            orchestrator,
            clock,
            permits,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run the scheduler loop until the provided shutdown token fires, then
    /// wait for the syncs it dispatched.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting sync scheduler");
        let tick_interval = TokioDuration::from_secs(self.config.tick_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync scheduler shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = ?err, "Scheduler tick failed");
                    }
                    histogram!("sync_scheduler_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        let drained = self.drain().await;
        info!(
            completed = drained.completed,
            failed = drained.failed,
            "Sync scheduler stopped"
        );
    }

    /// Evaluate every integration with a cadence once and dispatch the due
    /// ones. Returns as soon as the syncs are spawned.
    pub async fn tick(&self) -> Result<TickReport, IntegrationError> {
        let now = self.clock.now();
        let candidates = self.integrations.list_with_cadence().await?;
        let mut report = TickReport {
            candidates: candidates.len() as u64,
            ..TickReport::default()
        };

        let due: Vec<Uuid> = {
            let mut rng = rand::thread_rng();
            candidates
                .iter()
                .filter(|integration| {
                    let jitter = integration
                        .sync_interval_seconds
                        .map(|interval| compute_jitter_seconds(&self.config, interval.max(0) as u64, &mut rng))
                        .unwrap_or(0);
                    is_due(integration, now, jitter)
                })
                .map(|integration| integration.id)
                .collect()
        };
        report.due = due.len() as u64;
        gauge!("sync_scheduler_due_gauge").set(due.len() as f64);

        let mut in_flight = self.in_flight.lock().await;
        in_flight.retain(|_, handle| !handle.is_finished());

        for integration_id in due {
            if in_flight.contains_key(&integration_id) {
                debug!(integration_id = %integration_id, "Previous scheduled sync still running");
                report.still_running += 1;
                continue;
            }
            in_flight.insert(integration_id, self.dispatch(integration_id));
            report.dispatched += 1;
        }
        gauge!("sync_scheduler_in_flight_gauge").set(in_flight.len() as f64);
        counter!("sync_scheduler_jobs_scheduled_total").increment(report.dispatched);

        debug!(
            candidates = report.candidates,
            due = report.due,
            dispatched = report.dispatched,
            still_running = report.still_running,
            "Scheduler tick completed"
        );
        Ok(report)
    }

    /// Wait for every dispatched sync and tally how they ended.
    pub async fn drain(&self) -> DrainReport {
        let handles: Vec<(Uuid, JoinHandle<Disposition>)> =
            self.in_flight.lock().await.drain().collect();

        let mut report = DrainReport::default();
        for (integration_id, handle) in handles {
            match handle.await {
                Ok(Disposition::Completed) => report.completed += 1,
                Ok(Disposition::Failed) => report.failed += 1,
                Ok(Disposition::Skipped) => report.skipped += 1,
                Ok(Disposition::Error) => report.errors += 1,
                Err(join_error) => {
                    error!(
                        integration_id = %integration_id,
                        error = ?join_error,
                        "Scheduled sync task panicked or was cancelled"
                    );
                    report.errors += 1;
                }
            }
        }
        gauge!("sync_scheduler_in_flight_gauge").set(0.0);
        report
    }

    fn dispatch(&self, integration_id: Uuid) -> JoinHandle<Disposition> {
        let permits = self.permits.clone();
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(integration_id = %integration_id, "Scheduler semaphore closed");
                return Disposition::Error;
            };
            match orchestrator
                .run_sync(integration_id, SyncType::Scheduled)
                .await
            {
                Ok(outcome) if outcome.is_success() => Disposition::Completed,
                Ok(_) => Disposition::Failed,
                Err(err) if err.is_control_flow() => {
                    debug!(integration_id = %integration_id, error = %err, "Scheduled sync skipped");
                    Disposition::Skipped
                }
                Err(err) => {
                    warn!(integration_id = %integration_id, error = %err, "Scheduled sync did not run");
                    Disposition::Error
                }
            }
        })
    }
}

/// Whether `integration` should sync at `now`, given a jitter in seconds.
pub fn is_due(integration: &IntegrationModel, now: DateTime<Utc>, jitter_seconds: u64) -> bool {
    let Some(interval) = integration.sync_interval_seconds.filter(|s| *s > 0) else {
        return false;
    };
    let reference = integration
        .last_sync_at_utc()
        .unwrap_or_else(|| integration.created_at_utc());
    let jitter = Duration::seconds(i64::try_from(jitter_seconds).unwrap_or(0));
    reference + Duration::seconds(interval) + jitter <= now
}

fn compute_jitter_seconds<R: Rng + ?Sized>(
    config: &SchedulerConfig,
    base_interval_seconds: u64,
    rng: &mut R,
) -> u64 {
    let min = config.jitter_pct_min.max(0.0);
    let max = config.jitter_pct_max.max(min);

    if min == 0.0 && max == 0.0 {
        return 0;
    }

    let jitter_pct = if (max - min).abs() < f64::EPSILON {
        min
    } else {
        rng.gen_range(min..=max)
    };

    (base_interval_seconds as f64 * jitter_pct).round() as u64
}
