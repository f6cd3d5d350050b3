//! Telemetry utilities: global subscriber management and metric descriptions.
//!
//! The crate emits metrics through the `metrics` facade only. Installing an
//! exporter is left to the embedding process.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use thiserror::Error;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

use crate::config::AppConfig;

/// Errors that can occur while initializing global telemetry.
#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize global tracing/logging exactly once, wiring `log::` macros into the tracing pipeline.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    // Install log bridge first so `log::` macros from the db layer route through tracing.
    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        let logger_type = type_name_of_val(log::logger());
        if !logger_type.contains("LogTracer") {
            eprintln!(
                "Warning: Failed to install log tracer bridge: {}. `log::` macros will not emit structured tracing events.",
                err
            );
        }
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer().json().boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!(
            "Warning: Failed to set global tracing subscriber: {}. Default subscriber remains in effect.",
            err
        );
    }

    describe_metrics();

    Ok(())
}

/// Register descriptions for every metric the crate emits.
pub fn describe_metrics() {
    describe_counter!(
        "sync_runs_total",
        "Completed sync runs labelled by provider and terminal status"
    );
    describe_histogram!(
        "sync_duration_ms",
        Unit::Milliseconds,
        "Wall-clock duration of a sync including retries"
    );
    describe_counter!(
        "sync_retry_attempts_total",
        "Provider calls repeated by the retry executor"
    );
    describe_counter!(
        "circuit_breaker_transitions_total",
        "Circuit breaker state changes labelled by target state"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "Syncs rejected because the breaker was open"
    );
    describe_counter!(
        "oauth_exchange_total",
        "Authorization code exchanges labelled by provider and outcome"
    );
    describe_counter!("token_refresh_attempts_total", "Token refresh attempts");
    describe_counter!("token_refresh_success_total", "Successful token refreshes");
    describe_counter!("token_refresh_failure_total", "Failed token refreshes");
    describe_counter!(
        "token_refresh_rejected_total",
        "Refreshes rejected by the provider, marking the integration for re-authorization"
    );
    describe_counter!(
        "token_refresh_integrations_marked_error_total",
        "Integrations moved to error status by the background refresh"
    );
    describe_gauge!(
        "token_refresh_integrations_polled_gauge",
        "Integrations with tokens inside the refresh lead time at the last tick"
    );
    describe_counter!(
        "oauth_sessions_expired_total",
        "Abandoned OAuth sessions purged after their TTL"
    );
    describe_histogram!(
        "token_refresh_tick_duration_ms",
        Unit::Milliseconds,
        "Duration of one background refresh tick"
    );
    describe_counter!(
        "sync_scheduler_jobs_scheduled_total",
        "Scheduled syncs started by the scheduler"
    );
    describe_gauge!(
        "sync_scheduler_due_gauge",
        "Integrations due for a scheduled sync at the last tick"
    );
    describe_gauge!(
        "sync_scheduler_in_flight_gauge",
        "Scheduled syncs dispatched and not yet finished"
    );
    describe_histogram!(
        "sync_scheduler_tick_duration_ms",
        Unit::Milliseconds,
        "Duration of one scheduler tick"
    );
}
