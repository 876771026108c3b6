//! Series emitted by the pipeline and their Prometheus exposition.
//!
//! Call sites record through the `metrics` macros using the names below. `describe` attaches
//! help text and units; the recorder gives the histograms buckets sized for what they
//! measure: events per batch, and seconds per flush.
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{
    BuildError, Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder,
};

pub const EVENTS_RECEIVED: &str = "eventsum_events_received_total";
/// Labelled with the `stage` that rejected the event.
pub const EVENTS_SKIPPED: &str = "eventsum_events_skipped_total";
pub const QUEUE_DEPTH: &str = "eventsum_queue_depth";
/// Labelled with the flush `trigger`.
pub const FLUSHES: &str = "eventsum_flushes_total";
pub const BATCH_SIZE: &str = "eventsum_batch_size";
pub const FLUSH_DURATION: &str = "eventsum_flush_duration_seconds";
/// Labelled with the row `kind`.
pub const ROWS_PERSISTED: &str = "eventsum_rows_persisted_total";
/// Labelled with the row `kind`.
pub const ROWS_FAILED: &str = "eventsum_rows_failed_total";
pub const CAS_CONFLICTS: &str = "eventsum_period_cas_conflicts_total";
pub const CAS_ATTEMPTS: &str = "eventsum_period_cas_attempts";
pub const FAILURE_SINK_ROWS: &str = "eventsum_failure_sink_rows";

const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];
const CAS_ATTEMPT_BUCKETS: &[f64] = &[1.0, 2.0, 3.0, 5.0, 8.0, 16.0, 32.0, 64.0];
const FLUSH_SECONDS_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Register help text and units for every series with the installed recorder.
pub fn describe() {
    describe_counter!(EVENTS_RECEIVED, Unit::Count, "Events accepted by the intake queue");
    describe_counter!(
        EVENTS_SKIPPED,
        Unit::Count,
        "Events dropped or left uncounted by a failing processing stage"
    );
    describe_gauge!(QUEUE_DEPTH, Unit::Count, "Events waiting in the intake queue");
    describe_counter!(FLUSHES, Unit::Count, "Batches drained from the intake queue");
    describe_histogram!(BATCH_SIZE, Unit::Count, "Events drained per flush");
    describe_histogram!(
        FLUSH_DURATION,
        Unit::Seconds,
        "Time spent persisting one aggregated batch"
    );
    describe_counter!(ROWS_PERSISTED, Unit::Count, "Rows written or merged in the store");
    describe_counter!(ROWS_FAILED, Unit::Count, "Rows handed to the failure sink");
    describe_counter!(
        CAS_CONFLICTS,
        Unit::Count,
        "Period merges that lost to a concurrent writer"
    );
    describe_histogram!(
        CAS_ATTEMPTS,
        Unit::Count,
        "Read-merge-write attempts needed by a successful Period merge"
    );
    describe_gauge!(FAILURE_SINK_ROWS, Unit::Count, "Rows held by the failure sink");
}

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(BATCH_SIZE.to_owned()), BATCH_SIZE_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full(CAS_ATTEMPTS.to_owned()), CAS_ATTEMPT_BUCKETS)?
        .set_buckets_for_metric(
            Matcher::Full(FLUSH_DURATION.to_owned()),
            FLUSH_SECONDS_BUCKETS,
        )
}

/// Build a recorder without installing it globally.
pub fn build_recorder() -> Result<PrometheusRecorder, BuildError> {
    Ok(builder()?.build_recorder())
}

/// Install the global recorder and describe the pipeline's series.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = builder()?.install_recorder()?;
    describe();
    Ok(handle)
}

/// A router rendering the recorder behind `handle` on `/metrics`.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route("/metrics", get(move || std::future::ready(handle.render())))
}
