//! Aggregate events read as JSON lines from stdin into the event store.
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use envconfig::Envconfig;
use eventsum_common::failures::FailureSink;
use eventsum_common::health::{ComponentStatus, HealthRegistry};
use eventsum_common::metrics::{metrics_router, setup_metrics_recorder};
use eventsum_common::model::RawEvent;
use eventsum_common::rules::{builtin, Rules};
use eventsum_common::store::{Datastore, MemoryStore};
use eventsum_worker::aggregator::Aggregator;
use eventsum_worker::batcher::Batcher;
use eventsum_worker::config::Config;
use eventsum_worker::dump::{replay_file, run_dumper};
use eventsum_worker::error::WorkerError;
use eventsum_worker::persister::Persister;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Health deadline for a loop ticking every `period`.
fn deadline(period: std::time::Duration) -> time::Duration {
    time::Duration::try_from(period * 4).unwrap_or(time::Duration::HOUR) + time::Duration::SECOND
}

async fn read_events(batcher: Batcher) -> Result<(), WorkerError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RawEvent>(&line) {
            Ok(event) => batcher.send(event).await?,
            Err(err) => warn!(error = %err, "dropping undecodable event"),
        }
    }

    info!("reached end of input");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().map_err(|e| WorkerError::Config(e.to_string()))?;
    config.validate()?;

    let liveness = HealthRegistry::new("liveness");
    let readiness = HealthRegistry::new("readiness");

    let mut rules = Rules::new();
    builtin::register(&mut rules)?;
    let rules = Arc::new(rules);

    let store: Arc<dyn Datastore> = Arc::new(MemoryStore::with_eventsum_schema());
    store.ping().await?;

    let sink = Arc::new(FailureSink::new(rules.clone()));
    let persister = Persister::new(
        store.clone(),
        rules.clone(),
        sink.clone(),
        config.retry_policy(),
    );
    let aggregator = Aggregator::new(rules.clone(), config.bucketing()?);

    if let Some(path) = &config.replay_failures_from {
        replay_file(&persister, &PathBuf::from(path.as_str())).await?;
    }

    let batcher = Batcher::new(
        config.batch_size,
        config.flush_interval.0,
        aggregator,
        persister,
    );
    let batcher_liveness = liveness.register("batcher", deadline(config.flush_interval.0));
    let dumper_liveness = config
        .failure_log_path
        .as_ref()
        .map(|_| liveness.register("failure_dump", deadline(config.failure_dump_interval.0)));

    // Ready while the store answers pings.
    let store_readiness = readiness.register("store", deadline(config.flush_interval.0));
    let health_store = store.clone();
    let health_interval = config.flush_interval.0;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(health_interval);
        loop {
            ticker.tick().await;
            match health_store.ping().await {
                Ok(()) => store_readiness.report_healthy(),
                Err(err) => {
                    warn!(error = %err, "store ping failed");
                    store_readiness.report_status(ComponentStatus::Unhealthy);
                }
            }
        }
    });

    let recorder = setup_metrics_recorder().map_err(|e| WorkerError::Metrics(e.to_string()))?;
    let router = metrics_router(recorder)
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        )
        .route(
            "/_readiness",
            get(move || std::future::ready(readiness.get_status())),
        );
    let listener = tokio::net::TcpListener::bind(config.bind()).await?;
    info!(bind = %config.bind(), "serving metrics and health checks");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            error!(error = %err, "admin server stopped");
        }
    });

    let batcher_task = batcher.start(Some(batcher_liveness))?;

    let cancel = CancellationToken::new();
    let dumper_task = match (&config.failure_log_path, dumper_liveness) {
        (Some(path), Some(handle)) => {
            let path = PathBuf::from(path.as_str());
            let sink = sink.clone();
            let interval = config.failure_dump_interval.0;
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                run_dumper(sink, &path, interval, cancel, handle).await
            }))
        }
        _ => None,
    };

    tokio::select! {
        result = read_events(batcher.clone()) => {
            if let Err(err) = result {
                error!(error = %err, "stopped reading events");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
    }

    batcher.stop();
    if let Err(err) = batcher_task.await {
        error!(error = %err, "batcher task failed");
    }

    cancel.cancel();
    if let Some(dumper_task) = dumper_task {
        if let Err(err) = dumper_task.await {
            error!(error = %err, "failure dump task failed");
        }
    }

    if !sink.is_empty() {
        warn!(rows = sink.len(), "exiting with failed rows that were not dumped");
    }

    Ok(())
}
