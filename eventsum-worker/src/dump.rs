//! Failure sink snapshots written to and replayed from a JSON-lines file.
//!
//! Every dump appends one line holding a `FailedRows` document.
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time;

use chrono::{DateTime, Utc};

use eventsum_common::failures::{FailedRows, FailureSink};
use eventsum_common::health::HealthHandle;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::WorkerError;
use crate::persister::Persister;

pub async fn append_snapshot(path: &Path, rows: &FailedRows) -> Result<(), WorkerError> {
    let mut line = serde_json::to_vec(rows)?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await?;

    Ok(())
}

pub async fn read_snapshots(path: &Path) -> Result<Vec<FailedRows>, WorkerError> {
    let contents = tokio::fs::read_to_string(path).await?;

    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(WorkerError::from))
        .collect()
}

/// Take everything from the sink and append it to `path`. Rows that could not be written
/// go back into the sink.
pub async fn dump_once(sink: &FailureSink, path: &Path) -> Result<usize, WorkerError> {
    let rows = sink.take();
    if rows.is_empty() {
        return Ok(0);
    }

    let count = rows.len();
    if let Err(err) = append_snapshot(path, &rows).await {
        restore(sink, rows);
        return Err(err);
    }

    info!(rows = count, path = %path.display(), "dumped failed rows");
    Ok(count)
}

fn restore(sink: &FailureSink, rows: FailedRows) {
    rows.bases.into_iter().for_each(|row| sink.record_base(row));
    rows.details.into_iter().for_each(|row| sink.record_detail(row));
    rows.instances
        .into_iter()
        .for_each(|row| sink.record_instance(row));
    rows.periods.into_iter().for_each(|row| sink.record_period(row));
}

/// Dump the sink every `interval` until cancelled, then one last time.
pub async fn run_dumper(
    sink: Arc<FailureSink>,
    path: &Path,
    interval: time::Duration,
    cancel: CancellationToken,
    liveness: HealthHandle,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                liveness.report_healthy();
                if let Err(err) = dump_once(&sink, path).await {
                    error!(path = %path.display(), error = %err, "failed to dump failed rows");
                }
            }
        }
    }

    if let Err(err) = dump_once(&sink, path).await {
        error!(path = %path.display(), error = %err, "failed to dump failed rows on shutdown");
    }
}

/// Where a replayed file is moved once its snapshots were read.
pub fn replayed_path(path: &Path, at: DateTime<Utc>) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".replayed-{}", at.format("%Y%m%dT%H%M%S")));
    PathBuf::from(name)
}

/// Replay every snapshot found in `path` through the persister. Rows failing again end
/// up in the failure sink.
///
/// The file is moved to `replayed_path` before anything is replayed, so a restart with
/// the same path does not apply the same counts twice. A missing file replays nothing.
pub async fn replay_file(persister: &Persister, path: &Path) -> Result<usize, WorkerError> {
    let snapshots = match read_snapshots(path).await {
        Ok(snapshots) => snapshots,
        Err(WorkerError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "no failure dump to replay");
            return Ok(0);
        }
        Err(err) => return Err(err),
    };

    let moved = replayed_path(path, Utc::now());
    tokio::fs::rename(path, &moved).await?;
    info!(from = %path.display(), to = %moved.display(), "moved failure dump aside for replay");

    let mut replayed = 0;

    for rows in snapshots {
        replayed += rows.len();
        let report = persister.replay(rows).await;
        if !report.is_success() {
            warn!(
                failed = report.errors.len(),
                path = %path.display(),
                "some replayed rows failed again"
            );
        }
    }

    info!(rows = replayed, path = %path.display(), "replayed failed rows");
    Ok(replayed)
}
