//! Queue handlers that tie the core processors to the metadata store.

use crate::db::connection::with_conn;
use crate::models::{diff as diff_model, snapshot, source};
use crate::services::retention;
use crate::state::AppState;
use dbsnap_core::jobs::{
    enqueue_job, process_diff, process_restore, process_snapshot, DiffJob, JobOptions, RestoreJob, SnapshotJob,
    DIFF_QUEUE, RESTORE_QUEUE, SNAPSHOT_QUEUE,
};
use dbsnap_core::notify::check_growth;
use dbsnap_core::transfer::progress::format_bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A diff job plus the metadata row tracking it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRequest {
    pub diff_id: String,
    #[serde(flatten)]
    pub job: DiffJob,
}

pub fn register_all(state: &Arc<AppState>) {
    let s = state.clone();
    state
        .queue
        .register(SNAPSHOT_QUEUE, move |payload| handle_snapshot(s.clone(), payload));
    let s = state.clone();
    state
        .queue
        .register(DIFF_QUEUE, move |payload| handle_diff(s.clone(), payload));
    let s = state.clone();
    state
        .queue
        .register(RESTORE_QUEUE, move |payload| handle_restore(s.clone(), payload));
}

/// Records a pending snapshot of `source_id` and queues it. Returns the snapshot id.
pub async fn request_snapshot(state: &AppState, source_id: &str) -> anyhow::Result<String> {
    let sid = source_id.to_string();
    let compression = state.config.compression;
    let (source, snap) = with_conn(&state.db, move |conn| {
        let source = source::find_by_id(conn, &sid)?.ok_or_else(|| anyhow::anyhow!("Source not found: {}", sid))?;
        let snap = snapshot::create(conn, &source.id, compression.as_str())?;
        Ok((source, snap))
    })
    .await?;

    let job = SnapshotJob {
        snapshot_id: snap.id.clone(),
        project_id: source.project_id.clone(),
        engine: source.engine()?,
        connection: source.connection_options(),
        compression,
    };
    let job_id = enqueue_job(state.queue.as_ref(), SNAPSHOT_QUEUE, &job, JobOptions::default()).await?;
    tracing::info!(source_id = %source.id, snapshot_id = %snap.id, job_id = %job_id, "Snapshot queued");
    Ok(snap.id)
}

/// Records a pending diff and queues it. Returns the diff id.
pub async fn request_diff(state: &AppState, job: DiffJob) -> anyhow::Result<String> {
    let (key_a, key_b, engine) = (job.key_a.clone(), job.key_b.clone(), job.engine);
    let record = with_conn(&state.db, move |conn| {
        diff_model::create(conn, &key_a, key_b.as_deref(), engine.as_str())
    })
    .await?;

    let request = DiffRequest {
        diff_id: record.id.clone(),
        job,
    };
    enqueue_job(state.queue.as_ref(), DIFF_QUEUE, &request, JobOptions::default()).await?;
    tracing::info!(diff_id = %record.id, "Diff queued");
    Ok(record.id)
}

pub async fn request_restore(state: &AppState, job: RestoreJob) -> anyhow::Result<String> {
    // Replaying into a live database is not idempotent in append mode.
    let options = JobOptions {
        attempts: 1,
        ..JobOptions::default()
    };
    let job_id = enqueue_job(state.queue.as_ref(), RESTORE_QUEUE, &job, options).await?;
    tracing::info!(job_id = %job_id, key = %job.key, "Restore queued");
    Ok(job_id)
}

async fn handle_snapshot(state: Arc<AppState>, payload: Value) -> anyhow::Result<()> {
    let job: SnapshotJob = serde_json::from_value(payload)?;
    let id = job.snapshot_id.clone();
    with_conn(&state.db, move |conn| snapshot::mark_running(conn, &id)).await?;

    let artifact = match process_snapshot(state.storage.as_ref(), &job).await {
        Ok(artifact) => artifact,
        Err(e) => {
            tracing::error!(snapshot_id = %job.snapshot_id, error = %e, "Snapshot failed");
            let (id, message) = (job.snapshot_id.clone(), e.to_string());
            with_conn(&state.db, move |conn| snapshot::mark_failed(conn, &id, &message)).await?;
            return Err(e.into());
        }
    };

    let (id, key, size, checksum) = (
        job.snapshot_id.clone(),
        artifact.key.clone(),
        artifact.size as i64,
        artifact.checksum.clone(),
    );
    let (source_id, previous) = with_conn(&state.db, move |conn| {
        snapshot::mark_completed(conn, &id, &key, size, &checksum)?;
        let current = snapshot::find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Snapshot vanished: {}", id))?;
        let previous = snapshot::find_previous_completed(conn, &current.source_id, &id)?;
        Ok((current.source_id, previous))
    })
    .await?;

    if let Some(previous) = previous {
        if let Some(alert) = check_growth(
            previous.size_bytes.max(0) as u64,
            artifact.size,
            state.config.growth_alert_percent,
        ) {
            tracing::warn!(
                source_id = %source_id,
                snapshot_id = %job.snapshot_id,
                previous = %format_bytes(alert.previous_bytes),
                current = %format_bytes(alert.current_bytes),
                growth_percent = alert.growth_percent,
                "Snapshot size grew beyond alert threshold"
            );
        }
    }

    if let Err(e) = retention::enforce(&state, &source_id).await {
        tracing::warn!(source_id = %source_id, error = %e, "Retention pass failed");
    }
    Ok(())
}

async fn handle_diff(state: Arc<AppState>, payload: Value) -> anyhow::Result<()> {
    let request: DiffRequest = serde_json::from_value(payload)?;
    let id = request.diff_id.clone();
    with_conn(&state.db, move |conn| diff_model::mark_running(conn, &id)).await?;

    match process_diff(state.storage.as_ref(), &request.job).await {
        Ok(outcome) => {
            tracing::info!(
                diff_id = %request.diff_id,
                result_key = %outcome.result_key,
                added = outcome.summary.total_added,
                removed = outcome.summary.total_removed,
                modified = outcome.summary.total_modified,
                "Diff completed"
            );
            let id = request.diff_id.clone();
            with_conn(&state.db, move |conn| {
                diff_model::mark_completed(conn, &id, &outcome.result_key, &outcome.summary)
            })
            .await
        }
        Err(e) => {
            tracing::error!(diff_id = %request.diff_id, error = %e, "Diff failed");
            let (id, message) = (request.diff_id.clone(), e.to_string());
            with_conn(&state.db, move |conn| diff_model::mark_failed(conn, &id, &message)).await?;
            Err(e.into())
        }
    }
}

async fn handle_restore(state: Arc<AppState>, payload: Value) -> anyhow::Result<()> {
    let job: RestoreJob = serde_json::from_value(payload)?;
    let report = process_restore(state.storage.clone(), &job).await?;
    tracing::info!(
        key = %job.key,
        target = %job.target_engine,
        records = report.total_records,
        structures = report.structure_counts.len(),
        skipped_lines = report.skipped_lines,
        "Restore completed"
    );
    Ok(())
}
