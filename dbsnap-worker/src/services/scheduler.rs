use crate::db::connection::with_conn;
use crate::models::{schedule, snapshot};
use crate::services::processors::request_snapshot;
use crate::state::AppState;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Queues snapshots on each source's cron schedule.
pub struct SnapshotScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

/// One cron tick. Flags are re-read here, so disabling a source or schedule
/// takes effect without restarting the worker. Returns the queued snapshot id.
async fn fire_schedule(state: &AppState, schedule_id: &str, source_id: &str) -> anyhow::Result<Option<String>> {
    let (id, sid) = (schedule_id.to_string(), source_id.to_string());
    let (active, busy) = with_conn(&state.db, move |conn| {
        Ok((schedule::is_active(conn, &id)?, snapshot::has_in_flight(conn, &sid)?))
    })
    .await?;

    if !active {
        tracing::debug!(schedule_id = %schedule_id, "Skipping scheduled snapshot: schedule or source disabled");
        return Ok(None);
    }
    if busy {
        tracing::warn!(source_id = %source_id, "Skipping scheduled snapshot: previous one still in flight");
        return Ok(None);
    }

    let id = schedule_id.to_string();
    if let Err(e) = with_conn(&state.db, move |conn| schedule::touch_last_run(conn, &id)).await {
        tracing::warn!(schedule_id = %schedule_id, error = %e, "Failed to record schedule run");
    }

    request_snapshot(state, source_id).await.map(Some)
}

impl SnapshotScheduler {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    pub async fn schedule(&self, entry: &schedule::Schedule) -> anyhow::Result<()> {
        let state = self.state.clone();
        let schedule_id = entry.id.clone();
        let source_id = entry.source_id.clone();

        let job = Job::new_async(entry.cron_expression.as_str(), move |_uuid, _lock| {
            let state = state.clone();
            let schedule_id = schedule_id.clone();
            let source_id = source_id.clone();
            Box::pin(async move {
                match fire_schedule(&state, &schedule_id, &source_id).await {
                    Ok(Some(snapshot_id)) => {
                        tracing::info!(source_id = %source_id, snapshot_id = %snapshot_id, "Scheduled snapshot queued");
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(source_id = %source_id, error = %e, "Scheduled snapshot failed to queue");
                    }
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(source_id = %entry.source_id, cron = %entry.cron_expression, "Snapshot scheduled");
        Ok(())
    }

    pub async fn init_schedules(&self) -> anyhow::Result<usize> {
        let entries = with_conn(&self.state.db, schedule::find_all_enabled).await?;

        let mut count = 0;
        for entry in entries {
            if let Err(e) = self.schedule(&entry).await {
                tracing::error!(
                    schedule_id = %entry.id,
                    cron = %entry.cron_expression,
                    error = %e,
                    "Failed to schedule snapshot"
                );
            } else {
                count += 1;
            }
        }

        tracing::info!(count, "Cron schedules initialized");
        Ok(count)
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::source;
    use crate::state::test_state;
    use dbsnap_core::storage::MemoryStorage;

    #[tokio::test]
    async fn test_invalid_cron_is_skipped() {
        let state = test_state(Arc::new(MemoryStorage::new()));
        with_conn(&state.db, |conn| {
            conn.execute(
                "INSERT INTO sources (id, project_id, name, engine, database_name) VALUES ('src', 'p', 'n', 'sqlite', 'x.db')",
                [],
            )?;
            schedule::create(conn, "src", "0 0 3 * * *")?;
            schedule::create(conn, "src", "not a cron line")?;
            Ok(())
        })
        .await
        .unwrap();

        let scheduler = SnapshotScheduler::new(state).await.unwrap();
        assert_eq!(scheduler.init_schedules().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_disabled_source_is_skipped_at_fire_time() {
        let state = test_state(Arc::new(MemoryStorage::new()));
        let entry = with_conn(&state.db, |conn| {
            conn.execute(
                "INSERT INTO sources (id, project_id, name, engine, database_name) VALUES ('src', 'p', 'n', 'sqlite', 'x.db')",
                [],
            )?;
            schedule::create(conn, "src", "0 0 3 * * *")
        })
        .await
        .unwrap();

        // Disabled after the cron job was registered.
        with_conn(&state.db, |conn| source::set_enabled(conn, "src", false)).await.unwrap();
        assert!(fire_schedule(&state, &entry.id, "src").await.unwrap().is_none());
        let snapshots = with_conn(&state.db, |conn| snapshot::find_by_source_id(conn, "src")).await.unwrap();
        assert!(snapshots.is_empty());

        with_conn(&state.db, |conn| source::set_enabled(conn, "src", true)).await.unwrap();
        let queued = fire_schedule(&state, &entry.id, "src").await.unwrap();
        assert!(queued.is_some());

        // The first one is still pending.
        assert!(fire_schedule(&state, &entry.id, "src").await.unwrap().is_none());
    }
}
