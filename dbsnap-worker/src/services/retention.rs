use crate::db::connection::with_conn;
use crate::models::{snapshot, source};
use crate::state::AppState;

/// Deletes the oldest completed snapshots of a source beyond its `max_snapshots`.
///
/// Storage is cleared before the metadata row, so a failed delete is retried
/// on the next run. Returns how many snapshots were removed.
pub async fn enforce(state: &AppState, source_id: &str) -> anyhow::Result<usize> {
    let sid = source_id.to_string();
    let (limit, completed) = with_conn(&state.db, move |conn| {
        let source = source::find_by_id(conn, &sid)?.ok_or_else(|| anyhow::anyhow!("Source not found: {}", sid))?;
        Ok((source.max_snapshots, snapshot::find_completed(conn, &sid)?))
    })
    .await?;

    if limit <= 0 {
        return Ok(0);
    }

    let mut removed = 0;
    for old in completed.into_iter().skip(limit as usize) {
        if let Some(key) = &old.storage_key {
            if let Err(e) = state.storage.delete(key).await {
                tracing::warn!(snapshot_id = %old.id, key = %key, error = %e, "Failed to delete expired snapshot");
                continue;
            }
        }
        let id = old.id.clone();
        with_conn(&state.db, move |conn| snapshot::delete(conn, &id)).await?;
        tracing::info!(source_id = %source_id, snapshot_id = %old.id, "Expired snapshot removed");
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use dbsnap_core::storage::{MemoryStorage, StorageAdapter};
    use dbsnap_core::transfer::bytes_stream;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_keeps_newest_snapshots() {
        let storage = Arc::new(MemoryStorage::new());
        let state = test_state(storage.clone());

        let ids = with_conn(&state.db, |conn| {
            conn.execute(
                "INSERT INTO sources (id, project_id, name, engine, database_name, max_snapshots) VALUES ('src', 'p', 'n', 'sqlite', 'x.db', 2)",
                [],
            )?;
            let mut ids = Vec::new();
            for n in 0..4 {
                let snap = snapshot::create(conn, "src", "none")?;
                snapshot::mark_completed(conn, &snap.id, &format!("snapshots/p/{}.jsonl", n), 10, "c")?;
                ids.push(snap.id);
            }
            Ok(ids)
        })
        .await
        .unwrap();
        for n in 0..4 {
            storage
                .upload(&format!("snapshots/p/{}.jsonl", n), bytes_stream("{}"))
                .await
                .unwrap();
        }

        assert_eq!(enforce(&state, "src").await.unwrap(), 2);

        let remaining = with_conn(&state.db, |conn| snapshot::find_completed(conn, "src")).await.unwrap();
        let remaining: Vec<_> = remaining.into_iter().map(|s| s.id).collect();
        assert_eq!(remaining, vec![ids[3].clone(), ids[2].clone()]);
        assert!(!storage.exists("snapshots/p/0.jsonl").await.unwrap());
        assert!(storage.exists("snapshots/p/3.jsonl").await.unwrap());
    }
}
