use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::models::Request;

/// Point-in-time copy of every request in the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub taken_at: DateTime<Utc>,
    pub requests: Vec<Request>,
}

/// Write the snapshot as pretty JSON, replacing any previous file through a
/// sibling temp file.
pub async fn persist_snapshot(path: &Path, snapshot: &LedgerSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let payload = serde_json::to_string_pretty(snapshot).context("failed to encode snapshot")?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, payload)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;

    Ok(())
}

/// Read a snapshot, returning `None` when no file exists yet.
pub async fn load_snapshot(path: &Path) -> Result<Option<LedgerSnapshot>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };

    let snapshot = serde_json::from_str(&content)
        .with_context(|| format!("failed to decode {}", path.display()))?;
    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataSource, RequestId, RequestPayload, RequestState};
    use chrono::{Duration, TimeZone};

    fn request() -> Request {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Request {
            id: RequestId::new(),
            payload: RequestPayload::new(DataSource::HttpJson {
                url: "https://example.com/price".to_string(),
            })
            .with_path("/price"),
            requester: "contract".to_string(),
            callback: "on_price".to_string(),
            fee_reserved: 100,
            state: RequestState::Collecting,
            deadline: now + Duration::seconds(30),
            created_at: now,
            updated_at: now,
            failure_reason: None,
        }
    }

    #[tokio::test]
    async fn test_persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.json");
        let snapshot = LedgerSnapshot {
            taken_at: Utc::now(),
            requests: vec![request()],
        };

        persist_snapshot(&path, &snapshot).await.unwrap();
        let loaded = load_snapshot(&path).await.unwrap().unwrap();

        assert_eq!(loaded.requests, snapshot.requests);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_load_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_snapshot(&dir.path().join("absent.json")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_load_corrupt_snapshot_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert!(load_snapshot(&path).await.is_err());
    }
}
