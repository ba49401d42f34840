// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Issue store backed by a JSON Lines file, one unit per line.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::IssueStore;
use crate::error::StoreError;
use crate::types::{UnitId, UnitOfWork, UnitStatus};

/// File-backed store. Every write rewrites the file through a temporary
/// sibling and a rename, so readers never see a partial file.
#[derive(Debug)]
pub struct JsonlIssueStore {
    path: PathBuf,
    units: Mutex<Vec<UnitOfWork>>,
}

impl JsonlIssueStore {
    /// Open a store; a missing file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let units = match tokio::fs::read_to_string(&path).await {
            Ok(content) => parse_units(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), count = units.len(), "Opened issue store");
        Ok(Self {
            path,
            units: Mutex::new(units),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, units: &[UnitOfWork]) -> Result<(), StoreError> {
        let mut content = String::new();
        for unit in units {
            content.push_str(&serde_json::to_string(unit)?);
            content.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Parse JSON Lines content, skipping blank lines.
pub fn parse_units(content: &str) -> Result<Vec<UnitOfWork>, StoreError> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .map_err(|e| StoreError::Parse(format!("line {}: {}", n + 1, e)))
        })
        .collect()
}

#[async_trait]
impl IssueStore for JsonlIssueStore {
    async fn get(&self, id: &UnitId) -> Result<UnitOfWork, StoreError> {
        self.units
            .lock()
            .await
            .iter()
            .find(|u| &u.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn update_status(&self, id: &UnitId, status: UnitStatus) -> Result<(), StoreError> {
        let mut units = self.units.lock().await;
        let unit = units
            .iter_mut()
            .find(|u| &u.id == id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        unit.status = status;
        self.persist(&units).await
    }

    async fn list_by_status(&self, status: UnitStatus) -> Result<Vec<UnitOfWork>, StoreError> {
        Ok(self
            .units
            .lock()
            .await
            .iter()
            .filter(|u| u.status == status)
            .cloned()
            .collect())
    }

    async fn save(&self, unit: &UnitOfWork) -> Result<(), StoreError> {
        let mut units = self.units.lock().await;
        match units.iter_mut().find(|u| u.id == unit.id) {
            Some(existing) => *existing = unit.clone(),
            None => units.push(unit.clone()),
        }
        self.persist(&units).await
    }

    async fn list_all(&self) -> Result<Vec<UnitOfWork>, StoreError> {
        Ok(self.units.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const UNITS: &str = r#"{"id":"u1","key":"PROJ-1","created_at":"2026-01-01T00:00:00Z"}

{"id":"u2","key":"PROJ-2","status":"ready","priority":"high","created_at":"2026-01-02T00:00:00Z","blocked_by":["u1"]}
"#;

    #[tokio::test]
    async fn test_open_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = JsonlIssueStore::open(temp.path().join("units.jsonl")).await.unwrap();
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_parse_and_persist() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("units.jsonl");
        std::fs::write(&path, UNITS).unwrap();

        let store = JsonlIssueStore::open(&path).await.unwrap();
        let u2 = store.get(&UnitId::from("u2")).await.unwrap();
        assert_eq!(u2.status, UnitStatus::Ready);
        assert_eq!(u2.blocked_by, vec![UnitId::from("u1")]);

        store.update_status(&UnitId::from("u1"), UnitStatus::Done).await.unwrap();

        let reopened = JsonlIssueStore::open(&path).await.unwrap();
        let done = reopened.list_by_status(UnitStatus::Done).await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].key, "PROJ-1");
        assert_eq!(reopened.list_all().await.unwrap().len(), 2);
    }

    #[test]
    fn test_parse_error_reports_line() {
        let err = parse_units("{\"id\":\"u1\"}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}
