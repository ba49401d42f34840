// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory issue store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::IssueStore;
use crate::error::StoreError;
use crate::types::{UnitId, UnitOfWork, UnitStatus};

/// Issue store backed by a map; used by tests and the `plan` command.
#[derive(Debug, Default)]
pub struct MemoryIssueStore {
    units: RwLock<HashMap<UnitId, UnitOfWork>>,
}

impl MemoryIssueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_units(units: impl IntoIterator<Item = UnitOfWork>) -> Self {
        let map = units.into_iter().map(|u| (u.id.clone(), u)).collect();
        Self {
            units: RwLock::new(map),
        }
    }

    pub fn insert(&self, unit: UnitOfWork) {
        self.units.write().insert(unit.id.clone(), unit);
    }

    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.read().is_empty()
    }
}

#[async_trait]
impl IssueStore for MemoryIssueStore {
    async fn get(&self, id: &UnitId) -> Result<UnitOfWork, StoreError> {
        self.units
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn update_status(&self, id: &UnitId, status: UnitStatus) -> Result<(), StoreError> {
        let mut units = self.units.write();
        let unit = units
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        unit.status = status;
        Ok(())
    }

    async fn list_by_status(&self, status: UnitStatus) -> Result<Vec<UnitOfWork>, StoreError> {
        let mut units: Vec<UnitOfWork> = self
            .units
            .read()
            .values()
            .filter(|u| u.status == status)
            .cloned()
            .collect();
        units.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(units)
    }

    async fn save(&self, unit: &UnitOfWork) -> Result<(), StoreError> {
        self.units.write().insert(unit.id.clone(), unit.clone());
        Ok(())
    }
}
