// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Unit-of-work storage.
//!
//! The coordinator keeps live state in a [`UnitArena`]: one guarded slot per
//! unit, so claims on unrelated units never contend. The external issue store
//! is reached through the narrow [`IssueStore`] capability and only receives
//! write-through updates.

mod arena;
mod jsonl;
mod memory;

pub use arena::{SlotError, UnitArena, UnitSlot};
pub use jsonl::{parse_units, JsonlIssueStore};
pub use memory::MemoryIssueStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{UnitId, UnitOfWork, UnitStatus};

/// Operations the orchestration core needs from the issue/project store.
#[async_trait]
pub trait IssueStore: Send + Sync {
    /// Fetch one unit.
    async fn get(&self, id: &UnitId) -> Result<UnitOfWork, StoreError>;

    /// Set the status of one unit.
    async fn update_status(&self, id: &UnitId, status: UnitStatus) -> Result<(), StoreError>;

    /// All units currently in `status`.
    async fn list_by_status(&self, status: UnitStatus) -> Result<Vec<UnitOfWork>, StoreError>;

    /// Persist the full record (binding, dependency lists).
    ///
    /// Stores that only track status may keep the default.
    async fn save(&self, unit: &UnitOfWork) -> Result<(), StoreError> {
        self.update_status(&unit.id, unit.status).await
    }

    /// Every unit, in status order.
    async fn list_all(&self) -> Result<Vec<UnitOfWork>, StoreError> {
        let mut units = Vec::new();
        for status in UnitStatus::ALL {
            units.extend(self.list_by_status(status).await?);
        }
        Ok(units)
    }
}
