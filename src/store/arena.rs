// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Arena of units addressed by identifier.
//!
//! Each unit lives in its own mutex-guarded slot. The outer map lock is held
//! only long enough to clone the slot handle, so transitions on different
//! units proceed in parallel and transitions on the same unit serialize.
//! Slot guards are never held across an `.await`.
//!
//! Every applied mutation bumps the slot's revision, which lets writers to an
//! external store tell a newer state from an older one.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::types::{AssignmentRecord, UnitId, UnitOfWork, UnitStatus};

/// Live state of one unit.
#[derive(Debug, Clone)]
pub struct UnitSlot {
    pub unit: UnitOfWork,
    /// Present exactly while the unit is held.
    pub assignment: Option<AssignmentRecord>,
    /// Number of mutations applied to this slot.
    pub revision: u64,
}

/// Why a conditional transition did not apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotError {
    /// No slot for this identifier.
    Missing,
    /// The slot was not in any of the expected statuses.
    Mismatch { actual: UnitStatus },
}

/// Per-unit guarded storage.
#[derive(Debug, Default)]
pub struct UnitArena {
    slots: RwLock<HashMap<UnitId, Arc<Mutex<UnitSlot>>>>,
}

impl UnitArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an arena from a batch of units. Later duplicates are ignored.
    pub fn from_units(units: impl IntoIterator<Item = UnitOfWork>) -> Self {
        let arena = Self::new();
        for unit in units {
            arena.insert(unit);
        }
        arena
    }

    /// Insert a unit. Returns `false` if the identifier is already present.
    pub fn insert(&self, unit: UnitOfWork) -> bool {
        let mut slots = self.slots.write();
        if slots.contains_key(&unit.id) {
            return false;
        }
        slots.insert(
            unit.id.clone(),
            Arc::new(Mutex::new(UnitSlot {
                unit,
                assignment: None,
                revision: 0,
            })),
        );
        true
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.slots.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    fn slot(&self, id: &UnitId) -> Option<Arc<Mutex<UnitSlot>>> {
        self.slots.read().get(id).cloned()
    }

    fn handles(&self) -> Vec<Arc<Mutex<UnitSlot>>> {
        self.slots.read().values().cloned().collect()
    }

    /// Copy of one unit.
    pub fn get(&self, id: &UnitId) -> Option<UnitOfWork> {
        self.slot(id).map(|slot| slot.lock().unit.clone())
    }

    /// Copy of one slot, including its assignment record.
    pub fn get_slot(&self, id: &UnitId) -> Option<UnitSlot> {
        self.slot(id).map(|slot| slot.lock().clone())
    }

    /// Copy of every unit, sorted by identifier.
    ///
    /// Each slot is read under its own guard; the result is consistent per
    /// unit, not across units.
    pub fn snapshot(&self) -> Vec<UnitOfWork> {
        let mut units: Vec<UnitOfWork> = self
            .handles()
            .iter()
            .map(|slot| slot.lock().unit.clone())
            .collect();
        units.sort_by(|a, b| a.id.cmp(&b.id));
        units
    }

    /// Units currently in `status`, sorted by identifier.
    pub fn with_status(&self, status: UnitStatus) -> Vec<UnitOfWork> {
        self.snapshot()
            .into_iter()
            .filter(|u| u.status == status)
            .collect()
    }

    /// All live assignment records, sorted by unit.
    pub fn assignments(&self) -> Vec<AssignmentRecord> {
        let mut records: Vec<AssignmentRecord> = self
            .handles()
            .iter()
            .filter_map(|slot| slot.lock().assignment.clone())
            .collect();
        records.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        records
    }

    /// Apply `mutate` only if the unit is in one of `expected`.
    ///
    /// The status check and the mutation happen under one slot guard, so two
    /// callers racing on the same unit cannot both succeed.
    pub fn transition<R>(
        &self,
        id: &UnitId,
        expected: &[UnitStatus],
        mutate: impl FnOnce(&mut UnitSlot) -> R,
    ) -> Result<R, SlotError> {
        let slot = self.slot(id).ok_or(SlotError::Missing)?;
        let mut guard = slot.lock();
        if !expected.contains(&guard.unit.status) {
            return Err(SlotError::Mismatch {
                actual: guard.unit.status,
            });
        }
        guard.revision += 1;
        Ok(mutate(&mut guard))
    }

    /// Apply `mutate` unconditionally.
    pub fn update<R>(&self, id: &UnitId, mutate: impl FnOnce(&mut UnitSlot) -> R) -> Option<R> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock();
        guard.revision += 1;
        Some(mutate(&mut guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentId;
    use std::thread;

    fn ready(id: &str) -> UnitOfWork {
        UnitOfWork::new(id, id.to_uppercase()).with_status(UnitStatus::Ready)
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let arena = UnitArena::new();
        assert!(arena.insert(ready("u1")));
        assert!(!arena.insert(ready("u1")));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_transition_checks_expected_status() {
        let arena = UnitArena::from_units(vec![ready("u1")]);
        let id = UnitId::from("u1");

        let result = arena.transition(&id, &[UnitStatus::Ready], |slot| {
            slot.unit.status = UnitStatus::Assigned;
        });
        assert!(result.is_ok());

        let again = arena.transition(&id, &[UnitStatus::Ready], |_| ());
        assert_eq!(
            again,
            Err(SlotError::Mismatch {
                actual: UnitStatus::Assigned
            })
        );
        assert_eq!(
            arena.transition(&UnitId::from("nope"), &[UnitStatus::Ready], |_| ()),
            Err(SlotError::Missing)
        );
    }

    #[test]
    fn test_revision_counts_applied_mutations() {
        let arena = UnitArena::from_units(vec![ready("u1")]);
        let id = UnitId::from("u1");
        assert_eq!(arena.get_slot(&id).unwrap().revision, 0);

        arena
            .transition(&id, &[UnitStatus::Ready], |slot| slot.unit.status = UnitStatus::Assigned)
            .unwrap();
        assert!(arena.transition(&id, &[UnitStatus::Ready], |_| ()).is_err());
        arena.update(&id, |slot| slot.unit.title = "renamed".to_string());

        let slot = arena.get_slot(&id).unwrap();
        assert_eq!(slot.revision, 2);
        assert_eq!(slot.unit.status, UnitStatus::Assigned);
    }

    #[test]
    fn test_snapshot_sorted_and_filtered() {
        let arena = UnitArena::from_units(vec![
            ready("b"),
            ready("a"),
            UnitOfWork::new("c", "C").with_status(UnitStatus::Done),
        ]);
        let ids: Vec<_> = arena.snapshot().into_iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![UnitId::from("a"), UnitId::from("b"), UnitId::from("c")]);
        assert_eq!(arena.with_status(UnitStatus::Ready).len(), 2);
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let arena = Arc::new(UnitArena::from_units(vec![ready("u1")]));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let arena = Arc::clone(&arena);
                thread::spawn(move || {
                    arena
                        .transition(&UnitId::from("u1"), &[UnitStatus::Ready], |slot| {
                            slot.unit.status = UnitStatus::Assigned;
                            slot.unit.assigned_agent = Some(AgentId::new(format!("a{}", i)));
                        })
                        .is_ok()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
