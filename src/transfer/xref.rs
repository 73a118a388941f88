//! Run-scoped cross-reference bookkeeping.
//!
//! Two small maps carry foreign keys from the exported id space into the
//! target id space:
//!
//! - [`ExportIndex`] answers "which natural key did exported record N have?"
//!   using only the inbound snapshot.
//! - [`CrossReferenceTable`] answers "which target row did this run resolve
//!   exported record N (or natural key K) to?".
//!
//! [`resolve_through_key`] composes the two for parents referenced by
//! natural identity (groups, personas, characters); [`resolve_direct`] uses the
//! table alone for parents only reachable through this run (sessions,
//! messages).

use crate::transfer::entity::EntityKind;
use crate::transfer::error::RecordError;
use crate::transfer::natural_key::{self, NaturalKey};
use crate::transfer::snapshot::SnapshotData;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The record did not exist and was created by this run.
    Imported,
    /// An existing record with the same natural key was reused.
    Linked,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub target_id: i32,
    pub resolution: Resolution,
    pub key: NaturalKey,
}

/// Exported id → natural key, for entity kinds whose key needs no parents.
#[derive(Debug, Default)]
pub struct ExportIndex {
    keys: HashMap<(EntityKind, i32), NaturalKey>,
}

impl ExportIndex {
    pub fn from_snapshot(data: &SnapshotData) -> Self {
        let mut index = Self::default();

        for group in &data.character_groups {
            index.insert(EntityKind::CharacterGroup, group.id, natural_key::group_key(group));
        }
        for persona in &data.personas {
            index.insert(EntityKind::Persona, persona.id, natural_key::persona_key(persona));
        }
        for character in &data.characters {
            index.insert(
                EntityKind::Character,
                character.id,
                natural_key::character_key(character),
            );
        }

        index
    }

    // First occurrence wins, matching the order in which stages resolve ids.
    fn insert(&mut self, kind: EntityKind, exported_id: i32, key: NaturalKey) {
        self.keys.entry((kind, exported_id)).or_insert(key);
    }

    pub fn natural_key(&self, kind: EntityKind, exported_id: i32) -> Option<&NaturalKey> {
        self.keys.get(&(kind, exported_id))
    }
}

/// Exported id → resolved target record. Write-once per (kind, exported id).
#[derive(Debug, Default)]
pub struct CrossReferenceTable {
    by_exported_id: HashMap<(EntityKind, i32), Resolved>,
    by_key: HashMap<NaturalKey, i32>,
}

impl CrossReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: EntityKind,
        exported_id: i32,
        resolved: Resolved,
    ) -> Result<(), RecordError> {
        match self.by_exported_id.entry((kind, exported_id)) {
            Entry::Occupied(_) => Err(RecordError::AlreadyResolved),
            Entry::Vacant(slot) => {
                self.by_key
                    .entry(resolved.key.clone())
                    .or_insert(resolved.target_id);
                slot.insert(resolved);
                Ok(())
            }
        }
    }

    pub fn get(&self, kind: EntityKind, exported_id: i32) -> Option<&Resolved> {
        self.by_exported_id.get(&(kind, exported_id))
    }

    pub fn target_for_id(&self, kind: EntityKind, exported_id: i32) -> Option<i32> {
        self.get(kind, exported_id).map(|resolved| resolved.target_id)
    }

    pub fn target_for_key(&self, key: &NaturalKey) -> Option<i32> {
        self.by_key.get(key).copied()
    }

    pub fn resolved_count(&self, kind: EntityKind) -> usize {
        self.by_exported_id
            .keys()
            .filter(|(entry_kind, _)| *entry_kind == kind)
            .count()
    }
}

/// Exported id → exported natural key → target id.
pub fn resolve_through_key(
    index: &ExportIndex,
    xref: &CrossReferenceTable,
    kind: EntityKind,
    exported_id: i32,
) -> Result<i32, RecordError> {
    let key = index
        .natural_key(kind, exported_id)
        .ok_or(RecordError::UnknownParent {
            kind,
            id: exported_id,
        })?;

    xref.target_for_key(key).ok_or(RecordError::MissingParent {
        kind,
        id: exported_id,
    })
}

/// Exported id → target id, for parents only this run can resolve.
pub fn resolve_direct(
    xref: &CrossReferenceTable,
    kind: EntityKind,
    exported_id: i32,
) -> Result<i32, RecordError> {
    xref.target_for_id(kind, exported_id)
        .ok_or(RecordError::MissingParent {
            kind,
            id: exported_id,
        })
}
