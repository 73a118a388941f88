//! Import reporting.
//!
//! Tracks imported/skipped counts per entity type plus one flat list of
//! record-level error strings. The finished [`ImportReport`] is the only
//! result of a reconciliation run; per-record failures never turn into a
//! request failure.

use crate::transfer::entity::EntityKind;
use rocket_okapi::okapi::schemars::{self, JsonSchema};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Outcome counts for one entity type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EntityCounts {
    /// Records created by this run.
    pub imported: usize,
    /// Records linked to an existing row or deliberately not written.
    pub skipped: usize,
}

impl EntityCounts {
    /// Merge another set of counts into this one.
    pub fn merge(&mut self, other: EntityCounts) {
        self.imported += other.imported;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EntityResults {
    pub character_groups: EntityCounts,
    pub personas: EntityCounts,
    pub characters: EntityCounts,
    pub user_prompts: EntityCounts,
    pub settings: EntityCounts,
    pub chat_sessions: EntityCounts,
    pub chat_messages: EntityCounts,
    pub message_versions: EntityCounts,
}

impl EntityResults {
    pub fn get(&self, kind: EntityKind) -> EntityCounts {
        match kind {
            EntityKind::CharacterGroup => self.character_groups,
            EntityKind::Persona => self.personas,
            EntityKind::Character => self.characters,
            EntityKind::UserPrompt => self.user_prompts,
            EntityKind::Setting => self.settings,
            EntityKind::ChatSession => self.chat_sessions,
            EntityKind::ChatMessage => self.chat_messages,
            EntityKind::MessageVersion => self.message_versions,
        }
    }

    fn get_mut(&mut self, kind: EntityKind) -> &mut EntityCounts {
        match kind {
            EntityKind::CharacterGroup => &mut self.character_groups,
            EntityKind::Persona => &mut self.personas,
            EntityKind::Character => &mut self.characters,
            EntityKind::UserPrompt => &mut self.user_prompts,
            EntityKind::Setting => &mut self.settings,
            EntityKind::ChatSession => &mut self.chat_sessions,
            EntityKind::ChatMessage => &mut self.chat_messages,
            EntityKind::MessageVersion => &mut self.message_versions,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub total_imported: usize,
    pub total_skipped: usize,
    pub total_errors: usize,
}

/// Result of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    /// Per-entity counts keyed by snapshot collection name.
    pub results: EntityResults,
    /// `"<EntityType> <exportedId-or-key>: <message>"`, in stage order.
    pub errors: Vec<String>,
    pub summary: ImportSummary,
}

impl ImportReport {
    pub fn counts(&self, kind: EntityKind) -> EntityCounts {
        self.results.get(kind)
    }
}

/// Accumulates outcomes while stages run.
#[derive(Debug, Default)]
pub struct ReportAggregator {
    results: EntityResults,
    errors: Vec<String>,
}

impl ReportAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_imported(&mut self, kind: EntityKind) {
        self.results.get_mut(kind).imported += 1;
    }

    pub fn record_skipped(&mut self, kind: EntityKind) {
        self.results.get_mut(kind).skipped += 1;
    }

    pub fn record_error(&mut self, kind: EntityKind, subject: impl Display, message: impl Display) {
        self.errors.push(format!("{kind} {subject}: {message}"));
    }

    pub fn counts(&self, kind: EntityKind) -> EntityCounts {
        self.results.get(kind)
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn finish(self) -> ImportReport {
        let mut totals = EntityCounts::default();
        for kind in EntityKind::STAGE_ORDER {
            totals.merge(self.results.get(kind));
        }

        ImportReport {
            summary: ImportSummary {
                total_imported: totals.imported,
                total_skipped: totals.skipped,
                total_errors: self.errors.len(),
            },
            results: self.results,
            errors: self.errors,
        }
    }
}
