//! The versioned snapshot envelope.
//!
//! ```text
//! {
//!   "formatVersion": "1.0.0",
//!   "exportedAt": "<RFC 3339>",
//!   "data": { "characterGroups": [...], "personas": [...], ... },
//!   "metadata": { "totalRecords": { "characterGroups": 3, ... } }
//! }
//! ```

use crate::models::{
    Character, CharacterGroup, ChatMessage, ChatSession, MessageVersion, Persona, Setting,
    UserPrompt,
};
use crate::transfer::entity::EntityKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version written into every export.
pub const FORMAT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub format_version: String,
    #[serde(default)]
    pub exported_at: Option<DateTime<Utc>>,
    pub data: SnapshotData,
    #[serde(default)]
    pub metadata: SnapshotMetadata,
}

/// Entity arrays. Arrays missing from an inbound document decode as empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotData {
    pub character_groups: Vec<CharacterGroup>,
    pub personas: Vec<Persona>,
    pub characters: Vec<Character>,
    pub chat_sessions: Vec<ChatSession>,
    pub chat_messages: Vec<ChatMessage>,
    pub message_versions: Vec<MessageVersion>,
    pub user_prompts: Vec<UserPrompt>,
    pub settings: Vec<Setting>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotMetadata {
    /// Keyed by collection name (`characterGroups`, `chatMessages`, ...).
    pub total_records: BTreeMap<String, usize>,
}

impl SnapshotData {
    pub fn count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::CharacterGroup => self.character_groups.len(),
            EntityKind::Persona => self.personas.len(),
            EntityKind::Character => self.characters.len(),
            EntityKind::UserPrompt => self.user_prompts.len(),
            EntityKind::Setting => self.settings.len(),
            EntityKind::ChatSession => self.chat_sessions.len(),
            EntityKind::ChatMessage => self.chat_messages.len(),
            EntityKind::MessageVersion => self.message_versions.len(),
        }
    }

    pub fn total_records(&self) -> BTreeMap<String, usize> {
        EntityKind::STAGE_ORDER
            .iter()
            .map(|kind| (kind.collection_name().to_string(), self.count(*kind)))
            .collect()
    }

    pub fn record_total(&self) -> usize {
        EntityKind::STAGE_ORDER
            .iter()
            .map(|kind| self.count(*kind))
            .sum()
    }
}

impl Snapshot {
    /// Wrap `data` in a current-version envelope with computed metadata.
    pub fn new(data: SnapshotData, exported_at: DateTime<Utc>) -> Self {
        let metadata = SnapshotMetadata {
            total_records: data.total_records(),
        };

        Self {
            format_version: FORMAT_VERSION.to_string(),
            exported_at: Some(exported_at),
            data,
            metadata,
        }
    }
}
