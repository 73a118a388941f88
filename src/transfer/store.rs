//! The target-store seam used by export and import.
//!
//! The reconciler only needs per-record find/create by natural key; it never
//! asks for multi-record transactions. Implementations must make `create`
//! atomic per record: a create that collides with an existing natural key
//! reports [`WriteOutcome::Existing`] instead of inserting a duplicate.

use crate::models::StoredDataset;
use crate::transfer::entity::EntityKind;
use crate::transfer::natural_key::{self, NaturalKey};
use crate::transfer::snapshot::Snapshot;
use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared handle managed as Rocket state.
pub type SharedStore = Arc<dyn VaultStore>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result of a create call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A new row was written with this id.
    Inserted(i32),
    /// A row with the same natural key already existed.
    Existing(i32),
}

impl WriteOutcome {
    pub fn id(&self) -> i32 {
        match self {
            WriteOutcome::Inserted(id) | WriteOutcome::Existing(id) => *id,
        }
    }
}

/// Per-entity row counts.
pub type RecordCounts = BTreeMap<EntityKind, i64>;

#[derive(Debug, Clone, PartialEq)]
pub struct NewCharacterGroup {
    pub name: String,
    pub color: String,
    pub sort_order: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPersona {
    pub name: String,
    pub profile_name: Option<String>,
    pub profile: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCharacter {
    pub name: String,
    pub profile_name: Option<String>,
    pub personality: String,
    pub scenario: String,
    pub example_dialogue: String,
    pub first_message: String,
    pub group_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewUserPrompt {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSetting {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewChatSession {
    pub persona_id: i32,
    pub character_id: i32,
    pub created_at: DateTime<Utc>,
    pub summary: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewChatMessage {
    pub session_id: i32,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessageVersion {
    pub message_id: i32,
    pub version: i32,
    pub content: String,
    pub is_active: bool,
}

/// A record ready to be written, with every parent id already target-side.
#[derive(Debug, Clone, PartialEq)]
pub enum NewRecord {
    CharacterGroup(NewCharacterGroup),
    Persona(NewPersona),
    Character(NewCharacter),
    UserPrompt(NewUserPrompt),
    Setting(NewSetting),
    ChatSession(NewChatSession),
    ChatMessage(NewChatMessage),
    MessageVersion(NewMessageVersion),
}

impl NewRecord {
    pub fn kind(&self) -> EntityKind {
        self.natural_key().kind()
    }

    pub fn natural_key(&self) -> NaturalKey {
        match self {
            NewRecord::CharacterGroup(group) => NaturalKey::CharacterGroup {
                name: group.name.clone(),
            },
            NewRecord::Persona(persona) => NaturalKey::Persona {
                name: persona.name.clone(),
                profile_name: persona.profile_name.clone(),
            },
            NewRecord::Character(character) => NaturalKey::Character {
                name: character.name.clone(),
                profile_name: character.profile_name.clone(),
            },
            NewRecord::UserPrompt(prompt) => NaturalKey::UserPrompt {
                title: prompt.title.clone(),
            },
            NewRecord::Setting(setting) => NaturalKey::Setting {
                key: setting.key.clone(),
            },
            NewRecord::ChatSession(session) => natural_key::session_key(
                session.persona_id,
                session.character_id,
                session.created_at,
            ),
            NewRecord::ChatMessage(message) => natural_key::message_key(
                message.session_id,
                &message.role,
                &message.content,
                message.created_at,
            ),
            NewRecord::MessageVersion(version) => {
                natural_key::version_key(version.message_id, version.version, &version.content)
            }
        }
    }
}

/// Persistence operations required by the transfer pipeline.
#[rocket::async_trait]
pub trait VaultStore: Send + Sync {
    /// Cheap connectivity probe run before any reconciliation starts.
    async fn ping(&self) -> StoreResult<()>;

    /// Look up the target id of the record identified by `key`.
    async fn find(&self, key: &NaturalKey) -> StoreResult<Option<i32>>;

    /// Create `record` unless its natural key is already taken.
    async fn create(&self, record: &NewRecord) -> StoreResult<WriteOutcome>;

    /// Read every exportable row; sessions come back nested.
    async fn load_dataset(&self) -> StoreResult<StoredDataset>;

    async fn record_counts(&self) -> StoreResult<RecordCounts>;

    /// Park a decoded snapshot under `token` until `expires_at`.
    async fn save_pending_import(
        &self,
        token: Uuid,
        snapshot: &Snapshot,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Remove and return a parked snapshot. Expired entries are never returned.
    async fn take_pending_import(&self, token: Uuid) -> StoreResult<Option<Snapshot>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn new_record_key_matches_resolver() {
        let created_at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let record = NewRecord::ChatMessage(NewChatMessage {
            session_id: 11,
            role: "assistant".into(),
            content: "Hello there".into(),
            created_at,
        });

        assert_eq!(record.kind(), EntityKind::ChatMessage);
        assert_eq!(
            record.natural_key(),
            natural_key::message_key(11, "assistant", "Hello there", created_at)
        );
    }

    #[test]
    fn write_outcome_exposes_id() {
        assert_eq!(WriteOutcome::Inserted(4).id(), 4);
        assert_eq!(WriteOutcome::Existing(9).id(), 9);
    }
}
