//! Natural keys: content-derived identities used to recognise a record that
//! already exists in the target store.
//!
//! Exported numeric ids are meaningless in the target id space, so every
//! "does this exist?" question is asked with a [`NaturalKey`] instead. Keys of
//! dependent entities embed their parents' *target-side* ids, which is why
//! those constructors take already-resolved ids rather than exported records.
//!
//! Everything here is pure; no function performs I/O.

use crate::models::{Character, CharacterGroup, Persona, Setting, UserPrompt};
use crate::transfer::entity::EntityKind;
use chrono::{DateTime, SubsecRound, Utc};
use std::fmt;

/// Sub-second digits kept by the store (`timestamptz` is microsecond precise).
pub const STORED_SUBSEC_DIGITS: u16 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NaturalKey {
    CharacterGroup {
        name: String,
    },
    Persona {
        name: String,
        profile_name: Option<String>,
    },
    Character {
        name: String,
        profile_name: Option<String>,
    },
    UserPrompt {
        title: String,
    },
    Setting {
        key: String,
    },
    ChatSession {
        persona_id: i32,
        character_id: i32,
        created_at: DateTime<Utc>,
    },
    ChatMessage {
        session_id: i32,
        role: String,
        content: String,
        created_at: DateTime<Utc>,
    },
    MessageVersion {
        message_id: i32,
        version: i32,
        content: String,
    },
}

impl NaturalKey {
    pub fn kind(&self) -> EntityKind {
        match self {
            NaturalKey::CharacterGroup { .. } => EntityKind::CharacterGroup,
            NaturalKey::Persona { .. } => EntityKind::Persona,
            NaturalKey::Character { .. } => EntityKind::Character,
            NaturalKey::UserPrompt { .. } => EntityKind::UserPrompt,
            NaturalKey::Setting { .. } => EntityKind::Setting,
            NaturalKey::ChatSession { .. } => EntityKind::ChatSession,
            NaturalKey::ChatMessage { .. } => EntityKind::ChatMessage,
            NaturalKey::MessageVersion { .. } => EntityKind::MessageVersion,
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NaturalKey::CharacterGroup { name } => write!(f, "group '{name}'"),
            NaturalKey::Persona { name, profile_name }
            | NaturalKey::Character { name, profile_name } => match profile_name {
                Some(profile) => write!(f, "{} '{name}' ({profile})", self.kind().label()),
                None => write!(f, "{} '{name}'", self.kind().label()),
            },
            NaturalKey::UserPrompt { title } => write!(f, "prompt '{title}'"),
            NaturalKey::Setting { key } => write!(f, "setting '{key}'"),
            NaturalKey::ChatSession {
                persona_id,
                character_id,
                created_at,
            } => write!(
                f,
                "session persona={persona_id} character={character_id} at {}",
                created_at.to_rfc3339()
            ),
            NaturalKey::ChatMessage {
                session_id,
                role,
                created_at,
                ..
            } => write!(
                f,
                "{role} message in session {session_id} at {}",
                created_at.to_rfc3339()
            ),
            NaturalKey::MessageVersion {
                message_id,
                version,
                ..
            } => write!(f, "version {version} of message {message_id}"),
        }
    }
}

/// Truncate a timestamp to the precision the store keeps.
///
/// Keys built from a nanosecond-precise snapshot would otherwise never match
/// the microsecond value persisted by the first import.
pub fn normalize_timestamp(value: DateTime<Utc>) -> DateTime<Utc> {
    value.trunc_subsecs(STORED_SUBSEC_DIGITS)
}

pub fn group_key(group: &CharacterGroup) -> NaturalKey {
    NaturalKey::CharacterGroup {
        name: group.name.clone(),
    }
}

pub fn persona_key(persona: &Persona) -> NaturalKey {
    NaturalKey::Persona {
        name: persona.name.clone(),
        profile_name: persona.profile_name.clone(),
    }
}

pub fn character_key(character: &Character) -> NaturalKey {
    NaturalKey::Character {
        name: character.name.clone(),
        profile_name: character.profile_name.clone(),
    }
}

pub fn prompt_key(prompt: &UserPrompt) -> NaturalKey {
    NaturalKey::UserPrompt {
        title: prompt.title.clone(),
    }
}

pub fn setting_key(setting: &Setting) -> NaturalKey {
    NaturalKey::Setting {
        key: setting.key.clone(),
    }
}

pub fn session_key(persona_id: i32, character_id: i32, created_at: DateTime<Utc>) -> NaturalKey {
    NaturalKey::ChatSession {
        persona_id,
        character_id,
        created_at: normalize_timestamp(created_at),
    }
}

pub fn message_key(
    session_id: i32,
    role: &str,
    content: &str,
    created_at: DateTime<Utc>,
) -> NaturalKey {
    NaturalKey::ChatMessage {
        session_id,
        role: role.to_string(),
        content: content.to_string(),
        created_at: normalize_timestamp(created_at),
    }
}

pub fn version_key(message_id: i32, version: i32, content: &str) -> NaturalKey {
    NaturalKey::MessageVersion {
        message_id,
        version,
        content: content.to_string(),
    }
}
