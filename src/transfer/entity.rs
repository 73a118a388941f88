//! Entity types known to the transfer pipeline, in import stage order.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    CharacterGroup,
    Persona,
    Character,
    UserPrompt,
    Setting,
    ChatSession,
    ChatMessage,
    MessageVersion,
}

impl EntityKind {
    /// Every kind, ordered so that parents always precede their children.
    pub const STAGE_ORDER: [EntityKind; 8] = [
        EntityKind::CharacterGroup,
        EntityKind::Persona,
        EntityKind::Character,
        EntityKind::UserPrompt,
        EntityKind::Setting,
        EntityKind::ChatSession,
        EntityKind::ChatMessage,
        EntityKind::MessageVersion,
    ];

    /// Singular name used in error strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::CharacterGroup => "CharacterGroup",
            EntityKind::Persona => "Persona",
            EntityKind::Character => "Character",
            EntityKind::UserPrompt => "UserPrompt",
            EntityKind::Setting => "Setting",
            EntityKind::ChatSession => "ChatSession",
            EntityKind::ChatMessage => "ChatMessage",
            EntityKind::MessageVersion => "MessageVersion",
        }
    }

    /// Key of this kind's array inside the snapshot `data` object.
    pub fn collection_name(&self) -> &'static str {
        match self {
            EntityKind::CharacterGroup => "characterGroups",
            EntityKind::Persona => "personas",
            EntityKind::Character => "characters",
            EntityKind::UserPrompt => "userPrompts",
            EntityKind::Setting => "settings",
            EntityKind::ChatSession => "chatSessions",
            EntityKind::ChatMessage => "chatMessages",
            EntityKind::MessageVersion => "messageVersions",
        }
    }

    /// Lower-case label for log lines and parent-reference messages.
    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::CharacterGroup => "character group",
            EntityKind::Persona => "persona",
            EntityKind::Character => "character",
            EntityKind::UserPrompt => "user prompt",
            EntityKind::Setting => "setting",
            EntityKind::ChatSession => "session",
            EntityKind::ChatMessage => "message",
            EntityKind::MessageVersion => "message version",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
