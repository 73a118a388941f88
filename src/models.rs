use chrono::{DateTime, Utc};
use std::collections::HashMap;
use rocket_db_pools::sqlx::FromRow;
use serde::{Deserialize, Serialize};

// ===== Library Models =====
//
// Rows double as snapshot records: the camelCase serde form is the export
// format, so field names here are part of the portable envelope.

fn default_group_color() -> String {
    "#6b7280".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CharacterGroup {
    pub id: i32,
    pub name: String,
    #[serde(default = "default_group_color")]
    pub color: String,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub profile_name: Option<String>,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub profile_name: Option<String>,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub scenario: String,
    #[serde(default)]
    pub example_dialogue: String,
    #[serde(default)]
    pub first_message: String,
    #[serde(default)]
    pub group_id: Option<i32>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserPrompt {
    pub id: i32,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    pub id: i32,
    pub key: String,
    #[serde(default)]
    pub value: String,
}

// ===== Conversation Models =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: i32,
    pub persona_id: i32,
    pub character_id: i32,
    /// Part of the session's natural key; must survive export byte-for-byte.
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i32,
    pub session_id: i32,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MessageVersion {
    pub id: i32,
    pub message_id: i32,
    pub version: i32,
    pub content: String,
    #[serde(default)]
    pub is_active: bool,
}

// ===== Nested Structs for Export =====

/// A message together with every stored version of it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessageTree {
    pub message: ChatMessage,
    pub versions: Vec<MessageVersion>,
}

/// A session loaded with its messages and their versions in one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSessionTree {
    pub session: ChatSession,
    pub messages: Vec<ChatMessageTree>,
}

/// Everything the exporter reads from a store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredDataset {
    pub character_groups: Vec<CharacterGroup>,
    pub personas: Vec<Persona>,
    pub characters: Vec<Character>,
    pub user_prompts: Vec<UserPrompt>,
    pub settings: Vec<Setting>,
    pub sessions: Vec<ChatSessionTree>,
}

/// Attach versions to messages and messages to sessions, keeping input order.
pub fn nest_sessions(
    sessions: Vec<ChatSession>,
    messages: Vec<ChatMessage>,
    versions: Vec<MessageVersion>,
) -> Vec<ChatSessionTree> {
    let mut versions_by_message: HashMap<i32, Vec<MessageVersion>> = HashMap::new();
    for version in versions {
        versions_by_message
            .entry(version.message_id)
            .or_default()
            .push(version);
    }

    let mut messages_by_session: HashMap<i32, Vec<ChatMessageTree>> = HashMap::new();
    for message in messages {
        let versions = versions_by_message.remove(&message.id).unwrap_or_default();
        messages_by_session
            .entry(message.session_id)
            .or_default()
            .push(ChatMessageTree { message, versions });
    }

    sessions
        .into_iter()
        .map(|session| ChatSessionTree {
            messages: messages_by_session.remove(&session.id).unwrap_or_default(),
            session,
        })
        .collect()
}
