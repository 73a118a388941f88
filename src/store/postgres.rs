//! PostgreSQL implementation of [`VaultStore`].
//!
//! Natural keys are backed by unique constraints (see the schema migration),
//! so creates use `INSERT ... ON CONFLICT DO NOTHING RETURNING id`. An empty
//! `RETURNING` means another writer got there first; the row is then looked up
//! again and reported as [`WriteOutcome::Existing`].

use crate::models::{
    Character, CharacterGroup, ChatMessage, ChatSession, MessageVersion, Persona, Setting,
    StoredDataset, UserPrompt, nest_sessions,
};
use crate::transfer::entity::EntityKind;
use crate::transfer::natural_key::NaturalKey;
use crate::transfer::snapshot::Snapshot;
use crate::transfer::store::{
    NewRecord, RecordCounts, StoreError, StoreResult, VaultStore, WriteOutcome,
};
use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::{self, PgPool};
use uuid::Uuid;

#[derive(Clone)]
pub struct PgVaultStore {
    pool: PgPool,
}

impl PgVaultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert(&self, record: &NewRecord) -> Result<Option<i32>, sqlx::Error> {
        match record {
            NewRecord::CharacterGroup(group) => {
                sqlx::query_scalar(
                    r#"INSERT INTO character_groups (name, color, sort_order)
                       VALUES ($1, $2, $3)
                       ON CONFLICT DO NOTHING
                       RETURNING id"#,
                )
                .bind(&group.name)
                .bind(&group.color)
                .bind(group.sort_order)
                .fetch_optional(&self.pool)
                .await
            }
            NewRecord::Persona(persona) => {
                sqlx::query_scalar(
                    r#"INSERT INTO personas (name, profile_name, profile)
                       VALUES ($1, $2, $3)
                       ON CONFLICT DO NOTHING
                       RETURNING id"#,
                )
                .bind(&persona.name)
                .bind(&persona.profile_name)
                .bind(&persona.profile)
                .fetch_optional(&self.pool)
                .await
            }
            NewRecord::Character(character) => {
                sqlx::query_scalar(
                    r#"INSERT INTO characters (
                           name, profile_name, personality, scenario,
                           example_dialogue, first_message, group_id
                       )
                       VALUES ($1, $2, $3, $4, $5, $6, $7)
                       ON CONFLICT DO NOTHING
                       RETURNING id"#,
                )
                .bind(&character.name)
                .bind(&character.profile_name)
                .bind(&character.personality)
                .bind(&character.scenario)
                .bind(&character.example_dialogue)
                .bind(&character.first_message)
                .bind(character.group_id)
                .fetch_optional(&self.pool)
                .await
            }
            NewRecord::UserPrompt(prompt) => {
                sqlx::query_scalar(
                    r#"INSERT INTO user_prompts (title, body)
                       VALUES ($1, $2)
                       ON CONFLICT DO NOTHING
                       RETURNING id"#,
                )
                .bind(&prompt.title)
                .bind(&prompt.body)
                .fetch_optional(&self.pool)
                .await
            }
            NewRecord::Setting(setting) => {
                sqlx::query_scalar(
                    r#"INSERT INTO settings (key, value)
                       VALUES ($1, $2)
                       ON CONFLICT DO NOTHING
                       RETURNING id"#,
                )
                .bind(&setting.key)
                .bind(&setting.value)
                .fetch_optional(&self.pool)
                .await
            }
            NewRecord::ChatSession(session) => {
                sqlx::query_scalar(
                    r#"INSERT INTO chat_sessions (persona_id, character_id, created_at, summary, notes)
                       VALUES ($1, $2, $3, $4, $5)
                       ON CONFLICT DO NOTHING
                       RETURNING id"#,
                )
                .bind(session.persona_id)
                .bind(session.character_id)
                .bind(session.created_at)
                .bind(&session.summary)
                .bind(&session.notes)
                .fetch_optional(&self.pool)
                .await
            }
            NewRecord::ChatMessage(message) => {
                sqlx::query_scalar(
                    r#"INSERT INTO chat_messages (session_id, role, content, created_at)
                       VALUES ($1, $2, $3, $4)
                       ON CONFLICT DO NOTHING
                       RETURNING id"#,
                )
                .bind(message.session_id)
                .bind(&message.role)
                .bind(&message.content)
                .bind(message.created_at)
                .fetch_optional(&self.pool)
                .await
            }
            NewRecord::MessageVersion(version) => {
                sqlx::query_scalar(
                    r#"INSERT INTO message_versions (message_id, version, content, is_active)
                       VALUES ($1, $2, $3, $4)
                       ON CONFLICT DO NOTHING
                       RETURNING id"#,
                )
                .bind(version.message_id)
                .bind(version.version)
                .bind(&version.content)
                .bind(version.is_active)
                .fetch_optional(&self.pool)
                .await
            }
        }
    }
}

#[rocket::async_trait]
impl VaultStore for PgVaultStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(())
    }

    async fn find(&self, key: &NaturalKey) -> StoreResult<Option<i32>> {
        let id: Option<i32> = match key {
            NaturalKey::CharacterGroup { name } => {
                sqlx::query_scalar("SELECT id FROM character_groups WHERE name = $1")
                    .bind(name)
                    .fetch_optional(&self.pool)
                    .await?
            }
            NaturalKey::Persona { name, profile_name } => {
                sqlx::query_scalar(
                    "SELECT id FROM personas WHERE name = $1 AND profile_name IS NOT DISTINCT FROM $2",
                )
                .bind(name)
                .bind(profile_name)
                .fetch_optional(&self.pool)
                .await?
            }
            NaturalKey::Character { name, profile_name } => {
                sqlx::query_scalar(
                    "SELECT id FROM characters WHERE name = $1 AND profile_name IS NOT DISTINCT FROM $2",
                )
                .bind(name)
                .bind(profile_name)
                .fetch_optional(&self.pool)
                .await?
            }
            NaturalKey::UserPrompt { title } => {
                sqlx::query_scalar("SELECT id FROM user_prompts WHERE title = $1")
                    .bind(title)
                    .fetch_optional(&self.pool)
                    .await?
            }
            NaturalKey::Setting { key } => {
                sqlx::query_scalar("SELECT id FROM settings WHERE key = $1")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await?
            }
            NaturalKey::ChatSession {
                persona_id,
                character_id,
                created_at,
            } => {
                sqlx::query_scalar(
                    r#"SELECT id FROM chat_sessions
                       WHERE persona_id = $1 AND character_id = $2 AND created_at = $3"#,
                )
                .bind(persona_id)
                .bind(character_id)
                .bind(created_at)
                .fetch_optional(&self.pool)
                .await?
            }
            NaturalKey::ChatMessage {
                session_id,
                role,
                content,
                created_at,
            } => {
                // md5() lets the lookup use the natural-key index.
                sqlx::query_scalar(
                    r#"SELECT id FROM chat_messages
                       WHERE session_id = $1 AND role = $2
                         AND md5(content) = md5($3) AND content = $3
                         AND created_at = $4"#,
                )
                .bind(session_id)
                .bind(role)
                .bind(content)
                .bind(created_at)
                .fetch_optional(&self.pool)
                .await?
            }
            NaturalKey::MessageVersion {
                message_id,
                version,
                content,
            } => {
                sqlx::query_scalar(
                    r#"SELECT id FROM message_versions
                       WHERE message_id = $1 AND version = $2
                         AND md5(content) = md5($3) AND content = $3"#,
                )
                .bind(message_id)
                .bind(version)
                .bind(content)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        Ok(id)
    }

    async fn create(&self, record: &NewRecord) -> StoreResult<WriteOutcome> {
        if let Some(id) = self.insert(record).await? {
            return Ok(WriteOutcome::Inserted(id));
        }

        let key = record.natural_key();
        match self.find(&key).await? {
            Some(id) => {
                log::debug!("{} already present as id {}", key, id);
                Ok(WriteOutcome::Existing(id))
            }
            None => Err(StoreError::Unavailable(format!(
                "insert of {key} conflicted but no matching row was found"
            ))),
        }
    }

    async fn load_dataset(&self) -> StoreResult<StoredDataset> {
        let (
            character_groups,
            personas,
            characters,
            user_prompts,
            settings,
            sessions,
            messages,
            versions,
        ) = tokio::try_join!(
            sqlx::query_as::<_, CharacterGroup>(
                "SELECT id, name, color, sort_order, created_at FROM character_groups ORDER BY sort_order, id",
            )
            .fetch_all(&self.pool),
            sqlx::query_as::<_, Persona>(
                "SELECT id, name, profile_name, profile, created_at FROM personas ORDER BY id",
            )
            .fetch_all(&self.pool),
            sqlx::query_as::<_, Character>(
                r#"SELECT id, name, profile_name, personality, scenario, example_dialogue,
                          first_message, group_id, created_at
                   FROM characters ORDER BY id"#,
            )
            .fetch_all(&self.pool),
            sqlx::query_as::<_, UserPrompt>(
                "SELECT id, title, body, created_at FROM user_prompts ORDER BY id",
            )
            .fetch_all(&self.pool),
            sqlx::query_as::<_, Setting>("SELECT id, key, value FROM settings ORDER BY key")
                .fetch_all(&self.pool),
            sqlx::query_as::<_, ChatSession>(
                r#"SELECT id, persona_id, character_id, created_at, summary, notes
                   FROM chat_sessions ORDER BY created_at, id"#,
            )
            .fetch_all(&self.pool),
            sqlx::query_as::<_, ChatMessage>(
                r#"SELECT id, session_id, role, content, created_at
                   FROM chat_messages ORDER BY session_id, created_at, id"#,
            )
            .fetch_all(&self.pool),
            sqlx::query_as::<_, MessageVersion>(
                r#"SELECT id, message_id, version, content, is_active
                   FROM message_versions ORDER BY message_id, version, id"#,
            )
            .fetch_all(&self.pool),
        )?;

        Ok(StoredDataset {
            character_groups,
            personas,
            characters,
            user_prompts,
            settings,
            sessions: nest_sessions(sessions, messages, versions),
        })
    }

    async fn record_counts(&self) -> StoreResult<RecordCounts> {
        let row: (i64, i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM character_groups),
                (SELECT COUNT(*) FROM personas),
                (SELECT COUNT(*) FROM characters),
                (SELECT COUNT(*) FROM user_prompts),
                (SELECT COUNT(*) FROM settings),
                (SELECT COUNT(*) FROM chat_sessions),
                (SELECT COUNT(*) FROM chat_messages),
                (SELECT COUNT(*) FROM message_versions)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(RecordCounts::from([
            (EntityKind::CharacterGroup, row.0),
            (EntityKind::Persona, row.1),
            (EntityKind::Character, row.2),
            (EntityKind::UserPrompt, row.3),
            (EntityKind::Setting, row.4),
            (EntityKind::ChatSession, row.5),
            (EntityKind::ChatMessage, row.6),
            (EntityKind::MessageVersion, row.7),
        ]))
    }

    async fn save_pending_import(
        &self,
        token: Uuid,
        snapshot: &Snapshot,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let document = serde_json::to_value(snapshot)?;

        sqlx::query(
            "INSERT INTO pending_imports (token, snapshot, expires_at) VALUES ($1, $2, $3)",
        )
        .bind(token)
        .bind(document)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn take_pending_import(&self, token: Uuid) -> StoreResult<Option<Snapshot>> {
        let purged = sqlx::query("DELETE FROM pending_imports WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        if purged > 0 {
            log::debug!("purged {} expired pending imports", purged);
        }

        let document: Option<serde_json::Value> = sqlx::query_scalar(
            "DELETE FROM pending_imports WHERE token = $1 AND expires_at > NOW() RETURNING snapshot",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        document
            .map(serde_json::from_value)
            .transpose()
            .map_err(StoreError::from)
    }
}
