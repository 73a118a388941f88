//! The staged import pipeline.
//!
//! Stages run strictly in [`EntityKind::STAGE_ORDER`]. Within a stage every
//! record is prepared against the cross-reference table as it stood when the
//! stage began, written through the batch scheduler, and only then registered.
//! Record futures never mutate shared state, so nothing here needs a lock.

use crate::models::{
    Character, CharacterGroup, ChatMessage, ChatSession, MessageVersion, Persona, Setting,
    UserPrompt,
};
use crate::transfer::entity::EntityKind;
use crate::transfer::error::{RecordError, TransferResult};
use crate::transfer::natural_key::normalize_timestamp;
use crate::transfer::report::{ImportReport, ReportAggregator};
use crate::transfer::scheduler::BatchScheduler;
use crate::transfer::snapshot::{Snapshot, SnapshotData};
use crate::transfer::store::{
    NewCharacter, NewCharacterGroup, NewChatMessage, NewChatSession, NewMessageVersion,
    NewPersona, NewRecord, NewSetting, NewUserPrompt, VaultStore, WriteOutcome,
};
use crate::transfer::xref::{
    CrossReferenceTable, ExportIndex, Resolution, Resolved, resolve_direct, resolve_through_key,
};
use std::collections::HashSet;
use std::time::Instant;

/// Setting keys an import must never create or overwrite.
pub const SENSITIVE_SETTING_KEYS: [&str; 3] = ["password_hash", "password_version", "jwt_secret"];

pub fn is_sensitive_setting(key: &str) -> bool {
    SENSITIVE_SETTING_KEYS.contains(&key)
}

type Prepared = Result<Option<NewRecord>, RecordError>;

/// One inbound record after parent resolution.
struct StagedRecord {
    exported_id: i32,
    /// Identifies the record in error strings.
    subject: String,
    /// `Ok(None)` marks a record that is deliberately not written.
    prepared: Prepared,
}

struct PendingWrite {
    exported_id: i32,
    subject: String,
    record: NewRecord,
}

pub struct Reconciler<'s> {
    store: &'s dyn VaultStore,
    scheduler: BatchScheduler,
}

impl<'s> Reconciler<'s> {
    pub fn new(store: &'s dyn VaultStore, scheduler: BatchScheduler) -> Self {
        Self { store, scheduler }
    }

    /// Merge `snapshot` into the store.
    ///
    /// Only an unreachable store fails the run; everything record-shaped ends
    /// up in the returned report.
    pub async fn run(&self, snapshot: &Snapshot) -> TransferResult<ImportReport> {
        self.store.ping().await?;

        let started = Instant::now();
        let index = ExportIndex::from_snapshot(&snapshot.data);
        let mut xref = CrossReferenceTable::new();
        let mut report = ReportAggregator::new();

        log::info!(
            "reconciling snapshot (format {}, {} records)",
            snapshot.format_version,
            snapshot.data.record_total()
        );

        for kind in EntityKind::STAGE_ORDER {
            self.run_stage(kind, &snapshot.data, &index, &mut xref, &mut report)
                .await;
        }

        let report = report.finish();
        log::info!(
            "import finished in {:.2}s: {} imported, {} skipped, {} errors",
            started.elapsed().as_secs_f64(),
            report.summary.total_imported,
            report.summary.total_skipped,
            report.summary.total_errors
        );

        Ok(report)
    }

    async fn run_stage(
        &self,
        kind: EntityKind,
        data: &SnapshotData,
        index: &ExportIndex,
        xref: &mut CrossReferenceTable,
        report: &mut ReportAggregator,
    ) {
        let staged = stage_records(kind, data, index, xref);
        if staged.is_empty() {
            return;
        }

        log::info!("stage {}: {} records", kind.collection_name(), staged.len());
        let errors_before = report.error_count();

        let mut writes = Vec::with_capacity(staged.len());
        for record in staged {
            match record.prepared {
                Ok(Some(new_record)) => writes.push(PendingWrite {
                    exported_id: record.exported_id,
                    subject: record.subject,
                    record: new_record,
                }),
                Ok(None) => report.record_skipped(kind),
                Err(err) => record_failure(report, kind, &record.subject, err),
            }
        }

        let outcomes = self
            .scheduler
            .process(&writes, |pending| self.write(&pending.record))
            .await;

        for (pending, outcome) in writes.into_iter().zip(outcomes) {
            let registered = outcome.and_then(|resolved| {
                let resolution = resolved.resolution;
                xref.register(kind, pending.exported_id, resolved)
                    .map(|_| resolution)
            });

            match registered {
                Ok(Resolution::Imported) => report.record_imported(kind),
                Ok(Resolution::Linked) => report.record_skipped(kind),
                Err(err) => record_failure(report, kind, &pending.subject, err),
            }
        }

        let counts = report.counts(kind);
        log::info!(
            "stage {} done: {} imported, {} skipped, {} errors",
            kind.collection_name(),
            counts.imported,
            counts.skipped,
            report.error_count() - errors_before
        );
    }

    /// Find-then-create for one record.
    async fn write(&self, record: &NewRecord) -> Result<Resolved, RecordError> {
        let key = record.natural_key();

        if let Some(target_id) = self.store.find(&key).await? {
            return Ok(Resolved {
                target_id,
                resolution: Resolution::Linked,
                key,
            });
        }

        let (target_id, resolution) = match self.store.create(record).await? {
            WriteOutcome::Inserted(id) => (id, Resolution::Imported),
            WriteOutcome::Existing(id) => (id, Resolution::Linked),
        };

        Ok(Resolved {
            target_id,
            resolution,
            key,
        })
    }
}

fn record_failure(
    report: &mut ReportAggregator,
    kind: EntityKind,
    subject: &str,
    err: RecordError,
) {
    log::warn!("{kind} {subject} not imported: {err}");
    report.record_error(kind, subject, err);
}

/// Collects staged records, rejecting repeated exported ids.
///
/// A repeated exported id keeps its first occurrence; later ones fail without
/// touching the store.
#[derive(Default)]
struct Stager {
    seen: HashSet<i32>,
    records: Vec<StagedRecord>,
}

impl Stager {
    fn push(&mut self, exported_id: i32, subject: String, prepare: impl FnOnce() -> Prepared) {
        let prepared = if self.seen.insert(exported_id) {
            prepare()
        } else {
            Err(RecordError::AlreadyResolved)
        };

        self.records.push(StagedRecord {
            exported_id,
            subject,
            prepared,
        });
    }
}

/// Resolve parents for every record of `kind`.
fn stage_records(
    kind: EntityKind,
    data: &SnapshotData,
    index: &ExportIndex,
    xref: &CrossReferenceTable,
) -> Vec<StagedRecord> {
    let mut stager = Stager::default();

    match kind {
        EntityKind::CharacterGroup => {
            for group in &data.character_groups {
                stager.push(group.id, group.id.to_string(), || prepare_group(group));
            }
        }
        EntityKind::Persona => {
            for persona in &data.personas {
                stager.push(persona.id, persona.id.to_string(), || {
                    prepare_persona(persona)
                });
            }
        }
        EntityKind::Character => {
            for character in &data.characters {
                stager.push(character.id, character.id.to_string(), || {
                    prepare_character(character, index, xref)
                });
            }
        }
        EntityKind::UserPrompt => {
            for prompt in &data.user_prompts {
                stager.push(prompt.id, prompt.id.to_string(), || prepare_prompt(prompt));
            }
        }
        EntityKind::Setting => {
            for setting in &data.settings {
                stager.push(setting.id, setting.key.clone(), || prepare_setting(setting));
            }
        }
        EntityKind::ChatSession => {
            for session in &data.chat_sessions {
                stager.push(session.id, session.id.to_string(), || {
                    prepare_session(session, index, xref)
                });
            }
        }
        EntityKind::ChatMessage => {
            for message in &data.chat_messages {
                stager.push(message.id, message.id.to_string(), || {
                    prepare_message(message, xref)
                });
            }
        }
        EntityKind::MessageVersion => {
            for version in &data.message_versions {
                stager.push(version.id, version.id.to_string(), || {
                    prepare_version(version, xref)
                });
            }
        }
    }

    stager.records
}

fn prepare_group(group: &CharacterGroup) -> Prepared {
    Ok(Some(NewRecord::CharacterGroup(NewCharacterGroup {
        name: group.name.clone(),
        color: group.color.clone(),
        sort_order: group.sort_order,
    })))
}

fn prepare_persona(persona: &Persona) -> Prepared {
    Ok(Some(NewRecord::Persona(NewPersona {
        name: persona.name.clone(),
        profile_name: persona.profile_name.clone(),
        profile: persona.profile.clone(),
    })))
}

fn prepare_character(
    character: &Character,
    index: &ExportIndex,
    xref: &CrossReferenceTable,
) -> Prepared {
    // The group is optional: a character whose group cannot be resolved is
    // still imported, just ungrouped.
    let group_id = character.group_id.and_then(|group_id| {
        match resolve_through_key(index, xref, EntityKind::CharacterGroup, group_id) {
            Ok(target) => Some(target),
            Err(err) => {
                log::warn!(
                    "Character {}: {err}; importing without a group",
                    character.id
                );
                None
            }
        }
    });

    Ok(Some(NewRecord::Character(NewCharacter {
        name: character.name.clone(),
        profile_name: character.profile_name.clone(),
        personality: character.personality.clone(),
        scenario: character.scenario.clone(),
        example_dialogue: character.example_dialogue.clone(),
        first_message: character.first_message.clone(),
        group_id,
    })))
}

fn prepare_prompt(prompt: &UserPrompt) -> Prepared {
    Ok(Some(NewRecord::UserPrompt(NewUserPrompt {
        title: prompt.title.clone(),
        body: prompt.body.clone(),
    })))
}

fn prepare_setting(setting: &Setting) -> Prepared {
    if is_sensitive_setting(&setting.key) {
        log::debug!("leaving sensitive setting '{}' untouched", setting.key);
        return Ok(None);
    }

    Ok(Some(NewRecord::Setting(NewSetting {
        key: setting.key.clone(),
        value: setting.value.clone(),
    })))
}

fn prepare_session(
    session: &ChatSession,
    index: &ExportIndex,
    xref: &CrossReferenceTable,
) -> Prepared {
    let persona_id = resolve_through_key(index, xref, EntityKind::Persona, session.persona_id)?;
    let character_id =
        resolve_through_key(index, xref, EntityKind::Character, session.character_id)?;

    Ok(Some(NewRecord::ChatSession(NewChatSession {
        persona_id,
        character_id,
        created_at: normalize_timestamp(session.created_at),
        summary: session.summary.clone(),
        notes: session.notes.clone(),
    })))
}

fn prepare_message(message: &ChatMessage, xref: &CrossReferenceTable) -> Prepared {
    let session_id = resolve_direct(xref, EntityKind::ChatSession, message.session_id)?;

    Ok(Some(NewRecord::ChatMessage(NewChatMessage {
        session_id,
        role: message.role.clone(),
        content: message.content.clone(),
        created_at: normalize_timestamp(message.created_at),
    })))
}

fn prepare_version(version: &MessageVersion, xref: &CrossReferenceTable) -> Prepared {
    let message_id = resolve_direct(xref, EntityKind::ChatMessage, version.message_id)?;

    Ok(Some(NewRecord::MessageVersion(NewMessageVersion {
        message_id,
        version: version.version,
        content: version.content.clone(),
        is_active: version.is_active,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryStore;
    use chrono::Utc;
    use std::time::Duration;

    fn setting(id: i32, key: &str, value: &str) -> Setting {
        Setting {
            id,
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn scheduler() -> BatchScheduler {
        BatchScheduler::new(2, Duration::ZERO)
    }

    #[tokio::test]
    async fn sensitive_settings_are_skipped_without_store_access() {
        let store = MemoryStore::new();
        let data = SnapshotData {
            settings: vec![
                setting(1, "password_hash", "$argon2id$forged"),
                setting(2, "jwt_secret", "forged"),
                setting(3, "theme", "dark"),
            ],
            ..Default::default()
        };

        let report = Reconciler::new(&store, scheduler())
            .run(&Snapshot::new(data, Utc::now()))
            .await
            .expect("run");

        assert_eq!(report.counts(EntityKind::Setting).skipped, 2);
        assert_eq!(report.counts(EntityKind::Setting).imported, 1);
        assert_eq!(store.setting_value("password_hash"), None);
        assert_eq!(store.setting_value("theme").as_deref(), Some("dark"));
    }

    #[tokio::test]
    async fn repeated_exported_id_keeps_first_record() {
        let store = MemoryStore::new();
        let prompt = |title: &str| UserPrompt {
            id: 8,
            title: title.to_string(),
            body: String::new(),
            created_at: None,
        };
        let data = SnapshotData {
            user_prompts: vec![prompt("First"), prompt("Second")],
            ..Default::default()
        };

        let report = Reconciler::new(&store, scheduler())
            .run(&Snapshot::new(data, Utc::now()))
            .await
            .expect("run");

        assert_eq!(report.counts(EntityKind::UserPrompt).imported, 1);
        assert_eq!(
            report.errors,
            vec!["UserPrompt 8: exported id already resolved in this import".to_string()]
        );
    }

    #[tokio::test]
    async fn unreachable_store_fails_the_whole_run() {
        let store = MemoryStore::new();
        store.set_available(false);

        let result = Reconciler::new(&store, scheduler())
            .run(&Snapshot::new(SnapshotData::default(), Utc::now()))
            .await;

        assert!(matches!(
            result,
            Err(crate::transfer::error::TransferError::StoreUnavailable(_))
        ));
    }
}
