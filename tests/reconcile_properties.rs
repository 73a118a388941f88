use chat_vault::models::{
    Character, CharacterGroup, ChatMessage, ChatSession, MessageVersion, Persona, Setting,
    UserPrompt,
};
use chat_vault::test_support::MemoryStore;
use chat_vault::transfer::natural_key::{self, NaturalKey};
use chat_vault::transfer::snapshot::{Snapshot, SnapshotData};
use chat_vault::transfer::store::{NewCharacterGroup, NewRecord, NewSetting, VaultStore};
use chat_vault::transfer::{BatchScheduler, EntityKind, ImportReport, Reconciler, export};
use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_717_000_000 + seconds, 0).unwrap()
}

fn group(id: i32, name: &str) -> CharacterGroup {
    CharacterGroup {
        id,
        name: name.into(),
        color: "#112233".into(),
        sort_order: id,
        created_at: None,
    }
}

fn persona(id: i32, name: &str) -> Persona {
    Persona {
        id,
        name: name.into(),
        profile_name: None,
        profile: format!("{name} likes tea"),
        created_at: None,
    }
}

fn character(id: i32, name: &str, group_id: Option<i32>) -> Character {
    Character {
        id,
        name: name.into(),
        profile_name: Some("default".into()),
        personality: "curious".into(),
        scenario: String::new(),
        example_dialogue: String::new(),
        first_message: format!("Hello, I am {name}."),
        group_id,
        created_at: None,
    }
}

fn session(id: i32, persona_id: i32, character_id: i32, created_at: DateTime<Utc>) -> ChatSession {
    ChatSession {
        id,
        persona_id,
        character_id,
        created_at,
        summary: None,
        notes: None,
    }
}

fn message(id: i32, session_id: i32, content: &str, created_at: DateTime<Utc>) -> ChatMessage {
    ChatMessage {
        id,
        session_id,
        role: if id % 2 == 0 { "assistant" } else { "user" }.into(),
        content: content.into(),
        created_at,
    }
}

fn version(id: i32, message_id: i32, number: i32, content: &str) -> MessageVersion {
    MessageVersion {
        id,
        message_id,
        version: number,
        content: content.into(),
        is_active: number == 1,
    }
}

fn setting(id: i32, key: &str, value: &str) -> Setting {
    Setting {
        id,
        key: key.into(),
        value: value.into(),
    }
}

/// A small but complete dataset: two groups, two personas, three characters,
/// two sessions with messages and versions, prompts and settings.
fn sample_data() -> SnapshotData {
    SnapshotData {
        character_groups: vec![group(1, "Sci-Fi"), group(2, "Fantasy")],
        personas: vec![persona(1, "Ada"), persona(2, "Grace")],
        characters: vec![
            character(1, "Nova", Some(1)),
            character(2, "Eldrin", Some(2)),
            character(3, "Pip", None),
        ],
        chat_sessions: vec![session(1, 1, 1, at(0)), session(2, 2, 2, at(60))],
        chat_messages: vec![
            message(1, 1, "Where are we?", at(1)),
            message(2, 1, "On the bridge.", at(2)),
            message(3, 2, "Tell me a story.", at(61)),
            message(4, 2, "Once upon a time...", at(62)),
        ],
        message_versions: vec![
            version(1, 2, 1, "On the bridge."),
            version(2, 2, 2, "On the bridge, captain."),
            version(3, 4, 1, "Once upon a time..."),
        ],
        user_prompts: vec![UserPrompt {
            id: 1,
            title: "Summarize".into(),
            body: "Summarize the chat so far.".into(),
            created_at: None,
        }],
        settings: vec![
            setting(1, "theme", "dark"),
            setting(2, "password_hash", "$argon2id$v=19$attacker"),
            setting(3, "password_version", "99"),
            setting(4, "jwt_secret", "attacker-secret"),
        ],
    }
}

fn snapshot(data: SnapshotData) -> Snapshot {
    Snapshot::new(data, at(3600))
}

async fn import(store: &MemoryStore, snapshot: &Snapshot) -> ImportReport {
    import_with(store, snapshot, BatchScheduler::new(2, Duration::ZERO)).await
}

async fn import_with(
    store: &MemoryStore,
    snapshot: &Snapshot,
    scheduler: BatchScheduler,
) -> ImportReport {
    Reconciler::new(store, scheduler)
        .run(snapshot)
        .await
        .expect("store is reachable")
}

#[tokio::test]
async fn fresh_import_creates_everything_but_secrets() {
    let store = MemoryStore::new();
    let report = import(&store, &snapshot(sample_data())).await;

    assert!(report.errors.is_empty(), "unexpected errors: {:?}", report.errors);
    assert_eq!(report.counts(EntityKind::CharacterGroup).imported, 2);
    assert_eq!(report.counts(EntityKind::Character).imported, 3);
    assert_eq!(report.counts(EntityKind::ChatSession).imported, 2);
    assert_eq!(report.counts(EntityKind::ChatMessage).imported, 4);
    assert_eq!(report.counts(EntityKind::MessageVersion).imported, 3);
    assert_eq!(report.counts(EntityKind::Setting).imported, 1);
    assert_eq!(report.counts(EntityKind::Setting).skipped, 3);
    assert_eq!(report.summary.total_imported, 18);
    assert_eq!(report.summary.total_skipped, 3);
    assert!(store.dangling_references().is_empty());
}

#[tokio::test]
async fn second_import_of_same_snapshot_creates_nothing() {
    let store = MemoryStore::new();
    let snapshot = snapshot(sample_data());

    import(&store, &snapshot).await;
    let counts_after_first = store.record_counts().await.expect("counts");

    let second = import(&store, &snapshot).await;

    assert_eq!(second.summary.total_imported, 0);
    assert_eq!(second.summary.total_errors, 0);
    assert_eq!(second.summary.total_skipped, snapshot.data.record_total());
    assert_eq!(store.record_counts().await.expect("counts"), counts_after_first);
}

#[tokio::test]
async fn imported_foreign_keys_point_at_target_rows() {
    let store = MemoryStore::new();
    // Pre-existing rows shift the target id space away from the exported one.
    store.seed(NewRecord::CharacterGroup(NewCharacterGroup {
        name: "Horror".into(),
        color: "#000000".into(),
        sort_order: 0,
    }));

    import(&store, &snapshot(sample_data())).await;

    assert!(store.dangling_references().is_empty());
    let exported_ids: Vec<i32> = vec![1, 2, 3, 4];
    for message in store.messages() {
        assert!(!exported_ids.contains(&message.session_id));
    }
}

#[tokio::test]
async fn security_sensitive_settings_are_never_overwritten() {
    let store = MemoryStore::new();
    store.seed(NewRecord::Setting(NewSetting {
        key: "password_hash".into(),
        value: "$argon2id$v=19$original".into(),
    }));
    let creates_before = store.create_calls();

    let report = import(&store, &snapshot(sample_data())).await;

    assert_eq!(
        store.setting_value("password_hash").as_deref(),
        Some("$argon2id$v=19$original")
    );
    assert_eq!(store.setting_value("jwt_secret"), None);
    assert_eq!(store.setting_value("password_version"), None);
    assert_eq!(report.counts(EntityKind::Setting).skipped, 3);

    // Only non-sensitive records reached the store's create path.
    let writable = sample_data().record_total() - 3;
    assert_eq!(store.create_calls() - creates_before, writable);
}

#[tokio::test]
async fn existing_setting_value_is_left_untouched() {
    let store = MemoryStore::new();
    store.seed(NewRecord::Setting(NewSetting {
        key: "theme".into(),
        value: "light".into(),
    }));

    let report = import(&store, &snapshot(sample_data())).await;

    assert_eq!(store.setting_value("theme").as_deref(), Some("light"));
    assert_eq!(report.counts(EntityKind::Setting).imported, 0);
}

#[tokio::test]
async fn children_listed_before_parents_still_resolve() {
    let mut data = sample_data();
    data.characters.reverse();
    data.character_groups.reverse();
    data.chat_messages.reverse();
    data.message_versions.reverse();

    let store = MemoryStore::new();
    let report = import(&store, &snapshot(data)).await;

    assert!(report.errors.is_empty(), "unexpected errors: {:?}", report.errors);
    assert!(store.dangling_references().is_empty());
}

#[tokio::test]
async fn existing_group_is_linked_by_name() {
    let store = MemoryStore::new();
    let fantasy_id = store.seed(NewRecord::CharacterGroup(NewCharacterGroup {
        name: "Fantasy".into(),
        color: "#aa00ff".into(),
        sort_order: 3,
    }));

    let data = SnapshotData {
        character_groups: vec![group(5, "Fantasy")],
        characters: vec![character(9, "Eldrin", Some(5))],
        ..Default::default()
    };
    let report = import(&store, &snapshot(data)).await;

    assert_eq!(report.counts(EntityKind::CharacterGroup).skipped, 1);
    assert_eq!(report.counts(EntityKind::CharacterGroup).imported, 0);
    assert_eq!(report.counts(EntityKind::Character).imported, 1);
    assert_eq!(store.groups().len(), 1);

    let eldrin = store
        .characters()
        .into_iter()
        .find(|c| c.name == "Eldrin")
        .expect("character imported");
    assert_eq!(eldrin.group_id, Some(fantasy_id));
}

#[tokio::test]
async fn character_with_unknown_group_is_imported_ungrouped() {
    let store = MemoryStore::new();
    let data = SnapshotData {
        personas: vec![persona(1, "Ada")],
        characters: vec![character(4, "Orphan", Some(77))],
        chat_sessions: vec![session(1, 1, 4, at(0))],
        chat_messages: vec![message(1, 1, "Anyone here?", at(1))],
        ..Default::default()
    };

    let report = import(&store, &snapshot(data)).await;

    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.counts(EntityKind::Character).imported, 1);
    assert_eq!(report.counts(EntityKind::ChatSession).imported, 1);
    assert_eq!(report.counts(EntityKind::ChatMessage).imported, 1);

    let characters = store.characters();
    assert_eq!(characters.len(), 1);
    assert_eq!(characters[0].group_id, None);
    assert!(store.dangling_references().is_empty());
}

#[tokio::test]
async fn session_with_missing_persona_fails_with_its_messages() {
    let mut data = sample_data();
    // Session 2 now points at a persona that was never exported.
    data.chat_sessions[1].persona_id = 42;

    let store = MemoryStore::new();
    let report = import(&store, &snapshot(data)).await;

    assert_eq!(report.counts(EntityKind::ChatSession).imported, 1);
    assert_eq!(report.counts(EntityKind::ChatMessage).imported, 2);
    assert_eq!(report.counts(EntityKind::MessageVersion).imported, 2);
    assert_eq!(
        report.errors,
        vec![
            "ChatSession 2: persona 42 is not present in the snapshot".to_string(),
            "ChatMessage 3: session 2 was not imported".to_string(),
            "ChatMessage 4: session 2 was not imported".to_string(),
            "MessageVersion 3: message 4 was not imported".to_string(),
        ]
    );
    assert_eq!(report.summary.total_errors, 4);
    assert!(store.dangling_references().is_empty());
}

#[tokio::test]
async fn one_failing_record_does_not_stop_the_run() {
    let store = MemoryStore::new();
    let data = sample_data();

    // Session 1 will get the first target session id; its second message fails.
    let first = import(&store, &snapshot(SnapshotData {
        character_groups: data.character_groups.clone(),
        personas: data.personas.clone(),
        characters: data.characters.clone(),
        chat_sessions: data.chat_sessions.clone(),
        ..Default::default()
    }))
    .await;
    assert!(first.errors.is_empty());

    let session_target = store
        .sessions()
        .into_iter()
        .find(|s| s.created_at == at(0))
        .expect("session 1 stored")
        .id;
    store.fail_on(natural_key::message_key(
        session_target,
        "assistant",
        "On the bridge.",
        at(2),
    ));

    let report = import(&store, &snapshot(data)).await;

    assert_eq!(report.counts(EntityKind::ChatMessage).imported, 3);
    assert_eq!(report.counts(EntityKind::MessageVersion).imported, 1);
    assert_eq!(report.summary.total_errors, 3);
    assert!(report.errors[0].starts_with("ChatMessage 2: store unavailable: injected failure"));
    assert_eq!(report.errors[1], "MessageVersion 1: message 2 was not imported");
    assert_eq!(report.errors[2], "MessageVersion 2: message 2 was not imported");
    assert!(store.dangling_references().is_empty());
}

#[tokio::test]
async fn batch_size_does_not_change_outcomes() {
    let snapshot = snapshot(sample_data());
    let mut reports = Vec::new();

    for batch_size in [1, 3, 50] {
        let store = MemoryStore::new();
        reports.push(import_with(&store, &snapshot, BatchScheduler::new(batch_size, Duration::ZERO)).await);
    }

    assert_eq!(reports[0], reports[1]);
    assert_eq!(reports[1], reports[2]);
}

#[tokio::test]
async fn repeated_exported_ids_keep_the_first_record() {
    let mut data = sample_data();
    data.personas.push(persona(1, "Impostor"));

    let store = MemoryStore::new();
    let report = import(&store, &snapshot(data)).await;

    assert_eq!(report.counts(EntityKind::Persona).imported, 2);
    assert_eq!(
        report.errors,
        vec!["Persona 1: exported id already resolved in this import".to_string()]
    );
    assert_eq!(store.count(EntityKind::Persona), 2);
}

#[tokio::test]
async fn sub_microsecond_timestamps_still_deduplicate() {
    let precise = Utc.timestamp_opt(1_717_000_000, 123_456_789).unwrap();
    let mut data = sample_data();
    data.chat_sessions[0].created_at = precise;
    data.chat_messages[0].created_at = precise;

    let store = MemoryStore::new();
    let snapshot = snapshot(data);
    import(&store, &snapshot).await;
    let second = import(&store, &snapshot).await;

    assert_eq!(second.summary.total_imported, 0);
    let stored = store
        .sessions()
        .into_iter()
        .find(|s| s.created_at.timestamp() == precise.timestamp())
        .expect("session stored");
    assert_eq!(stored.created_at, natural_key::normalize_timestamp(precise));
}

#[tokio::test]
async fn exported_snapshot_reimports_cleanly() {
    let source = MemoryStore::new();
    import(&source, &snapshot(sample_data())).await;

    let exported = export::build_snapshot(&source, Utc::now())
        .await
        .expect("export");
    assert!(
        exported
            .data
            .settings
            .iter()
            .all(|s| s.key != "password_hash" && s.key != "jwt_secret")
    );

    // Into an empty store: everything is created again.
    let target = MemoryStore::new();
    let fresh = import(&target, &exported).await;
    assert_eq!(fresh.summary.total_errors, 0);
    assert_eq!(fresh.summary.total_imported, exported.data.record_total());
    assert_eq!(
        target.record_counts().await.expect("counts"),
        source.record_counts().await.expect("counts")
    );

    // Back into the source: everything links.
    let round_trip = import(&source, &exported).await;
    assert_eq!(round_trip.summary.total_imported, 0);
    assert_eq!(round_trip.summary.total_skipped, exported.data.record_total());
}

#[tokio::test]
async fn natural_keys_of_stored_rows_are_findable() {
    let store = MemoryStore::new();
    import(&store, &snapshot(sample_data())).await;

    let key = NaturalKey::Persona {
        name: "Ada".into(),
        profile_name: None,
    };
    assert!(store.find(&key).await.expect("find").is_some());
}
