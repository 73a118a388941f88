//! Store → snapshot envelope.

use crate::models::StoredDataset;
use crate::transfer::error::TransferResult;
use crate::transfer::reconciler::is_sensitive_setting;
use crate::transfer::snapshot::{Snapshot, SnapshotData};
use crate::transfer::store::VaultStore;
use chrono::{DateTime, Utc};

/// Read the whole dataset and wrap it in a current-version envelope.
pub async fn build_snapshot(
    store: &dyn VaultStore,
    exported_at: DateTime<Utc>,
) -> TransferResult<Snapshot> {
    let dataset = store.load_dataset().await?;
    let snapshot = Snapshot::new(flatten(dataset), exported_at);

    log::info!(
        "exported {} records across {} sessions",
        snapshot.data.record_total(),
        snapshot.data.chat_sessions.len()
    );

    Ok(snapshot)
}

/// Flatten nested sessions into the envelope arrays and drop sensitive settings.
pub fn flatten(dataset: StoredDataset) -> SnapshotData {
    let StoredDataset {
        character_groups,
        personas,
        characters,
        user_prompts,
        settings,
        sessions,
    } = dataset;

    let mut data = SnapshotData {
        character_groups,
        personas,
        characters,
        user_prompts,
        settings: settings
            .into_iter()
            .filter(|setting| !is_sensitive_setting(&setting.key))
            .collect(),
        ..Default::default()
    };

    for tree in sessions {
        data.chat_sessions.push(tree.session);
        for message in tree.messages {
            data.chat_messages.push(message.message);
            data.message_versions.extend(message.versions);
        }
    }

    data
}
