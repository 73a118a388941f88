//! Snapshot export and reconciling import.
//!
//! Export reads the whole dataset into a versioned envelope ([`snapshot`])
//! and packs it as JSON or a zip archive ([`codec`]). Import decodes such a
//! file and merges it into a store that may already hold overlapping data
//! ([`reconciler`]): records are matched by natural key ([`natural_key`]),
//! exported foreign keys are re-linked through a run-scoped table ([`xref`]),
//! and writes go out in bounded batches ([`scheduler`]). The outcome is an
//! [`ImportReport`].
//!
//! Everything talks to persistence through the [`VaultStore`] trait.

pub mod codec;
pub mod entity;
pub mod error;
pub mod export;
pub mod natural_key;
pub mod pending;
pub mod reconciler;
pub mod report;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod xref;

use crate::config::TransferConfig;

pub use codec::SnapshotFormat;
pub use entity::EntityKind;
pub use error::{RecordError, TransferError, TransferResult};
pub use pending::{PendingImportTicket, PendingImports};
pub use reconciler::Reconciler;
pub use report::ImportReport;
pub use scheduler::BatchScheduler;
pub use snapshot::Snapshot;
pub use store::{SharedStore, StoreError, VaultStore};

/// Decode an uploaded file and reconcile it in one step.
pub async fn import_file(
    store: &dyn VaultStore,
    config: &TransferConfig,
    filename: &str,
    bytes: &[u8],
) -> TransferResult<ImportReport> {
    if bytes.len() as u64 > config.max_upload_bytes {
        return Err(TransferError::PayloadTooLarge {
            limit: config.max_upload_bytes,
        });
    }

    let format = SnapshotFormat::from_filename(filename)?;
    let snapshot = codec::decode(bytes, format, config.max_document_bytes)?;
    Reconciler::new(store, config.scheduler()).run(&snapshot).await
}
