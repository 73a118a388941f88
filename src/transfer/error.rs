use crate::transfer::entity::EntityKind;
use crate::transfer::store::StoreError;
use thiserror::Error;

pub type TransferResult<T> = Result<T, TransferError>;

/// Request-level failures: nothing was reconciled when one of these is returned.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("unsupported file type '{0}', expected a .json or .zip snapshot")]
    UnsupportedFileType(String),
    #[error("snapshot exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: u64 },
    #[error("unreadable archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("archive does not contain {0}")]
    MissingArchiveEntry(&'static str),
    #[error("invalid snapshot JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("target store unavailable: {0}")]
    StoreUnavailable(String),
}

impl TransferError {
    /// Structural errors describe the upload; the rest describe the environment.
    pub fn is_structural(&self) -> bool {
        !matches!(self, TransferError::StoreUnavailable(_))
    }
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        TransferError::StoreUnavailable(err.to_string())
    }
}

/// Failure confined to one inbound record.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("{label} {id} is not present in the snapshot", label = .kind.label())]
    UnknownParent { kind: EntityKind, id: i32 },
    #[error("{label} {id} was not imported", label = .kind.label())]
    MissingParent { kind: EntityKind, id: i32 },
    #[error("exported id already resolved in this import")]
    AlreadyResolved,
    #[error("{0}")]
    Store(#[from] StoreError),
}
