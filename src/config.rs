use crate::transfer::scheduler::{BatchScheduler, DEFAULT_BATCH_PAUSE, DEFAULT_BATCH_SIZE};
use std::env;
use std::time::Duration;

/// Default cap on a single snapshot upload.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

/// Default cap on the JSON envelope extracted from an upload.
pub const DEFAULT_MAX_DOCUMENT_BYTES: u64 = 512 * 1024 * 1024;

/// Default lifetime of a parked import.
pub const DEFAULT_PENDING_IMPORT_TTL: Duration = Duration::from_secs(15 * 60);

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_duration_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Runtime tuning for export and import.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Records written concurrently per batch.
    pub batch_size: usize,
    /// Pause between batches.
    pub batch_pause: Duration,
    /// Uploads larger than this are rejected before parsing.
    pub max_upload_bytes: u64,
    /// Decoded envelopes larger than this are rejected, archives included.
    pub max_document_bytes: u64,
    pub pending_import_ttl: Duration,
}

impl TransferConfig {
    pub fn from_env() -> Self {
        Self {
            batch_size: env_usize("VAULT_IMPORT_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            batch_pause: env_duration_millis("VAULT_IMPORT_BATCH_PAUSE_MS", DEFAULT_BATCH_PAUSE),
            max_upload_bytes: env_u64("VAULT_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES),
            max_document_bytes: env_u64("VAULT_MAX_DOCUMENT_BYTES", DEFAULT_MAX_DOCUMENT_BYTES),
            pending_import_ttl: env_duration_secs(
                "VAULT_PENDING_IMPORT_TTL_SECS",
                DEFAULT_PENDING_IMPORT_TTL,
            ),
        }
    }

    pub fn scheduler(&self) -> BatchScheduler {
        BatchScheduler::new(self.batch_size, self.batch_pause)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_pause: DEFAULT_BATCH_PAUSE,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
            pending_import_ttl: DEFAULT_PENDING_IMPORT_TTL,
        }
    }
}
