//! Two-step imports: park a validated snapshot, apply it later by token.
//!
//! The parked snapshot lives in the store, not in process memory, so a ticket
//! survives restarts and can be redeemed by any instance. Tickets are
//! consume-once and expire after the configured TTL.

use crate::transfer::error::TransferResult;
use crate::transfer::snapshot::Snapshot;
use crate::transfer::store::VaultStore;
use chrono::{DateTime, TimeDelta, Utc};
use rocket_okapi::okapi::schemars::{self, JsonSchema};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Handed back when an upload has been validated and parked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PendingImportTicket {
    /// Redeem with `POST /transfer/imports/pending/<token>`.
    pub token: String,
    pub expires_at: DateTime<Utc>,
    /// Records contained in the parked snapshot.
    pub total_records: usize,
}

pub struct PendingImports<'s> {
    store: &'s dyn VaultStore,
    ttl: Duration,
}

impl<'s> PendingImports<'s> {
    pub fn new(store: &'s dyn VaultStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn park(&self, snapshot: &Snapshot) -> TransferResult<PendingImportTicket> {
        let token = Uuid::new_v4();
        let now = Utc::now();
        let expires_at = TimeDelta::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.store
            .save_pending_import(token, snapshot, expires_at)
            .await?;

        log::info!(
            "parked pending import {} ({} records, expires {})",
            token,
            snapshot.data.record_total(),
            expires_at.to_rfc3339()
        );

        Ok(PendingImportTicket {
            token: token.to_string(),
            expires_at,
            total_records: snapshot.data.record_total(),
        })
    }

    /// `None` when the token is unknown, already redeemed, or expired.
    pub async fn claim(&self, token: Uuid) -> TransferResult<Option<Snapshot>> {
        let snapshot = self.store.take_pending_import(token).await?;
        if snapshot.is_none() {
            log::debug!("pending import {} not found", token);
        }
        Ok(snapshot)
    }
}
