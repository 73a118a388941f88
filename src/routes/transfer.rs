//! Snapshot export and import endpoints.
//!
//! Uploads are raw request bodies; the original file name travels in the
//! `filename` query parameter because the container format is chosen by its
//! extension.

use crate::config::TransferConfig;
use crate::error::ApiError;
use crate::routes::payload::{SnapshotDownload, UploadedSnapshot};
use crate::transfer::codec::{self, SnapshotFormat, export_filename};
use crate::transfer::store::SharedStore;
use crate::transfer::{
    self, ImportReport, PendingImportTicket, PendingImports, Reconciler, export,
};
use chrono::Utc;
use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::{self, JsonSchema};
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Current contents of the store plus the limits an import runs under.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatus {
    /// Row counts keyed by snapshot collection name.
    pub records: BTreeMap<String, i64>,
    pub total_records: i64,
    pub max_upload_bytes: u64,
    pub batch_size: usize,
}

fn require_filename(filename: Option<String>) -> Result<String, ApiError> {
    filename
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::BadRequest("the 'filename' query parameter is required".into()))
}

/// Download the whole dataset as a `.zip` (default) or `.json` snapshot.
#[openapi(tag = "Transfer")]
#[get("/transfer/export?<format>")]
pub async fn export_snapshot(
    format: Option<String>,
    store: &State<SharedStore>,
) -> Result<SnapshotDownload, ApiError> {
    let format = match format {
        Some(value) => value.parse::<SnapshotFormat>()?,
        None => SnapshotFormat::Archive,
    };

    let exported_at = Utc::now();
    let snapshot = export::build_snapshot(store.inner().as_ref(), exported_at).await?;
    let bytes = codec::encode(&snapshot, format)?;

    Ok(SnapshotDownload {
        filename: export_filename(exported_at, format),
        format,
        bytes,
    })
}

/// Decode an uploaded snapshot and merge it into the store.
///
/// Record-level failures are listed in the report; only an unreadable upload
/// (400/413) or an unreachable database (503) fails the request.
#[openapi(tag = "Transfer")]
#[post("/transfer/imports?<filename>", data = "<upload>")]
pub async fn import_snapshot(
    filename: Option<String>,
    upload: Result<UploadedSnapshot, ApiError>,
    store: &State<SharedStore>,
    config: &State<TransferConfig>,
) -> Result<Json<ImportReport>, ApiError> {
    let filename = require_filename(filename)?;
    let upload = upload?;

    let report =
        transfer::import_file(store.inner().as_ref(), config.inner(), &filename, &upload.0)
            .await?;

    Ok(Json(report))
}

/// Validate an upload and park it until it is applied by token.
#[openapi(tag = "Transfer")]
#[post("/transfer/imports/pending?<filename>", data = "<upload>")]
pub async fn stage_import(
    filename: Option<String>,
    upload: Result<UploadedSnapshot, ApiError>,
    store: &State<SharedStore>,
    config: &State<TransferConfig>,
) -> Result<Json<PendingImportTicket>, ApiError> {
    let filename = require_filename(filename)?;
    let upload = upload?;

    let format = SnapshotFormat::from_filename(&filename)?;
    let snapshot = codec::decode(&upload.0, format, config.max_document_bytes)?;

    let ticket = PendingImports::new(store.inner().as_ref(), config.pending_import_ttl)
        .park(&snapshot)
        .await?;

    Ok(Json(ticket))
}

/// Apply a parked snapshot. Each token can be redeemed once.
#[openapi(tag = "Transfer")]
#[post("/transfer/imports/pending/<token>")]
pub async fn apply_pending_import(
    token: String,
    store: &State<SharedStore>,
    config: &State<TransferConfig>,
) -> Result<Json<ImportReport>, ApiError> {
    let store = store.inner().as_ref();
    let not_found =
        || ApiError::NotFound(format!("pending import {token} does not exist or has expired"));

    let parsed = Uuid::parse_str(token.trim()).map_err(|_| not_found())?;
    let snapshot = PendingImports::new(store, config.pending_import_ttl)
        .claim(parsed)
        .await?
        .ok_or_else(not_found)?;

    let report = Reconciler::new(store, config.scheduler())
        .run(&snapshot)
        .await?;

    Ok(Json(report))
}

/// Per-entity record counts of the store.
#[openapi(tag = "Transfer")]
#[get("/transfer/status")]
pub async fn transfer_status(
    store: &State<SharedStore>,
    config: &State<TransferConfig>,
) -> Result<Json<TransferStatus>, ApiError> {
    let counts = store.record_counts().await?;

    let records: BTreeMap<String, i64> = counts
        .iter()
        .map(|(kind, count)| (kind.collection_name().to_string(), *count))
        .collect();
    let total_records = records.values().sum();

    Ok(Json(TransferStatus {
        records,
        total_records,
        max_upload_bytes: config.max_upload_bytes,
        batch_size: config.batch_size,
    }))
}
