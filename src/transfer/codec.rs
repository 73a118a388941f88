//! Snapshot containers: flat JSON documents and zip archives.
//!
//! An archive holds the envelope as `database.json` plus a plain-text
//! `manifest.txt` for humans. Decoding validates the envelope's required
//! top-level fields before any typed parsing happens, so a malformed upload is
//! rejected as a whole and never reaches the reconciler.

use crate::transfer::entity::EntityKind;
use crate::transfer::error::{TransferError, TransferResult};
use crate::transfer::snapshot::{FORMAT_VERSION, Snapshot};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::str::FromStr;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Archive entry holding the envelope.
pub const ARCHIVE_DOCUMENT: &str = "database.json";
/// Archive entry holding the human-readable summary.
pub const ARCHIVE_MANIFEST: &str = "manifest.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    Json,
    Archive,
}

impl SnapshotFormat {
    /// Pick the container from an uploaded file name's extension.
    pub fn from_filename(filename: &str) -> TransferResult<Self> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());

        match extension.as_deref() {
            Some("json") => Ok(SnapshotFormat::Json),
            Some("zip") => Ok(SnapshotFormat::Archive),
            _ => Err(TransferError::UnsupportedFileType(filename.to_string())),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            SnapshotFormat::Json => "json",
            SnapshotFormat::Archive => "zip",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            SnapshotFormat::Json => "application/json",
            SnapshotFormat::Archive => "application/zip",
        }
    }
}

impl FromStr for SnapshotFormat {
    type Err = TransferError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(SnapshotFormat::Json),
            "zip" | "archive" => Ok(SnapshotFormat::Archive),
            other => Err(TransferError::UnsupportedFileType(other.to_string())),
        }
    }
}

/// Download name for an export taken at `exported_at`.
pub fn export_filename(exported_at: DateTime<Utc>, format: SnapshotFormat) -> String {
    format!(
        "chat-vault-export-{}.{}",
        exported_at.format("%Y%m%d-%H%M%S"),
        format.extension()
    )
}

/// Serialize `snapshot` into the requested container.
pub fn encode(snapshot: &Snapshot, format: SnapshotFormat) -> TransferResult<Vec<u8>> {
    let document = serde_json::to_vec_pretty(snapshot)?;

    match format {
        SnapshotFormat::Json => Ok(document),
        SnapshotFormat::Archive => encode_archive(snapshot, &document),
    }
}

fn encode_archive(snapshot: &Snapshot, document: &[u8]) -> TransferResult<Vec<u8>> {
    let manifest = render_manifest(snapshot, document);

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    writer.start_file(ARCHIVE_DOCUMENT, options)?;
    writer.write_all(document)?;

    writer.start_file(ARCHIVE_MANIFEST, options)?;
    writer.write_all(manifest.as_bytes())?;

    let cursor = writer.finish()?;
    Ok(cursor.into_inner())
}

/// Plain-text summary shipped next to `database.json`.
pub fn render_manifest(snapshot: &Snapshot, document: &[u8]) -> String {
    let exported_at = snapshot
        .exported_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string());

    let mut lines = vec![
        "Chat Vault export".to_string(),
        format!("Format version: {}", snapshot.format_version),
        format!("Exported at: {exported_at}"),
        format!("SHA-256 ({ARCHIVE_DOCUMENT}): {:x}", Sha256::digest(document)),
        String::new(),
        "Records:".to_string(),
    ];

    for kind in EntityKind::STAGE_ORDER {
        lines.push(format!(
            "  {:<16} {}",
            kind.collection_name(),
            snapshot.data.count(kind)
        ));
    }
    lines.push(format!("  {:<16} {}", "total", snapshot.data.record_total()));
    lines.push(String::new());

    lines.join("\n")
}

/// Extract and validate a snapshot from an uploaded container.
///
/// `max_document_bytes` bounds the JSON envelope after extraction, so an
/// archive cannot inflate past it whatever sizes its entries declare.
pub fn decode(
    bytes: &[u8],
    format: SnapshotFormat,
    max_document_bytes: u64,
) -> TransferResult<Snapshot> {
    let document = match format {
        SnapshotFormat::Json => {
            if bytes.len() as u64 > max_document_bytes {
                return Err(TransferError::PayloadTooLarge {
                    limit: max_document_bytes,
                });
            }
            Cow::Borrowed(bytes)
        }
        SnapshotFormat::Archive => Cow::Owned(read_archive_document(bytes, max_document_bytes)?),
    };

    parse_document(&document)
}

fn read_archive_document(bytes: &[u8], limit: u64) -> TransferResult<Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    // Prefer a top-level entry; fall back to one nested in a wrapping folder.
    let entry_name = archive
        .file_names()
        .find(|name| *name == ARCHIVE_DOCUMENT)
        .or_else(|| {
            archive
                .file_names()
                .find(|name| name.ends_with(&format!("/{ARCHIVE_DOCUMENT}")))
        })
        .map(str::to_string)
        .ok_or(TransferError::MissingArchiveEntry(ARCHIVE_DOCUMENT))?;

    let mut entry = archive.by_name(&entry_name)?;
    if entry.size() > limit {
        return Err(TransferError::PayloadTooLarge { limit });
    }

    // The declared size is untrusted; cap what the decompressor may produce.
    let mut document = Vec::new();
    entry
        .by_ref()
        .take(limit.saturating_add(1))
        .read_to_end(&mut document)?;
    if document.len() as u64 > limit {
        return Err(TransferError::PayloadTooLarge { limit });
    }

    Ok(document)
}

/// Parse a JSON envelope, requiring `formatVersion` and `data`.
pub fn parse_document(document: &[u8]) -> TransferResult<Snapshot> {
    let value: Value = serde_json::from_slice(document)?;

    let has_version = value
        .get("formatVersion")
        .and_then(Value::as_str)
        .is_some_and(|version| !version.trim().is_empty());
    if !has_version {
        return Err(TransferError::MissingField("formatVersion"));
    }

    if !value.get("data").is_some_and(Value::is_object) {
        return Err(TransferError::MissingField("data"));
    }

    let snapshot: Snapshot = serde_json::from_value(value)?;

    if major_version(&snapshot.format_version) != major_version(FORMAT_VERSION) {
        log::warn!(
            "snapshot format {} differs from supported {}; importing anyway",
            snapshot.format_version,
            FORMAT_VERSION
        );
    }

    Ok(snapshot)
}

fn major_version(version: &str) -> &str {
    version.trim().split('.').next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CharacterGroup;
    use crate::transfer::snapshot::SnapshotData;
    use chrono::TimeZone;

    const LIMIT: u64 = 1024 * 1024;

    fn sample_snapshot() -> Snapshot {
        let data = SnapshotData {
            character_groups: vec![CharacterGroup {
                id: 1,
                name: "Fantasy".into(),
                color: "#aa00ff".into(),
                sort_order: 0,
                created_at: None,
            }],
            ..Default::default()
        };
        Snapshot::new(data, Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap())
    }

    #[test]
    fn picks_format_from_extension() {
        assert_eq!(
            SnapshotFormat::from_filename("backup.JSON").unwrap(),
            SnapshotFormat::Json
        );
        assert_eq!(
            SnapshotFormat::from_filename("nested/dir/export.zip").unwrap(),
            SnapshotFormat::Archive
        );
        assert!(matches!(
            SnapshotFormat::from_filename("export.tar.gz"),
            Err(TransferError::UnsupportedFileType(_))
        ));
        assert!(SnapshotFormat::from_filename("no-extension").is_err());
    }

    #[test]
    fn archive_carries_document_and_manifest() {
        let snapshot = sample_snapshot();
        let bytes = encode(&snapshot, SnapshotFormat::Archive).expect("encode archive");

        let mut archive = ZipArchive::new(Cursor::new(bytes.as_slice())).expect("open archive");
        let mut manifest = String::new();
        archive
            .by_name(ARCHIVE_MANIFEST)
            .expect("manifest entry")
            .read_to_string(&mut manifest)
            .expect("read manifest");

        assert!(manifest.contains("Format version: 1.0.0"));
        assert!(manifest.contains("characterGroups"));
        assert!(manifest.contains("SHA-256 (database.json): "));

        let decoded = decode(&bytes, SnapshotFormat::Archive, LIMIT).expect("decode archive");
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn archive_without_document_is_rejected() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("notes.txt", SimpleFileOptions::default())
            .expect("start entry");
        writer.write_all(b"not a snapshot").expect("write entry");
        let bytes = writer.finish().expect("finish archive").into_inner();

        assert!(matches!(
            decode(&bytes, SnapshotFormat::Archive, LIMIT),
            Err(TransferError::MissingArchiveEntry(ARCHIVE_DOCUMENT))
        ));
    }

    #[test]
    fn nested_archive_document_is_found() {
        let document = serde_json::to_vec(&sample_snapshot()).expect("serialize");
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("vault-backup/database.json", SimpleFileOptions::default())
            .expect("start entry");
        writer.write_all(&document).expect("write entry");
        let bytes = writer.finish().expect("finish archive").into_inner();

        let decoded = decode(&bytes, SnapshotFormat::Archive, LIMIT).expect("decode nested");
        assert_eq!(decoded.data.character_groups.len(), 1);
    }

    #[test]
    fn garbage_archive_is_structural_error() {
        let err = decode(b"definitely not a zip", SnapshotFormat::Archive, LIMIT).unwrap_err();
        assert!(matches!(err, TransferError::Archive(_)));
        assert!(err.is_structural());
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        let no_version = br#"{"data": {}}"#;
        assert!(matches!(
            decode(no_version, SnapshotFormat::Json, LIMIT),
            Err(TransferError::MissingField("formatVersion"))
        ));

        let no_data = br#"{"formatVersion": "1.0.0", "exportedAt": "2024-01-01T00:00:00Z"}"#;
        assert!(matches!(
            decode(no_data, SnapshotFormat::Json, LIMIT),
            Err(TransferError::MissingField("data"))
        ));

        assert!(matches!(
            decode(b"{ not json", SnapshotFormat::Json, LIMIT),
            Err(TransferError::Json(_))
        ));
    }

    #[test]
    fn missing_collections_default_to_empty() {
        let minimal = br#"{"formatVersion": "1.0.0", "data": {"userPrompts": [{"id": 4, "title": "Greeting", "body": "Hi"}]}}"#;
        let snapshot = decode(minimal, SnapshotFormat::Json, LIMIT).expect("decode minimal");

        assert_eq!(snapshot.data.user_prompts.len(), 1);
        assert!(snapshot.data.chat_messages.is_empty());
        assert!(snapshot.exported_at.is_none());
        assert_eq!(snapshot.data.record_total(), 1);
    }

    fn archive_with_document(document: &[u8]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        writer
            .start_file(ARCHIVE_DOCUMENT, options)
            .expect("start entry");
        writer.write_all(document).expect("write entry");
        writer.finish().expect("finish archive").into_inner()
    }

    /// Rewrite the uncompressed size recorded for the single entry, in both
    /// the local header and the central directory.
    fn declare_size(mut bytes: Vec<u8>, size: u32) -> Vec<u8> {
        let patch = |bytes: &mut Vec<u8>, signature: [u8; 4], offset: usize| {
            let start = bytes
                .windows(4)
                .position(|window| window == signature)
                .expect("header present");
            bytes[start + offset..start + offset + 4].copy_from_slice(&size.to_le_bytes());
        };
        patch(&mut bytes, [0x50, 0x4b, 0x03, 0x04], 22);
        patch(&mut bytes, [0x50, 0x4b, 0x01, 0x02], 24);
        bytes
    }

    #[test]
    fn declared_size_over_limit_is_rejected_without_reading() {
        let document = serde_json::to_vec(&sample_snapshot()).expect("serialize");
        let bytes = declare_size(archive_with_document(&document), 0xFFFF_FFF0);

        let err = decode(&bytes, SnapshotFormat::Archive, LIMIT).unwrap_err();
        assert!(matches!(err, TransferError::PayloadTooLarge { limit: LIMIT }));
        assert!(err.is_structural());
    }

    #[test]
    fn understated_entry_cannot_inflate_past_limit() {
        // Highly compressible padding: a few hundred bytes on the wire.
        let mut document = br#"{"formatVersion": "1.0.0", "data": {}, "pad": ""#.to_vec();
        document.extend(std::iter::repeat_n(b' ', 64 * 1024));
        document.extend_from_slice(b"\"}");
        let bytes = declare_size(archive_with_document(&document), 16);

        let err = decode(&bytes, SnapshotFormat::Archive, 4096).unwrap_err();
        assert!(matches!(err, TransferError::PayloadTooLarge { limit: 4096 }));
    }

    #[test]
    fn json_document_over_limit_is_rejected() {
        let document = serde_json::to_vec(&sample_snapshot()).expect("serialize");
        assert!(matches!(
            decode(&document, SnapshotFormat::Json, 8),
            Err(TransferError::PayloadTooLarge { limit: 8 })
        ));
    }

    #[test]
    fn export_filename_carries_timestamp() {
        let at = Utc.with_ymd_and_hms(2025, 2, 3, 4, 5, 6).unwrap();
        assert_eq!(
            export_filename(at, SnapshotFormat::Archive),
            "chat-vault-export-20250203-040506.zip"
        );
    }
}
