//! Request and response bodies for snapshot files.
//!
//! Uploads arrive as the raw request body and downloads leave as an
//! attachment, so neither fits `Json<T>`. Both types describe themselves to
//! `rocket_okapi` so they still show up in the generated OpenAPI document.

use crate::config::{DEFAULT_MAX_UPLOAD_BYTES, TransferConfig};
use crate::error::ApiError;
use crate::transfer::codec::SnapshotFormat;
use rocket::data::{self, Data, FromData, ToByteUnit};
use rocket::http::{ContentType, Header, Status};
use rocket::outcome::Outcome;
use rocket::response::{self, Responder};
use rocket::{Request, Response};
use rocket_okapi::OpenApiError;
use rocket_okapi::okapi::Map;
use rocket_okapi::okapi::openapi3::{MediaType, RefOr, RequestBody, Responses};
use rocket_okapi::okapi::schemars::schema::{InstanceType, SchemaObject};
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::request::OpenApiFromData;
use rocket_okapi::response::OpenApiResponderInner;
use std::io::Cursor;

fn binary_media_type() -> MediaType {
    MediaType {
        schema: Some(SchemaObject {
            instance_type: Some(InstanceType::String.into()),
            format: Some("binary".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A snapshot file read from the request body, bounded by
/// [`TransferConfig::max_upload_bytes`].
#[derive(Debug)]
pub struct UploadedSnapshot(pub Vec<u8>);

#[rocket::async_trait]
impl<'r> FromData<'r> for UploadedSnapshot {
    type Error = ApiError;

    async fn from_data(req: &'r Request<'_>, data: Data<'r>) -> data::Outcome<'r, Self> {
        let limit = req
            .rocket()
            .state::<TransferConfig>()
            .map(|config| config.max_upload_bytes)
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

        match data.open(limit.bytes()).into_bytes().await {
            Ok(capped) if capped.is_complete() => Outcome::Success(UploadedSnapshot(capped.into_inner())),
            Ok(_) => Outcome::Error((
                Status::PayloadTooLarge,
                ApiError::PayloadTooLarge(format!("upload exceeds the {limit} byte limit")),
            )),
            Err(err) => Outcome::Error((
                Status::BadRequest,
                ApiError::BadRequest(format!("failed to read upload: {err}")),
            )),
        }
    }
}

impl<'r> OpenApiFromData<'r> for UploadedSnapshot {
    fn request_body(_generator: &mut OpenApiGenerator) -> Result<RequestBody, OpenApiError> {
        let mut content = Map::new();
        content.insert("application/octet-stream".to_string(), binary_media_type());

        Ok(RequestBody {
            description: Some(
                "Raw `.json` or `.zip` snapshot file; pass its name as `filename`.".to_string(),
            ),
            content,
            required: true,
            ..Default::default()
        })
    }
}

/// An encoded snapshot sent back as a file attachment.
#[derive(Debug)]
pub struct SnapshotDownload {
    pub filename: String,
    pub format: SnapshotFormat,
    pub bytes: Vec<u8>,
}

impl<'r> Responder<'r, 'static> for SnapshotDownload {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let content_type = match self.format {
            SnapshotFormat::Json => ContentType::JSON,
            SnapshotFormat::Archive => ContentType::ZIP,
        };

        Response::build()
            .status(Status::Ok)
            .header(content_type)
            .header(Header::new(
                "Content-Disposition",
                format!("attachment; filename=\"{}\"", self.filename),
            ))
            .sized_body(self.bytes.len(), Cursor::new(self.bytes))
            .ok()
    }
}

impl OpenApiResponderInner for SnapshotDownload {
    fn responses(_generator: &mut OpenApiGenerator) -> Result<Responses, OpenApiError> {
        let mut content = Map::new();
        content.insert(
            SnapshotFormat::Archive.content_type().to_string(),
            binary_media_type(),
        );
        content.insert(
            SnapshotFormat::Json.content_type().to_string(),
            binary_media_type(),
        );

        let mut responses = Responses::default();
        responses.responses.insert(
            "200".to_string(),
            RefOr::Object(rocket_okapi::okapi::openapi3::Response {
                description: "Snapshot file delivered as an attachment.".to_string(),
                content,
                ..Default::default()
            }),
        );
        Ok(responses)
    }
}
