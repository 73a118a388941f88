//! HTTP route handlers.
//!
//! Handlers are annotated with `#[openapi]` so `rocket_okapi` can derive the
//! OpenAPI document served under `/api/v1/openapi.json`.

pub mod health;
pub mod payload;
pub mod transfer;
