//! HTTP plumbing shared by the mock peer and the simulated homeserver.

mod federation_client;
mod serve;

pub use federation_client::{FederationClient, FederationError};
pub use serve::spawn_server;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::json;

/// Everything except RFC 3986 unreserved characters.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode one path segment (room ids, event ids, user ids).
pub fn path_segment(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT).to_string()
}

/// Join literal segments into an encoded path rooted at `/`.
pub fn encode_path<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .map(|s| format!("/{}", path_segment(s.as_ref())))
        .collect()
}

/// Matrix-style error body, `{"errcode": ..., "error": ...}`.
pub fn matrix_error(status: StatusCode, errcode: &str, message: impl Into<String>) -> Response {
    let body = json!({ "errcode": errcode, "error": message.into() });
    (status, Json(body)).into_response()
}
