//! HTTP Range request plumbing for transcoded streams
//!
//! Range parsing itself lives in the core; this module reads the header and
//! frames the partial content response around a live transcoder body.

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use magstream_core::streaming::PreparedStream;

/// Extract the Range header value.
///
/// Returns None only when no range header is present. Bytes that are not
/// valid UTF-8 are replaced, so a garbled header fails range parsing with a
/// 416 instead of being served as a whole-file request.
pub fn extract_range_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::RANGE)
        .map(|range| String::from_utf8_lossy(range.as_bytes()).into_owned())
}

/// Builds the 206 response streaming a prepared transcode.
///
/// Partial content is returned even for requests without a Range header,
/// so players always see the byte framing of the source file.
pub fn partial_content_response(prepared: PreparedStream) -> Response {
    let framing = prepared.framing;
    (
        StatusCode::PARTIAL_CONTENT,
        [
            (header::CONTENT_RANGE, framing.content_range()),
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (header::CONTENT_LENGTH, framing.content_length.to_string()),
            (header::CONTENT_TYPE, framing.content_type.to_string()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(prepared.body),
    )
        .into_response()
}
