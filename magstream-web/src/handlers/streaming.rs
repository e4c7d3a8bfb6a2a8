//! Range-aware transcoded streaming endpoint.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::debug;

use super::error::ApiError;
use super::range::{extract_range_header, partial_content_response};
use crate::server::AppState;

/// Query parameters for streaming requests
#[derive(Debug, Deserialize)]
pub struct StreamingQuery {
    /// Magnet link or info hash of the content to stream
    pub magnet: Option<String>,
}

/// Streams the first playable file of the identified content as fragmented MP4.
///
/// The response is always `206 Partial Content` framed against the source
/// file size. The body is produced live by the transcoder and stops when the
/// client disconnects.
pub async fn stream_media(
    State(state): State<AppState>,
    Query(query): Query<StreamingQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(magnet) = query.magnet.filter(|magnet| !magnet.trim().is_empty()) else {
        return ApiError::bad_request("Missing magnet parameter").into_response();
    };

    let range = extract_range_header(&headers);
    debug!("Streaming request: range={:?}", range);

    match state.streamer.open_stream(&magnet, range.as_deref()).await {
        Ok(prepared) => {
            debug!(
                "Request {} streaming {} as {}",
                prepared.request_id,
                prepared.file.relative_path,
                prepared.framing.content_range()
            );
            partial_content_response(prepared)
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}
