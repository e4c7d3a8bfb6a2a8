//! JSON error responses.

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use magstream_core::StreamingError;
use magstream_core::streaming::ErrorKind;
use serde_json::json;

/// Error returned by API handlers, rendered as `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// Response status
    pub status: StatusCode,
    /// Message placed in the JSON body
    pub message: String,
    /// File size reported in `Content-Range: bytes */size` for 416 responses
    pub file_size: Option<u64>,
}

impl ApiError {
    /// Creates a 400 error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            file_size: None,
        }
    }
}

impl From<StreamingError> for ApiError {
    fn from(error: StreamingError) -> Self {
        let status = match error.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            ErrorKind::Unprocessable => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let file_size = match &error {
            StreamingError::RangeNotSatisfiable { file_size, .. } => Some(*file_size),
            _ => None,
        };

        Self {
            status,
            message: error.to_string(),
            file_size,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        match self.file_size {
            Some(size) => (
                self.status,
                [(header::CONTENT_RANGE, format!("bytes */{size}"))],
                body,
            )
                .into_response(),
            None => (self.status, body).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                StreamingError::NotFound {
                    identifier: "abc".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                StreamingError::NoPlayableFile {
                    identifier: "abc".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                StreamingError::NoMediaStream { kind: "video" },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                StreamingError::ProbeFailed { exit_code: Some(1) },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            let api = ApiError::from(error);
            assert_eq!(api.status, expected);
            assert_eq!(api.file_size, None);
        }
    }

    #[test]
    fn test_unsatisfiable_range_reports_size() {
        let api = ApiError::from(StreamingError::RangeNotSatisfiable {
            reason: "start 6000 beyond end of file".into(),
            file_size: 5000,
        });
        assert_eq!(api.status, StatusCode::RANGE_NOT_SATISFIABLE);

        let response = api.into_response();
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */5000"
        );
    }
}
