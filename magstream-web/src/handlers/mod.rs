//! HTTP request handlers organized by functionality

pub mod error;
pub mod health;
pub mod range;
pub mod streaming;

// Re-export handler functions
pub use error::ApiError;
pub use health::{HealthResponse, api_health};
pub use range::{extract_range_header, partial_content_response};
pub use streaming::{StreamingQuery, stream_media};
