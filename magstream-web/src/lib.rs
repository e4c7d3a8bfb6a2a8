//! Magstream Web - HTTP streaming server

#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
//!
//! Exposes the transcode pipeline as a single range-aware streaming endpoint
//! plus a health check, for browser video players and external clients.

pub mod handlers;
pub mod server;

// Re-export main types
pub use server::{AppState, build_router, run_server};
