//! Range-aware transcode streaming.
//!
//! A request flows through source resolution, metadata probing, byte to time
//! range mapping and a live transcode whose output is handed to the HTTP layer
//! as a chunked body.

pub mod probe;
pub mod process;
pub mod pump;
pub mod range;
pub mod session;
pub mod transcode;

use std::time::Duration;

pub use probe::{CodecType, MediaStream, MetadataProbe, StreamMetadata};
pub use process::{ExitReason, ManagedProcess, ProcessExit};
pub use range::{RangeRequest, TimeRange, map_byte_range_to_time, parse_range_header};
pub use session::{
    MediaStreamer, OUTPUT_CONTENT_TYPE, PreparedStream, RequestState, ResponseBody, StreamFraming,
};
pub use transcode::{TranscodeJob, TranscodePipeline};

use crate::source::EngineError;

/// Errors that can occur while preparing or serving a stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    /// The identifier does not address any known content.
    #[error("Nothing found for {identifier}")]
    NotFound {
        /// The identifier as supplied by the client.
        identifier: String,
    },

    /// The content has no file with a playable extension.
    #[error("No playable file in {identifier}")]
    NoPlayableFile {
        /// The identifier of the resolved source.
        identifier: String,
    },

    /// An operation did not complete in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being waited for.
        operation: &'static str,
        /// The elapsed bound.
        after: Duration,
    },

    /// A byte range outside the file was requested from the source.
    #[error("Invalid range {start}-{end} for file of {length} bytes")]
    InvalidRange {
        /// First requested byte.
        start: u64,
        /// Last requested byte, inclusive.
        end: u64,
        /// Length of the file.
        length: u64,
    },

    /// The client's Range header cannot be satisfied.
    #[error("Range not satisfiable: {reason}")]
    RangeNotSatisfiable {
        /// Why the header was rejected.
        reason: String,
        /// Size of the file the range applied to.
        file_size: u64,
    },

    /// The prober exited unsuccessfully.
    #[error("Metadata probe failed with exit code {exit_code:?}")]
    ProbeFailed {
        /// Exit code, `None` when terminated by a signal.
        exit_code: Option<i32>,
    },

    /// The prober's output could not be interpreted.
    #[error("Could not parse probe output: {reason}")]
    ProbeParseError {
        /// What was wrong with the output.
        reason: String,
    },

    /// A required stream kind is missing from the source.
    #[error("Source has no {kind} stream")]
    NoMediaStream {
        /// The missing kind, `video` or `audio`.
        kind: &'static str,
    },

    /// An external program could not be started.
    #[error("Failed to start {program}: {source}")]
    ProcessSpawnError {
        /// Program that failed to start.
        program: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// I/O failure while moving bytes between source, process and client.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The content engine failed.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Coarse classification used to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown content or nothing playable in it
    NotFound,
    /// Range header cannot be served
    RangeNotSatisfiable,
    /// Content exists but cannot be transcoded
    Unprocessable,
    /// Everything on the server side
    Internal,
}

impl StreamingError {
    /// Classifies the error for HTTP status selection.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } | Self::NoPlayableFile { .. } => ErrorKind::NotFound,
            Self::RangeNotSatisfiable { .. } => ErrorKind::RangeNotSatisfiable,
            Self::NoMediaStream { .. } => ErrorKind::Unprocessable,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether the error is caused by the request rather than the server.
    pub fn is_client_error(&self) -> bool {
        self.kind() != ErrorKind::Internal
    }
}

/// Result alias for streaming operations.
pub type StreamingResult<T> = Result<T, StreamingError>;

/// Renders milliseconds as seconds with millisecond precision, e.g. `6.000`.
pub(crate) fn format_seconds(ms: u64) -> String {
    format!("{}.{:03}", ms / 1000, ms % 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        let not_found = StreamingError::NotFound {
            identifier: "abc".into(),
        };
        assert_eq!(not_found.kind(), ErrorKind::NotFound);
        assert!(not_found.is_client_error());

        let unsatisfiable = StreamingError::RangeNotSatisfiable {
            reason: "start beyond end of file".into(),
            file_size: 10,
        };
        assert_eq!(unsatisfiable.kind(), ErrorKind::RangeNotSatisfiable);

        assert_eq!(
            StreamingError::NoMediaStream { kind: "audio" }.kind(),
            ErrorKind::Unprocessable
        );

        let failed = StreamingError::ProbeFailed { exit_code: Some(1) };
        assert_eq!(failed.kind(), ErrorKind::Internal);
        assert!(!failed.is_client_error());
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(6000), "6.000");
        assert_eq!(format_seconds(5994), "5.994");
        assert_eq!(format_seconds(42), "0.042");
    }
}
