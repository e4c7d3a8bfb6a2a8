//! HTTP byte ranges and their mapping onto source time ranges.
//!
//! Time mapping assumes a constant bitrate across the file: byte offsets are
//! scaled by `duration / size`. This is an approximation and is not frame
//! accurate; variable bitrate sources will start a little before or after the
//! position a player expects.

use super::{StreamingError, StreamingResult};
use crate::source::ByteRange;

/// Validated byte range of a client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    /// First byte, inclusive
    pub start: u64,
    /// Last byte, inclusive
    pub end: u64,
    /// `end - start + 1`
    pub content_length: u64,
}

impl RangeRequest {
    /// The request as an inclusive source byte range.
    pub fn byte_range(&self) -> ByteRange {
        ByteRange::new(self.start, self.end)
    }
}

/// Source time window in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl TimeRange {
    /// Length of the window in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Parses an optional `Range` header against a file size.
///
/// A missing header selects the whole file. A present header must have the
/// form `bytes=<start>-<end>`, where `<end>` defaults to the last byte.
///
/// # Errors
///
/// - `StreamingError::RangeNotSatisfiable` - Non-numeric bounds, bounds outside
///   the file, reversed bounds, or an empty file
///
/// # Examples
/// ```
/// use magstream_core::streaming::parse_range_header;
/// let range = parse_range_header(Some("bytes=100-199"), 1000).unwrap();
/// assert_eq!((range.start, range.end, range.content_length), (100, 199, 100));
/// ```
pub fn parse_range_header(header: Option<&str>, file_size: u64) -> StreamingResult<RangeRequest> {
    let unsatisfiable = |reason: String| StreamingError::RangeNotSatisfiable { reason, file_size };

    if file_size == 0 {
        return Err(unsatisfiable("file is empty".to_string()));
    }

    let Some(header) = header else {
        return Ok(RangeRequest {
            start: 0,
            end: file_size - 1,
            content_length: file_size,
        });
    };

    let spec = header.trim();
    let spec = spec.strip_prefix("bytes=").unwrap_or(spec);
    let (start_str, end_str) = spec
        .split_once('-')
        .ok_or_else(|| unsatisfiable(format!("malformed range '{header}'")))?;

    let start = start_str
        .trim()
        .parse::<u64>()
        .map_err(|_| unsatisfiable(format!("start '{start_str}' is not a number")))?;
    let end = match end_str.trim() {
        "" => file_size - 1,
        value => value
            .parse::<u64>()
            .map_err(|_| unsatisfiable(format!("end '{end_str}' is not a number")))?,
    };

    if start >= file_size {
        return Err(unsatisfiable(format!("start {start} beyond end of file")));
    }
    if end >= file_size {
        return Err(unsatisfiable(format!("end {end} beyond end of file")));
    }
    if start > end {
        return Err(unsatisfiable(format!("start {start} after end {end}")));
    }

    Ok(RangeRequest {
        start,
        end,
        content_length: end - start + 1,
    })
}

/// Maps a byte range onto a time range using the size/duration ratio.
///
/// `start_ms` is rounded down and `end_ms` rounded up, so the window always
/// covers the requested bytes. Degenerate inputs map to an empty window.
pub fn map_byte_range_to_time(
    start_byte: u64,
    end_byte: u64,
    file_size: u64,
    duration_ms: f64,
) -> TimeRange {
    if file_size == 0 || !duration_ms.is_finite() || duration_ms <= 0.0 {
        return TimeRange {
            start_ms: 0,
            end_ms: 0,
        };
    }

    let ms_per_byte = |byte: u64| byte as f64 * duration_ms / file_size as f64;
    TimeRange {
        start_ms: ms_per_byte(start_byte).floor() as u64,
        end_ms: ms_per_byte(end_byte).ceil() as u64,
    }
}
