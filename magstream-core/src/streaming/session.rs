//! Per-request state machine tying resolution, probing and transcoding together.
//!
//! [`MediaStreamer::open_stream`] is the single entry point for the HTTP
//! layer. It returns the response framing together with a [`ResponseBody`]
//! that owns every per-request resource: the transcoder, the source lease
//! and the request tracker. Dropping the body before it is exhausted counts
//! as a client abort and tears the pipeline down.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::watch;
use tracing::{Instrument, Span, debug, error, info, warn};
use uuid::Uuid;

use super::probe::MetadataProbe;
use super::process::ProcessExit;
use super::range::{map_byte_range_to_time, parse_range_header};
use super::transcode::{TranscodeJob, TranscodeOutput, TranscodePipeline};
use super::{StreamingError, StreamingResult};
use crate::config::MagstreamConfig;
use crate::source::{ContentEngine, FileEntry, MediaSourceResolver, ReleaseMode, SourceLease};
use crate::tracing_setup::request_span;

/// Content type of every transcoded response.
pub const OUTPUT_CONTENT_TYPE: &str = "video/mp4";

/// Lifecycle of one streaming request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    ResolvingSource,
    ProbingMetadata,
    MappingRange,
    Transcoding,
    Streaming,
    Completed,
    Aborted,
    Failed,
}

impl RequestState {
    /// Whether no further transitions can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ResolvingSource => "resolving_source",
            Self::ProbingMetadata => "probing_metadata",
            Self::MappingRange => "mapping_range",
            Self::Transcoding => "transcoding",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks and logs the state of one request.
///
/// Log lines about the request are emitted inside its span.
#[derive(Debug)]
struct RequestTracker {
    id: Uuid,
    identifier: String,
    state: RequestState,
    started_at: Instant,
    span: Span,
}

impl RequestTracker {
    fn new(identifier: &str) -> Self {
        let id = Uuid::new_v4();
        let identifier = crate::source::ContentId::parse(identifier)
            .map(|id| id.to_string())
            .unwrap_or_default();
        let span = request_span(id, &identifier);
        span.in_scope(|| info!("Request {} started for {}", id, identifier));

        Self {
            id,
            identifier,
            state: RequestState::ResolvingSource,
            started_at: Instant::now(),
            span,
        }
    }

    fn transition(&mut self, next: RequestState) {
        if self.state.is_terminal() {
            return;
        }
        debug!("{} -> {}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, error: &StreamingError) {
        let from = self.state;
        self.transition(RequestState::Failed);
        if error.is_client_error() {
            warn!("Failed while {}: {}", from, error);
        } else {
            error!("Failed while {}: {}", from, error);
        }
    }
}

/// Response framing for a prepared stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFraming {
    /// First byte of the advertised range
    pub start: u64,
    /// Last byte of the advertised range, inclusive
    pub end: u64,
    /// Size of the source file
    pub file_size: u64,
    /// Number of bytes the body carries
    pub content_length: u64,
    pub content_type: &'static str,
}

impl StreamFraming {
    /// Value of the `Content-Range` header.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.file_size)
    }
}

/// A stream ready to be sent to the client.
pub struct PreparedStream {
    pub request_id: Uuid,
    pub file: FileEntry,
    pub framing: StreamFraming,
    pub body: ResponseBody,
}

/// Transcoded response body, capped at the advertised content length.
///
/// Ends with `Completed` at transcoder EOF or when the cap is reached,
/// `Failed` on a stream error and `Aborted` when dropped early.
pub struct ResponseBody {
    output: Option<TranscodeOutput>,
    lease: Option<SourceLease>,
    tracker: RequestTracker,
    remaining: u64,
    sent: u64,
    pid: Option<u32>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl ResponseBody {
    fn new(job: TranscodeJob, lease: SourceLease, tracker: RequestTracker, limit: u64) -> Self {
        let pid = job.pid();
        let exit = job.exit_watcher();
        Self {
            output: Some(job.into_output()),
            lease: Some(lease),
            tracker,
            remaining: limit,
            sent: 0,
            pid,
            exit,
        }
    }

    /// Request id used in log lines.
    pub fn request_id(&self) -> Uuid {
        self.tracker.id
    }

    /// Current request state.
    pub fn state(&self) -> RequestState {
        self.tracker.state
    }

    /// Transcoder process id.
    pub fn transcoder_pid(&self) -> Option<u32> {
        self.pid
    }

    /// Receiver that observes the transcoder exit.
    pub fn transcoder_exit(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }

    fn complete(&mut self) {
        let _entered = self.tracker.span.clone().entered();
        // Dropping the output terminates a transcoder that is still running
        self.output = None;
        if self.remaining > 0 {
            warn!(
                "Transcoder ended after {} bytes, {} short of the advertised length",
                self.sent, self.remaining
            );
        }
        self.tracker.transition(RequestState::Completed);
        info!(
            "Request {} completed: {} bytes in {:.2?}",
            self.tracker.id,
            self.sent,
            self.tracker.started_at.elapsed()
        );
        self.lease.take();
    }

    fn fail(&mut self, error: &std::io::Error) {
        let _entered = self.tracker.span.clone().entered();
        self.output = None;
        self.tracker.transition(RequestState::Failed);
        error!("Failed after {} bytes: {}", self.sent, error);
        if let Some(lease) = self.lease.take() {
            release_now(lease);
        }
    }
}

fn release_now(lease: SourceLease) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(lease.release(ReleaseMode::Immediate));
        }
        Err(_) => drop(lease),
    }
}

impl Stream for ResponseBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let Some(output) = this.output.as_mut() else {
            return Poll::Ready(None);
        };

        match output.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(mut chunk))) => {
                if chunk.len() as u64 >= this.remaining {
                    chunk.truncate(this.remaining as usize);
                    this.sent += chunk.len() as u64;
                    this.remaining = 0;
                    this.complete();
                } else {
                    this.sent += chunk.len() as u64;
                    this.remaining -= chunk.len() as u64;
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.fail(&e);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.complete();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        if self.tracker.state.is_terminal() {
            return;
        }
        let _entered = self.tracker.span.clone().entered();
        self.tracker.transition(RequestState::Aborted);
        info!(
            "Request {} aborted by client after {} bytes, stopping transcoder",
            self.tracker.id, self.sent
        );
        // Output and lease drop after this: transcoder terminated, source lingers
    }
}

/// Prepares transcoded streams for HTTP requests.
pub struct MediaStreamer {
    resolver: Arc<MediaSourceResolver>,
    probe: MetadataProbe,
    pipeline: TranscodePipeline,
}

impl MediaStreamer {
    pub fn new(
        resolver: Arc<MediaSourceResolver>,
        probe: MetadataProbe,
        pipeline: TranscodePipeline,
    ) -> Self {
        Self {
            resolver,
            probe,
            pipeline,
        }
    }

    /// Wires a streamer around an engine using the given configuration.
    pub fn from_config(engine: Arc<dyn ContentEngine>, config: &MagstreamConfig) -> Self {
        let resolver = Arc::new(MediaSourceResolver::new(engine, config.resolver.clone()));
        Self::new(
            resolver,
            MetadataProbe::new(config.probe.clone()),
            TranscodePipeline::new(config.transcode.clone()),
        )
    }

    pub fn resolver(&self) -> &Arc<MediaSourceResolver> {
        &self.resolver
    }

    /// Resolves, probes and starts transcoding the requested range.
    ///
    /// On failure every resource acquired so far is released before the
    /// error is returned.
    ///
    /// # Errors
    ///
    /// - `StreamingError::NotFound` / `NoPlayableFile` - Nothing to play
    /// - `StreamingError::RangeNotSatisfiable` - Range header outside the file
    /// - `StreamingError::Timeout` - Metadata or probe did not finish in time
    /// - `StreamingError::ProbeFailed` / `ProbeParseError` - Metadata unavailable
    /// - `StreamingError::NoMediaStream` - Source lacks video or audio
    /// - `StreamingError::ProcessSpawnError` - Prober or transcoder missing
    /// - `StreamingError::Engine` / `Io` - Source failures
    pub async fn open_stream(
        &self,
        identifier: &str,
        range_header: Option<&str>,
    ) -> StreamingResult<PreparedStream> {
        let tracker = RequestTracker::new(identifier);
        let span = tracker.span.clone();
        self.open_tracked(tracker, identifier, range_header)
            .instrument(span)
            .await
    }

    async fn open_tracked(
        &self,
        mut tracker: RequestTracker,
        identifier: &str,
        range_header: Option<&str>,
    ) -> StreamingResult<PreparedStream> {
        let media = match self.resolver.resolve(identifier).await {
            Ok(media) => media,
            Err(e) => {
                tracker.fail(&e);
                return Err(e);
            }
        };

        let file = media.file;
        let lease = media.lease;

        match self.start_transcode(&mut tracker, &file, range_header).await {
            Ok((framing, job)) => {
                tracker.transition(RequestState::Streaming);
                let body = ResponseBody::new(job, lease, tracker, framing.content_length);
                Ok(PreparedStream {
                    request_id: body.request_id(),
                    file,
                    framing,
                    body,
                })
            }
            Err(e) => {
                tracker.fail(&e);
                lease.release(ReleaseMode::Immediate).await;
                Err(e)
            }
        }
    }

    async fn start_transcode(
        &self,
        tracker: &mut RequestTracker,
        file: &FileEntry,
        range_header: Option<&str>,
    ) -> StreamingResult<(StreamFraming, TranscodeJob)> {
        let range = parse_range_header(range_header, file.length)?;
        debug!(
            "{} bytes {}-{} of {} ({})",
            tracker.identifier, range.start, range.end, file.length, file.name
        );

        tracker.transition(RequestState::ProbingMetadata);
        let probe_input = self.resolver.get_stream(file, None).await?;
        let metadata = self.probe.get_metadata(probe_input).await?;

        tracker.transition(RequestState::MappingRange);
        let window =
            map_byte_range_to_time(range.start, range.end, file.length, metadata.duration_ms);
        debug!(
            "Bytes {}-{} map to {}ms-{}ms",
            range.start, range.end, window.start_ms, window.end_ms
        );

        tracker.transition(RequestState::Transcoding);
        let input = self.resolver.get_stream(file, None).await?;
        let job = self
            .pipeline
            .convert(input, &metadata, window.start_ms, window.end_ms)?;

        let framing = StreamFraming {
            start: range.start,
            end: range.end,
            file_size: file.length,
            content_length: range.content_length,
            content_type: OUTPUT_CONTENT_TYPE,
        };
        Ok((framing, job))
    }
}
