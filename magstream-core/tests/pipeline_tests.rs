//! End-to-end tests for the streaming pipeline.
//!
//! The prober and transcoder are replaced by shell scripts so the tests
//! exercise real process spawning, piping and termination without needing
//! ffmpeg on the machine.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use magstream_core::config::{MagstreamConfig, ProbeStrategy, ToolCommand};
use magstream_core::source::{MemoryContentEngine, MemorySource};
use magstream_core::streaming::{ExitReason, RequestState, ResponseBody};
use magstream_core::{MediaStreamer, StreamingError};
use tempfile::TempDir;
use tokio::time::timeout;

const IDENTIFIER: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";

const PROBE_H264_AAC: &str = r#"{
  "streams": [
    {"index": 0, "codec_type": "video", "codec_name": "h264"},
    {"index": 1, "codec_type": "audio", "codec_name": "aac"}
  ],
  "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "60.000000"}
}"#;

/// Test fixture wiring a streamer to scripted tools and an in-memory source.
struct PipelineFixture {
    dir: TempDir,
    engine: Arc<MemoryContentEngine>,
    config: MagstreamConfig,
}

impl PipelineFixture {
    /// Creates a fixture serving one file of `size` bytes under [`IDENTIFIER`].
    fn new(size: usize) -> Self {
        let engine = Arc::new(MemoryContentEngine::new().with_source(
            IDENTIFIER,
            MemorySource::new()
                .with_file("Show/sample.txt", b"notes".to_vec())
                .with_file("Show/episode.mp4", vec![0x42u8; size]),
        ));

        Self {
            dir: TempDir::new().unwrap(),
            engine,
            config: MagstreamConfig::for_testing(),
        }
    }

    fn script(&self, name: &str, body: &str) -> ToolCommand {
        let path = self.dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        ToolCommand::with_leading_args("sh", vec![path.to_string_lossy().into_owned()])
    }

    /// Prober that drains its input and prints `json`.
    fn with_probe_output(mut self, json: &str) -> Self {
        let output = self.dir.path().join("probe.json");
        std::fs::write(&output, json).unwrap();
        self.config.probe.tool = self.script(
            "ffprobe.sh",
            &format!("cat > /dev/null\ncat '{}'\n", output.display()),
        );
        self
    }

    fn with_probe_script(mut self, body: &str) -> Self {
        self.config.probe.tool = self.script("ffprobe.sh", body);
        self
    }

    fn with_transcoder_script(mut self, body: &str) -> Self {
        self.config.transcode.tool = self.script("ffmpeg.sh", body);
        self
    }

    fn streamer(&self) -> MediaStreamer {
        MediaStreamer::from_config(self.engine.clone(), &self.config)
    }

    fn marker(&self) -> PathBuf {
        self.dir.path().join("terminated")
    }
}

async fn collect_body(mut body: ResponseBody) -> (Vec<u8>, RequestState) {
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        bytes.extend_from_slice(&chunk.unwrap());
    }
    (bytes, body.state())
}

async fn wait_for_deregistration(engine: &MemoryContentEngine) {
    timeout(Duration::from_secs(5), async {
        while engine.deregistrations().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("source should be deregistered");
}

fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
}

#[tokio::test]
async fn test_request_without_range_streams_whole_file() {
    let fixture = PipelineFixture::new(5000)
        .with_probe_output(PROBE_H264_AAC)
        .with_transcoder_script("cat > /dev/null\nhead -c 20000 /dev/zero\n");
    let streamer = fixture.streamer();

    let prepared = streamer.open_stream(IDENTIFIER, None).await.unwrap();
    assert_eq!(prepared.file.relative_path, "Show/episode.mp4");
    assert_eq!(prepared.framing.content_length, 5000);
    assert_eq!(prepared.framing.content_range(), "bytes 0-4999/5000");
    assert_eq!(prepared.framing.content_type, "video/mp4");

    let (bytes, state) = collect_body(prepared.body).await;
    assert_eq!(bytes.len(), 5000);
    assert_eq!(state, RequestState::Completed);
}

#[tokio::test]
async fn test_byte_range_maps_to_transcoder_time_window() {
    let fixture = PipelineFixture::new(10_000)
        .with_probe_output(PROBE_H264_AAC)
        .with_transcoder_script("cat > /dev/null\nprintf '%s ' \"$@\"\n");
    let streamer = fixture.streamer();

    let prepared = streamer
        .open_stream(IDENTIFIER, Some("bytes=1000-1999"))
        .await
        .unwrap();
    assert_eq!(prepared.framing.content_range(), "bytes 1000-1999/10000");
    assert_eq!(prepared.framing.content_length, 1000);

    let (bytes, state) = collect_body(prepared.body).await;
    let args = String::from_utf8(bytes).unwrap();
    assert!(args.contains("-i pipe:0 -ss 6.000 -t 5.994"), "{args}");
    assert!(args.contains("-c:v copy -c:a copy"), "{args}");
    assert!(args.trim_end().ends_with("-f mp4 pipe:1"), "{args}");
    assert_eq!(state, RequestState::Completed);
}

#[tokio::test]
async fn test_hevc_source_is_reencoded() {
    let probe = PROBE_H264_AAC.replace("h264", "hevc").replace("aac", "opus");
    let fixture = PipelineFixture::new(4000)
        .with_probe_output(&probe)
        .with_transcoder_script("cat > /dev/null\nprintf '%s ' \"$@\"\n");
    let streamer = fixture.streamer();

    let prepared = streamer.open_stream(IDENTIFIER, None).await.unwrap();
    let (bytes, _) = collect_body(prepared.body).await;
    let args = String::from_utf8(bytes).unwrap();
    assert!(args.contains("-c:v libx264 -c:a aac"), "{args}");
}

#[tokio::test]
async fn test_probe_failure_cleans_up() {
    let mut fixture = PipelineFixture::new(5000)
        .with_probe_script("cat > /dev/null\nexit 1\n")
        .with_transcoder_script("exit 0\n");
    let spool = TempDir::new().unwrap();
    fixture.config.probe.strategy = ProbeStrategy::TempFile;
    fixture.config.probe.spool_dir = Some(spool.path().to_path_buf());
    let streamer = fixture.streamer();

    let result = streamer.open_stream(IDENTIFIER, Some("bytes=0-99")).await;
    assert!(matches!(
        result,
        Err(StreamingError::ProbeFailed { exit_code: Some(1) })
    ));

    // Failures release the source without waiting for the grace period
    assert_eq!(fixture.engine.deregistrations().len(), 1);
    assert!(!fixture.engine.is_registered(IDENTIFIER));
    assert!(dir_is_empty(spool.path()));
}

#[tokio::test]
async fn test_unparseable_probe_output() {
    let fixture = PipelineFixture::new(5000)
        .with_probe_output("{\"format\": {\"duration\": \"N/A\"}}")
        .with_transcoder_script("exit 0\n");
    let streamer = fixture.streamer();

    let result = streamer.open_stream(IDENTIFIER, None).await;
    assert!(matches!(result, Err(StreamingError::ProbeParseError { .. })));
}

#[tokio::test]
async fn test_unsatisfiable_range_releases_source() {
    let fixture = PipelineFixture::new(5000)
        .with_probe_output(PROBE_H264_AAC)
        .with_transcoder_script("exit 0\n");
    let streamer = fixture.streamer();

    let result = streamer
        .open_stream(IDENTIFIER, Some("bytes=6000-7000"))
        .await;
    let Err(error) = result else {
        panic!("range beyond the file must be rejected");
    };
    assert!(matches!(
        error,
        StreamingError::RangeNotSatisfiable {
            file_size: 5000,
            ..
        }
    ));
    assert!(error.is_client_error());
    assert_eq!(fixture.engine.deregistrations().len(), 1);
}

#[tokio::test]
async fn test_source_without_audio_is_rejected() {
    let probe = r#"{
        "streams": [{"index": 0, "codec_type": "video", "codec_name": "h264"}],
        "format": {"duration": "12.0"}
    }"#;
    let fixture = PipelineFixture::new(5000)
        .with_probe_output(probe)
        .with_transcoder_script("exit 0\n");
    let streamer = fixture.streamer();

    let result = streamer.open_stream(IDENTIFIER, None).await;
    assert!(matches!(
        result,
        Err(StreamingError::NoMediaStream { kind: "audio" })
    ));
    assert_eq!(fixture.engine.deregistrations().len(), 1);
}

#[tokio::test]
async fn test_unknown_identifier_is_not_found() {
    let fixture = PipelineFixture::new(5000)
        .with_probe_output(PROBE_H264_AAC)
        .with_transcoder_script("exit 0\n");
    let streamer = fixture.streamer();

    let result = streamer
        .open_stream("magnet:?xt=urn:btih:ffffffffffffffffffffffffffffffffffffffff", None)
        .await;
    assert!(matches!(result, Err(StreamingError::NotFound { .. })));
}

#[tokio::test]
async fn test_missing_transcoder_is_spawn_error() {
    let mut fixture = PipelineFixture::new(5000).with_probe_output(PROBE_H264_AAC);
    fixture.config.transcode.tool = ToolCommand::new("/nonexistent/magstream-ffmpeg");
    let streamer = fixture.streamer();

    let result = streamer.open_stream(IDENTIFIER, None).await;
    assert!(matches!(
        result,
        Err(StreamingError::ProcessSpawnError { .. })
    ));
    assert_eq!(fixture.engine.deregistrations().len(), 1);
}

#[tokio::test]
async fn test_client_abort_terminates_transcoder() {
    let fixture = PipelineFixture::new(5000).with_probe_output(PROBE_H264_AAC);
    let marker = fixture.marker();
    let fixture = fixture.with_transcoder_script(&format!(
        "trap 'echo stopped > \"{}\"; exit 143' TERM\nwhile true; do printf 'fragment'; sleep 0.1; done\n",
        marker.display()
    ));
    let streamer = fixture.streamer();

    let prepared = streamer.open_stream(IDENTIFIER, None).await.unwrap();
    let mut body = prepared.body;
    let first = timeout(Duration::from_secs(5), body.next())
        .await
        .expect("transcoder should produce output")
        .unwrap()
        .unwrap();
    assert!(!first.is_empty());

    let mut exit = body.transcoder_exit();
    drop(body);

    let outcome = *timeout(Duration::from_secs(5), exit.wait_for(Option::is_some))
        .await
        .expect("transcoder should stop after the client goes away")
        .unwrap();
    assert_eq!(outcome.map(|e| e.reason), Some(ExitReason::Terminated));
    assert!(marker.exists());

    // The source lingers for the grace period, which is zero in tests
    wait_for_deregistration(&fixture.engine).await;
}

#[tokio::test]
async fn test_concurrent_requests_share_source() {
    let fixture = PipelineFixture::new(5000)
        .with_probe_output(PROBE_H264_AAC)
        .with_transcoder_script("cat > /dev/null\nhead -c 3000 /dev/zero\n");
    let streamer = fixture.streamer();

    let (first, second) = tokio::join!(
        streamer.open_stream(IDENTIFIER, Some("bytes=0-999")),
        streamer.open_stream(IDENTIFIER, Some("bytes=1000-1999")),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first.request_id, second.request_id);

    let (bytes, _) = collect_body(first.body).await;
    assert_eq!(bytes.len(), 1000);
    assert!(fixture.engine.deregistrations().is_empty());

    let (bytes, _) = collect_body(second.body).await;
    assert_eq!(bytes.len(), 1000);
    wait_for_deregistration(&fixture.engine).await;
    assert_eq!(fixture.engine.deregistrations().len(), 1);
}
