//! Live transcoding of a source time window into fragmented MP4.
//!
//! The transcoder reads the source from stdin and writes MP4 fragments to
//! stdout as soon as they are produced. Nothing is buffered beyond one read
//! chunk, so the HTTP client's read rate drives the whole pipeline.

use std::process::Stdio;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::format_seconds;
use super::probe::StreamMetadata;
use super::process::{ManagedProcess, ProcessExit};
use super::pump::{AbortOnDrop, StderrLevel, spawn_input_pump, spawn_stderr_logger};
use super::{StreamingError, StreamingResult};
use crate::config::TranscodeConfig;
use crate::source::ByteStream;

/// Live transcoder output.
pub type TranscodeOutput = BoxStream<'static, std::io::Result<Bytes>>;

/// What to do with one elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecAction {
    /// Pass the stream through unchanged
    Copy,
    /// Re-encode with the named encoder
    Encode(&'static str),
}

impl CodecAction {
    fn as_arg(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Encode(encoder) => encoder,
        }
    }
}

struct CodecRule {
    codec: &'static str,
    action: CodecAction,
}

const VIDEO_RULES: &[CodecRule] = &[CodecRule {
    codec: "h264",
    action: CodecAction::Copy,
}];
const VIDEO_FALLBACK: CodecAction = CodecAction::Encode("libx264");

const AUDIO_RULES: &[CodecRule] = &[CodecRule {
    codec: "aac",
    action: CodecAction::Copy,
}];
const AUDIO_FALLBACK: CodecAction = CodecAction::Encode("aac");

fn select_action(rules: &[CodecRule], fallback: CodecAction, codec: &str) -> CodecAction {
    rules
        .iter()
        .find(|rule| rule.codec.eq_ignore_ascii_case(codec.trim()))
        .map_or(fallback, |rule| rule.action)
}

/// Action for a source video codec. Anything but H.264, HEVC included, is re-encoded.
pub fn video_action(codec: &str) -> CodecAction {
    select_action(VIDEO_RULES, VIDEO_FALLBACK, codec)
}

/// Action for a source audio codec. Anything but AAC is re-encoded.
pub fn audio_action(codec: &str) -> CodecAction {
    select_action(AUDIO_RULES, AUDIO_FALLBACK, codec)
}

/// Builds and runs transcoder invocations.
#[derive(Debug, Clone)]
pub struct TranscodePipeline {
    config: TranscodeConfig,
}

impl TranscodePipeline {
    pub fn new(config: TranscodeConfig) -> Self {
        Self { config }
    }

    /// Transcoder arguments for the time window `[start_ms, end_ms]`.
    ///
    /// # Errors
    /// - `StreamingError::NoMediaStream` - Metadata lacks a video or audio stream
    pub fn build_args(
        &self,
        metadata: &StreamMetadata,
        start_ms: u64,
        end_ms: u64,
    ) -> StreamingResult<Vec<String>> {
        let video = metadata
            .first_video()
            .ok_or(StreamingError::NoMediaStream { kind: "video" })?;
        let audio = metadata
            .first_audio()
            .ok_or(StreamingError::NoMediaStream { kind: "audio" })?;

        let args = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            "pipe:0",
            "-ss",
            format_seconds(start_ms).as_str(),
            "-t",
            format_seconds(end_ms.saturating_sub(start_ms)).as_str(),
            "-c:v",
            video_action(&video.codec_name).as_arg(),
            "-c:a",
            audio_action(&audio.codec_name).as_arg(),
            "-preset",
            self.config.preset.as_str(),
            "-movflags",
            self.config.movflags.as_str(),
            "-f",
            "mp4",
            "pipe:1",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();

        Ok(args)
    }

    /// Starts transcoding `input` and returns immediately.
    ///
    /// Arguments are validated before anything is spawned. The source is fed
    /// to the transcoder by a background pump and stderr is logged.
    ///
    /// # Errors
    ///
    /// - `StreamingError::NoMediaStream` - Metadata lacks a video or audio stream
    /// - `StreamingError::ProcessSpawnError` - Transcoder could not be started
    /// - `StreamingError::Io` - Transcoder pipes were not available
    pub fn convert(
        &self,
        input: ByteStream,
        metadata: &StreamMetadata,
        start_ms: u64,
        end_ms: u64,
    ) -> StreamingResult<TranscodeJob> {
        let args = self.build_args(metadata, start_ms, end_ms)?;
        let tool = &self.config.tool;

        let mut command = tool.command();
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|source| StreamingError::ProcessSpawnError {
                program: tool.program.clone(),
                source,
            })?;

        let label = format!("{} (pid {})", tool.program, child.id().unwrap_or_default());
        debug!("Started {} with args: {}", label, args.join(" "));

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let process = ManagedProcess::new(child, label.clone(), self.config.termination_grace);

        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            return Err(std::io::Error::other("transcoder pipes not captured").into());
        };

        let pump = AbortOnDrop::new(spawn_input_pump(
            input,
            stdin,
            self.config.input_chunk_size,
            label.clone(),
        ));
        if let Some(stderr) = stderr {
            spawn_stderr_logger(stderr, label, StderrLevel::Warn);
        }

        Ok(TranscodeJob {
            process,
            stdout,
            pump,
            chunk_size: self.config.output_chunk_size.max(1),
        })
    }
}

/// A running transcoder with its live output.
///
/// Dropping the job, or the stream returned by [`TranscodeJob::into_output`],
/// terminates the process.
pub struct TranscodeJob {
    process: ManagedProcess,
    stdout: ChildStdout,
    pump: AbortOnDrop<std::io::Result<u64>>,
    chunk_size: usize,
}

impl TranscodeJob {
    /// Transcoder process id.
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Receiver that observes the transcoder exit.
    pub fn exit_watcher(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.process.exit_watcher()
    }

    /// Terminates the transcoder. Idempotent.
    pub async fn terminate(&mut self) -> ProcessExit {
        self.pump.abort();
        self.process.terminate().await
    }

    /// Converts the job into its output stream.
    ///
    /// The stream ends once the transcoder closes stdout and has exited. A
    /// failed input pump or an unsuccessful exit is reported as a final error
    /// item.
    pub fn into_output(self) -> TranscodeOutput {
        let state = OutputState {
            stdout: self.stdout,
            process: self.process,
            pump: Some(self.pump),
            chunk_size: self.chunk_size,
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }

            let mut buffer = vec![0u8; state.chunk_size];
            match state.stdout.read(&mut buffer).await {
                Ok(0) => {
                    state.done = true;
                    match state.finish().await {
                        Ok(()) => None,
                        Err(e) => Some((Err(e), state)),
                    }
                }
                Ok(n) => {
                    buffer.truncate(n);
                    Some((Ok(Bytes::from(buffer)), state))
                }
                Err(e) => {
                    state.done = true;
                    warn!("Failed reading {} output: {}", state.process.label(), e);
                    Some((Err(e), state))
                }
            }
        })
        .boxed()
    }
}

struct OutputState {
    stdout: ChildStdout,
    process: ManagedProcess,
    pump: Option<AbortOnDrop<std::io::Result<u64>>>,
    chunk_size: usize,
    done: bool,
}

impl OutputState {
    /// Collects the exit after stdout reached EOF.
    async fn finish(&mut self) -> std::io::Result<()> {
        let exit = self.process.wait().await?;

        // The transcoder stops reading once the time window is written,
        // a pump still blocked on the source is no longer needed
        if let Some(pump) = self.pump.take() {
            if pump.is_finished() {
                if let Some(Err(e)) = pump.join().await {
                    return Err(e);
                }
            } else {
                pump.abort();
            }
        }

        if exit.success() {
            info!("{} finished", self.process.label());
            Ok(())
        } else {
            Err(std::io::Error::other(format!(
                "{} exited with code {:?}",
                self.process.label(),
                exit.code()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::probe::{CodecType, MediaStream};

    fn metadata(video: Option<&str>, audio: Option<&str>) -> StreamMetadata {
        let mut streams = Vec::new();
        if let Some(codec) = video {
            streams.push(MediaStream {
                index: 0,
                codec_type: CodecType::Video,
                codec_name: codec.to_string(),
            });
        }
        if let Some(codec) = audio {
            streams.push(MediaStream {
                index: 1,
                codec_type: CodecType::Audio,
                codec_name: codec.to_string(),
            });
        }
        StreamMetadata {
            duration_ms: 60_000.0,
            format_name: Some("matroska,webm".to_string()),
            streams,
        }
    }

    fn pipeline() -> TranscodePipeline {
        TranscodePipeline::new(TranscodeConfig::default())
    }

    fn codec_args(args: &[String]) -> (String, String) {
        let value_after = |flag: &str| {
            let pos = args.iter().position(|a| a == flag).unwrap();
            args[pos + 1].clone()
        };
        (value_after("-c:v"), value_after("-c:a"))
    }

    #[test]
    fn test_build_args_full_layout() {
        let args = pipeline()
            .build_args(&metadata(Some("h264"), Some("aac")), 6000, 11_994)
            .unwrap();

        assert_eq!(
            args,
            vec![
                "-hide_banner",
                "-loglevel",
                "error",
                "-i",
                "pipe:0",
                "-ss",
                "6.000",
                "-t",
                "5.994",
                "-c:v",
                "copy",
                "-c:a",
                "copy",
                "-preset",
                "ultrafast",
                "-movflags",
                "frag_keyframe+empty_moov+default_base_moof",
                "-f",
                "mp4",
                "pipe:1",
            ]
        );
    }

    #[test]
    fn test_codec_policy_matrix() {
        for video in ["h264", "hevc", "vp9"] {
            for audio in ["aac", "mp3"] {
                let args = pipeline()
                    .build_args(&metadata(Some(video), Some(audio)), 0, 1000)
                    .unwrap();
                let (v, a) = codec_args(&args);

                let expected_video = if video == "h264" { "copy" } else { "libx264" };
                let expected_audio = if audio == "aac" { "copy" } else { "aac" };
                assert_eq!(v, expected_video, "video {video}");
                assert_eq!(a, expected_audio, "audio {audio}");
            }
        }
    }

    #[test]
    fn test_codec_matching_ignores_case() {
        assert_eq!(video_action("H264"), CodecAction::Copy);
        assert_eq!(audio_action("AAC"), CodecAction::Copy);
        assert_eq!(video_action("HEVC"), CodecAction::Encode("libx264"));
    }

    #[test]
    fn test_missing_streams_rejected() {
        assert!(matches!(
            pipeline().build_args(&metadata(Some("h264"), None), 0, 1000),
            Err(StreamingError::NoMediaStream { kind: "audio" })
        ));
        assert!(matches!(
            pipeline().build_args(&metadata(None, Some("aac")), 0, 1000),
            Err(StreamingError::NoMediaStream { kind: "video" })
        ));
    }

    #[tokio::test]
    async fn test_convert_without_audio_spawns_nothing() {
        let config = TranscodeConfig {
            tool: crate::config::ToolCommand::new("/nonexistent/magstream-ffmpeg"),
            ..TranscodeConfig::default()
        };
        let input: ByteStream = Box::pin(std::io::Cursor::new(Vec::new()));
        let result =
            TranscodePipeline::new(config).convert(input, &metadata(Some("h264"), None), 0, 1000);

        assert!(matches!(result, Err(StreamingError::NoMediaStream { .. })));
    }

    #[tokio::test]
    async fn test_missing_transcoder_is_spawn_error() {
        let config = TranscodeConfig {
            tool: crate::config::ToolCommand::new("/nonexistent/magstream-ffmpeg"),
            ..TranscodeConfig::default()
        };
        let input: ByteStream = Box::pin(std::io::Cursor::new(Vec::new()));
        let result = TranscodePipeline::new(config).convert(
            input,
            &metadata(Some("h264"), Some("aac")),
            0,
            1000,
        );

        assert!(matches!(
            result,
            Err(StreamingError::ProcessSpawnError { .. })
        ));
    }
}
