//! Container metadata extraction with an external prober.

use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::process::ManagedProcess;
use super::pump::{AbortOnDrop, StderrLevel, spawn_input_pump, spawn_stderr_logger};
use super::{StreamingError, StreamingResult};
use crate::config::{ProbeConfig, ProbeStrategy};
use crate::source::ByteStream;

const PROBE_CHUNK_SIZE: usize = 64 * 1024;

/// Kind of an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecType {
    Video,
    Audio,
    Other,
}

impl CodecType {
    fn from_probe(value: Option<&str>) -> Self {
        match value {
            Some("video") => Self::Video,
            Some("audio") => Self::Audio,
            _ => Self::Other,
        }
    }
}

/// One elementary stream of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaStream {
    pub index: u32,
    pub codec_type: CodecType,
    pub codec_name: String,
}

/// Container and stream metadata of a source file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMetadata {
    /// Total duration in milliseconds, always positive
    pub duration_ms: f64,
    /// Container format as reported by the prober
    pub format_name: Option<String>,
    pub streams: Vec<MediaStream>,
}

impl StreamMetadata {
    /// First video stream in container order.
    pub fn first_video(&self) -> Option<&MediaStream> {
        self.first_of(CodecType::Video)
    }

    /// First audio stream in container order.
    pub fn first_audio(&self) -> Option<&MediaStream> {
        self.first_of(CodecType::Audio)
    }

    fn first_of(&self, kind: CodecType) -> Option<&MediaStream> {
        self.streams.iter().find(|stream| stream.codec_type == kind)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<serde_json::Value>,
    format_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    index: Option<u32>,
    codec_type: Option<String>,
    codec_name: Option<String>,
}

/// Parses the prober's JSON document.
///
/// `format.duration` is given in seconds, as a string or a number.
///
/// # Errors
/// - `StreamingError::ProbeParseError` - Invalid JSON, or a missing or non-positive duration
pub fn parse_probe_output(raw: &[u8]) -> StreamingResult<StreamMetadata> {
    let parse_error = |reason: String| StreamingError::ProbeParseError { reason };

    let output: ProbeOutput =
        serde_json::from_slice(raw).map_err(|e| parse_error(format!("invalid JSON: {e}")))?;
    let format = output
        .format
        .ok_or_else(|| parse_error("missing format section".to_string()))?;

    let seconds = match format.duration {
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        _ => None,
    }
    .ok_or_else(|| parse_error("missing or malformed format.duration".to_string()))?;

    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(parse_error(format!("non-positive duration {seconds}")));
    }

    let streams = output
        .streams
        .into_iter()
        .enumerate()
        .map(|(position, stream)| MediaStream {
            index: stream.index.unwrap_or(position as u32),
            codec_type: CodecType::from_probe(stream.codec_type.as_deref()),
            codec_name: stream.codec_name.unwrap_or_default(),
        })
        .collect();

    Ok(StreamMetadata {
        duration_ms: seconds * 1000.0,
        format_name: format.format_name,
        streams,
    })
}

/// Runs the prober against source bytes.
#[derive(Debug, Clone)]
pub struct MetadataProbe {
    config: ProbeConfig,
}

impl MetadataProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Prober arguments for the given input location.
    pub fn build_args(input: &str) -> Vec<String> {
        [
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
            "-i",
            input,
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect()
    }

    /// Extracts metadata from a source byte stream.
    ///
    /// Depending on the configured strategy the bytes are piped into the
    /// prober or spooled into a temporary file first. The temporary file is
    /// removed on every exit path.
    ///
    /// # Errors
    ///
    /// - `StreamingError::ProbeFailed` - Prober exited with a non-zero code
    /// - `StreamingError::ProbeParseError` - Output was not valid metadata
    /// - `StreamingError::ProcessSpawnError` - Prober could not be started
    /// - `StreamingError::Timeout` - Prober did not finish within the configured bound
    /// - `StreamingError::Io` - Spooling or pipe I/O failed
    pub async fn get_metadata(&self, input: ByteStream) -> StreamingResult<StreamMetadata> {
        let probe = async {
            match self.config.strategy {
                ProbeStrategy::Stdin => self.run(&Self::build_args("pipe:0"), Some(input)).await,
                ProbeStrategy::TempFile => self.probe_spooled(input).await,
            }
        };

        tokio::time::timeout(self.config.timeout, probe)
            .await
            .map_err(|_| StreamingError::Timeout {
                operation: "metadata probe",
                after: self.config.timeout,
            })?
    }

    /// Extracts metadata from a file on disk.
    ///
    /// # Errors
    ///
    /// Same as [`MetadataProbe::get_metadata`] except for spooling errors.
    pub async fn probe_path(&self, path: &Path) -> StreamingResult<StreamMetadata> {
        let args = Self::build_args(&path.to_string_lossy());
        tokio::time::timeout(self.config.timeout, self.run(&args, None))
            .await
            .map_err(|_| StreamingError::Timeout {
                operation: "metadata probe",
                after: self.config.timeout,
            })?
    }

    async fn probe_spooled(&self, input: ByteStream) -> StreamingResult<StreamMetadata> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("magstream-probe-");
        let spool = match &self.config.spool_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };

        let mut file = tokio::fs::File::from_std(spool.as_file().try_clone()?);
        let mut limited = input.take(self.config.spool_limit);
        let copied = tokio::io::copy(&mut limited, &mut file).await?;
        file.flush().await?;
        drop(file);
        drop(limited);

        debug!(
            "Spooled {} bytes for probing into {}",
            copied,
            spool.path().display()
        );

        let args = Self::build_args(&spool.path().to_string_lossy());
        self.run(&args, None).await
    }

    async fn run(&self, args: &[String], input: Option<ByteStream>) -> StreamingResult<StreamMetadata> {
        let tool = &self.config.tool;
        let mut command = tool.command();
        command
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
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
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();
        let mut process = ManagedProcess::new(child, label.clone(), self.config.termination_grace);

        let pump = match (input, stdin) {
            (Some(source), Some(stdin)) => Some(AbortOnDrop::new(spawn_input_pump(
                source,
                stdin,
                PROBE_CHUNK_SIZE,
                label.clone(),
            ))),
            _ => None,
        };
        if let Some(stderr) = stderr {
            spawn_stderr_logger(stderr, label.clone(), StderrLevel::Warn);
        }

        let stdout = stdout.ok_or_else(|| std::io::Error::other("prober stdout not captured"))?;
        let limit = self.config.max_output_bytes;
        let mut output = Vec::new();
        stdout.take(limit + 1).read_to_end(&mut output).await?;

        if output.len() as u64 > limit {
            process.terminate().await;
            return Err(StreamingError::ProbeParseError {
                reason: format!("output exceeds {limit} bytes"),
            });
        }

        let exit = process.wait().await?;

        // Prober is done with its input; stop feeding it
        if let Some(pump) = pump {
            pump.abort();
        }

        if !exit.success() {
            warn!("{} exited with code {:?}", label, exit.code());
            return Err(StreamingError::ProbeFailed {
                exit_code: exit.code(),
            });
        }

        let metadata = parse_probe_output(&output)?;
        debug!(
            "Probed {:.3}s of {} with {} streams",
            metadata.duration_ms / 1000.0,
            metadata.format_name.as_deref().unwrap_or("unknown format"),
            metadata.streams.len()
        );
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FFPROBE_JSON: &str = r#"{
        "streams": [
            {"index": 0, "codec_name": "hevc", "codec_type": "video", "width": 1920},
            {"index": 1, "codec_name": "aac", "codec_type": "audio"},
            {"index": 2, "codec_name": "subrip", "codec_type": "subtitle"}
        ],
        "format": {"format_name": "matroska,webm", "duration": "60.000000", "size": "10000"}
    }"#;

    #[test]
    fn test_parse_ffprobe_output() {
        let metadata = parse_probe_output(FFPROBE_JSON.as_bytes()).unwrap();

        assert_eq!(metadata.duration_ms, 60_000.0);
        assert_eq!(metadata.format_name.as_deref(), Some("matroska,webm"));
        assert_eq!(metadata.streams.len(), 3);
        assert_eq!(metadata.first_video().unwrap().codec_name, "hevc");
        assert_eq!(metadata.first_audio().unwrap().index, 1);
        assert_eq!(metadata.streams[2].codec_type, CodecType::Other);
    }

    #[test]
    fn test_numeric_duration_accepted() {
        let json = r#"{"streams": [], "format": {"duration": 12.5}}"#;
        let metadata = parse_probe_output(json.as_bytes()).unwrap();
        assert_eq!(metadata.duration_ms, 12_500.0);
        assert!(metadata.first_video().is_none());
    }

    #[test]
    fn test_invalid_probe_output_rejected() {
        for json in [
            "not json",
            r#"{"streams": []}"#,
            r#"{"format": {"format_name": "mp4"}}"#,
            r#"{"format": {"duration": "N/A"}}"#,
            r#"{"format": {"duration": "0.000000"}}"#,
            r#"{"format": {"duration": -3}}"#,
        ] {
            assert!(
                matches!(
                    parse_probe_output(json.as_bytes()),
                    Err(StreamingError::ProbeParseError { .. })
                ),
                "{json} should be rejected"
            );
        }
    }

    #[test]
    fn test_probe_args() {
        let args = MetadataProbe::build_args("pipe:0");
        assert_eq!(
            args,
            vec![
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
                "-i",
                "pipe:0"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_prober_is_spawn_error() {
        let config = ProbeConfig {
            tool: crate::config::ToolCommand::new("/nonexistent/magstream-ffprobe"),
            ..ProbeConfig::default()
        };
        let probe = MetadataProbe::new(config);
        let input: ByteStream = Box::pin(std::io::Cursor::new(vec![0u8; 16]));

        assert!(matches!(
            probe.get_metadata(input).await,
            Err(StreamingError::ProcessSpawnError { .. })
        ));
    }
}
