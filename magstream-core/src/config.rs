//! Centralized configuration for Magstream.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;

/// Container extensions that are considered directly streamable sources.
pub const PLAYABLE_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "avi", "mov"];

/// Central configuration for all Magstream components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct MagstreamConfig {
    pub resolver: ResolverConfig,
    pub probe: ProbeConfig,
    pub transcode: TranscodeConfig,
    pub server: ServerConfig,
}

/// Media source resolution settings.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// How long to wait for the content engine to report file metadata
    pub metadata_timeout: Duration,
    /// How long an unused source stays registered after its last request
    pub release_grace: Duration,
    /// File name suffixes considered playable, matched case-insensitively
    pub playable_extensions: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            metadata_timeout: Duration::from_secs(30),
            release_grace: Duration::from_secs(60),
            playable_extensions: PLAYABLE_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// External program invocation, optionally behind a wrapper.
///
/// `leading_args` are placed before the generated arguments, which allows
/// running the tool through `nice`, a container runtime or a shell script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl ToolCommand {
    /// Creates a tool invocation without leading arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Creates a tool invocation with a fixed argument prefix.
    pub fn with_leading_args(program: impl Into<String>, leading_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }

    /// Builds a tokio command with the leading arguments already applied.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.leading_args);
        command
    }
}

/// How probe input reaches the prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStrategy {
    /// Source bytes are piped into the prober's standard input
    Stdin,
    /// Source bytes are spooled into a temporary file that the prober reads
    TempFile,
}

impl std::str::FromStr for ProbeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdin" | "pipe" => Ok(Self::Stdin),
            "tempfile" | "temp-file" | "file" => Ok(Self::TempFile),
            _ => Err(format!(
                "Invalid probe strategy: '{s}'. Valid options are: stdin, tempfile"
            )),
        }
    }
}

/// Metadata prober settings.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Prober executable
    pub tool: ToolCommand,
    /// Input delivery strategy
    pub strategy: ProbeStrategy,
    /// Directory for spooled probe input (None = system temp dir)
    pub spool_dir: Option<PathBuf>,
    /// Maximum number of source bytes spooled for the temp file strategy
    pub spool_limit: u64,
    /// Maximum accepted size of the prober's JSON output
    pub max_output_bytes: u64,
    /// Upper bound for a single probe run
    pub timeout: Duration,
    /// Time between SIGTERM and forced kill when a probe is abandoned
    pub termination_grace: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            tool: ToolCommand::new("ffprobe"),
            strategy: ProbeStrategy::Stdin,
            spool_dir: None,
            spool_limit: 32 * 1024 * 1024,      // 32 MiB
            max_output_bytes: 4 * 1024 * 1024, // 4 MiB
            timeout: Duration::from_secs(60),
            termination_grace: Duration::from_secs(2),
        }
    }
}

/// Transcoder settings.
#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    /// Transcoder executable
    pub tool: ToolCommand,
    /// Encoder speed preset
    pub preset: String,
    /// MP4 muxer flags for fragmented, streaming-friendly output
    pub movflags: String,
    /// Chunk size used when feeding source bytes to the transcoder
    pub input_chunk_size: usize,
    /// Chunk size used when reading transcoder output
    pub output_chunk_size: usize,
    /// Time between SIGTERM and forced kill on termination
    pub termination_grace: Duration,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            tool: ToolCommand::new("ffmpeg"),
            preset: "ultrafast".to_string(),
            movflags: "frag_keyframe+empty_moov+default_base_moof".to_string(),
            input_chunk_size: 64 * 1024,  // 64 KiB
            output_chunk_size: 64 * 1024, // 64 KiB
            termination_grace: Duration::from_secs(5),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Allowed CORS origin (None = permissive)
    pub cors_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            cors_origin: None,
        }
    }
}

impl MagstreamConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(seconds) = env_parse::<u64>("MAGSTREAM_METADATA_TIMEOUT") {
            config.resolver.metadata_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("MAGSTREAM_RELEASE_GRACE") {
            config.resolver.release_grace = Duration::from_secs(seconds);
        }

        if let Ok(program) = std::env::var("MAGSTREAM_FFPROBE") {
            config.probe.tool = ToolCommand::new(program);
        }

        if let Ok(program) = std::env::var("MAGSTREAM_FFMPEG") {
            config.transcode.tool = ToolCommand::new(program);
        }

        if let Some(strategy) = env_parse::<ProbeStrategy>("MAGSTREAM_PROBE_STRATEGY") {
            config.probe.strategy = strategy;
        }

        if let Ok(preset) = std::env::var("MAGSTREAM_PRESET") {
            config.transcode.preset = preset;
        }

        if let Ok(host) = std::env::var("MAGSTREAM_HOST") {
            config.server.host = host;
        }

        // PORT is honoured for compatibility with common hosting setups
        if let Some(port) = env_parse::<u16>("PORT") {
            config.server.port = port;
        }

        if let Some(port) = env_parse::<u16>("MAGSTREAM_PORT") {
            config.server.port = port;
        }

        if let Ok(origin) = std::env::var("MAGSTREAM_CORS_ORIGIN")
            && !origin.trim().is_empty()
        {
            config.server.cors_origin = Some(origin);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short timeouts keep failing tests fast.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.resolver.metadata_timeout = Duration::from_secs(2);
        config.resolver.release_grace = Duration::ZERO;
        config.probe.timeout = Duration::from_secs(10);
        config.probe.termination_grace = Duration::from_millis(500);
        config.transcode.termination_grace = Duration::from_secs(1);
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = MagstreamConfig::default();

        assert_eq!(config.resolver.metadata_timeout, Duration::from_secs(30));
        assert_eq!(
            config.resolver.playable_extensions,
            vec!["mp4", "mkv", "webm", "avi", "mov"]
        );
        assert_eq!(config.probe.tool.program, "ffprobe");
        assert_eq!(config.probe.strategy, ProbeStrategy::Stdin);
        assert_eq!(config.transcode.tool.program, "ffmpeg");
        assert_eq!(config.transcode.preset, "ultrafast");
        assert_eq!(
            config.transcode.movflags,
            "frag_keyframe+empty_moov+default_base_moof"
        );
        assert_eq!(config.server.port, 3000);
        assert!(config.server.cors_origin.is_none());
    }

    #[test]
    fn test_probe_strategy_parsing() {
        assert_eq!("stdin".parse::<ProbeStrategy>(), Ok(ProbeStrategy::Stdin));
        assert_eq!(
            "TempFile".parse::<ProbeStrategy>(),
            Ok(ProbeStrategy::TempFile)
        );
        assert!("carrier-pigeon".parse::<ProbeStrategy>().is_err());
    }

    #[test]
    fn test_tool_command_leading_args() {
        let tool = ToolCommand::with_leading_args("nice", vec!["-n".into(), "10".into()]);
        assert_eq!(tool.program, "nice");
        assert_eq!(tool.leading_args, vec!["-n", "10"]);

        let plain = ToolCommand::new("ffmpeg");
        assert!(plain.leading_args.is_empty());
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("MAGSTREAM_METADATA_TIMEOUT", "45");
            std::env::set_var("MAGSTREAM_FFMPEG", "/opt/ffmpeg/bin/ffmpeg");
            std::env::set_var("MAGSTREAM_PROBE_STRATEGY", "tempfile");
            std::env::set_var("MAGSTREAM_PORT", "8088");
            std::env::set_var("MAGSTREAM_CORS_ORIGIN", "http://localhost:5173");
        }

        let config = MagstreamConfig::from_env();

        assert_eq!(config.resolver.metadata_timeout, Duration::from_secs(45));
        assert_eq!(config.transcode.tool.program, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(config.probe.strategy, ProbeStrategy::TempFile);
        assert_eq!(config.server.port, 8088);
        assert_eq!(
            config.server.cors_origin.as_deref(),
            Some("http://localhost:5173")
        );

        // Cleanup
        unsafe {
            std::env::remove_var("MAGSTREAM_METADATA_TIMEOUT");
            std::env::remove_var("MAGSTREAM_FFMPEG");
            std::env::remove_var("MAGSTREAM_PROBE_STRATEGY");
            std::env::remove_var("MAGSTREAM_PORT");
            std::env::remove_var("MAGSTREAM_CORS_ORIGIN");
        }
    }

    #[test]
    fn test_testing_preset_shortens_timeouts() {
        let config = MagstreamConfig::for_testing();
        assert!(config.resolver.metadata_timeout < Duration::from_secs(30));
        assert_eq!(config.resolver.release_grace, Duration::ZERO);
    }
}
