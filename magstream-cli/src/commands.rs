//! CLI command implementations

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Subcommand, ValueEnum};
use magstream_core::config::MagstreamConfig;
use magstream_core::source::{LocalLibraryEngine, ReleaseMode};
use magstream_core::streaming::MetadataProbe;
use magstream_core::{ContentEngine, MagstreamError, MediaSourceResolver, StreamingError};
use tracing::info;

/// Content engine backing the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// Serve files from a local library directory
    Local,
    /// Download sources from the BitTorrent network
    Torrent,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the streaming server
    Serve {
        /// Host to bind to (defaults to MAGSTREAM_HOST or 127.0.0.1)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to (defaults to MAGSTREAM_PORT, PORT or 3000)
        #[arg(short, long)]
        port: Option<u16>,
        /// Content engine
        #[arg(long, value_enum, default_value = "local")]
        engine: EngineKind,
        /// Library directory for the local engine
        #[arg(long, default_value = ".")]
        library: PathBuf,
        /// Download directory for the torrent engine
        #[arg(long, default_value = "downloads")]
        download_dir: PathBuf,
        /// Allowed CORS origin (all origins when unset)
        #[arg(long)]
        cors_origin: Option<String>,
    },
    /// Print the metadata of a media file as JSON
    Probe {
        /// Media file to probe
        file: PathBuf,
    },
    /// Resolve an identifier against a local library and print the selected file
    Resolve {
        /// Magnet link or info hash
        identifier: String,
        /// Library directory
        #[arg(long, default_value = ".")]
        library: PathBuf,
    },
    /// List the entries of a local library with their magnet links
    Library {
        /// Library directory
        #[arg(default_value = ".")]
        library: PathBuf,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve {
            host,
            port,
            engine,
            library,
            download_dir,
            cors_origin,
        } => {
            let mut config = MagstreamConfig::from_env();
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if cors_origin.is_some() {
                config.server.cors_origin = cors_origin;
            }
            serve(config, engine, library, download_dir).await
        }
        Commands::Probe { file } => probe_file(file).await,
        Commands::Resolve {
            identifier,
            library,
        } => resolve_identifier(identifier, library).await,
        Commands::Library { library } => list_library(library).await,
    }
}

async fn serve(
    config: MagstreamConfig,
    kind: EngineKind,
    library: PathBuf,
    download_dir: PathBuf,
) -> anyhow::Result<()> {
    let engine = create_engine(kind, library, download_dir).await?;
    info!("Using {} content engine", engine.name());

    magstream_web::run_server(config, engine)
        .await
        .context("streaming server failed")
}

async fn create_engine(
    kind: EngineKind,
    library: PathBuf,
    download_dir: PathBuf,
) -> anyhow::Result<Arc<dyn ContentEngine>> {
    match kind {
        EngineKind::Local => {
            anyhow::ensure!(
                library.is_dir(),
                "library {} is not a directory",
                library.display()
            );
            Ok(Arc::new(LocalLibraryEngine::new(library)))
        }
        #[cfg(feature = "librqbit")]
        EngineKind::Torrent => {
            let engine = magstream_core::source::TorrentEngine::new(download_dir)
                .await
                .map_err(MagstreamError::from)?;
            Ok(Arc::new(engine))
        }
        #[cfg(not(feature = "librqbit"))]
        EngineKind::Torrent => {
            let _ = (library, download_dir);
            Err(MagstreamError::Configuration {
                reason: "the torrent engine requires building with the `librqbit` feature"
                    .to_string(),
            }
            .into())
        }
    }
}

async fn probe_file(file: PathBuf) -> anyhow::Result<()> {
    let config = MagstreamConfig::from_env();
    let probe = MetadataProbe::new(config.probe);

    let metadata = probe.probe_path(&file).await.map_err(user_error)?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}

async fn resolve_identifier(identifier: String, library: PathBuf) -> anyhow::Result<()> {
    let config = MagstreamConfig::from_env();
    let engine: Arc<dyn ContentEngine> = Arc::new(LocalLibraryEngine::new(library));
    let resolver = MediaSourceResolver::new(engine, config.resolver);

    let outcome = resolver.resolve(&identifier).await;
    let printed = match outcome {
        Ok(media) => {
            let json = serde_json::json!({
                "file": media.file,
                "files": media.files,
            });
            media.lease.release(ReleaseMode::Immediate).await;
            println!("{}", serde_json::to_string_pretty(&json)?);
            Ok(())
        }
        Err(e) => Err(user_error(e)),
    };

    resolver.destroy().await;
    printed
}

/// Wraps a pipeline error with its user-facing message.
fn user_error(error: StreamingError) -> anyhow::Error {
    let error = MagstreamError::from(error);
    let message = error.user_message();
    anyhow::Error::new(error).context(message)
}

async fn list_library(library: PathBuf) -> anyhow::Result<()> {
    let engine = LocalLibraryEngine::new(&library);
    let entries = engine
        .entries()
        .await
        .with_context(|| format!("failed to read library {}", library.display()))?;

    if entries.is_empty() {
        println!("No entries in {}", library.display());
        return Ok(());
    }

    for entry in entries {
        println!("{}  {}", entry.info_hash, entry.name);
        println!("    {}", entry.magnet_link());
    }
    Ok(())
}
