//! Media sources addressed by peer-to-peer content identifiers.
//!
//! The [`ContentEngine`] trait is the seam between the streaming pipeline and
//! whatever actually fetches bytes (a BitTorrent session, a local library, an
//! in-memory fixture). Engines report file metadata asynchronously through a
//! [`SourceEvents`] channel; the [`MediaSourceResolver`] turns that event
//! stream into a single, timeout-bounded resolution.

pub mod info_hash;
pub mod local;
pub mod memory;
pub mod registry;
pub mod resolver;
#[cfg(feature = "librqbit")]
pub mod torrent;

use std::fmt;
use std::pin::Pin;

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

pub use info_hash::InfoHash;
pub use local::LocalLibraryEngine;
pub use memory::{MemoryContentEngine, MemorySource};
pub use registry::HandleRegistry;
pub use resolver::{MediaSourceResolver, ReleaseMode, ResolvedMedia, SourceLease};
#[cfg(feature = "librqbit")]
pub use torrent::TorrentEngine;

/// Readable byte stream over (part of) a source file.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Receiving half of an engine's per-source event channel.
pub type SourceEvents = mpsc::Receiver<SourceEvent>;

/// Capacity of per-source event channels created by engines.
pub const SOURCE_EVENT_CAPACITY: usize = 8;

/// Opaque identifier addressing media content within a peer-to-peer network.
///
/// Typically a magnet URI or a hex info hash. The identifier is never
/// interpreted here; engines decide what they accept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Creates an identifier from raw input, trimming whitespace.
    ///
    /// Returns `None` for empty input.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// Returns the identifier as given by the client.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Magnet links carry long tracker lists; keep log lines readable
        const MAX_DISPLAY: usize = 64;
        if self.0.len() > MAX_DISPLAY {
            let cut = (0..=MAX_DISPLAY)
                .rev()
                .find(|&i| self.0.is_char_boundary(i))
                .unwrap_or(0);
            write!(f, "{}...", &self.0[..cut])
        } else {
            f.write_str(&self.0)
        }
    }
}

/// One file within a media source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// Source this file belongs to
    pub source: ContentId,
    /// Position in the source's enumeration order
    pub index: usize,
    /// File name without directories
    pub name: String,
    /// Total length in bytes
    pub length: u64,
    /// Path relative to the source root
    pub relative_path: String,
}

impl FileEntry {
    /// Lower-cased extension of the file name, if any.
    pub fn extension(&self) -> Option<String> {
        self.name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
    }

    /// Range covering the whole file, or `None` for empty files.
    pub fn full_range(&self) -> Option<ByteRange> {
        if self.length == 0 {
            None
        } else {
            Some(ByteRange::new(0, self.length - 1))
        }
    }
}

/// Inclusive byte range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Creates an inclusive range. Callers validate `start <= end`.
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered by the range.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    /// Inclusive ranges always cover at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Notification from an engine about a registered source.
#[derive(Debug)]
pub enum SourceEvent {
    /// Metadata exchange completed; files are listed in enumeration order
    Ready(Vec<FileEntry>),
    /// The source cannot be served
    Failed(EngineError),
}

/// Errors raised by content engines.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine does not know the requested content.
    #[error("unknown source: {identifier}")]
    UnknownSource {
        /// The identifier that could not be found.
        identifier: String,
    },

    /// The identifier is malformed for this engine.
    #[error("invalid identifier {identifier}: {reason}")]
    InvalidIdentifier {
        /// The rejected identifier.
        identifier: String,
        /// Why the engine rejected it.
        reason: String,
    },

    /// The underlying engine reported a connection or protocol failure.
    #[error("engine failure: {reason}")]
    Backend {
        /// Error message from the engine backend.
        reason: String,
    },

    /// The engine dropped the event channel before reporting metadata.
    #[error("engine closed the source before metadata was available")]
    Closed,

    /// The engine has been shut down.
    #[error("engine has been shut down")]
    ShutDown,

    /// Reading source bytes failed.
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Peer-to-peer content engine capability shared by all requests.
///
/// Registration is per identifier and idempotent: registering an identifier
/// that is already registered must produce a fresh event channel that
/// eventually reports the same files.
#[async_trait::async_trait]
pub trait ContentEngine: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &'static str;

    /// Registers a source and starts fetching its metadata.
    ///
    /// Events are delivered on the returned channel. Engines may send more
    /// than one event; consumers act on the first meaningful one.
    ///
    /// # Errors
    ///
    /// - `EngineError::InvalidIdentifier` - The identifier cannot be used by this engine
    /// - `EngineError::ShutDown` - The engine no longer accepts sources
    async fn register(&self, identifier: &ContentId) -> Result<SourceEvents, EngineError>;

    /// Removes a source and releases its resources. Unknown identifiers are ignored.
    async fn deregister(&self, identifier: &ContentId);

    /// Opens a readable stream over an inclusive byte range of a file.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownSource` - The file's source is not registered
    /// - `EngineError::Io` - The underlying storage could not be read
    async fn open(&self, file: &FileEntry, range: ByteRange) -> Result<ByteStream, EngineError>;

    /// Stops the engine and releases every source. Must be idempotent.
    async fn shutdown(&self);
}

/// Checks whether a file name ends in one of the playable extensions.
pub fn is_playable(name: &str, extensions: &[String]) -> bool {
    let lower = name.to_ascii_lowercase();
    extensions.iter().any(|ext| {
        lower.len() > ext.len()
            && lower.ends_with(ext.as_str())
            && lower.as_bytes()[lower.len() - ext.len() - 1] == b'.'
    })
}

/// Picks the first playable file in enumeration order.
pub fn select_playable_file<'a>(
    files: &'a [FileEntry],
    extensions: &[String],
) -> Option<&'a FileEntry> {
    files.iter().find(|file| is_playable(&file.name, extensions))
}
