//! Content engine serving a local media library.
//!
//! Every top-level entry of the library directory (a single file or a
//! directory tree) is one source. Sources are addressed by the SHA-1 of the
//! entry name, either as a bare hex hash or inside a magnet link, so clients
//! can use the same identifiers they would use against a torrent engine.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

use super::{
    ByteRange, ByteStream, ContentEngine, ContentId, EngineError, FileEntry, InfoHash,
    SOURCE_EVENT_CAPACITY, SourceEvent, SourceEvents,
};

/// One addressable entry of the library.
#[derive(Debug, Clone)]
pub struct LibraryEntry {
    /// Entry name inside the library root
    pub name: String,
    /// Hash the entry is addressed by
    pub info_hash: InfoHash,
    /// Absolute path of the entry
    pub path: PathBuf,
}

impl LibraryEntry {
    /// Magnet link addressing this entry.
    pub fn magnet_link(&self) -> String {
        format!("magnet:?xt=urn:btih:{}&dn={}", self.info_hash, self.name)
    }
}

/// Local directory backed content engine.
pub struct LocalLibraryEngine {
    root: PathBuf,
    registered: Mutex<HashMap<ContentId, Vec<PathBuf>>>,
    shut_down: AtomicBool,
}

impl LocalLibraryEngine {
    /// Creates an engine over the given library directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            registered: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Library root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lists the top-level entries of the library, sorted by name.
    ///
    /// # Errors
    /// - `std::io::Error` - Failed to read the library directory
    pub async fn entries(&self) -> Result<Vec<LibraryEntry>, std::io::Error> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            entries.push(LibraryEntry {
                info_hash: InfoHash::digest(name.as_bytes()),
                name,
                path: entry.path(),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn find_entry(&self, hash: InfoHash) -> Result<Option<LibraryEntry>, std::io::Error> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .find(|entry| entry.info_hash == hash))
    }
}

/// Collects regular files below `path` as `(relative path, absolute path)`,
/// sorted by relative path. A plain file yields itself.
async fn collect_files(path: &Path) -> Result<Vec<(String, PathBuf)>, std::io::Error> {
    let metadata = tokio::fs::metadata(path).await?;
    if metadata.is_file() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Ok(vec![(name, path.to_path_buf())]);
    }

    let mut files = Vec::new();
    let mut pending = vec![path.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let entry_path = entry.path();
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }

            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry_path);
            } else if file_type.is_file()
                && let Ok(relative) = entry_path.strip_prefix(path)
            {
                let relative = relative.to_string_lossy().replace('\\', "/");
                files.push((relative, entry_path));
            }
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

#[async_trait::async_trait]
impl ContentEngine for LocalLibraryEngine {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn register(&self, identifier: &ContentId) -> Result<SourceEvents, EngineError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }

        let hash = InfoHash::from_identifier(identifier)?;
        let (tx, rx) = mpsc::channel(SOURCE_EVENT_CAPACITY);

        let event = match self.find_entry(hash).await {
            Ok(Some(entry)) => match collect_files(&entry.path).await {
                Ok(files) => {
                    let mut entries = Vec::with_capacity(files.len());
                    let mut paths = Vec::with_capacity(files.len());
                    for (index, (relative_path, path)) in files.into_iter().enumerate() {
                        let length = tokio::fs::metadata(&path).await?.len();
                        entries.push(FileEntry {
                            source: identifier.clone(),
                            index,
                            name: relative_path
                                .rsplit('/')
                                .next()
                                .unwrap_or(&relative_path)
                                .to_string(),
                            length,
                            relative_path,
                        });
                        paths.push(path);
                    }

                    tracing::debug!(
                        "Local source {} resolved to {} with {} files",
                        hash,
                        entry.path.display(),
                        entries.len()
                    );
                    self.registered.lock().insert(identifier.clone(), paths);
                    SourceEvent::Ready(entries)
                }
                Err(e) => SourceEvent::Failed(EngineError::Io(e)),
            },
            Ok(None) => SourceEvent::Failed(EngineError::UnknownSource {
                identifier: hash.to_string(),
            }),
            Err(e) => SourceEvent::Failed(EngineError::Io(e)),
        };

        // Fresh channel with spare capacity, cannot be full
        let _ = tx.try_send(event);
        Ok(rx)
    }

    async fn deregister(&self, identifier: &ContentId) {
        if self.registered.lock().remove(identifier).is_some() {
            tracing::debug!("Local source {} deregistered", identifier);
        }
    }

    async fn open(&self, file: &FileEntry, range: ByteRange) -> Result<ByteStream, EngineError> {
        let path = self
            .registered
            .lock()
            .get(&file.source)
            .and_then(|paths| paths.get(file.index).cloned())
            .ok_or_else(|| EngineError::UnknownSource {
                identifier: file.source.to_string(),
            })?;

        let mut handle = tokio::fs::File::open(&path).await?;
        if range.start > 0 {
            handle.seek(SeekFrom::Start(range.start)).await?;
        }
        Ok(Box::pin(handle.take(range.len())))
    }

    async fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            self.registered.lock().clear();
        }
    }
}
