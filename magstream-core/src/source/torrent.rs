//! BitTorrent content engine backed by a librqbit session.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use librqbit::{
    AddTorrent, AddTorrentOptions, AddTorrentResponse, ManagedTorrent, Session, TorrentIdOrHash,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

use super::{
    ByteRange, ByteStream, ContentEngine, ContentId, EngineError, FileEntry, HandleRegistry,
    SOURCE_EVENT_CAPACITY, SourceEvent, SourceEvents,
};

type Torrents = Arc<HandleRegistry<Arc<ManagedTorrent>>>;

/// Content engine downloading sources from the BitTorrent network.
pub struct TorrentEngine {
    session: Arc<Session>,
    torrents: Torrents,
    shut_down: AtomicBool,
}

impl TorrentEngine {
    /// Starts a session storing downloads below `download_dir`.
    ///
    /// # Errors
    /// - `EngineError::Io` - Download directory could not be created
    /// - `EngineError::Backend` - Session failed to start
    pub async fn new(download_dir: PathBuf) -> Result<Self, EngineError> {
        tokio::fs::create_dir_all(&download_dir).await?;
        tracing::debug!("Storing torrent downloads in {}", download_dir.display());

        let session = Session::new_with_opts(download_dir, librqbit::SessionOptions::default())
            .await
            .map_err(backend_error)?;

        Ok(Self {
            session,
            torrents: Arc::new(HandleRegistry::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    fn handle(&self, id: &ContentId) -> Result<Arc<ManagedTorrent>, EngineError> {
        self.torrents
            .get(id)
            .ok_or_else(|| EngineError::UnknownSource {
                identifier: id.to_string(),
            })
    }
}

fn backend_error(error: impl std::fmt::Display) -> EngineError {
    EngineError::Backend {
        reason: error.to_string(),
    }
}

fn file_entries(id: &ContentId, handle: &ManagedTorrent) -> Result<Vec<FileEntry>, EngineError> {
    let metadata = handle
        .metadata
        .load_full()
        .ok_or_else(|| backend_error("torrent metadata not available"))?;

    let details = metadata.info.iter_file_details().map_err(backend_error)?;
    let mut entries = Vec::new();
    for (index, detail) in details.enumerate() {
        let relative_path = detail.filename.to_string().map_err(backend_error)?;
        entries.push(FileEntry {
            source: id.clone(),
            index,
            name: relative_path
                .rsplit('/')
                .next()
                .unwrap_or(&relative_path)
                .to_string(),
            length: detail.len,
            relative_path,
        });
    }
    Ok(entries)
}

async fn remove_torrent(session: &Session, id: &ContentId, handle: &ManagedTorrent) {
    if let Err(e) = session
        .delete(TorrentIdOrHash::Hash(handle.info_hash()), false)
        .await
    {
        tracing::warn!("Failed to remove torrent {}: {}", id, e);
    }
}

#[async_trait::async_trait]
impl ContentEngine for TorrentEngine {
    fn name(&self) -> &'static str {
        "torrent"
    }

    async fn register(&self, identifier: &ContentId) -> Result<SourceEvents, EngineError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }

        let (tx, rx) = mpsc::channel(SOURCE_EVENT_CAPACITY);
        let session = Arc::clone(&self.session);
        let torrents = Arc::clone(&self.torrents);
        let id = identifier.clone();
        torrents.begin(&id);

        tokio::spawn(async move {
            let options = AddTorrentOptions {
                overwrite: true,
                ..Default::default()
            };

            let handle = match session
                .add_torrent(AddTorrent::from_url(id.as_str()), Some(options))
                .await
            {
                Ok(
                    AddTorrentResponse::Added(_, handle)
                    | AddTorrentResponse::AlreadyManaged(_, handle),
                ) => handle,
                Ok(_) => {
                    let _ = tx
                        .send(SourceEvent::Failed(backend_error(
                            "unexpected add_torrent response",
                        )))
                        .await;
                    return;
                }
                Err(e) => {
                    let _ = tx.send(SourceEvent::Failed(backend_error(e))).await;
                    return;
                }
            };

            let entries = match handle.wait_until_initialized().await {
                Ok(()) => file_entries(&id, &handle),
                Err(e) => Err(backend_error(e)),
            };

            // Keep the torrent whatever the outcome; deregister removes it.
            if let Err(handle) = torrents.complete(&id, Arc::clone(&handle)) {
                tracing::debug!("Registration of {} finished after deregister", id);
                remove_torrent(&session, &id, &handle).await;
                return;
            }

            let event = match entries {
                Ok(entries) => SourceEvent::Ready(entries),
                Err(e) => SourceEvent::Failed(e),
            };
            if tx.send(event).await.is_err() {
                tracing::debug!("Metadata for {} arrived after the request gave up", id);
            }
        });

        Ok(rx)
    }

    async fn deregister(&self, identifier: &ContentId) {
        // A pending registration removes its own torrent once it completes.
        let Some(handle) = self.torrents.cancel(identifier) else {
            return;
        };
        remove_torrent(&self.session, identifier, &handle).await;
    }

    async fn open(&self, file: &FileEntry, range: ByteRange) -> Result<ByteStream, EngineError> {
        let handle = self.handle(&file.source)?;
        let mut stream = handle.stream(file.index).map_err(backend_error)?;
        if range.start > 0 {
            stream.seek(SeekFrom::Start(range.start)).await?;
        }
        Ok(Box::pin(stream.take(range.len())))
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.torrents.clear();
        self.session.stop().await;
    }
}
