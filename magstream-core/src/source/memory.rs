//! In-memory content engine for development and tests.
//!
//! Sources are scripted up front: their files, how long metadata takes to
//! arrive and whether the engine fails or never answers at all.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::{
    ByteRange, ByteStream, ContentEngine, ContentId, EngineError, FileEntry, SOURCE_EVENT_CAPACITY,
    SourceEvent, SourceEvents,
};

/// Scripted behaviour of one in-memory source.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: Vec<(String, Bytes)>,
    metadata_delay: Duration,
    failure: Option<String>,
    never_ready: bool,
    repeat_events: bool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file. Files are enumerated in insertion order.
    pub fn with_file(mut self, path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.files.push((path.into(), data.into()));
        self
    }

    /// Delays the metadata event.
    pub fn with_metadata_delay(mut self, delay: Duration) -> Self {
        self.metadata_delay = delay;
        self
    }

    /// Reports a backend failure instead of metadata.
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    /// Never reports metadata while keeping the event channel open.
    pub fn never_ready(mut self) -> Self {
        self.never_ready = true;
        self
    }

    /// Follows the first event with a duplicate ready event and a late failure.
    pub fn with_repeated_events(mut self) -> Self {
        self.repeat_events = true;
        self
    }

    fn entries(&self, source: &ContentId) -> Vec<FileEntry> {
        self.files
            .iter()
            .enumerate()
            .map(|(index, (path, data))| FileEntry {
                source: source.clone(),
                index,
                name: path.rsplit('/').next().unwrap_or(path).to_string(),
                length: data.len() as u64,
                relative_path: path.clone(),
            })
            .collect()
    }
}

/// Content engine backed by scripted in-memory sources.
#[derive(Default)]
pub struct MemoryContentEngine {
    catalog: RwLock<HashMap<ContentId, MemorySource>>,
    registered: Mutex<HashSet<ContentId>>,
    deregistered: Mutex<Vec<ContentId>>,
    registrations: AtomicUsize,
    deregister_delay: Duration,
    shut_down: AtomicBool,
}

impl MemoryContentEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a source to the catalog under the given identifier.
    pub fn with_source(self, identifier: &str, source: MemorySource) -> Self {
        self.add_source(identifier, source);
        self
    }

    /// Makes every `deregister` take `delay` before the source is dropped.
    pub fn with_deregister_delay(mut self, delay: Duration) -> Self {
        self.deregister_delay = delay;
        self
    }

    /// Adds or replaces a source in the catalog.
    pub fn add_source(&self, identifier: &str, source: MemorySource) {
        let id = ContentId(identifier.trim().to_string());
        self.catalog.write().insert(id, source);
    }

    /// Whether the identifier is currently registered.
    pub fn is_registered(&self, identifier: &str) -> bool {
        ContentId::parse(identifier).is_some_and(|id| self.registered.lock().contains(&id))
    }

    /// Identifiers deregistered so far, in order.
    pub fn deregistrations(&self) -> Vec<ContentId> {
        self.deregistered.lock().clone()
    }

    /// Total number of `register` calls accepted.
    pub fn registration_count(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Whether `shutdown` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ContentEngine for MemoryContentEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn register(&self, identifier: &ContentId) -> Result<SourceEvents, EngineError> {
        if self.is_shut_down() {
            return Err(EngineError::ShutDown);
        }

        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.registered.lock().insert(identifier.clone());

        let (tx, rx) = mpsc::channel(SOURCE_EVENT_CAPACITY);
        let Some(source) = self.catalog.read().get(identifier).cloned() else {
            let _ = tx.try_send(SourceEvent::Failed(EngineError::UnknownSource {
                identifier: identifier.to_string(),
            }));
            return Ok(rx);
        };

        let entries = source.entries(identifier);
        tokio::spawn(async move {
            if !source.metadata_delay.is_zero() {
                tokio::time::sleep(source.metadata_delay).await;
            }

            if source.never_ready {
                tx.closed().await;
                return;
            }

            let first = match &source.failure {
                Some(reason) => SourceEvent::Failed(EngineError::Backend {
                    reason: reason.clone(),
                }),
                None => SourceEvent::Ready(entries.clone()),
            };
            if tx.send(first).await.is_err() {
                return;
            }

            if source.repeat_events {
                let _ = tx.send(SourceEvent::Ready(entries)).await;
                let _ = tx
                    .send(SourceEvent::Failed(EngineError::Backend {
                        reason: "late failure".to_string(),
                    }))
                    .await;
            }
        });

        Ok(rx)
    }

    async fn deregister(&self, identifier: &ContentId) {
        if !self.deregister_delay.is_zero() {
            tokio::time::sleep(self.deregister_delay).await;
        }
        if self.registered.lock().remove(identifier) {
            self.deregistered.lock().push(identifier.clone());
        }
    }

    async fn open(&self, file: &FileEntry, range: ByteRange) -> Result<ByteStream, EngineError> {
        if !self.registered.lock().contains(&file.source) {
            return Err(EngineError::UnknownSource {
                identifier: file.source.to_string(),
            });
        }

        let data = self
            .catalog
            .read()
            .get(&file.source)
            .and_then(|source| source.files.get(file.index))
            .map(|(_, data)| data.clone())
            .ok_or_else(|| EngineError::UnknownSource {
                identifier: file.source.to_string(),
            })?;

        let len = data.len() as u64;
        let start = range.start.min(len);
        let end = range.end.saturating_add(1).min(len);
        let slice = data.slice(start as usize..end.max(start) as usize);
        Ok(Box::pin(Cursor::new(slice)))
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<ContentId> = self.registered.lock().drain().collect();
        self.deregistered.lock().extend(drained);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn engine() -> MemoryContentEngine {
        MemoryContentEngine::new().with_source(
            "abc",
            MemorySource::new()
                .with_file("docs/readme.txt", "hello")
                .with_file("video/movie.mp4", Bytes::from_static(b"0123456789")),
        )
    }

    #[tokio::test]
    async fn test_register_reports_files_in_order() {
        let engine = engine();
        let id = ContentId::parse("abc").unwrap();
        let mut events = engine.register(&id).await.unwrap();

        match events.recv().await {
            Some(SourceEvent::Ready(files)) => {
                assert_eq!(files.len(), 2);
                assert_eq!(files[1].name, "movie.mp4");
                assert_eq!(files[1].relative_path, "video/movie.mp4");
                assert_eq!(files[1].length, 10);
            }
            other => panic!("expected ready event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_source_fails() {
        let engine = engine();
        let id = ContentId::parse("missing").unwrap();
        let mut events = engine.register(&id).await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(SourceEvent::Failed(EngineError::UnknownSource { .. }))
        ));
    }

    #[tokio::test]
    async fn test_open_reads_inclusive_range() {
        let engine = engine();
        let id = ContentId::parse("abc").unwrap();
        let mut events = engine.register(&id).await.unwrap();
        let Some(SourceEvent::Ready(files)) = events.recv().await else {
            panic!("expected ready event");
        };

        let mut stream = engine.open(&files[1], ByteRange::new(2, 5)).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"2345");
    }

    #[tokio::test]
    async fn test_open_after_deregister_fails() {
        let engine = engine();
        let id = ContentId::parse("abc").unwrap();
        let mut events = engine.register(&id).await.unwrap();
        let Some(SourceEvent::Ready(files)) = events.recv().await else {
            panic!("expected ready event");
        };

        engine.deregister(&id).await;
        assert_eq!(engine.deregistrations(), vec![id]);
        assert!(engine.open(&files[0], ByteRange::new(0, 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_register_after_shutdown_rejected() {
        let engine = engine();
        engine.shutdown().await;
        engine.shutdown().await;
        let id = ContentId::parse("abc").unwrap();
        assert!(matches!(
            engine.register(&id).await,
            Err(EngineError::ShutDown)
        ));
    }
}
