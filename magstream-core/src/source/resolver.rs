//! Resolution of content identifiers to playable files.
//!
//! Each resolve holds a [`SourceLease`]. The engine source is deregistered
//! only after the last lease for an identifier is released, so a failing
//! request never tears down a source another request is still reading.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{
    ByteRange, ByteStream, ContentEngine, ContentId, EngineError, FileEntry, SourceEvent,
    SourceEvents, select_playable_file,
};
use crate::config::ResolverConfig;
use crate::streaming::{StreamingError, StreamingResult};

/// How a lease hands its source back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Keep the source registered for the release grace period
    Linger,
    /// Deregister as soon as no other lease holds the source
    Immediate,
}

#[derive(Debug, Default)]
struct LeaseSlot {
    count: usize,
    epoch: u64,
}

/// Reference counts of registered sources.
///
/// Registering and deregistering an identifier both hold its gate, so a
/// deregister still in flight finishes before a new registration starts.
struct LeaseTable {
    engine: Arc<dyn ContentEngine>,
    slots: Mutex<HashMap<ContentId, LeaseSlot>>,
    gates: Mutex<HashMap<ContentId, Arc<AsyncMutex<()>>>>,
    release_grace: Duration,
}

impl LeaseTable {
    fn acquire(self: &Arc<Self>, id: &ContentId) -> SourceLease {
        let mut slots = self.slots.lock();
        let slot = slots.entry(id.clone()).or_default();
        slot.count += 1;
        tracing::trace!("Lease acquired for {} (holders: {})", id, slot.count);

        SourceLease {
            id: id.clone(),
            table: Arc::clone(self),
            released: false,
        }
    }

    /// Drops one reference. Returns the epoch to deregister at, if this was the last holder.
    fn decrement(&self, id: &ContentId, mode: ReleaseMode) -> Option<u64> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(id)?;
        slot.count = slot.count.saturating_sub(1);
        if slot.count > 0 {
            return None;
        }

        slot.epoch += 1;
        let epoch = slot.epoch;
        if mode == ReleaseMode::Immediate || self.release_grace.is_zero() {
            slots.remove(id);
        }
        Some(epoch)
    }

    /// Removes the slot if nobody re-acquired it since `epoch`.
    fn expire(&self, id: &ContentId, epoch: u64) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(id) {
            Some(slot) if slot.count == 0 && slot.epoch == epoch => {
                slots.remove(id);
                true
            }
            _ => false,
        }
    }

    async fn release(self: Arc<Self>, id: ContentId, mode: ReleaseMode) {
        let Some(epoch) = self.decrement(&id, mode) else {
            return;
        };

        if mode == ReleaseMode::Linger && !self.release_grace.is_zero() {
            tokio::time::sleep(self.release_grace).await;
            if !self.expire(&id, epoch) {
                tracing::trace!("Source {} re-acquired during grace period", id);
                return;
            }
        }

        let gate = self.lock_gate(&id).await;
        if self.slots.lock().get(&id).is_some_and(|slot| slot.count > 0) {
            tracing::trace!("Source {} re-acquired before deregistration", id);
            return;
        }

        tracing::debug!("Deregistering source {} ({:?})", id, mode);
        self.engine.deregister(&id).await;
        drop(gate);
        self.prune_gate(&id);
    }

    async fn lock_gate(&self, id: &ContentId) -> OwnedMutexGuard<()> {
        let gate = Arc::clone(self.gates.lock().entry(id.clone()).or_default());
        gate.lock_owned().await
    }

    /// Drops the gate of `id` unless someone else is holding or waiting on it.
    fn prune_gate(&self, id: &ContentId) {
        let mut gates = self.gates.lock();
        if gates.get(id).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            gates.remove(id);
        }
    }

    fn clear(&self) {
        self.slots.lock().clear();
        self.gates.lock().clear();
    }
}

/// Reference-counted hold on a registered source.
///
/// Dropping a lease releases it with [`ReleaseMode::Linger`].
pub struct SourceLease {
    id: ContentId,
    table: Arc<LeaseTable>,
    released: bool,
}

impl SourceLease {
    /// Identifier of the leased source.
    pub fn id(&self) -> &ContentId {
        &self.id
    }

    /// Releases the lease, deregistering the source if this was the last holder.
    ///
    /// With [`ReleaseMode::Immediate`] deregistration has completed when this returns.
    pub async fn release(mut self, mode: ReleaseMode) {
        self.released = true;
        let table = Arc::clone(&self.table);
        let id = self.id.clone();

        match mode {
            ReleaseMode::Immediate => table.release(id, mode).await,
            ReleaseMode::Linger => {
                tokio::spawn(table.release(id, mode));
            }
        }
    }
}

impl std::fmt::Debug for SourceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceLease")
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for SourceLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let table = Arc::clone(&self.table);
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(table.release(id, ReleaseMode::Linger));
            }
            Err(_) => {
                // Without a runtime nothing can deregister; forget the hold
                table.decrement(&id, ReleaseMode::Immediate);
                tracing::warn!("Lease for {} dropped outside a runtime", id);
            }
        }
    }
}

/// Outcome of a successful resolve.
#[derive(Debug)]
pub struct ResolvedMedia {
    /// Hold on the registered source
    pub lease: SourceLease,
    /// Selected playable file
    pub file: FileEntry,
    /// All files of the source in enumeration order
    pub files: Vec<FileEntry>,
}

/// Resolves identifiers to playable files and opens byte streams over them.
pub struct MediaSourceResolver {
    engine: Arc<dyn ContentEngine>,
    config: ResolverConfig,
    leases: Arc<LeaseTable>,
    destroyed: AtomicBool,
}

impl MediaSourceResolver {
    pub fn new(engine: Arc<dyn ContentEngine>, config: ResolverConfig) -> Self {
        let leases = Arc::new(LeaseTable {
            engine: Arc::clone(&engine),
            slots: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            release_grace: config.release_grace,
        });

        Self {
            engine,
            config,
            leases,
            destroyed: AtomicBool::new(false),
        }
    }

    /// The engine shared by all requests.
    pub fn engine(&self) -> &Arc<dyn ContentEngine> {
        &self.engine
    }

    /// Registers the identifier and selects its first playable file.
    ///
    /// Waits for the first engine event, bounded by the metadata timeout.
    /// Later events on the same channel are ignored. On any failure the lease
    /// is released immediately.
    ///
    /// # Errors
    ///
    /// - `StreamingError::NotFound` - Blank, malformed or unknown identifier
    /// - `StreamingError::NoPlayableFile` - No file has a playable extension
    /// - `StreamingError::Timeout` - Metadata did not arrive in time
    /// - `StreamingError::Engine` - Engine failure or resolver destroyed
    pub async fn resolve(&self, identifier: &str) -> StreamingResult<ResolvedMedia> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(StreamingError::Engine(EngineError::ShutDown));
        }

        let id = ContentId::parse(identifier).ok_or_else(|| StreamingError::NotFound {
            identifier: identifier.to_string(),
        })?;

        let lease = self.leases.acquire(&id);
        tracing::debug!("Registering {} with {} engine", id, self.engine.name());

        let registered = {
            let _gate = self.leases.lock_gate(&id).await;
            self.engine.register(&id).await
        };
        let outcome = match registered {
            Ok(events) => self.await_files(&id, events).await,
            Err(e) => Err(engine_failure(&id, e)),
        };

        let files = match outcome {
            Ok(files) => files,
            Err(e) => {
                lease.release(ReleaseMode::Immediate).await;
                return Err(e);
            }
        };

        let Some(file) = select_playable_file(&files, &self.config.playable_extensions).cloned()
        else {
            tracing::debug!("No playable file among {} files of {}", files.len(), id);
            lease.release(ReleaseMode::Immediate).await;
            return Err(StreamingError::NoPlayableFile {
                identifier: id.to_string(),
            });
        };

        tracing::debug!(
            "Resolved {} to {} ({} bytes)",
            id,
            file.relative_path,
            file.length
        );

        Ok(ResolvedMedia { lease, file, files })
    }

    /// Settles on the first of: metadata, failure, closed channel, timeout.
    async fn await_files(
        &self,
        id: &ContentId,
        mut events: SourceEvents,
    ) -> StreamingResult<Vec<FileEntry>> {
        let timeout = self.config.metadata_timeout;

        tokio::select! {
            event = events.recv() => match event {
                Some(SourceEvent::Ready(files)) => Ok(files),
                Some(SourceEvent::Failed(e)) => Err(engine_failure(id, e)),
                None => Err(StreamingError::Engine(EngineError::Closed)),
            },
            () = tokio::time::sleep(timeout) => {
                tracing::warn!("Metadata for {} not available after {:?}", id, timeout);
                Err(StreamingError::Timeout {
                    operation: "metadata resolution",
                    after: timeout,
                })
            }
        }
    }

    /// Opens a byte stream over an inclusive range of the file.
    ///
    /// Without a range the whole file is streamed.
    ///
    /// # Errors
    ///
    /// - `StreamingError::InvalidRange` - Range outside the file or reversed
    /// - `StreamingError::Engine` - The engine could not open the file
    pub async fn get_stream(
        &self,
        file: &FileEntry,
        range: Option<ByteRange>,
    ) -> StreamingResult<ByteStream> {
        let range = match range {
            Some(range) => range,
            None => file.full_range().ok_or(StreamingError::InvalidRange {
                start: 0,
                end: 0,
                length: 0,
            })?,
        };

        if range.start > range.end || range.end >= file.length {
            return Err(StreamingError::InvalidRange {
                start: range.start,
                end: range.end,
                length: file.length,
            });
        }

        Ok(self.engine.open(file, range).await?)
    }

    /// Releases every source and shuts the engine down. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!("Shutting down {} content engine", self.engine.name());
        self.leases.clear();
        self.engine.shutdown().await;
    }

    /// Whether `destroy` has been called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

fn engine_failure(id: &ContentId, error: EngineError) -> StreamingError {
    match error {
        EngineError::UnknownSource { .. } | EngineError::InvalidIdentifier { .. } => {
            tracing::debug!("Source {} not found: {}", id, error);
            StreamingError::NotFound {
                identifier: id.to_string(),
            }
        }
        other => StreamingError::Engine(other),
    }
}
