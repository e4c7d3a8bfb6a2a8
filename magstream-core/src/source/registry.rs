//! Bookkeeping for engine handles whose registration finishes in the background.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::ContentId;

#[derive(Debug)]
enum Entry<H> {
    Pending,
    Ready(H),
}

/// Handles keyed by identifier, including registrations still in flight.
///
/// `begin` is called when a registration starts and `cancel` when the
/// identifier is deregistered. A background registration hands its handle to
/// `complete`, which gives it back if the identifier was cancelled meanwhile so
/// the caller can discard it instead of leaking it.
#[derive(Debug)]
pub struct HandleRegistry<H> {
    entries: Mutex<HashMap<ContentId, Entry<H>>>,
}

impl<H> Default for HandleRegistry<H> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<H: Clone> HandleRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a registration of `id` as in flight. A ready handle is kept.
    pub fn begin(&self, id: &ContentId) {
        self.entries
            .lock()
            .entry(id.clone())
            .or_insert(Entry::Pending);
    }

    /// Stores the handle of a finished registration.
    ///
    /// # Errors
    /// Returns the handle back when `id` was cancelled while pending.
    pub fn complete(&self, id: &ContentId, handle: H) -> Result<(), H> {
        let mut entries = self.entries.lock();
        match entries.get_mut(id) {
            Some(entry) => {
                *entry = Entry::Ready(handle);
                Ok(())
            }
            None => Err(handle),
        }
    }

    /// Forgets `id`, returning its handle if the registration had finished.
    pub fn cancel(&self, id: &ContentId) -> Option<H> {
        match self.entries.lock().remove(id)? {
            Entry::Ready(handle) => Some(handle),
            Entry::Pending => None,
        }
    }

    /// The ready handle for `id`.
    pub fn get(&self, id: &ContentId) -> Option<H> {
        match self.entries.lock().get(id)? {
            Entry::Ready(handle) => Some(handle.clone()),
            Entry::Pending => None,
        }
    }

    /// Whether a registration of `id` is in flight or finished.
    pub fn contains(&self, id: &ContentId) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Forgets everything.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
