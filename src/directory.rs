//! Data directories and the machinery that turns them into typed content.
//!
//! Each [`ImageDirectoryEntry`](ImageDirectoryEntry) that has a registered loader gets one slot in
//! a [`ContentCache`](ContentCache). A slot starts out not loaded; the first request runs the loader
//! while holding the slot's lock, and whatever the loader produced, content or error, is what every
//! later request sees until the slot is reset.

use log::{debug, trace};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{Error, Result};
use crate::clr::{self, CLRContent};
use crate::exports::{self, ExportContent};
use crate::headers::ImageDirectoryEntry;
use crate::image::Image;
use crate::imports::{self, ImportContent};
use crate::resources::{self, ResourceContent};
use crate::tls::{self, TLSContent};
use crate::types::{Location, RVA};

/// A (type, RVA, size) triple from the optional header.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct DataDirectory {
    pub entry: ImageDirectoryEntry,
    pub virtual_address: RVA,
    pub size: u32,
}
impl DataDirectory {
    /// A directory with a zero RVA and a zero size is absent. That is not an error.
    pub fn is_empty(&self) -> bool {
        self.virtual_address.0 == 0 && self.size == 0
    }
    /// Check whether the given RVA lies inside ```[VirtualAddress, VirtualAddress+Size)```.
    pub fn contains(&self, rva: RVA) -> bool {
        self.virtual_address.0 <= rva.0 && (rva.0 as u64) < self.end()
    }
    /// The RVA one past the end of the directory.
    pub fn end(&self) -> u64 {
        self.virtual_address.0 as u64 + self.size as u64
    }
}

/// The decoded content of a data directory.
#[derive(Clone, Debug)]
pub enum DirectoryContent {
    Export(Arc<ExportContent>),
    Import(Arc<ImportContent>),
    Resource(Arc<ResourceContent>),
    TLS(Arc<TLSContent>),
    CLR(Arc<CLRContent>),
}
impl DirectoryContent {
    pub fn as_exports(&self) -> Option<&Arc<ExportContent>> {
        if let DirectoryContent::Export(e) = self { Some(e) } else { None }
    }
    pub fn as_imports(&self) -> Option<&Arc<ImportContent>> {
        if let DirectoryContent::Import(i) = self { Some(i) } else { None }
    }
    pub fn as_resources(&self) -> Option<&Arc<ResourceContent>> {
        if let DirectoryContent::Resource(r) = self { Some(r) } else { None }
    }
    pub fn as_tls(&self) -> Option<&Arc<TLSContent>> {
        if let DirectoryContent::TLS(t) = self { Some(t) } else { None }
    }
    pub fn as_clr(&self) -> Option<&Arc<CLRContent>> {
        if let DirectoryContent::CLR(c) = self { Some(c) } else { None }
    }
    /// Check whether two handles refer to the very same loaded content.
    pub fn ptr_eq(&self, other: &DirectoryContent) -> bool {
        match (self, other) {
            (DirectoryContent::Export(a), DirectoryContent::Export(b)) => Arc::ptr_eq(a, b),
            (DirectoryContent::Import(a), DirectoryContent::Import(b)) => Arc::ptr_eq(a, b),
            (DirectoryContent::Resource(a), DirectoryContent::Resource(b)) => Arc::ptr_eq(a, b),
            (DirectoryContent::TLS(a), DirectoryContent::TLS(b)) => Arc::ptr_eq(a, b),
            (DirectoryContent::CLR(a), DirectoryContent::CLR(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A cooperative cancellation flag for content loads.
///
/// Loaders poll it between reads through [`LoadContext::checkpoint`](LoadContext::checkpoint).
#[derive(Clone, Default, Debug)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a loader gets to work with.
pub struct LoadContext<'a> {
    pub image: &'a Image,
    pub directory: DataDirectory,
    pub location: Location,
    pub cancel: Option<&'a CancelToken>,
}
impl<'a> LoadContext<'a> {
    /// Fail with [`Error::Cancelled`](Error::Cancelled) if the load has been cancelled.
    pub fn checkpoint(&self) -> Result<()> {
        match self.cancel {
            Some(token) if token.is_cancelled() => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Builds the content of one kind of data directory.
///
/// A loader runs while its cache slot is locked, so it must not request content of its own
/// directory type from the image.
pub type Loader = fn(&LoadContext<'_>) -> Result<DirectoryContent>;

/// Maps directory types to the loaders that decode them.
///
/// Directory types without a loader have no content: asking for them yields ```None```, never an error.
#[derive(Clone)]
pub struct DirectoryContentRegistry {
    loaders: HashMap<ImageDirectoryEntry, Loader>,
}
impl DirectoryContentRegistry {
    /// A registry without any loaders.
    pub fn empty() -> Self {
        Self { loaders: HashMap::new() }
    }
    /// Register a loader, returning the one it replaced.
    pub fn register(&mut self, entry: ImageDirectoryEntry, loader: Loader) -> Option<Loader> {
        self.loaders.insert(entry, loader)
    }
    pub fn get(&self, entry: ImageDirectoryEntry) -> Option<Loader> {
        self.loaders.get(&entry).copied()
    }
    pub fn contains(&self, entry: ImageDirectoryEntry) -> bool {
        self.loaders.contains_key(&entry)
    }
}
impl Default for DirectoryContentRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();

        registry.register(ImageDirectoryEntry::Export, exports::load);
        registry.register(ImageDirectoryEntry::Import, imports::load);
        registry.register(ImageDirectoryEntry::Resource, resources::load);
        registry.register(ImageDirectoryEntry::TLS, tls::load);
        registry.register(ImageDirectoryEntry::CLRRuntimeHeader, clr::load);

        registry
    }
}
impl fmt::Debug for DirectoryContentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.loaders.keys()).finish()
    }
}

/// The observable state of a cache slot.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ContentStatus {
    NotLoaded,
    Loading,
    Loaded,
    Failed,
}

#[derive(Clone, Debug)]
enum ContentState {
    NotLoaded,
    Loaded(DirectoryContent),
    Failed(Error),
}

/// Per-directory content slots with single-flight loading.
#[derive(Debug)]
pub struct ContentCache {
    slots: HashMap<ImageDirectoryEntry, Mutex<ContentState>>,
}
impl ContentCache {
    pub fn new() -> Self {
        let slots = ImageDirectoryEntry::ALL
            .iter()
            .map(|&entry| (entry, Mutex::new(ContentState::NotLoaded)))
            .collect();

        Self { slots }
    }
    fn lock(&self, entry: ImageDirectoryEntry) -> MutexGuard<'_, ContentState> {
        // every entry gets a slot in new()
        self.slots[&entry].lock().unwrap_or_else(PoisonError::into_inner)
    }
    /// Return the slot's content, running ```load``` first if the slot is not loaded yet.
    ///
    /// Concurrent callers block on the slot and observe the first caller's outcome. A failure is
    /// stored and returned again on later calls. A cancelled load stores nothing.
    pub fn get_or_load<F>(&self, entry: ImageDirectoryEntry, load: F) -> Result<DirectoryContent>
    where
        F: FnOnce() -> Result<DirectoryContent>
    {
        let mut state = self.lock(entry);

        match &*state {
            ContentState::Loaded(content) => {
                trace!("{:?} content served from cache", entry);
                return Ok(content.clone());
            },
            ContentState::Failed(error) => {
                trace!("{:?} content previously failed: {}", entry, error);
                return Err(error.clone());
            },
            ContentState::NotLoaded => (),
        }

        debug!("loading {:?} content", entry);

        match load() {
            Ok(content) => {
                *state = ContentState::Loaded(content.clone());
                Ok(content)
            },
            Err(Error::Cancelled) => {
                debug!("{:?} content load cancelled", entry);
                Err(Error::Cancelled)
            },
            Err(error) => {
                debug!("{:?} content failed to load: {}", entry, error);
                *state = ContentState::Failed(error.clone());
                Err(error)
            },
        }
    }
    /// Return the slot to the not-loaded state.
    pub fn reset(&self, entry: ImageDirectoryEntry) {
        *self.lock(entry) = ContentState::NotLoaded;
    }
    /// Peek at the slot without waiting. A slot whose lock is held is being loaded.
    pub fn status(&self, entry: ImageDirectoryEntry) -> ContentStatus {
        let state = match self.slots[&entry].try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return ContentStatus::Loading,
        };

        match &*state {
            ContentState::NotLoaded => ContentStatus::NotLoaded,
            ContentState::Loaded(_) => ContentStatus::Loaded,
            ContentState::Failed(_) => ContentStatus::Failed,
        }
    }
}
impl Default for ContentCache {
    fn default() -> Self {
        Self::new()
    }
}
