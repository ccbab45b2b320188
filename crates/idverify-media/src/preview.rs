//! Preview references for captured images.
//!
//! The store keeps one thumbnail per live [`PreviewHandle`]. Handles are not
//! `Clone`; dropping one releases its entry, so every preview is released
//! exactly once by whoever owns it last.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Longest side of a stored thumbnail, in pixels.
pub const THUMBNAIL_MAX_SIDE: u32 = 320;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreviewId(Uuid);

impl std::fmt::Display for PreviewId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<PreviewId, Arc<[u8]>>,
    issued: u64,
    released: u64,
}

/// Shared registry of preview thumbnails. Cheap to clone.
#[derive(Clone, Default)]
pub struct PreviewStore {
    inner: Arc<Mutex<StoreInner>>,
}

fn lock(inner: &Mutex<StoreInner>) -> MutexGuard<'_, StoreInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PreviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a thumbnail and return the handle that owns it.
    pub fn issue(&self, thumbnail: Vec<u8>) -> PreviewHandle {
        let id = PreviewId(Uuid::new_v4());
        let mut inner = lock(&self.inner);
        inner.entries.insert(id, thumbnail.into());
        inner.issued += 1;
        PreviewHandle {
            id,
            store: self.inner.clone(),
        }
    }

    /// Thumbnail bytes for a live preview.
    pub fn get(&self, id: PreviewId) -> Option<Arc<[u8]>> {
        lock(&self.inner).entries.get(&id).cloned()
    }

    /// Number of previews currently held.
    pub fn live(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn issued(&self) -> u64 {
        lock(&self.inner).issued
    }

    pub fn released(&self) -> u64 {
        lock(&self.inner).released
    }
}

/// Owning reference to one stored preview.
pub struct PreviewHandle {
    id: PreviewId,
    store: Arc<Mutex<StoreInner>>,
}

impl PreviewHandle {
    pub fn id(&self) -> PreviewId {
        self.id
    }
}

impl std::fmt::Debug for PreviewHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PreviewHandle").field(&self.id).finish()
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        let mut inner = lock(&self.store);
        if inner.entries.remove(&self.id).is_some() {
            inner.released += 1;
            tracing::trace!(preview = %self.id, "preview released");
        } else {
            tracing::warn!(preview = %self.id, "preview missing from store at release");
        }
    }
}
