use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::*;

use crate::handle::SyntheticHandle;

/// Override bytes we serve in place of one of the host's resources.
#[derive(Debug, PartialEq, Eq)]
pub struct CachedResource {
    bytes: Box<[u8]>,
}

impl CachedResource {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The size reported to the host. Resources are capped at `u32::MAX`
    /// bytes by the host API.
    pub fn size(&self) -> u32 {
        u32::try_from(self.bytes.len()).unwrap_or(u32::MAX)
    }

    /// A pointer to the first byte. This stays valid until the owning cache
    /// is cleared.
    pub fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }
}

/// A thread-safe map from [SyntheticHandle] to the bytes it stands for.
///
/// The host may call its resource API from any thread, so every operation
/// takes the cache's one lock, and only for the duration of the map access.
///
/// Pointers handed out through [CachedResource::as_ptr] remain valid until
/// [ResourceCache::clear], even if the entry is replaced in the meantime.
/// Each distinct payload stored under a handle is kept once, so an addon
/// flipping between the same few overrides doesn't grow the cache.
#[derive(Default)]
pub struct ResourceCache {
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<SyntheticHandle, Arc<CachedResource>>,

    /// Entries that were replaced by a later [ResourceCache::put] but whose
    /// bytes the host may still be reading, per handle.
    retired: HashMap<SyntheticHandle, Vec<Arc<CachedResource>>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Default::default()
    }

    /// Stores `bytes` under `handle` and returns the stored entry. Storing
    /// bytes this handle has held before reuses the entry that held them.
    pub fn put(&self, handle: SyntheticHandle, bytes: Vec<u8>) -> Arc<CachedResource> {
        let mut state = self.lock();
        if let Some(existing) = state.entries.get(&handle)
            && *existing.bytes == *bytes
        {
            return existing.clone();
        }

        let retired = state.retired.entry(handle).or_default();
        let entry = match retired.iter().position(|r| *r.bytes == *bytes) {
            Some(index) => retired.swap_remove(index),
            None => Arc::new(CachedResource {
                bytes: bytes.into_boxed_slice(),
            }),
        };
        let replaced = match state.entries.insert(handle, entry.clone()) {
            Some(old) => {
                state.retired.entry(handle).or_default().push(old);
                true
            }
            None => false,
        };
        drop(state);

        if replaced {
            debug!("Replaced the bytes behind {handle:?}");
        }
        entry
    }

    pub fn get(&self, handle: SyntheticHandle) -> Option<Arc<CachedResource>> {
        self.lock().entries.get(&handle).cloned()
    }

    /// Drops every entry. Any pointer previously handed out is dangling
    /// afterwards.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.retired.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many replaced entries are being kept alive.
    pub fn retired_len(&self) -> usize {
        self.lock().retired.values().map(Vec::len).sum()
    }

    // A panic while holding this lock can only come from the allocator, and
    // the map is still consistent afterwards.
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
