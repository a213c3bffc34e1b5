//! Deduplicating, reference-counted resource store.
//!
//! Maps a content hash to its resolved location and naming metadata. The
//! first resolution of a hash creates the entry; repeated resolutions of the
//! same content increment the refcount instead of storing a second copy.
//! Hit/miss and bytes-saved counters exist for reporting only and never
//! change behavior.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::types::ContentHash;

/// Resolution metadata supplied when a hash is first (or repeatedly) resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceData {
    /// Where the asset's primary bytes live (local path or remote URL).
    pub primary_location: String,
    /// Server-assigned name, used to derive remote thumbnail URLs.
    pub server_name: Option<String>,
    /// Name the asset carried when it was dropped onto the canvas.
    pub original_name: Option<String>,
    /// Size of the asset's primary bytes; counts toward dedup savings.
    pub byte_size: u64,
}

/// One live entry in the resource cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    pub data: ResourceData,
    pub refcount: usize,
}

/// Reporting-only counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResourceCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub bytes_saved: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
struct ResourceInner {
    entries: HashMap<ContentHash, ResourceEntry>,
    hits: u64,
    misses: u64,
    bytes_saved: u64,
}

/// Thread-safe refcounted store keyed by content hash.
#[derive(Debug, Default)]
pub struct ResourceCache {
    inner: Mutex<ResourceInner>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, hash: &ContentHash) -> bool {
        self.inner.lock().entries.contains_key(hash)
    }

    /// Look up an entry, recording a hit or miss.
    pub fn get(&self, hash: &ContentHash) -> Option<ResourceEntry> {
        let mut inner = self.inner.lock();
        match inner.entries.get(hash).cloned() {
            Some(entry) => {
                inner.hits += 1;
                Some(entry)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Server-assigned name for the hash, if the entry carries one.
    pub fn server_name(&self, hash: &ContentHash) -> Option<String> {
        self.inner.lock().entries.get(hash).and_then(|entry| entry.data.server_name.clone())
    }

    /// Register a resolution of `hash`.
    ///
    /// The first call creates the entry with refcount 1. Later calls for the
    /// same hash increment the refcount and credit the avoided duplicate to
    /// the bytes-saved counter; the stored metadata is never replaced.
    pub fn set(&self, hash: ContentHash, data: ResourceData) -> usize {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&hash) {
            Some(entry) => {
                entry.refcount += 1;
                let refcount = entry.refcount;
                inner.bytes_saved += data.byte_size;
                trace!(hash = %hash, refcount, "deduplicated resource resolution");
                refcount
            }
            None => {
                inner.entries.insert(hash, ResourceEntry { data, refcount: 1 });
                1
            }
        }
    }

    /// Increment the refcount of an existing entry. No-op for unknown hashes.
    pub fn add_reference(&self, hash: &ContentHash) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(hash) {
            Some(entry) => {
                entry.refcount += 1;
                true
            }
            None => false,
        }
    }

    /// Drop one reference; the entry is purged when the count reaches zero.
    /// Returns true if the entry was purged by this call.
    pub fn remove_reference(&self, hash: &ContentHash) -> bool {
        let mut inner = self.inner.lock();
        let purge = match inner.entries.get_mut(hash) {
            Some(entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount == 0
            }
            None => false,
        };
        if purge {
            inner.entries.remove(hash);
            trace!(hash = %hash, "purged resource entry at refcount zero");
        }
        purge
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn stats(&self) -> ResourceCacheStats {
        let inner = self.inner.lock();
        ResourceCacheStats {
            hits: inner.hits,
            misses: inner.misses,
            bytes_saved: inner.bytes_saved,
            entries: inner.entries.len(),
        }
    }
}
