use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{GraderError, Result};

/// An immutable, content-addressed set of test files.
#[derive(Debug)]
pub struct Bundle {
    id: String,
    files: BTreeMap<String, Vec<u8>>,
    size: u64,
}

impl Bundle {
    pub fn new(id: String, files: BTreeMap<String, Vec<u8>>) -> Self {
        let size = files.values().map(|data| data.len() as u64).sum();
        Self { id, files, size }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Total payload size in bytes, the unit of cache accounting.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn file(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(|data| data.as_slice())
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files
            .iter()
            .map(|(name, data)| (name.as_str(), data.as_slice()))
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

/// Produces a bundle from durable storage on a cache miss.
#[async_trait]
pub trait BundleFactory: Send + Sync {
    async fn create(&self, bundle_id: &str) -> Result<Bundle>;
}

/// Factory that materializes bundles from a directory tree where each
/// bundle is a flat directory of test files named by its bundle ID.
pub struct DirBundleFactory {
    root: PathBuf,
}

impl DirBundleFactory {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl BundleFactory for DirBundleFactory {
    async fn create(&self, bundle_id: &str) -> Result<Bundle> {
        let dir = self.root.join(bundle_id);
        load_bundle_dir(bundle_id, &dir)
            .await
            .map_err(|e| GraderError::BundleFetch {
                id: bundle_id.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Read a flat directory of files into a bundle.
async fn load_bundle_dir(bundle_id: &str, dir: &Path) -> Result<Bundle> {
    let mut files = BTreeMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let data = tokio::fs::read(entry.path()).await?;
        files.insert(name, data);
    }
    Ok(Bundle::new(bundle_id.to_string(), files))
}

struct Entry {
    bundle: Arc<Bundle>,
    refs: usize,
    last_used: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, Entry>,
    /// Bundle IDs with a fetch in progress; waiters watch the receiver and
    /// re-check once the sender side is dropped.
    in_flight: HashMap<String, watch::Receiver<()>>,
    total_bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Counters and occupancy of the input cache, for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Reference-counted lease on a cached bundle.
///
/// Holding a handle pins the bundle against eviction; dropping it releases
/// the reference.
pub struct BundleHandle {
    bundle: Arc<Bundle>,
    cache: Arc<InputCache>,
}

impl BundleHandle {
    pub fn bundle(&self) -> &Arc<Bundle> {
        &self.bundle
    }
}

impl std::fmt::Debug for BundleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleHandle")
            .field("bundle", &self.bundle)
            .finish_non_exhaustive()
    }
}

impl Deref for BundleHandle {
    type Target = Bundle;

    fn deref(&self) -> &Bundle {
        &self.bundle
    }
}

impl Drop for BundleHandle {
    fn drop(&mut self) {
        self.cache.release_ref(self.bundle.id());
    }
}

enum MissRole {
    Fetch(#[allow(dead_code)] watch::Sender<()>),
    Wait(watch::Receiver<()>),
}

/// Content-addressable store of input bundles with a byte budget.
///
/// Eviction is least-recently-used among zero-reference entries only; an
/// entry with a positive reference count is pinned regardless of recency.
/// Concurrent misses for the same bundle ID collapse into a single factory
/// fetch. The internal lock is never held across the fetch itself.
pub struct InputCache {
    inner: Mutex<CacheInner>,
    factory: Arc<dyn BundleFactory>,
    budget_bytes: u64,
}

impl InputCache {
    pub fn new(budget_bytes: u64, factory: Arc<dyn BundleFactory>) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            factory,
            budget_bytes,
        }
    }

    /// Return the bundle for `bundle_id`, fetching it from durable storage
    /// on a miss. The returned handle holds a reference that pins the entry
    /// until dropped.
    pub async fn fetch(self: &Arc<Self>, bundle_id: &str) -> Result<BundleHandle> {
        loop {
            let role = {
                let mut inner = self.inner.lock().unwrap();
                if let Some(entry) = inner.entries.get_mut(bundle_id) {
                    entry.refs += 1;
                    entry.last_used = Instant::now();
                    let bundle = entry.bundle.clone();
                    inner.hits += 1;
                    return Ok(BundleHandle {
                        bundle,
                        cache: self.clone(),
                    });
                }
                match inner.in_flight.get(bundle_id) {
                    Some(rx) => MissRole::Wait(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(());
                        inner.in_flight.insert(bundle_id.to_string(), rx);
                        inner.misses += 1;
                        MissRole::Fetch(tx)
                    }
                }
            };

            match role {
                MissRole::Wait(mut rx) => {
                    // Resolves as soon as the fetching task drops its sender,
                    // even if that already happened.
                    let _ = rx.changed().await;
                }
                MissRole::Fetch(_guard) => {
                    let created = self.factory.create(bundle_id).await;
                    let mut inner = self.inner.lock().unwrap();
                    inner.in_flight.remove(bundle_id);
                    let bundle = self.insert_locked(&mut inner, created?)?;
                    return Ok(BundleHandle {
                        bundle,
                        cache: self.clone(),
                    });
                }
            }
        }
    }

    /// Register already-materialized bundles from a runtime cache directory
    /// without fetching, stopping short of the byte budget. Returns the
    /// number of bundles registered. A missing directory is not an error.
    pub async fn preload(&self, dir: &Path) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut registered = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let bundle_id = entry.file_name().to_string_lossy().into_owned();
            let bundle = load_bundle_dir(&bundle_id, &entry.path()).await?;
            let size = bundle.size();

            let mut inner = self.inner.lock().unwrap();
            if inner.entries.contains_key(&bundle_id) {
                continue;
            }
            if inner.total_bytes + size > self.budget_bytes {
                tracing::warn!(
                    bundle_id = %bundle_id,
                    size,
                    "Skipping preload, bundle does not fit in the cache budget"
                );
                continue;
            }
            inner.entries.insert(
                bundle_id.clone(),
                Entry {
                    bundle: Arc::new(bundle),
                    refs: 0,
                    last_used: Instant::now(),
                },
            );
            inner.total_bytes += size;
            registered += 1;
            tracing::debug!(bundle_id = %bundle_id, size, "Preloaded bundle");
        }
        Ok(registered)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            entries: inner.entries.len(),
            total_bytes: inner.total_bytes,
            budget_bytes: self.budget_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }

    /// Insert a freshly fetched bundle, evicting zero-reference entries in
    /// LRU order as needed. Fails when pinned entries keep the cache over
    /// budget. The new entry starts with one reference for the caller.
    fn insert_locked(&self, inner: &mut CacheInner, bundle: Bundle) -> Result<Arc<Bundle>> {
        let size = bundle.size();
        while inner.total_bytes + size > self.budget_bytes {
            let victim = inner
                .entries
                .iter()
                .filter(|(_, entry)| entry.refs == 0)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    let evicted = inner.entries.remove(&id).expect("victim exists");
                    inner.total_bytes -= evicted.bundle.size();
                    inner.evictions += 1;
                    tracing::debug!(
                        bundle_id = %id,
                        size = evicted.bundle.size(),
                        "Evicted bundle"
                    );
                }
                None => {
                    return Err(GraderError::CacheCapacity {
                        id: bundle.id().to_string(),
                        size,
                    });
                }
            }
        }
        let bundle = Arc::new(bundle);
        inner.entries.insert(
            bundle.id().to_string(),
            Entry {
                bundle: bundle.clone(),
                refs: 1,
                last_used: Instant::now(),
            },
        );
        inner.total_bytes += size;
        Ok(bundle)
    }

    fn release_ref(&self, bundle_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(bundle_id) {
            debug_assert!(entry.refs > 0, "reference count underflow");
            entry.refs = entry.refs.saturating_sub(1);
        }
    }
}
