use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use graderd::cache::{Bundle, BundleFactory, DirBundleFactory, InputCache};
use graderd::error::{GraderError, Result};

/// Factory serving bundles from an in-memory map, counting fetches per ID.
#[derive(Default)]
struct MapFactory {
    bundles: HashMap<String, BTreeMap<String, Vec<u8>>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
}

impl MapFactory {
    fn with_bundle(mut self, id: &str, files: &[(&str, usize)]) -> Self {
        let files = files
            .iter()
            .map(|(name, size)| (name.to_string(), vec![0u8; *size]))
            .collect();
        self.bundles.insert(id.to_string(), files);
        self
    }

    fn calls_for(&self, id: &str) -> usize {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl BundleFactory for MapFactory {
    async fn create(&self, bundle_id: &str) -> Result<Bundle> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(bundle_id.to_string())
            .or_insert(0) += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.bundles.get(bundle_id) {
            Some(files) => Ok(Bundle::new(bundle_id.to_string(), files.clone())),
            None => Err(GraderError::BundleFetch {
                id: bundle_id.to_string(),
                reason: "no such bundle".to_string(),
            }),
        }
    }
}

fn cache_with(
    budget: u64,
    factory: MapFactory,
) -> (Arc<InputCache>, Arc<MapFactory>) {
    let factory = Arc::new(factory);
    (
        Arc::new(InputCache::new(budget, factory.clone())),
        factory,
    )
}

#[tokio::test]
async fn miss_fetches_then_hit_serves_from_cache() {
    let (cache, factory) =
        cache_with(1000, MapFactory::default().with_bundle("b1", &[("in", 10), ("out", 10)]));

    let handle = cache.fetch("b1").await.unwrap();
    assert_eq!(handle.size(), 20);
    assert_eq!(handle.file_count(), 2);
    assert!(handle.file("in").is_some());
    drop(handle);

    let handle = cache.fetch("b1").await.unwrap();
    assert_eq!(handle.id(), "b1");

    assert_eq!(factory.calls_for("b1"), 1);
    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.total_bytes, 20);
}

#[tokio::test]
async fn released_entry_is_evicted_to_make_room() {
    // Budget 100: A (60) must leave before B (60) fits.
    let (cache, factory) = cache_with(
        100,
        MapFactory::default()
            .with_bundle("a", &[("data", 60)])
            .with_bundle("b", &[("data", 60)]),
    );

    let a = cache.fetch("a").await.unwrap();
    drop(a); // refcount back to zero

    let _b = cache.fetch("b").await.unwrap();
    let stats = cache.stats();
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.total_bytes, 60);

    // A is gone; fetching it again goes back to the factory.
    drop(_b);
    cache.fetch("a").await.unwrap();
    assert_eq!(factory.calls_for("a"), 2);
}

#[tokio::test]
async fn pinned_entry_is_never_evicted() {
    let (cache, _factory) = cache_with(
        100,
        MapFactory::default()
            .with_bundle("a", &[("data", 60)])
            .with_bundle("b", &[("data", 60)]),
    );

    // Keep the handle alive: A stays pinned.
    let _a = cache.fetch("a").await.unwrap();

    let err = cache.fetch("b").await.unwrap_err();
    assert!(matches!(err, GraderError::CacheCapacity { id, size } if id == "b" && size == 60));

    // A is still there and still usable.
    let stats = cache.stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.evictions, 0);
}

#[tokio::test]
async fn eviction_picks_the_least_recently_used_entry() {
    let (cache, factory) = cache_with(
        150,
        MapFactory::default()
            .with_bundle("a", &[("data", 60)])
            .with_bundle("b", &[("data", 60)])
            .with_bundle("c", &[("data", 60)]),
    );

    drop(cache.fetch("a").await.unwrap());
    drop(cache.fetch("b").await.unwrap());
    // Touch A so B becomes the least recently used.
    drop(cache.fetch("a").await.unwrap());

    drop(cache.fetch("c").await.unwrap());

    // A survived, B did not.
    drop(cache.fetch("a").await.unwrap());
    assert_eq!(factory.calls_for("a"), 1);
    drop(cache.fetch("b").await.unwrap());
    assert_eq!(factory.calls_for("b"), 2);
}

#[tokio::test]
async fn concurrent_misses_share_a_single_fetch() {
    let factory = MapFactory {
        delay: Some(Duration::from_millis(50)),
        ..MapFactory::default()
    }
    .with_bundle("shared", &[("data", 10)]);
    let (cache, factory) = cache_with(1000, factory);

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.fetch("shared").await })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(factory.calls_for("shared"), 1);
    assert_eq!(cache.stats().misses, 1);
}

#[tokio::test]
async fn fetch_failure_propagates_and_clears_the_marker() {
    let (cache, factory) = cache_with(1000, MapFactory::default());

    assert!(cache.fetch("missing").await.is_err());
    // The in-progress marker is gone: a second call retries the factory.
    assert!(cache.fetch("missing").await.is_err());
    assert_eq!(factory.calls_for("missing"), 2);
    assert_eq!(cache.stats().entries, 0);
}

#[tokio::test]
async fn bundle_larger_than_budget_is_rejected() {
    let (cache, _factory) =
        cache_with(50, MapFactory::default().with_bundle("huge", &[("data", 51)]));

    let err = cache.fetch("huge").await.unwrap_err();
    assert!(matches!(err, GraderError::CacheCapacity { .. }));
}

#[tokio::test]
async fn preload_registers_materialized_bundles() {
    let dir = tempfile::tempdir().unwrap();
    let bundle_dir = dir.path().join("prob-1");
    std::fs::create_dir(&bundle_dir).unwrap();
    std::fs::write(bundle_dir.join("1.in"), b"3 4").unwrap();
    std::fs::write(bundle_dir.join("1.out"), b"7").unwrap();

    let (cache, factory) = cache_with(1000, MapFactory::default());
    let registered = cache.preload(dir.path()).await.unwrap();
    assert_eq!(registered, 1);

    // Served from the warm cache, no factory involved.
    let handle = cache.fetch("prob-1").await.unwrap();
    assert_eq!(handle.file("1.in"), Some(&b"3 4"[..]));
    assert_eq!(factory.calls_for("prob-1"), 0);
    assert_eq!(cache.stats().hits, 1);
}

#[tokio::test]
async fn preload_of_a_missing_directory_is_empty() {
    let (cache, _factory) = cache_with(1000, MapFactory::default());
    let registered = cache
        .preload(std::path::Path::new("/nonexistent/cache/dir"))
        .await
        .unwrap();
    assert_eq!(registered, 0);
}

#[tokio::test]
async fn preload_stops_at_the_byte_budget() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["p1", "p2"] {
        let bundle_dir = dir.path().join(name);
        std::fs::create_dir(&bundle_dir).unwrap();
        std::fs::write(bundle_dir.join("case.in"), vec![0u8; 40]).unwrap();
    }

    let (cache, _factory) = cache_with(60, MapFactory::default());
    let registered = cache.preload(dir.path()).await.unwrap();
    assert_eq!(registered, 1);
    assert!(cache.stats().total_bytes <= 60);
}

#[tokio::test]
async fn dir_factory_reads_bundles_from_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let bundle_dir = dir.path().join("prob-9");
    std::fs::create_dir(&bundle_dir).unwrap();
    std::fs::write(bundle_dir.join("case.in"), b"hello").unwrap();

    let factory = DirBundleFactory::new(dir.path().to_path_buf());
    let bundle = factory.create("prob-9").await.unwrap();
    assert_eq!(bundle.id(), "prob-9");
    assert_eq!(bundle.file("case.in"), Some(&b"hello"[..]));

    let err = factory.create("prob-10").await.unwrap_err();
    assert!(matches!(err, GraderError::BundleFetch { .. }));
}
