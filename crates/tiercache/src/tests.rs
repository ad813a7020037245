use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::codec::TransformError;
use crate::config::{DiskConfig, LoaderConfig, TieredConfig, WritePolicy};
use crate::error::CacheError;
use crate::loader::{FetchSource, LoadOptions, Loader};
use crate::test;
use crate::tiered::TieredCache;

/// A remote source with a controllable delay, payload and failure mode,
/// counting how many fetches were actually dispatched.
#[derive(Clone)]
struct TestSource {
    fetches: Arc<AtomicUsize>,
    delay: Duration,
    payload: Option<Vec<u8>>,
    fail: bool,
}

impl TestSource {
    fn new(delay: Duration) -> Self {
        TestSource {
            fetches: Default::default(),
            delay,
            payload: None,
            fail: false,
        }
    }

    fn failing(delay: Duration) -> Self {
        TestSource {
            fail: true,
            ..Self::new(delay)
        }
    }

    fn with_payload(delay: Duration, payload: impl Into<Vec<u8>>) -> Self {
        TestSource {
            payload: Some(payload.into()),
            ..Self::new(delay)
        }
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl FetchSource<String> for TestSource {
    fn fetch(&self, key: &str) -> BoxFuture<'static, Result<Vec<u8>, CacheError>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay;
        let fail = self.fail;
        let payload = self.payload.clone();
        let key = key.to_owned();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            if fail {
                Err(CacheError::Fetch("connection reset by peer".into()))
            } else {
                Ok(payload.unwrap_or_else(|| format!("remote payload for {key}").into_bytes()))
            }
        })
    }
}

fn tiered_cache(root: &Path, name: &str) -> TieredCache<String> {
    let config = TieredConfig {
        disk: DiskConfig {
            root: Some(root.to_owned()),
            ..Default::default()
        },
        write_policy: WritePolicy::Sync,
        ..Default::default()
    };
    TieredCache::new(name, config, Handle::current()).unwrap()
}

fn loader(source: TestSource, cache: TieredCache<String>) -> Loader<String, TestSource> {
    Loader::new(
        source,
        cache,
        LoaderConfig::default(),
        Handle::current(),
        Handle::current(),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_loads_are_coalesced_into_one_fetch() {
    test::setup();
    let dir = test::tempdir();
    let source = TestSource::new(Duration::from_millis(100));
    let loader = loader(source.clone(), tiered_cache(dir.path(), "coalesce"));

    let results =
        futures::future::join_all((0..10).map(|_| loader.load_async("shared-key"))).await;

    for result in results {
        assert_eq!(result.unwrap(), "remote payload for shared-key");
    }
    assert_eq!(source.fetch_count(), 1);
}

#[tokio::test]
async fn cached_keys_never_fetch_again() {
    test::setup();
    let dir = test::tempdir();
    let source = TestSource::new(Duration::from_millis(10));
    let loader = loader(source.clone(), tiered_cache(dir.path(), "cache-first"));

    let first = loader.load_async("key").await.unwrap();
    for _ in 0..5 {
        assert_eq!(loader.load_async("key").await.unwrap(), first);
    }
    assert_eq!(source.fetch_count(), 1);
}

#[tokio::test]
async fn values_already_on_disk_are_served_without_a_fetch() {
    test::setup();
    let dir = test::tempdir();
    let cache = tiered_cache(dir.path(), "disk-first");
    cache.disk().set("key", &"from disk".to_owned(), None).unwrap();

    let source = TestSource::new(Duration::from_millis(10));
    let loader = loader(source.clone(), cache);

    assert_eq!(loader.load_async("key").await.unwrap(), "from disk");
    assert_eq!(source.fetch_count(), 0);

    // the disk hit was promoted: a second load is served from memory
    assert_eq!(loader.cached_value("key"), Some("from disk".to_owned()));
}

#[tokio::test]
async fn fetched_values_land_in_both_tiers() {
    test::setup();
    let dir = test::tempdir();
    let source = TestSource::new(Duration::from_millis(10));
    let loader = loader(source.clone(), tiered_cache(dir.path(), "both-tiers"));

    loader.load_async("key").await.unwrap();

    loader.clear_cache(crate::config::ClearMode::Memory).unwrap();
    // still served from disk, no second fetch
    assert_eq!(
        loader.load_async("key").await.unwrap(),
        "remote payload for key"
    );
    assert_eq!(source.fetch_count(), 1);
}

#[tokio::test]
async fn one_failure_fails_the_whole_coalesced_group() {
    test::setup();
    let dir = test::tempdir();
    let source = TestSource::failing(Duration::from_millis(100));
    let loader = loader(source.clone(), tiered_cache(dir.path(), "failure"));

    let results = futures::future::join_all((0..3).map(|_| loader.load_async("key"))).await;

    for result in results {
        assert!(matches!(result, Err(CacheError::Fetch(_))));
    }
    assert_eq!(source.fetch_count(), 1);

    // failures are not cached; each caller may independently retry
    assert!(loader.load_async("key").await.is_err());
    assert_eq!(source.fetch_count(), 2);
}

#[tokio::test]
async fn undecodable_payload_fails_the_load() {
    test::setup();
    let dir = test::tempdir();
    let source = TestSource::with_payload(Duration::from_millis(10), vec![0xff, 0xfe]);
    let loader = loader(source.clone(), tiered_cache(dir.path(), "undecodable"));

    assert!(matches!(
        loader.load_async("key").await,
        Err(CacheError::Decode(_))
    ));
    assert_eq!(loader.cached_value("key"), None);
}

#[tokio::test]
async fn keep_only_latest_drops_earlier_waiters() {
    test::setup();
    let dir = test::tempdir();
    let source = TestSource::new(Duration::from_millis(200));
    let loader = loader(source.clone(), tiered_cache(dir.path(), "latest"));

    let first_fired = Arc::new(AtomicBool::new(false));
    {
        let first_fired = first_fired.clone();
        loader.load("key", move |_| {
            first_fired.store(true, Ordering::SeqCst);
        });
    }

    let (tx, rx) = oneshot::channel();
    loader.load_with(
        "key",
        LoadOptions {
            keep_only_latest: true,
            decode: None,
        },
        move |result| {
            tx.send(result).ok();
        },
    );

    assert_eq!(rx.await.unwrap().unwrap(), "remote payload for key");

    // give any stray callback a chance to fire before asserting it didn't
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!first_fired.load(Ordering::SeqCst));
    assert_eq!(source.fetch_count(), 1);
}

#[tokio::test]
async fn removed_pending_handlers_are_never_notified() {
    test::setup();
    let dir = test::tempdir();
    let source = TestSource::new(Duration::from_millis(100));
    let loader = loader(source.clone(), tiered_cache(dir.path(), "removed"));

    let fired = Arc::new(AtomicBool::new(false));
    {
        let fired = fired.clone();
        loader.load("key", move |_| {
            fired.store(true, Ordering::SeqCst);
        });
    }
    loader.remove_pending_handlers("key", false);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!fired.load(Ordering::SeqCst));

    // the fetch itself still completed and populated the cache
    assert_eq!(source.fetch_count(), 1);
    assert_eq!(
        loader.cached_value("key"),
        Some("remote payload for key".to_owned())
    );
}

#[tokio::test]
async fn remove_pending_handlers_can_keep_the_latest() {
    test::setup();
    let dir = test::tempdir();
    let source = TestSource::new(Duration::from_millis(100));
    let loader = loader(source.clone(), tiered_cache(dir.path(), "keep-latest"));

    let first_fired = Arc::new(AtomicBool::new(false));
    {
        let first_fired = first_fired.clone();
        loader.load("key", move |_| {
            first_fired.store(true, Ordering::SeqCst);
        });
    }
    let (tx, rx) = oneshot::channel();
    loader.load("key", move |result| {
        tx.send(result).ok();
    });

    loader.remove_pending_handlers("key", true);

    assert!(rx.await.unwrap().is_ok());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!first_fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn cancel_all_leaves_callers_unresolved() {
    test::setup();
    let dir = test::tempdir();
    let source = TestSource::new(Duration::from_millis(200));
    let loader = Arc::new(loader(source.clone(), tiered_cache(dir.path(), "cancel")));

    let waiter = {
        let loader = loader.clone();
        tokio::spawn(async move { loader.load_async("key").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    loader.cancel_all();

    // the awaitable wrapper observes the dropped completion as `Cancelled`
    assert_eq!(waiter.await.unwrap(), Err(CacheError::Cancelled));

    // nothing was stored by the cancelled fetch
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(loader.cached_value("key"), None);

    // the loader keeps working afterwards
    assert_eq!(
        loader.load_async("key").await.unwrap(),
        "remote payload for key"
    );
    assert_eq!(source.fetch_count(), 2);
}

#[tokio::test]
async fn reconfigure_supersedes_outstanding_work() {
    test::setup();
    let dir1 = test::tempdir();
    let dir2 = test::tempdir();
    let source = TestSource::new(Duration::from_millis(200));
    let loader = loader(source.clone(), tiered_cache(dir1.path(), "reconfig-old"));

    let fired = Arc::new(AtomicBool::new(false));
    {
        let fired = fired.clone();
        loader.load("key", move |_| {
            fired.store(true, Ordering::SeqCst);
        });
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    loader.reconfigure(
        tiered_cache(dir2.path(), "reconfig-new"),
        LoaderConfig::default(),
        Handle::current(),
        Handle::current(),
    );

    tokio::time::sleep(Duration::from_millis(400)).await;

    // the superseded callback never fired, and the superseded fetch did not
    // write into the newly configured cache
    assert!(!fired.load(Ordering::SeqCst));
    assert_eq!(loader.cached_value("key"), None);

    // the new configuration serves loads normally
    assert_eq!(
        loader.load_async("key").await.unwrap(),
        "remote payload for key"
    );
    assert_eq!(source.fetch_count(), 2);
}

#[tokio::test]
async fn decode_override_takes_priority() {
    test::setup();
    let dir = test::tempdir();
    let source = TestSource::new(Duration::from_millis(10));
    let loader = loader(source.clone(), tiered_cache(dir.path(), "override"));

    let (tx, rx) = oneshot::channel();
    loader.load_with(
        "key",
        LoadOptions {
            keep_only_latest: false,
            decode: Some(Arc::new(|bytes: &[u8]| {
                String::from_utf8(bytes.to_vec())
                    .map(|s| s.to_uppercase())
                    .map_err(TransformError::new)
            })),
        },
        move |result| {
            tx.send(result).ok();
        },
    );

    assert_eq!(rx.await.unwrap().unwrap(), "REMOTE PAYLOAD FOR KEY");
    // the decoded value is what got cached
    assert_eq!(
        loader.cached_value("key"),
        Some("REMOTE PAYLOAD FOR KEY".to_owned())
    );
}

#[test]
fn configs_deserialize_with_defaults() {
    let yaml = r#"
        memory:
          max_entries: 10
        disk:
          size_limit: 1048576
        write_policy: sync
    "#;
    let config: TieredConfig = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(config.memory.max_entries, 10);
    assert_eq!(config.memory.max_total_cost, 256 * 1024 * 1024);
    assert_eq!(config.disk.size_limit, 1024 * 1024);
    assert!(config.disk.use_hashed_file_names);
    assert_eq!(config.write_policy, WritePolicy::Sync);

    let loader: LoaderConfig = serde_yaml::from_str("max_concurrent_fetches: 2").unwrap();
    assert_eq!(loader.max_concurrent_fetches, 2);

    let loader: LoaderConfig = serde_yaml::from_str("{}").unwrap();
    assert_eq!(loader.max_concurrent_fetches, 6);
}
