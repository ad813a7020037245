//! The deduplicating loader.
//!
//! Fronts a [`TieredCache`] with an abstract fetch-and-decode operation and
//! coalesces concurrent requests: at most one fetch is in flight per key,
//! while arbitrarily many callers wait on its result.
//!
//! Per-key bookkeeping lives in a single mutex-guarded map from key to the
//! ordered list of pending completion handlers. Presence of a key in the map
//! is the "currently loading" flag; the entry is removed exactly once, when
//! the fetch resolves (fan-out), on [`Loader::cancel_all`], or on
//! [`Loader::reconfigure`]. Fan-out drains the list and removes the entry in
//! one critical section before invoking any handler, so a caller arriving
//! before the drain is notified exactly once and a caller arriving after it
//! starts a fresh fetch — no lost wake-ups, no duplicate fetches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::codec::{TransformError, Transformable};
use crate::config::{ClearMode, LoaderConfig};
use crate::error::CacheError;
use crate::tiered::TieredCache;

/// The outcome of a load, delivered to every waiting caller.
pub type LoadResult<V> = Result<V, CacheError>;

/// A caller-supplied completion handler.
pub type LoadHandler<V> = Box<dyn FnOnce(LoadResult<V>) + Send + 'static>;

/// A per-call decode override, taking priority over the source's default.
pub type DecodeFn<V> = Arc<dyn Fn(&[u8]) -> Result<V, TransformError> + Send + Sync>;

/// The abstract remote source a [`Loader`] fetches from.
///
/// `fetch` returns the raw bytes for a key or fails with a transport error;
/// the loader treats it as an opaque capability. `decode` turns fetched
/// bytes into a value and defaults to the value's own [`Transformable`]
/// conversion.
pub trait FetchSource<V: Transformable>: Send + Sync + 'static {
    fn fetch(&self, key: &str) -> BoxFuture<'static, Result<Vec<u8>, CacheError>>;

    fn decode(&self, bytes: &[u8]) -> Result<V, TransformError> {
        V::from_bytes(bytes)
    }
}

/// Options for a single [`Loader::load_with`] call.
#[derive(Clone)]
pub struct LoadOptions<V> {
    /// Keep only this completion in the pending list, discarding earlier
    /// waiters' ability to be notified. Useful when only the newest request
    /// matters, e.g. a view that is re-bound while scrolling.
    pub keep_only_latest: bool,
    /// Decode override for this call. Applies to the fetch this call
    /// *starts*; a call that joins an in-flight fetch inherits the decoder
    /// the fetch was started with.
    pub decode: Option<DecodeFn<V>>,
}

impl<V> Default for LoadOptions<V> {
    fn default() -> Self {
        LoadOptions {
            keep_only_latest: false,
            decode: None,
        }
    }
}

/// Everything that [`Loader::reconfigure`] swaps in one piece: the cache,
/// the execution resources, and the in-flight bookkeeping tied to them.
struct LoaderShared<V> {
    cache: TieredCache<V>,
    /// Runtime the fetch operations run on.
    executor: Handle,
    /// Runtime the completion handlers are invoked on.
    delivery: Handle,
    /// Bounds the number of concurrently running fetches.
    permits: Arc<Semaphore>,
    /// Cancels queued and running fetches; replaced on `cancel_all`.
    cancel: Mutex<CancellationToken>,
    /// Key -> ordered pending handlers. Presence is the loading flag.
    inflight: Mutex<HashMap<String, Vec<LoadHandler<V>>>>,
}

impl<V> LoaderShared<V> {
    fn new(cache: TieredCache<V>, config: &LoaderConfig, executor: Handle, delivery: Handle) -> Self {
        LoaderShared {
            cache,
            executor,
            delivery,
            permits: Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1))),
            cancel: Mutex::new(CancellationToken::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Cancels all fetches and forgets every pending handler without
    /// invoking it.
    fn cancel_all(&self) {
        {
            let mut token = self.cancel.lock().unwrap();
            token.cancel();
            *token = CancellationToken::new();
        }
        self.inflight.lock().unwrap().clear();
    }
}

/// A deduplicating loader over a [`TieredCache`].
///
/// `load` serves from the cache when possible and otherwise fetches from the
/// remote source, coalescing concurrent requests for the same key into a
/// single fetch. Results are stored in both cache tiers and fanned out to
/// every waiting caller on the delivery runtime.
///
/// There is no implicit global instance; applications that want a shared
/// loader construct one and hand it around (or wrap it in their own
/// `static`), which keeps tests isolated.
pub struct Loader<V, S> {
    source: Arc<S>,
    shared: RwLock<Arc<LoaderShared<V>>>,
}

impl<V, S> Loader<V, S>
where
    V: Transformable + Clone + Send + Sync + 'static,
    S: FetchSource<V>,
{
    /// Creates a loader that fetches on `executor` and invokes completion
    /// handlers on `delivery`.
    pub fn new(
        source: S,
        cache: TieredCache<V>,
        config: LoaderConfig,
        executor: Handle,
        delivery: Handle,
    ) -> Self {
        let shared = LoaderShared::new(cache, &config, executor, delivery);
        Loader {
            source: Arc::new(source),
            shared: RwLock::new(Arc::new(shared)),
        }
    }

    /// Loads the value for `key`, delivering the result to `completion` on
    /// the delivery runtime.
    ///
    /// Served from the cache when present; otherwise joins the in-flight
    /// fetch for `key`, or starts one if there is none.
    pub fn load(&self, key: &str, completion: impl FnOnce(LoadResult<V>) + Send + 'static) {
        self.load_with(key, LoadOptions::default(), completion);
    }

    /// Like [`load`](Self::load), with per-call [`LoadOptions`].
    pub fn load_with(
        &self,
        key: &str,
        options: LoadOptions<V>,
        completion: impl FnOnce(LoadResult<V>) + Send + 'static,
    ) {
        let shared = self.shared.read().unwrap().clone();

        // Cache probe first; in-flight bookkeeping is only touched on a
        // miss. A read error here counts as a miss so the fetch can
        // repopulate the broken entry.
        match shared.cache.get(key) {
            Ok(Some(value)) => {
                tracing::trace!(key, "load served from cache");
                shared.delivery.spawn(async move { completion(Ok(value)) });
                return;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    key,
                    "cache probe failed, fetching instead"
                );
            }
        }

        let completion: LoadHandler<V> = Box::new(completion);
        {
            let mut inflight = shared.inflight.lock().unwrap();
            if let Some(pending) = inflight.get_mut(key) {
                metric!(counter("loader.coalesced") += 1);
                tracing::trace!(key, "joining in-flight fetch");
                if options.keep_only_latest {
                    pending.clear();
                }
                pending.push(completion);
                return;
            }
            inflight.insert(key.to_owned(), vec![completion]);
        }

        self.spawn_fetch(shared, key.to_owned(), options.decode);
    }

    /// Awaitable sugar over [`load`](Self::load).
    ///
    /// Resolves to [`CacheError::Cancelled`] when the load is abandoned by
    /// [`cancel_all`](Self::cancel_all), [`reconfigure`](Self::reconfigure)
    /// or [`remove_pending_handlers`](Self::remove_pending_handlers) before
    /// a result is produced.
    pub async fn load_async(&self, key: &str) -> LoadResult<V> {
        let (tx, rx) = oneshot::channel();
        self.load(key, move |result| {
            tx.send(result).ok();
        });
        rx.await.unwrap_or(Err(CacheError::Cancelled))
    }

    /// Returns the cached value for `key` without ever triggering a fetch.
    pub fn cached_value(&self, key: &str) -> Option<V> {
        let shared = self.shared.read().unwrap().clone();
        shared.cache.get(key).ok().flatten()
    }

    /// Clears the underlying cache tiers selected by `mode`.
    pub fn clear_cache(&self, mode: ClearMode) -> Result<(), CacheError> {
        let shared = self.shared.read().unwrap().clone();
        shared.cache.clear(mode)
    }

    /// Drops pending handlers for `key` that should no longer be notified.
    ///
    /// With `keep_latest`, only the most recently registered handler
    /// survives. The loading flag is left untouched: the in-flight fetch
    /// still completes and populates the cache, its result just goes
    /// unannounced.
    pub fn remove_pending_handlers(&self, key: &str, keep_latest: bool) {
        let shared = self.shared.read().unwrap().clone();
        let mut inflight = shared.inflight.lock().unwrap();
        if let Some(pending) = inflight.get_mut(key) {
            if keep_latest {
                if pending.len() > 1 {
                    pending.drain(..pending.len() - 1);
                }
            } else {
                pending.clear();
            }
        }
    }

    /// Cancels all queued and running fetches and forgets all pending
    /// handlers without invoking them.
    ///
    /// This is an explicit "give up": callers are left unresolved rather
    /// than notified of a failure. Cancellation is best-effort — a fetch
    /// past its point of no return completes, but its result is discarded.
    pub fn cancel_all(&self) {
        self.shared.read().unwrap().cancel_all();
    }

    /// Replaces the cache and execution resources.
    ///
    /// Outstanding work is cancelled and all in-flight/pending state is
    /// cleared first, so no stale handler fires against the new
    /// configuration and no superseded fetch writes into the new cache.
    pub fn reconfigure(
        &self,
        cache: TieredCache<V>,
        config: LoaderConfig,
        executor: Handle,
        delivery: Handle,
    ) {
        let mut shared = self.shared.write().unwrap();
        shared.cancel_all();
        *shared = Arc::new(LoaderShared::new(cache, &config, executor, delivery));
    }

    fn spawn_fetch(&self, shared: Arc<LoaderShared<V>>, key: String, decode: Option<DecodeFn<V>>) {
        metric!(counter("loader.fetch") += 1);
        tracing::debug!(key = %key, "starting fetch");

        let token = shared.cancel.lock().unwrap().clone();
        let source = Arc::clone(&self.source);
        let executor = shared.executor.clone();

        executor.spawn(async move {
            let work = async {
                let _permit = match Arc::clone(&shared.permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let result = fetch_and_store(&*source, &shared, &key, decode).await;
                fan_out(&shared, &key, result);
            };
            // Dropped mid-await on cancellation; anything already fanned
            // out stays delivered, everything else is discarded.
            token.run_until_cancelled(work).await;
        });
    }
}

/// Fetches and decodes `key`, storing a successful result in both cache
/// tiers before returning it.
async fn fetch_and_store<V, S>(
    source: &S,
    shared: &LoaderShared<V>,
    key: &str,
    decode: Option<DecodeFn<V>>,
) -> LoadResult<V>
where
    V: Transformable + Clone + Send + Sync + 'static,
    S: FetchSource<V>,
{
    let bytes = source.fetch(key).await?;

    let value = match decode {
        Some(decode) => decode(&bytes),
        None => source.decode(&bytes),
    }
    .map_err(|e| CacheError::Decode(e.to_string()))?;

    // The fetched bytes double as the encoded representation, sparing the
    // disk tier a second encoding pass. A store failure is logged, not
    // delivered: the value itself is good.
    if let Err(err) = shared.cache.set(key, value.clone(), Some(&bytes)) {
        tracing::error!(
            error = &err as &dyn std::error::Error,
            key = %key,
            "failed to store fetched value in cache"
        );
    }

    tracing::trace!(key = %key, "load served from remote source");
    Ok(value)
}

/// Atomically clears the loading flag and drains the pending list, then
/// invokes every drained handler with the result on the delivery runtime.
fn fan_out<V: Clone + Send + 'static>(
    shared: &LoaderShared<V>,
    key: &str,
    result: LoadResult<V>,
) {
    let handlers = shared.inflight.lock().unwrap().remove(key);
    let Some(handlers) = handlers else {
        // cancelled or reconfigured while the fetch was finishing; the
        // result is discarded
        return;
    };
    for handler in handlers {
        let result = result.clone();
        shared.delivery.spawn(async move { handler(result) });
    }
}
