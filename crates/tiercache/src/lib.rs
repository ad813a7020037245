//! # tiercache
//!
//! A two-tier object cache fronted by a deduplicating asynchronous loader.
//! Callers request a value by key; the loader serves it from memory, falls
//! back to disk (promoting the result into memory), and falls back further
//! to fetching it from a remote source, storing the result in both tiers.
//!
//! ## Cache layers
//!
//! - An in-memory layer ([`MemoryCache`]): a bounded, thread-safe key/value
//!   map with count and total-cost limits and LRU eviction. Entries are
//!   never persisted; they vanish under eviction or explicit removal.
//! - A file-system layer ([`DiskCache`]): one file per entry in a dedicated
//!   directory, with file names derived from the key (by default its SHA-256
//!   digest). A size cap is enforced by the [`prune_over_limit`]
//!   maintenance operation, which removes the oldest-created files until the
//!   total size drops to half the limit.
//! - The composition of the two ([`TieredCache`]): read-through with
//!   promotion, synchronous memory writes, and synchronous or background
//!   disk writes depending on the configured [`WritePolicy`].
//!
//! A load request goes through the following steps:
//! - First, the two-tier cache is consulted; a hit is delivered without any
//!   in-flight bookkeeping.
//! - On a miss, the request joins the in-flight fetch for its key, or
//!   starts one if there is none. However many callers pile onto a key,
//!   exactly one fetch runs.
//! - The fetch result is decoded, stored into both tiers, and fanned out to
//!   every pending caller on the delivery runtime. A fetch or decode
//!   failure is fanned out the same way; each caller may independently
//!   retry by loading again.
//!
//! ## Metrics
//!
//! When statsd reporting is configured via
//! [`metrics::configure_statsd`], the following are emitted, tagged with
//! the cache name where applicable: `cache.access`, `cache.memory.hit`,
//! `cache.disk.hit`, `cache.disk.write`, `cache.disk.file.size`,
//! `cache.disk.prune.removed_files`, `cache.disk.prune.removed_bytes`,
//! `loader.fetch`, `loader.coalesced`.
//!
//! ## Concurrency
//!
//! Fetches run on an executor runtime with parallelism bounded by the
//! loader configuration; completion handlers are invoked on a separate
//! delivery runtime. The in-flight map is guarded by a single mutex, and
//! fan-out drains it before invoking any handler, which is what makes the
//! coalescing race-free. Disk reads happen on the calling thread; disk
//! writes and removals follow the configured [`WritePolicy`].
//!
//! [`MemoryCache`]: crate::memory::MemoryCache
//! [`DiskCache`]: crate::disk::DiskCache
//! [`TieredCache`]: crate::tiered::TieredCache
//! [`WritePolicy`]: crate::config::WritePolicy
//! [`prune_over_limit`]: crate::disk::DiskCache::prune_over_limit

#[macro_use]
pub mod metrics;

pub mod codec;
pub mod config;
pub mod disk;
pub mod error;
pub mod loader;
pub mod memory;
pub mod store;
pub mod tiered;

#[cfg(test)]
mod tests;

pub use codec::{TransformError, Transformable};
pub use config::{ClearMode, DiskConfig, LoaderConfig, MemoryConfig, TieredConfig, WritePolicy};
pub use disk::{DiskCache, RemovedEntry};
pub use error::CacheError;
pub use loader::{DecodeFn, FetchSource, LoadOptions, LoadResult, Loader};
pub use memory::MemoryCache;
pub use store::Store;
pub use tiered::TieredCache;
