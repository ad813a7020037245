//! The two-tier cache.
//!
//! Composes the memory and disk tiers into one read-through store: reads hit
//! memory first and promote disk hits into memory, writes go to memory
//! synchronously and to disk either inline or on a background I/O runtime.

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::codec::Transformable;
use crate::config::{ClearMode, TieredConfig, WritePolicy};
use crate::disk::DiskCache;
use crate::error::CacheError;
use crate::memory::MemoryCache;
use crate::store::Store;

/// A cache using both memory and disk.
///
/// With [`WritePolicy::Background`], disk writes and removals are dispatched
/// to the I/O runtime and their failures are logged rather than surfaced —
/// a successful `set` only guarantees the memory tier. A `get` issued after
/// a `set` on the same thread always observes at least the memory-tier
/// value.
pub struct TieredCache<V> {
    memory: Arc<MemoryCache<V>>,
    disk: Arc<DiskCache<V>>,
    io: Handle,
    write_policy: WritePolicy,
    clear_mode: ClearMode,
}

impl<V> Clone for TieredCache<V> {
    fn clone(&self) -> Self {
        TieredCache {
            memory: Arc::clone(&self.memory),
            disk: Arc::clone(&self.disk),
            io: self.io.clone(),
            write_policy: self.write_policy,
            clear_mode: self.clear_mode,
        }
    }
}

impl<V> TieredCache<V>
where
    V: Transformable + Clone + Send + Sync + 'static,
{
    /// Creates a two-tier cache named `name`, with disk writes dispatched to
    /// the `io` runtime when the write policy is [`WritePolicy::Background`].
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty (see [`DiskCache::new`]).
    pub fn new(name: &str, config: TieredConfig, io: Handle) -> Result<Self, CacheError> {
        let memory = MemoryCache::new(config.memory);
        let disk = DiskCache::new(name, config.disk)?;
        Ok(Self::with_stores(
            memory,
            disk,
            config.write_policy,
            config.clear_mode,
            io,
        ))
    }

    /// Composes a cache from already-constructed tiers.
    pub fn with_stores(
        memory: MemoryCache<V>,
        disk: DiskCache<V>,
        write_policy: WritePolicy,
        clear_mode: ClearMode,
        io: Handle,
    ) -> Self {
        TieredCache {
            memory: Arc::new(memory),
            disk: Arc::new(disk),
            io,
            write_policy,
            clear_mode,
        }
    }

    pub fn name(&self) -> &str {
        self.disk.name()
    }

    pub fn memory(&self) -> &MemoryCache<V> {
        &self.memory
    }

    pub fn disk(&self) -> &DiskCache<V> {
        &self.disk
    }

    /// Stores `value` in both tiers.
    ///
    /// The memory write happens first, so subsequent reads on the same
    /// thread observe the value immediately. `raw` optionally carries the
    /// encoded byte representation, sparing the disk tier a second encoding
    /// pass; it also serves as the memory-tier cost.
    pub fn set(&self, key: &str, value: V, raw: Option<&[u8]>) -> Result<(), CacheError> {
        let cost = raw.map(|b| b.len() as u64).unwrap_or(0);
        self.memory.set(key, value.clone(), cost);

        match self.write_policy {
            WritePolicy::Sync => self.disk.set(key, &value, raw),
            WritePolicy::Background => {
                let disk = Arc::clone(&self.disk);
                let key = key.to_owned();
                let raw = raw.map(|b| b.to_vec());
                self.io.spawn(async move {
                    if let Err(err) = disk.set(&key, &value, raw.as_deref()) {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            key = %key,
                            "failed to write cache entry to disk"
                        );
                    }
                });
                Ok(())
            }
        }
    }

    /// Returns the value for `key` from the fastest tier holding it.
    ///
    /// A disk hit is promoted into memory before returning, so the next read
    /// is served without touching the disk.
    pub fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        metric!(counter("cache.access") += 1, "cache" => self.name());

        if let Some(value) = self.memory.get(key) {
            metric!(counter("cache.memory.hit") += 1, "cache" => self.name());
            tracing::trace!(key, "value served from memory");
            return Ok(Some(value));
        }

        match self.disk.load(key)? {
            Some((value, size)) => {
                tracing::trace!(key, "value served from disk");
                self.memory.set(key, value.clone(), size);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Removes `key` from both tiers.
    pub fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.memory.remove(key);

        match self.write_policy {
            WritePolicy::Sync => self.disk.remove(key),
            WritePolicy::Background => {
                let disk = Arc::clone(&self.disk);
                let key = key.to_owned();
                self.io.spawn(async move {
                    if let Err(err) = disk.remove(&key) {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            key = %key,
                            "failed to remove cache entry from disk"
                        );
                    }
                });
                Ok(())
            }
        }
    }

    /// Clears the tiers selected by `mode`.
    pub fn clear(&self, mode: ClearMode) -> Result<(), CacheError> {
        if matches!(mode, ClearMode::Memory | ClearMode::Both) {
            self.memory.clear();
        }
        if matches!(mode, ClearMode::Disk | ClearMode::Both) {
            match self.write_policy {
                WritePolicy::Sync => self.disk.clear()?,
                WritePolicy::Background => {
                    let disk = Arc::clone(&self.disk);
                    self.io.spawn(async move {
                        if let Err(err) = disk.clear() {
                            tracing::error!(
                                error = &err as &dyn std::error::Error,
                                "failed to clear disk cache"
                            );
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

impl<V> Store<V> for TieredCache<V>
where
    V: Transformable + Clone + Send + Sync + 'static,
{
    fn set(&self, key: &str, value: V, raw: Option<&[u8]>) -> Result<(), CacheError> {
        TieredCache::set(self, key, value, raw)
    }

    fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        TieredCache::get(self, key)
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        TieredCache::remove(self, key)
    }

    fn clear(&self) -> Result<(), CacheError> {
        TieredCache::clear(self, self.clear_mode)
    }
}
