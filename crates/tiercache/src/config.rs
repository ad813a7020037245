use std::path::PathBuf;

use serde::Deserialize;

/// Limits for the in-memory tier.
///
/// Both limits are soft caps: the tier evicts least-recently-used entries
/// until it is back under them. A limit of `0` means "no limit" for that
/// dimension.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum number of entries held in memory.
    pub max_entries: usize,
    /// Maximum total cost in bytes.
    ///
    /// An entry's cost is the length of its encoded byte representation when
    /// one is known at insertion time, and `0` otherwise.
    pub max_total_cost: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            max_entries: 1_000,
            max_total_cost: 256 * 1024 * 1024,
        }
    }
}

/// Configuration for the on-disk tier.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Root directory under which the cache directory is created.
    ///
    /// The tier appends a namespaced directory derived from the cache name,
    /// so several caches can share one root. Defaults to the user cache
    /// directory.
    pub root: Option<PathBuf>,
    /// Size limit in bytes for all files of this cache. `0` means no limit
    /// and disables pruning.
    pub size_limit: u64,
    /// Extension appended to every cache file name.
    pub path_extension: Option<String>,
    /// Derive file names by hashing the key instead of using it literally.
    pub use_hashed_file_names: bool,
    /// With hashed file names, append an extension inferred from the key's
    /// own trailing segment.
    pub auto_ext_from_key: bool,
}

impl Default for DiskConfig {
    fn default() -> Self {
        DiskConfig {
            root: None,
            size_limit: 0,
            path_extension: None,
            use_hashed_file_names: true,
            auto_ext_from_key: false,
        }
    }
}

impl DiskConfig {
    /// A disk tier with the given size limit, storing under the default root.
    pub fn with_size_limit(size_limit: u64) -> Self {
        DiskConfig {
            size_limit,
            ..Default::default()
        }
    }
}

/// When the two-tier cache performs disk writes and removals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritePolicy {
    /// Disk writes happen inline and their failures are surfaced to the
    /// caller.
    Sync,
    /// Disk writes are dispatched to the I/O runtime; failures are logged
    /// and swallowed. A successful `set` does not imply durability.
    Background,
}

impl Default for WritePolicy {
    fn default() -> Self {
        WritePolicy::Background
    }
}

/// Which tiers a `clear` call wipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClearMode {
    Memory,
    Disk,
    Both,
}

impl Default for ClearMode {
    fn default() -> Self {
        ClearMode::Both
    }
}

/// Configuration for a [`TieredCache`](crate::tiered::TieredCache).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TieredConfig {
    pub memory: MemoryConfig,
    pub disk: DiskConfig,
    pub write_policy: WritePolicy,
    /// Mode used by the trait-level `clear()`; the inherent
    /// `clear(mode)` takes an explicit mode instead.
    pub clear_mode: ClearMode,
}

/// Configuration for a [`Loader`](crate::loader::Loader).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Upper bound on concurrently running fetches.
    pub max_concurrent_fetches: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            max_concurrent_fetches: 6,
        }
    }
}
