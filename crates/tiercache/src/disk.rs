//! The on-disk tier.
//!
//! One file per entry in a dedicated directory. There is no index or
//! manifest; directory enumeration is the source of truth. File names are
//! derived from the key, by default as its SHA-256 hex digest.

use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::codec::Transformable;
use crate::config::DiskConfig;
use crate::error::CacheError;
use crate::store::Store;

/// A file removed by [`DiskCache::prune_over_limit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedEntry {
    pub path: PathBuf,
    pub size: u64,
}

struct FileMeta {
    path: PathBuf,
    created: SystemTime,
    size: u64,
}

/// The disk tier: a durable key/value store backed by one file per entry.
pub struct DiskCache<V> {
    config: DiskConfig,
    name: String,
    directory: PathBuf,
    _value: PhantomData<fn() -> V>,
}

impl<V: Transformable> DiskCache<V> {
    /// Creates a disk cache storing under `<root>/tiercache.<name>/`.
    ///
    /// The backing directory is created if absent; failure to create it is
    /// fatal to construction. Two instances with the same name silently
    /// share storage, so names must be unique per logical cache.
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty. An unnamed cache is a programming error,
    /// not a runtime condition.
    pub fn new(name: &str, config: DiskConfig) -> Result<Self, CacheError> {
        assert!(
            !name.is_empty(),
            "a cache must have a non-empty name; an empty name is not permitted"
        );
        let root = config
            .root
            .clone()
            .or_else(dirs::cache_dir)
            .unwrap_or_else(std::env::temp_dir);
        let directory = root.join(format!("tiercache.{name}"));
        prepare_directory(&directory)?;

        Ok(DiskCache {
            config,
            name: name.to_owned(),
            directory,
            _value: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The directory all entries of this cache live in.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Encodes `value` and writes it to the file derived from `key`,
    /// overwriting any existing file.
    ///
    /// When `raw` carries the encoded byte representation it is written
    /// directly, skipping the encoding pass.
    pub fn set(&self, key: &str, value: &V, raw: Option<&[u8]>) -> Result<(), CacheError> {
        let encoded;
        let bytes = match raw {
            Some(raw) => raw,
            None => {
                encoded = value
                    .to_bytes()
                    .map_err(|e| CacheError::Encode(e.to_string()))?;
                &encoded[..]
            }
        };

        let path = self.file_path(key);
        self.write_atomic(&path, bytes)?;

        metric!(counter("cache.disk.write") += 1, "cache" => self.name.as_str());
        metric!(time_raw("cache.disk.file.size") = bytes.len() as u64, "cache" => self.name.as_str());
        tracing::trace!(key, path = %path.display(), "wrote cache file");
        Ok(())
    }

    /// Returns the decoded value for `key`, or `None` if no file exists.
    pub fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        Ok(self.load(key)?.map(|(value, _)| value))
    }

    /// Like [`get`](Self::get), but also returns the entry's byte length,
    /// which the two-tier cache uses as the memory-tier cost on promotion.
    pub(crate) fn load(&self, key: &str) -> Result<Option<(V, u64)>, CacheError> {
        let path = self.file_path(key);
        let Some(bytes) =
            catch_not_found(|| fs::read(&path)).map_err(|e| CacheError::read_file(&path, e))?
        else {
            return Ok(None);
        };

        let value = V::from_bytes(&bytes).map_err(|e| CacheError::Decode(e.to_string()))?;
        metric!(counter("cache.disk.hit") += 1, "cache" => self.name.as_str());
        Ok(Some((value, bytes.len() as u64)))
    }

    /// Deletes the file for `key`. Absence of the file is not an error.
    pub fn remove(&self, key: &str) -> Result<(), CacheError> {
        let path = self.file_path(key);
        catch_not_found(|| fs::remove_file(&path))
            .map_err(|e| CacheError::remove_file(&path, e))?;
        Ok(())
    }

    /// Deletes the entire backing directory and recreates it, so subsequent
    /// writes succeed without a manual re-init step.
    pub fn clear(&self) -> Result<(), CacheError> {
        catch_not_found(|| fs::remove_dir_all(&self.directory))
            .map_err(|e| CacheError::clear_directory(&self.directory, e))?;
        fs::create_dir_all(&self.directory)
            .map_err(|e| CacheError::clear_directory(&self.directory, e))?;
        Ok(())
    }

    /// The total size in bytes of all entries of this cache.
    pub fn total_size(&self) -> Result<u64, CacheError> {
        Ok(self.enumerate()?.iter().map(|m| m.size).sum())
    }

    /// Removes size-exceeded entries, oldest first.
    ///
    /// A configured size limit of `0` disables eviction. Otherwise, once the
    /// total size reaches the limit, files are deleted oldest-created first
    /// until the total drops to half the limit. The gap between trigger and
    /// target keeps repeated prune passes from thrashing at the boundary.
    ///
    /// Creation time stands in for recency here: files that are read often
    /// but never rewritten are still eviction candidates ahead of
    /// rarely-read but recently-written ones. No access-time tracking is
    /// maintained.
    ///
    /// This is a maintenance operation. It is never invoked by `set` or
    /// `get`; schedule it periodically from the outside.
    pub fn prune_over_limit(&self) -> Result<Vec<RemovedEntry>, CacheError> {
        if self.config.size_limit == 0 {
            return Ok(Vec::new());
        }

        let mut metas = self.enumerate()?;
        let mut size: u64 = metas.iter().map(|m| m.size).sum();
        if size < self.config.size_limit {
            return Ok(Vec::new());
        }

        // Newest first; eviction consumes the list from its tail.
        metas.sort_by(|a, b| b.created.cmp(&a.created));

        let target = self.config.size_limit / 2;
        let mut removed = Vec::new();
        while size > target {
            let Some(meta) = metas.pop() else {
                break;
            };
            catch_not_found(|| fs::remove_file(&meta.path))
                .map_err(|e| CacheError::remove_file(&meta.path, e))?;
            size = size.saturating_sub(meta.size);
            removed.push(RemovedEntry {
                path: meta.path,
                size: meta.size,
            });
        }

        if !removed.is_empty() {
            let bytes: u64 = removed.iter().map(|e| e.size).sum();
            metric!(counter("cache.disk.prune.removed_files") += removed.len() as i64, "cache" => self.name.as_str());
            metric!(counter("cache.disk.prune.removed_bytes") += bytes as i64, "cache" => self.name.as_str());
            tracing::debug!(
                cache = %self.name,
                files = removed.len(),
                bytes,
                "pruned size-exceeded cache files"
            );
        }
        Ok(removed)
    }

    /// Lists all entry files with their creation timestamp and size.
    fn enumerate(&self) -> Result<Vec<FileMeta>, CacheError> {
        let entries = fs::read_dir(&self.directory)
            .map_err(|e| CacheError::enumerate(&self.directory, e))?;

        let mut metas = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CacheError::enumerate(&self.directory, e))?;
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'))
            {
                // hidden files, including in-progress temp files
                continue;
            }
            // The file may be removed concurrently between listing and stat.
            let Some(metadata) = catch_not_found(|| entry.metadata())
                .map_err(|e| CacheError::enumerate(&self.directory, e))?
            else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            // Not every filesystem records a birth time; fall back to mtime.
            let created = metadata
                .created()
                .or_else(|_| metadata.modified())
                .map_err(|e| CacheError::enumerate(&self.directory, e))?;
            metas.push(FileMeta {
                path,
                created,
                size: metadata.len(),
            });
        }
        Ok(metas)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        // Write into a sibling temp file and move it into place, so a
        // crashed writer never leaves a torn entry behind.
        let mut temp_file =
            NamedTempFile::new_in(&self.directory).map_err(|e| CacheError::write_file(path, e))?;
        temp_file
            .write_all(bytes)
            .map_err(|e| CacheError::write_file(path, e))?;
        temp_file
            .persist(path)
            .map_err(|e| CacheError::write_file(path, e))?;
        Ok(())
    }

    pub(crate) fn file_path(&self, key: &str) -> PathBuf {
        self.directory.join(self.file_name(key))
    }

    fn file_name(&self, key: &str) -> String {
        if self.config.use_hashed_file_names {
            let hashed = hash_key(key);
            if let Some(ext) = &self.config.path_extension {
                format!("{hashed}.{ext}")
            } else if self.config.auto_ext_from_key {
                match key_extension(key) {
                    Some(ext) => format!("{hashed}.{ext}"),
                    None => hashed,
                }
            } else {
                hashed
            }
        } else {
            match &self.config.path_extension {
                Some(ext) => format!("{key}.{ext}"),
                None => key.to_owned(),
            }
        }
    }
}

impl<V: Transformable + Send + Sync> Store<V> for DiskCache<V> {
    fn set(&self, key: &str, value: V, raw: Option<&[u8]>) -> Result<(), CacheError> {
        DiskCache::set(self, key, &value, raw)
    }

    fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        DiskCache::get(self, key)
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        DiskCache::remove(self, key)
    }

    fn clear(&self) -> Result<(), CacheError> {
        DiskCache::clear(self)
    }
}

fn prepare_directory(directory: &Path) -> Result<(), CacheError> {
    fs::create_dir_all(directory).map_err(|e| CacheError::create_directory(directory, e))
}

fn hash_key(key: &str) -> String {
    let hash = Sha256::digest(key.as_bytes());
    let mut name = String::with_capacity(hash.len() * 2);
    for b in hash {
        write!(name, "{b:02x}").unwrap();
    }
    name
}

/// Runs `f`, mapping an `io::ErrorKind::NotFound` result to `None`.
///
/// File absence is not an error for cache reads and removals; everything
/// else is surfaced to the caller.
fn catch_not_found<F, R>(f: F) -> std::io::Result<Option<R>>
where
    F: FnOnce() -> std::io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            std::io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

/// Extension inferred from the key's trailing segment: the text after the
/// last `.`, truncated at the first `@`.
fn key_extension(key: &str) -> Option<&str> {
    let (_, ext) = key.rsplit_once('.')?;
    let ext = ext.split('@').next().unwrap_or(ext);
    (!ext.is_empty()).then_some(ext)
}
