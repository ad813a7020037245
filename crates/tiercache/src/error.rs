use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// An error raised by any of the cache tiers or the loader.
///
/// This error is intended to be fanned out to every caller waiting on a
/// coalesced load, so it is cheap to clone and carries the underlying OS
/// error as a rendered message together with the path involved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// A value could not be encoded into bytes for the disk tier.
    #[error("failed to encode value: {0}")]
    Encode(String),
    /// Bytes could not be decoded back into a value.
    #[error("failed to decode value: {0}")]
    Decode(String),
    /// The backing directory could not be created.
    #[error("failed to create cache directory {}: {message}", path.display())]
    CreateDirectory { path: PathBuf, message: String },
    /// A cache file could not be written.
    #[error("failed to write cache file {}: {message}", path.display())]
    WriteFile { path: PathBuf, message: String },
    /// A cache file exists but could not be read.
    #[error("failed to read cache file {}: {message}", path.display())]
    ReadFile { path: PathBuf, message: String },
    /// A cache file could not be removed.
    #[error("failed to remove cache file {}: {message}", path.display())]
    RemoveFile { path: PathBuf, message: String },
    /// The backing directory could not be cleared or recreated.
    #[error("failed to clear cache directory {}: {message}", path.display())]
    ClearDirectory { path: PathBuf, message: String },
    /// The backing directory could not be enumerated.
    #[error("failed to enumerate cache directory {}: {message}", path.display())]
    Enumerate { path: PathBuf, message: String },
    /// The remote source failed to deliver bytes for a key.
    ///
    /// The payload is the transport's own rendering of the failure; the
    /// loader treats the transport as an opaque collaborator.
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// The load was abandoned before a result was produced.
    ///
    /// Pending callers are never invoked by [`cancel_all`] or
    /// [`reconfigure`]; this variant only surfaces through the awaitable
    /// [`load_async`] wrapper, whose completion channel is dropped in that
    /// case.
    ///
    /// [`cancel_all`]: crate::loader::Loader::cancel_all
    /// [`reconfigure`]: crate::loader::Loader::reconfigure
    /// [`load_async`]: crate::loader::Loader::load_async
    #[error("load was cancelled")]
    Cancelled,
}

impl CacheError {
    pub(crate) fn create_directory(path: &Path, err: io::Error) -> Self {
        Self::CreateDirectory {
            path: path.to_owned(),
            message: err.to_string(),
        }
    }

    pub(crate) fn write_file(path: &Path, err: impl std::fmt::Display) -> Self {
        Self::WriteFile {
            path: path.to_owned(),
            message: err.to_string(),
        }
    }

    pub(crate) fn read_file(path: &Path, err: io::Error) -> Self {
        Self::ReadFile {
            path: path.to_owned(),
            message: err.to_string(),
        }
    }

    pub(crate) fn remove_file(path: &Path, err: io::Error) -> Self {
        Self::RemoveFile {
            path: path.to_owned(),
            message: err.to_string(),
        }
    }

    pub(crate) fn clear_directory(path: &Path, err: io::Error) -> Self {
        Self::ClearDirectory {
            path: path.to_owned(),
            message: err.to_string(),
        }
    }

    pub(crate) fn enumerate(path: &Path, err: io::Error) -> Self {
        Self::Enumerate {
            path: path.to_owned(),
            message: err.to_string(),
        }
    }
}

