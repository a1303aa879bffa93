//! Byte-level storage seam used by every on-disk component.
//!
//! Arrays never talk to a filesystem or object store directly: they go through
//! [`Vfs`], which exposes list/read/write/remove over [`Path`] URIs. The
//! production implementation is [`FusioVfs`], a thin adapter over a `fusio`
//! [`DynFs`](fusio::DynFs).

mod fusio_backend;
#[cfg(test)]
pub(crate) mod faulty;

use std::{future::Future, pin::Pin};

pub use fusio::path::Path;
use thiserror::Error;

pub use self::fusio_backend::FusioVfs;

/// Boxed future returned by [`Vfs`] operations.
pub type VfsFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Failure of an underlying storage operation.
///
/// Retry policy belongs to the storage backend; callers treat every variant as
/// fatal to the current operation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend I/O failure.
    #[error("failed to {op} `{uri}`: {source}")]
    Io {
        /// Operation that failed.
        op: &'static str,
        /// Target URI.
        uri: String,
        /// Backend error.
        #[source]
        source: fusio::Error,
    },
    /// A URI could not be converted into a storage path.
    #[error("invalid path `{uri}`: {reason}")]
    Path {
        /// Offending URI.
        uri: String,
        /// Conversion failure.
        reason: String,
    },
    /// Fewer bytes were available than requested.
    #[error("short read from `{uri}`: wanted {wanted} bytes at offset {offset}, object has {size}")]
    ShortRead {
        /// Target URI.
        uri: String,
        /// Requested offset.
        offset: u64,
        /// Requested length.
        wanted: u64,
        /// Object size.
        size: u64,
    },
    /// Failure injected by a test double.
    #[error("injected failure on {op} `{uri}`")]
    Injected {
        /// Operation that failed.
        op: &'static str,
        /// Target URI.
        uri: String,
    },
}

/// Streaming writer for one object, used for tile files that grow tile by tile.
pub trait AppendFile: Send {
    /// Append bytes at the current end of the object.
    fn append(&mut self, bytes: Vec<u8>) -> VfsFuture<'_, ()>;

    /// Flush and close the object.
    fn close(self: Box<Self>) -> VfsFuture<'static, ()>;
}

/// Storage collaborator consumed by directory listing, tile I/O and vacuum.
pub trait Vfs: Send + Sync {
    /// List the direct children of `dir`. A missing directory lists as empty.
    fn list<'a>(&'a self, dir: &'a Path) -> VfsFuture<'a, Vec<Path>>;

    /// Read `len` bytes starting at `offset`.
    fn read<'a>(&'a self, uri: &'a Path, offset: u64, len: u64) -> VfsFuture<'a, Vec<u8>>;

    /// Read a whole object.
    fn read_all<'a>(&'a self, uri: &'a Path) -> VfsFuture<'a, Vec<u8>>;

    /// Create or replace an object with `bytes`.
    fn write<'a>(&'a self, uri: &'a Path, bytes: Vec<u8>) -> VfsFuture<'a, ()>;

    /// Create or truncate an object for streaming appends.
    fn open_append<'a>(&'a self, uri: &'a Path) -> VfsFuture<'a, Box<dyn AppendFile>>;

    /// Delete one object.
    fn remove<'a>(&'a self, uri: &'a Path) -> VfsFuture<'a, ()>;

    /// Ensure a directory (or prefix) exists.
    fn create_dir<'a>(&'a self, dir: &'a Path) -> VfsFuture<'a, ()>;

    /// `true` when an object exists at `uri`.
    fn exists<'a>(&'a self, uri: &'a Path) -> VfsFuture<'a, bool>;

    /// `true` when `uri` has at least one child.
    fn is_dir<'a>(&'a self, uri: &'a Path) -> VfsFuture<'a, bool> {
        Box::pin(async move { Ok(!self.list(uri).await?.is_empty()) })
    }

    /// Delete every object under `dir`. The default removes the children only,
    /// which suits object stores where a prefix has no existence of its own;
    /// backends with real directories override it to remove `dir` as well.
    fn remove_dir<'a>(&'a self, dir: &'a Path) -> VfsFuture<'a, ()> {
        Box::pin(async move {
            for child in self.list(dir).await? {
                self.remove(&child).await?;
            }
            Ok(())
        })
    }
}

/// Last component of a URI, which carries every name this crate parses.
pub(crate) fn file_name(uri: &Path) -> Option<&str> {
    uri.filename()
}

/// Last component of a URI given as text, as stored in `.vac` files.
pub(crate) fn file_name_str(uri: &str) -> &str {
    let trimmed = uri.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_of_text_uri() {
        assert_eq!(file_name_str("tmp/array/__fragments/__1_1_abc_3"), "__1_1_abc_3");
        assert_eq!(file_name_str("__1_1_abc_3/"), "__1_1_abc_3");
        assert_eq!(file_name_str("plain"), "plain");
    }
}
