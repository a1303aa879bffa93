//! [`Vfs`] implementation backed by a `fusio` filesystem.

use std::{io, sync::Arc};

use fusio::{DynFs, Read, Write, fs::OpenOptions, path::Path};
use futures::StreamExt;

use super::{AppendFile, StorageError, Vfs, VfsFuture};

fn io_err(op: &'static str, uri: &Path, source: fusio::Error) -> StorageError {
    StorageError::Io {
        op,
        uri: uri.to_string(),
        source,
    }
}

fn is_not_found(err: &fusio::Error) -> bool {
    matches!(err, fusio::Error::Io(inner) if inner.kind() == io::ErrorKind::NotFound)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(not(feature = "tokio"), allow(dead_code))]
enum FileSystemTag {
    Local,
    Other,
}

/// Storage facade over any `fusio` [`DynFs`].
#[derive(Clone)]
pub struct FusioVfs {
    fs: Arc<dyn DynFs>,
    tag: FileSystemTag,
}

impl FusioVfs {
    /// Wrap an existing filesystem. Directories are treated as key prefixes
    /// that vanish with their last object.
    pub fn new(fs: Arc<dyn DynFs>) -> Self {
        Self {
            fs,
            tag: FileSystemTag::Other,
        }
    }

    /// Local-disk filesystem.
    #[cfg(feature = "tokio")]
    pub fn local() -> Self {
        Self {
            fs: Arc::new(fusio::disk::LocalFs {}),
            tag: FileSystemTag::Local,
        }
    }

    /// Convert a local directory into a root URI for arrays.
    pub fn local_path(path: impl AsRef<std::path::Path>) -> Result<Path, StorageError> {
        let path = path.as_ref();
        Path::from_filesystem_path(path).map_err(|err| StorageError::Path {
            uri: path.display().to_string(),
            reason: err.to_string(),
        })
    }

    fn read_options() -> OpenOptions {
        OpenOptions::default().read(true)
    }

    fn write_options() -> OpenOptions {
        OpenOptions::default().create(true).write(true).truncate(true)
    }
}

struct FusioAppendFile<F> {
    uri: Path,
    file: F,
}

impl<F> AppendFile for FusioAppendFile<F>
where
    F: Write + Send + 'static,
{
    fn append(&mut self, bytes: Vec<u8>) -> VfsFuture<'_, ()> {
        Box::pin(async move {
            let (result, _) = self.file.write_all(bytes).await;
            result.map_err(|err| io_err("append to", &self.uri, err))
        })
    }

    fn close(self: Box<Self>) -> VfsFuture<'static, ()> {
        Box::pin(async move {
            let FusioAppendFile { uri, mut file } = *self;
            file.flush().await.map_err(|err| io_err("flush", &uri, err))?;
            file.close().await.map_err(|err| io_err("close", &uri, err))
        })
    }
}

impl Vfs for FusioVfs {
    fn list<'a>(&'a self, dir: &'a Path) -> VfsFuture<'a, Vec<Path>> {
        Box::pin(async move {
            let mut entries = Vec::new();
            let mut stream = match self.fs.list(dir).await {
                Ok(stream) => stream,
                Err(err) if is_not_found(&err) => return Ok(entries),
                Err(err) => return Err(io_err("list", dir, err)),
            };
            while let Some(meta) = stream.next().await {
                let meta = meta.map_err(|err| io_err("list", dir, err))?;
                if meta.path.filename().is_some() {
                    entries.push(meta.path);
                }
            }
            Ok(entries)
        })
    }

    fn read<'a>(&'a self, uri: &'a Path, offset: u64, len: u64) -> VfsFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let mut file = self
                .fs
                .open_options(uri, Self::read_options())
                .await
                .map_err(|err| io_err("open", uri, err))?;
            let size = file.size().await.map_err(|err| io_err("stat", uri, err))?;
            if offset.saturating_add(len) > size {
                return Err(StorageError::ShortRead {
                    uri: uri.to_string(),
                    offset,
                    wanted: len,
                    size,
                });
            }
            let (result, buf) = file.read_exact_at(vec![0u8; len as usize], offset).await;
            result.map_err(|err| io_err("read", uri, err))?;
            Ok(buf)
        })
    }

    fn read_all<'a>(&'a self, uri: &'a Path) -> VfsFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let mut file = self
                .fs
                .open_options(uri, Self::read_options())
                .await
                .map_err(|err| io_err("open", uri, err))?;
            let (result, data) = file.read_to_end_at(Vec::new(), 0).await;
            result.map_err(|err| io_err("read", uri, err))?;
            Ok(data)
        })
    }

    fn write<'a>(&'a self, uri: &'a Path, bytes: Vec<u8>) -> VfsFuture<'a, ()> {
        Box::pin(async move {
            let mut file = self
                .fs
                .open_options(uri, Self::write_options())
                .await
                .map_err(|err| io_err("create", uri, err))?;
            let (result, _) = file.write_all(bytes).await;
            result.map_err(|err| io_err("write", uri, err))?;
            file.flush().await.map_err(|err| io_err("flush", uri, err))?;
            file.close().await.map_err(|err| io_err("close", uri, err))
        })
    }

    fn open_append<'a>(&'a self, uri: &'a Path) -> VfsFuture<'a, Box<dyn AppendFile>> {
        Box::pin(async move {
            let file = self
                .fs
                .open_options(uri, Self::write_options())
                .await
                .map_err(|err| io_err("create", uri, err))?;
            Ok(Box::new(FusioAppendFile {
                uri: uri.clone(),
                file,
            }) as Box<dyn AppendFile>)
        })
    }

    fn remove<'a>(&'a self, uri: &'a Path) -> VfsFuture<'a, ()> {
        Box::pin(async move {
            match self.fs.remove(uri).await {
                Ok(()) => Ok(()),
                Err(err) if is_not_found(&err) => Ok(()),
                Err(err) => Err(io_err("remove", uri, err)),
            }
        })
    }

    fn remove_dir<'a>(&'a self, dir: &'a Path) -> VfsFuture<'a, ()> {
        Box::pin(async move {
            for child in self.list(dir).await? {
                self.remove(&child).await?;
            }
            if self.tag == FileSystemTag::Local {
                remove_local_dir(dir).await?;
            }
            Ok(())
        })
    }

    fn create_dir<'a>(&'a self, dir: &'a Path) -> VfsFuture<'a, ()> {
        Box::pin(async move {
            self.fs
                .create_dir_all(dir)
                .await
                .map_err(|err| io_err("create directory", dir, err))
        })
    }

    fn exists<'a>(&'a self, uri: &'a Path) -> VfsFuture<'a, bool> {
        Box::pin(async move {
            match self.fs.open_options(uri, Self::read_options()).await {
                Ok(_) => Ok(true),
                Err(err) if is_not_found(&err) => Ok(false),
                Err(err) => Err(io_err("open", uri, err)),
            }
        })
    }
}

#[cfg(feature = "tokio")]
async fn remove_local_dir(dir: &Path) -> Result<(), StorageError> {
    let local = fusio::path::path_to_local(dir).map_err(|err| StorageError::Path {
        uri: dir.to_string(),
        reason: err.to_string(),
    })?;
    match tokio::fs::remove_dir(&local).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err("remove directory", dir, fusio::Error::Io(err))),
    }
}

#[cfg(not(feature = "tokio"))]
async fn remove_local_dir(_dir: &Path) -> Result<(), StorageError> {
    Ok(())
}

#[cfg(all(test, feature = "tokio"))]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_list_read_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = FusioVfs::local_path(dir.path()).expect("root");
        let vfs = FusioVfs::local();

        let sub = root.child("__commits");
        vfs.create_dir(&sub).await.expect("mkdir");
        let file = sub.child("one.wrt");
        vfs.write(&file, b"hello world".to_vec()).await.expect("write");

        let listed = vfs.list(&sub).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].filename(), Some("one.wrt"));
        assert!(vfs.exists(&file).await.expect("exists"));
        assert!(vfs.is_dir(&sub).await.expect("is_dir"));

        assert_eq!(vfs.read(&file, 6, 5).await.expect("range"), b"world".to_vec());
        assert!(matches!(
            vfs.read(&file, 6, 50).await,
            Err(StorageError::ShortRead { .. })
        ));

        vfs.remove(&file).await.expect("remove");
        assert!(!vfs.exists(&file).await.expect("exists after remove"));
        assert!(vfs.list(&root.child("missing")).await.expect("missing").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn append_file_streams_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = FusioVfs::local_path(dir.path()).expect("root");
        let vfs = FusioVfs::local();
        let uri = root.child("d0.tdb");

        let mut file = vfs.open_append(&uri).await.expect("open");
        file.append(vec![1, 2, 3]).await.expect("first");
        file.append(vec![4, 5]).await.expect("second");
        file.close().await.expect("close");

        assert_eq!(vfs.read_all(&uri).await.expect("read"), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remove_dir_deletes_the_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = FusioVfs::local_path(dir.path()).expect("root");
        let vfs = FusioVfs::local();
        let fragment = root.child("__1_1_01A_3");
        vfs.create_dir(&fragment).await.expect("mkdir");
        vfs.write(&fragment.child("d0.tdb"), vec![1]).await.expect("d0");
        vfs.write(&fragment.child("a0.tdb"), vec![2]).await.expect("a0");

        vfs.remove_dir(&fragment).await.expect("remove_dir");
        assert!(!dir.path().join("__1_1_01A_3").exists());
        vfs.remove_dir(&fragment).await.expect("remove missing dir");
    }
}
