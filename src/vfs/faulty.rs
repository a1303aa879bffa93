//! Failure-injecting [`Vfs`] wrapper for tests.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use super::{AppendFile, Path, StorageError, Vfs, VfsFuture};

/// Operation class a fault applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FaultOp {
    List,
    Read,
    Write,
    Remove,
}

#[derive(Clone, Debug)]
struct Fault {
    op: FaultOp,
    needle: String,
}

/// Delegates to an inner [`Vfs`] and fails operations whose URI contains a
/// configured substring.
pub(crate) struct FaultyVfs {
    inner: Arc<dyn Vfs>,
    faults: Mutex<Vec<Fault>>,
    removed: AtomicUsize,
}

impl FaultyVfs {
    pub(crate) fn new(inner: Arc<dyn Vfs>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Vec::new()),
            removed: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail(&self, op: FaultOp, needle: &str) {
        self.faults.lock().expect("faults lock").push(Fault {
            op,
            needle: needle.to_string(),
        });
    }

    pub(crate) fn clear(&self) {
        self.faults.lock().expect("faults lock").clear();
    }

    pub(crate) fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    fn check(&self, op: FaultOp, uri: &Path) -> Result<(), StorageError> {
        let text = uri.to_string();
        let faults = self.faults.lock().expect("faults lock");
        if faults
            .iter()
            .any(|fault| fault.op == op && text.contains(&fault.needle))
        {
            return Err(StorageError::Injected {
                op: match op {
                    FaultOp::List => "list",
                    FaultOp::Read => "read",
                    FaultOp::Write => "write",
                    FaultOp::Remove => "remove",
                },
                uri: text,
            });
        }
        Ok(())
    }
}

impl Vfs for FaultyVfs {
    fn list<'a>(&'a self, dir: &'a Path) -> VfsFuture<'a, Vec<Path>> {
        Box::pin(async move {
            self.check(FaultOp::List, dir)?;
            self.inner.list(dir).await
        })
    }

    fn read<'a>(&'a self, uri: &'a Path, offset: u64, len: u64) -> VfsFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.check(FaultOp::Read, uri)?;
            self.inner.read(uri, offset, len).await
        })
    }

    fn read_all<'a>(&'a self, uri: &'a Path) -> VfsFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.check(FaultOp::Read, uri)?;
            self.inner.read_all(uri).await
        })
    }

    fn write<'a>(&'a self, uri: &'a Path, bytes: Vec<u8>) -> VfsFuture<'a, ()> {
        Box::pin(async move {
            self.check(FaultOp::Write, uri)?;
            self.inner.write(uri, bytes).await
        })
    }

    fn open_append<'a>(&'a self, uri: &'a Path) -> VfsFuture<'a, Box<dyn AppendFile>> {
        Box::pin(async move {
            self.check(FaultOp::Write, uri)?;
            self.inner.open_append(uri).await
        })
    }

    fn remove<'a>(&'a self, uri: &'a Path) -> VfsFuture<'a, ()> {
        Box::pin(async move {
            self.check(FaultOp::Remove, uri)?;
            self.removed.fetch_add(1, Ordering::SeqCst);
            self.inner.remove(uri).await
        })
    }

    fn create_dir<'a>(&'a self, dir: &'a Path) -> VfsFuture<'a, ()> {
        Box::pin(async move {
            self.check(FaultOp::Write, dir)?;
            self.inner.create_dir(dir).await
        })
    }

    fn exists<'a>(&'a self, uri: &'a Path) -> VfsFuture<'a, bool> {
        Box::pin(async move {
            self.check(FaultOp::Read, uri)?;
            self.inner.exists(uri).await
        })
    }
}
