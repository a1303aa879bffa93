//! Physical deletion of consolidated-away files.
//!
//! A vacuum pass takes a fresh directory snapshot over the whole history and
//! deletes, phase by phase, what the applicable `.vac` markers supersede:
//! data directories first, then their commit markers, then the `.vac` markers
//! themselves. Array metadata files follow the same scheme. A failed phase
//! stops the pass. Until its commit marker is gone a half-deleted input is
//! still listed as superseded, so the next pass picks it up again.

use std::sync::Arc;

use futures::{StreamExt, stream};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    directory::{ArrayDirectory, DirectoryError, DirectoryMode},
    error::ErrorClass,
    observability::{log_info, log_warn},
    timestamp::TimestampRange,
    vfs::{Path, StorageError, Vfs},
};

/// Failures of a vacuum pass.
#[derive(Debug, Error)]
pub enum VacuumError {
    /// Listing the array failed.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    /// A deletion failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The pass observed its cancellation token.
    #[error("vacuum cancelled")]
    Cancelled,
}

impl VacuumError {
    /// Taxonomy class of this failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            VacuumError::Directory(err) => err.class(),
            VacuumError::Storage(_) => ErrorClass::StorageIo,
            VacuumError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

/// Files removed by a vacuum pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VacuumReport {
    /// Commit markers of superseded fragments.
    pub commits_removed: usize,
    /// Superseded fragment data directories.
    pub fragments_removed: usize,
    /// Applied fragment `.vac` markers.
    pub vac_files_removed: usize,
    /// Superseded array metadata files.
    pub meta_files_removed: usize,
    /// Applied array metadata `.vac` markers.
    pub meta_vac_files_removed: usize,
}

#[derive(Clone, Copy, Debug)]
enum Target {
    File,
    Dir,
}

/// Deletes what consolidation superseded in one array.
pub struct Vacuum {
    vfs: Arc<dyn Vfs>,
    array_uri: Path,
    io_concurrency: usize,
    cancel: CancellationToken,
}

impl Vacuum {
    /// Vacuum for the array at `array_uri`, deleting up to `io_concurrency`
    /// files at once.
    pub fn new(vfs: Arc<dyn Vfs>, array_uri: Path, io_concurrency: usize) -> Self {
        Self {
            vfs,
            array_uri,
            io_concurrency: io_concurrency.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Observe `cancel` between phases.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run one pass.
    pub async fn run(&self) -> Result<VacuumReport, VacuumError> {
        let dir = ArrayDirectory::load(
            self.vfs.as_ref(),
            &self.array_uri,
            TimestampRange::ALL,
            DirectoryMode::Vacuum,
            &self.cancel,
        )
        .await?;
        let filtered = dir.filtered_fragment_uris(true);

        let fragments_removed = self.remove_all(&filtered.fragment_uris_to_vacuum, Target::Dir).await?;
        let report = VacuumReport {
            fragments_removed,
            commits_removed: self.remove_all(&filtered.commit_uris_to_vacuum, Target::File).await?,
            vac_files_removed: self.remove_all(&filtered.vac_uris_to_vacuum, Target::File).await?,
            meta_files_removed: self.remove_all(&dir.array_meta_uris_to_vacuum(), Target::File).await?,
            meta_vac_files_removed: self
                .remove_all(&dir.array_meta_vac_uris_to_vacuum(), Target::File)
                .await?,
        };
        log_info!(
            "vacuum",
            "vacuum_completed",
            array = %self.array_uri,
            commits = report.commits_removed,
            fragments = report.fragments_removed,
            vac_files = report.vac_files_removed,
            meta_files = report.meta_files_removed,
            meta_vac_files = report.meta_vac_files_removed,
        );
        Ok(report)
    }

    /// Delete every URI of one phase. All deletions are attempted; the first
    /// failure is returned afterwards.
    async fn remove_all(&self, uris: &[Path], target: Target) -> Result<usize, VacuumError> {
        if self.cancel.is_cancelled() {
            return Err(VacuumError::Cancelled);
        }
        let results: Vec<(&Path, Result<(), StorageError>)> = stream::iter(uris)
            .map(|uri| async move {
                let result = match target {
                    Target::File => self.vfs.remove(uri).await,
                    Target::Dir => self.vfs.remove_dir(uri).await,
                };
                (uri, result)
            })
            .buffer_unordered(self.io_concurrency)
            .collect()
            .await;

        let mut first = None;
        for (uri, result) in results {
            if let Err(err) = result {
                log_warn!(
                    "vacuum",
                    "vacuum_remove_failed",
                    uri = %uri,
                    error = %err,
                );
                first.get_or_insert(err);
            }
        }
        match first {
            Some(err) => Err(err.into()),
            None => Ok(uris.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fragment::{COMMITS_DIR, FRAGMENTS_DIR, FragmentName, META_DIR, SCHEMA_DIR},
        vfs::{
            FusioVfs,
            faulty::{FaultOp, FaultyVfs},
        },
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        vfs: Arc<dyn Vfs>,
        root: Path,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let vfs: Arc<dyn Vfs> = Arc::new(FusioVfs::local());
            let root = FusioVfs::local_path(dir.path()).expect("root");
            for sub in [SCHEMA_DIR, COMMITS_DIR, FRAGMENTS_DIR, META_DIR] {
                vfs.create_dir(&root.child(sub)).await.expect("mkdir");
            }
            vfs.write(&root.child(SCHEMA_DIR).child("__0_0_01S_3"), b"{}".to_vec())
                .await
                .expect("schema");
            Self { _dir: dir, vfs, root }
        }

        /// A committed fragment with one data file.
        async fn fragment(&self, start: u64, end: u64) -> FragmentName {
            let name = FragmentName::generate(TimestampRange::new(start, end));
            let data = name.data_dir(&self.root);
            self.vfs.create_dir(&data).await.expect("mkdir");
            self.vfs.write(&data.child("d0.tdb"), vec![1]).await.expect("data");
            self.vfs
                .write(&self.root.child(COMMITS_DIR).child(name.commit_file().as_str()), Vec::new())
                .await
                .expect("commit");
            name
        }

        async fn vac(&self, name: &FragmentName, inputs: &[&FragmentName]) {
            let body: String = inputs
                .iter()
                .map(|input| format!("{}\n", input.data_dir(&self.root)))
                .collect();
            self.vfs
                .write(&self.root.child(COMMITS_DIR).child(name.vac_file().as_str()), body.into_bytes())
                .await
                .expect("vac");
        }

        async fn commits(&self) -> Vec<String> {
            let mut names: Vec<String> = self
                .vfs
                .list(&self.root.child(COMMITS_DIR))
                .await
                .expect("list")
                .iter()
                .filter_map(|uri| crate::vfs::file_name(uri).map(str::to_string))
                .collect();
            names.sort();
            names
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn removes_inputs_then_markers() {
        let fx = Fixture::new().await;
        let a = fx.fragment(1, 1).await;
        let b = fx.fragment(2, 2).await;
        let merged = fx.fragment(1, 2).await;
        fx.vac(&merged, &[&a, &b]).await;

        let report = Vacuum::new(fx.vfs.clone(), fx.root.clone(), 4).run().await.expect("vacuum");
        assert_eq!(report.commits_removed, 2);
        assert_eq!(report.fragments_removed, 2);
        assert_eq!(report.vac_files_removed, 1);
        assert_eq!(fx.commits().await, vec![merged.commit_file()]);
        assert!(!fx
            .vfs
            .exists(&a.data_dir(&fx.root).child("d0.tdb"))
            .await
            .expect("exists"));
        assert!(fx
            .vfs
            .exists(&merged.data_dir(&fx.root).child("d0.tdb"))
            .await
            .expect("exists"));

        let again = Vacuum::new(fx.vfs.clone(), fx.root.clone(), 4).run().await.expect("vacuum");
        assert_eq!(again, VacuumReport::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_data_phase_is_retried() {
        let fx = Fixture::new().await;
        let a = fx.fragment(1, 1).await;
        let merged = fx.fragment(1, 2).await;
        fx.vac(&merged, &[&a]).await;
        let data = a.data_dir(&fx.root).child("d0.tdb");

        let faulty = Arc::new(FaultyVfs::new(fx.vfs.clone()));
        faulty.fail(FaultOp::Remove, "d0.tdb");
        let err = Vacuum::new(faulty.clone(), fx.root.clone(), 4)
            .run()
            .await
            .expect_err("remove failure");
        assert_eq!(err.class(), ErrorClass::StorageIo);
        assert!(fx.vfs.exists(&data).await.expect("exists"));
        let commits = fx.commits().await;
        assert!(commits.contains(&a.commit_file()));
        assert!(commits.contains(&merged.vac_file()));

        faulty.clear();
        let report = Vacuum::new(faulty, fx.root.clone(), 4).run().await.expect("retry");
        assert_eq!(report.fragments_removed, 1);
        assert_eq!(report.commits_removed, 1);
        assert_eq!(report.vac_files_removed, 1);
        assert!(!fx.vfs.exists(&data).await.expect("exists"));
        assert_eq!(fx.commits().await, vec![merged.commit_file()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_commit_phase_keeps_vac() {
        let fx = Fixture::new().await;
        let a = fx.fragment(1, 1).await;
        let merged = fx.fragment(1, 2).await;
        fx.vac(&merged, &[&a]).await;

        let faulty = Arc::new(FaultyVfs::new(fx.vfs.clone()));
        faulty.fail(FaultOp::Remove, &a.commit_file());
        let err = Vacuum::new(faulty.clone(), fx.root.clone(), 4)
            .run()
            .await
            .expect_err("remove failure");
        assert_eq!(err.class(), ErrorClass::StorageIo);
        assert!(fx.commits().await.contains(&merged.vac_file()));

        faulty.clear();
        let report = Vacuum::new(faulty, fx.root.clone(), 4).run().await.expect("retry");
        assert_eq!(report.commits_removed, 1);
        assert_eq!(report.vac_files_removed, 1);
        assert_eq!(fx.commits().await, vec![merged.commit_file()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn uncommitted_vac_is_ignored() {
        let fx = Fixture::new().await;
        let a = fx.fragment(1, 1).await;
        let orphan = FragmentName::generate(TimestampRange::new(1, 1));
        fx.vac(&orphan, &[&a]).await;

        let report = Vacuum::new(fx.vfs.clone(), fx.root.clone(), 4).run().await.expect("vacuum");
        assert_eq!(report, VacuumReport::default());
        assert_eq!(fx.commits().await.len(), 2);
    }
}
