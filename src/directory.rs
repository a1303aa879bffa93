//! Array directory: a snapshot of every file relevant to one logical open of
//! an array, classified for a timestamp window and a mode.
//!
//! Loading performs all listing and `.vac` reads up front. Everything after
//! [`ArrayDirectory::load`] is a pure function of the snapshot, so repeated
//! classification of the same snapshot always yields the same answer.

use std::collections::{HashMap, HashSet};

use futures::future::try_join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ErrorClass, FormatError},
    fragment::{COMMITS_DIR, FragmentName, META_DIR, SCHEMA_DIR, VAC_SUFFIX, WRT_SUFFIX, split_suffix},
    observability::log_debug,
    timestamp::TimestampRange,
    vfs::{Path, StorageError, Vfs, file_name, file_name_str},
};

/// Errors raised while loading a directory snapshot.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Listing or reading failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A managed file name could not be parsed.
    #[error(transparent)]
    Format(#[from] FormatError),
    /// No schema exists under the root.
    #[error("no array at `{0}`")]
    ArrayNotFound(String),
    /// The requested window has `start > end`.
    #[error("invalid timestamp window {0}")]
    InvalidRange(TimestampRange),
    /// The load observed its cancellation token.
    #[error("directory load cancelled")]
    Cancelled,
}

impl DirectoryError {
    /// Taxonomy class of this failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            DirectoryError::Storage(_) => ErrorClass::StorageIo,
            DirectoryError::Format(_) => ErrorClass::Format,
            DirectoryError::ArrayNotFound(_) | DirectoryError::InvalidRange(_) => ErrorClass::Invalid,
            DirectoryError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

/// Purpose of a directory snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectoryMode {
    /// Open for reading. Fragments with per-cell timestamps may overlap the
    /// window partially.
    Read,
    /// Plan a consolidation. Only fully contained fragments qualify.
    Consolidate,
    /// Plan a vacuum.
    Vacuum,
}

/// A committed fragment and its data directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentUri {
    /// Parsed fragment name.
    pub name: FragmentName,
    /// Data directory under `__fragments`.
    pub uri: Path,
}

/// A timestamped array-metadata file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaUri {
    /// Parsed file name.
    pub name: FragmentName,
    /// File URI under `__meta`.
    pub uri: Path,
}

/// Result of [`ArrayDirectory::filtered_fragment_uris`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilteredFragmentUris {
    /// Visible fragments in `(t_start, t_end, uuid)` order.
    pub fragment_uris: Vec<FragmentUri>,
    /// Fragment data directories superseded by an applicable `.vac` file.
    pub fragment_uris_to_vacuum: Vec<Path>,
    /// Commit markers of the superseded fragments. Only filled in vacuum mode.
    pub commit_uris_to_vacuum: Vec<Path>,
    /// `.vac` files whose every listed fragment lies inside the window.
    pub vac_uris_to_vacuum: Vec<Path>,
}

#[derive(Clone, Debug)]
struct VacFile {
    name: FragmentName,
    uri: Path,
    entries: Vec<String>,
}

/// Immutable classification of an array root for one window and mode.
#[derive(Clone, Debug)]
pub struct ArrayDirectory {
    uri: Path,
    range: TimestampRange,
    mode: DirectoryMode,
    fragments: Vec<FragmentName>,
    commit_uris: Vec<(FragmentName, Path)>,
    vac_files: Vec<VacFile>,
    array_schema_uris: Vec<Path>,
    array_meta: Vec<MetaUri>,
    array_meta_vac_files: Vec<VacFile>,
}

fn parse_managed(uri: &Path) -> Result<Option<(FragmentName, Option<String>)>, FormatError> {
    let Some(file) = file_name(uri) else {
        return Ok(None);
    };
    if file.starts_with('.') {
        return Ok(None);
    }
    let (stem, ext) = split_suffix(file);
    Ok(Some((FragmentName::parse(stem)?, ext.map(str::to_string))))
}

fn unknown_suffix(uri: &Path) -> FormatError {
    FormatError::MalformedName {
        name: uri.to_string(),
        reason: "unknown file suffix",
    }
}

async fn read_vac_files(vfs: &dyn Vfs, files: Vec<(FragmentName, Path)>) -> Result<Vec<VacFile>, StorageError> {
    try_join_all(files.into_iter().map(|(name, uri)| async move {
        let bytes = vfs.read_all(&uri).await?;
        let entries = String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| file_name_str(line).to_string())
            .collect();
        Ok::<_, StorageError>(VacFile { name, uri, entries })
    }))
    .await
}

impl ArrayDirectory {
    /// List and classify the array rooted at `uri`.
    ///
    /// All-or-nothing: any listing or `.vac` read failure aborts the load.
    pub async fn load(
        vfs: &dyn Vfs,
        uri: &Path,
        range: TimestampRange,
        mode: DirectoryMode,
        cancel: &CancellationToken,
    ) -> Result<Self, DirectoryError> {
        if !range.is_valid() {
            return Err(DirectoryError::InvalidRange(range));
        }
        let schema_dir = uri.child(SCHEMA_DIR);
        let commits_dir = uri.child(COMMITS_DIR);
        let meta_dir = uri.child(META_DIR);
        let (schemas, commits, metas) = futures::try_join!(
            vfs.list(&schema_dir),
            vfs.list(&commits_dir),
            vfs.list(&meta_dir)
        )?;
        if cancel.is_cancelled() {
            return Err(DirectoryError::Cancelled);
        }

        let mut array_schema_uris = Vec::new();
        for schema in schemas {
            if let Some((name, None)) = parse_managed(&schema)? {
                array_schema_uris.push((name, schema));
            }
        }
        if array_schema_uris.is_empty() {
            return Err(DirectoryError::ArrayNotFound(uri.to_string()));
        }
        array_schema_uris.sort_by(|a, b| a.0.cmp(&b.0));

        let mut fragments = Vec::new();
        let mut commit_uris = Vec::new();
        let mut vac_candidates = Vec::new();
        for commit in commits {
            match parse_managed(&commit)? {
                None => {}
                Some((name, Some(ext))) if ext == WRT_SUFFIX => {
                    fragments.push(name.clone());
                    commit_uris.push((name, commit));
                }
                Some((name, Some(ext))) if ext == VAC_SUFFIX => vac_candidates.push((name, commit)),
                Some(_) => return Err(unknown_suffix(&commit).into()),
            }
        }
        fragments.sort();
        commit_uris.sort_by(|a, b| a.0.cmp(&b.0));
        let committed: HashSet<&FragmentName> = fragments.iter().collect();
        // A `.vac` written by a consolidation that never committed is ignored.
        vac_candidates.retain(|(name, _)| committed.contains(name));

        let mut array_meta = Vec::new();
        let mut meta_vac_candidates = Vec::new();
        for meta in metas {
            match parse_managed(&meta)? {
                None => {}
                Some((name, None)) => array_meta.push(MetaUri { name, uri: meta }),
                Some((name, Some(ext))) if ext == VAC_SUFFIX => meta_vac_candidates.push((name, meta)),
                Some(_) => return Err(unknown_suffix(&meta).into()),
            }
        }
        array_meta.sort_by(|a, b| a.name.cmp(&b.name));
        let meta_names: HashSet<&FragmentName> = array_meta.iter().map(|m| &m.name).collect();
        meta_vac_candidates.retain(|(name, _)| meta_names.contains(name));

        let (vac_files, array_meta_vac_files) = futures::try_join!(
            read_vac_files(vfs, vac_candidates),
            read_vac_files(vfs, meta_vac_candidates)
        )?;
        if cancel.is_cancelled() {
            return Err(DirectoryError::Cancelled);
        }

        log_debug!(
            "directory",
            "directory_loaded",
            array = %uri,
            range = %range,
            mode = ?mode,
            fragments = fragments.len(),
            vac_files = vac_files.len(),
            schemas = array_schema_uris.len(),
            meta_files = array_meta.len(),
        );
        Ok(Self {
            uri: uri.clone(),
            range,
            mode,
            fragments,
            commit_uris,
            vac_files,
            array_schema_uris: array_schema_uris.into_iter().map(|(_, uri)| uri).collect(),
            array_meta,
            array_meta_vac_files,
        })
    }

    /// Array root.
    pub fn uri(&self) -> &Path {
        &self.uri
    }

    /// Window the snapshot was loaded for.
    pub fn range(&self) -> TimestampRange {
        self.range
    }

    /// Mode the snapshot was loaded for.
    pub fn mode(&self) -> DirectoryMode {
        self.mode
    }

    fn partial_allowed(&self, full_overlap_only: bool, name: &FragmentName) -> bool {
        !full_overlap_only && self.mode == DirectoryMode::Read && name.supports_timestamps()
    }

    /// Visible fragments and the files a vacuum may delete.
    ///
    /// With `full_overlap_only` a fragment qualifies only when its range lies
    /// inside the window; otherwise fragments whose format carries per-cell
    /// timestamps qualify on any overlap (read mode only).
    pub fn filtered_fragment_uris(&self, full_overlap_only: bool) -> FilteredFragmentUris {
        let overlaps = |name: &FragmentName| {
            name.range()
                .overlaps(&self.range, self.partial_allowed(full_overlap_only, name))
        };
        // Outside reads a marker hides its inputs as soon as its fragment
        // touches the window, so a superseded run is never merged twice.
        let applies = |name: &FragmentName| match self.mode {
            DirectoryMode::Read => overlaps(name),
            DirectoryMode::Consolidate | DirectoryMode::Vacuum => name.range().overlaps(&self.range, true),
        };
        let (vacuumed, vac_uris_to_vacuum) = classify_vacuum(&self.fragments, &self.vac_files, &overlaps, &applies);

        let mut out = FilteredFragmentUris {
            vac_uris_to_vacuum,
            ..Default::default()
        };
        for name in &self.fragments {
            if !overlaps(name) {
                continue;
            }
            if vacuumed.contains(name) {
                out.fragment_uris_to_vacuum.push(name.data_dir(&self.uri));
            } else {
                out.fragment_uris.push(FragmentUri {
                    name: name.clone(),
                    uri: name.data_dir(&self.uri),
                });
            }
        }
        if self.mode == DirectoryMode::Vacuum {
            out.commit_uris_to_vacuum = self
                .commit_uris
                .iter()
                .filter(|(name, _)| vacuumed.contains(name))
                .map(|(_, uri)| uri.clone())
                .collect();
        }
        out
    }

    /// Data directories and `.vac` files a vacuum over this snapshot may
    /// delete, under the full-overlap rule.
    pub fn compute_uris_to_vacuum(&self) -> (Vec<Path>, Vec<Path>) {
        let filtered = self.filtered_fragment_uris(true);
        (filtered.fragment_uris_to_vacuum, filtered.vac_uris_to_vacuum)
    }

    /// Commit markers of every fragment fully inside the window.
    pub fn commit_uris_to_consolidate(&self) -> Vec<Path> {
        self.commit_uris
            .iter()
            .filter(|(name, _)| name.range().is_within(&self.range))
            .map(|(_, uri)| uri.clone())
            .collect()
    }

    /// Every committed fragment, regardless of window or vacuum markers.
    pub fn committed_fragments(&self) -> &[FragmentName] {
        &self.fragments
    }

    /// Schema documents in name order.
    pub fn array_schema_uris(&self) -> &[Path] {
        &self.array_schema_uris
    }

    /// Newest schema document.
    pub fn latest_array_schema_uri(&self) -> Option<&Path> {
        self.array_schema_uris.last()
    }

    fn classify_meta(&self) -> (HashSet<FragmentName>, Vec<Path>) {
        let names: Vec<FragmentName> = self.array_meta.iter().map(|m| m.name.clone()).collect();
        let overlaps = |name: &FragmentName| name.range().is_within(&self.range);
        classify_vacuum(&names, &self.array_meta_vac_files, &overlaps, &overlaps)
    }

    /// Array metadata files fully inside the window and not superseded, in
    /// timestamp order.
    pub fn array_meta_uris(&self) -> Vec<MetaUri> {
        let (vacuumed, _) = self.classify_meta();
        self.array_meta
            .iter()
            .filter(|meta| meta.name.range().is_within(&self.range) && !vacuumed.contains(&meta.name))
            .cloned()
            .collect()
    }

    /// Array metadata files superseded by a metadata consolidation.
    pub fn array_meta_uris_to_vacuum(&self) -> Vec<Path> {
        let (vacuumed, _) = self.classify_meta();
        self.array_meta
            .iter()
            .filter(|meta| vacuumed.contains(&meta.name))
            .map(|meta| meta.uri.clone())
            .collect()
    }

    /// Metadata `.vac` files that can be deleted with their targets.
    pub fn array_meta_vac_uris_to_vacuum(&self) -> Vec<Path> {
        self.classify_meta().1
    }
}

/// Superseded names and removable `.vac` files. A name is superseded when a
/// `.vac` accepted by `applies` lists it and it lies inside the window itself;
/// a `.vac` is removable when none of its entries lie outside the window.
fn classify_vacuum(
    names: &[FragmentName],
    vac_files: &[VacFile],
    overlaps: &dyn Fn(&FragmentName) -> bool,
    applies: &dyn Fn(&FragmentName) -> bool,
) -> (HashSet<FragmentName>, Vec<Path>) {
    let mut inside: HashMap<String, &FragmentName> = HashMap::new();
    let mut outside: HashSet<String> = HashSet::new();
    for name in names {
        if overlaps(name) {
            inside.insert(name.to_string(), name);
        } else {
            outside.insert(name.to_string());
        }
    }
    let mut vacuumed = HashSet::new();
    let mut removable = Vec::new();
    for vac in vac_files.iter().filter(|vac| applies(&vac.name)) {
        let mut all_inside = true;
        for entry in &vac.entries {
            if let Some(name) = inside.get(entry) {
                vacuumed.insert((*name).clone());
            }
            if outside.contains(entry) {
                all_inside = false;
            }
        }
        if all_inside {
            removable.push(vac.uri.clone());
        }
    }
    (vacuumed, removable)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::vfs::{
        FusioVfs,
        faulty::{FaultOp, FaultyVfs},
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
            for sub in [SCHEMA_DIR, COMMITS_DIR, META_DIR] {
                vfs.create_dir(&root.child(sub)).await.expect("mkdir");
            }
            vfs.write(&root.child(SCHEMA_DIR).child("__0_0_01S_3"), b"{}".to_vec())
                .await
                .expect("schema");
            Self { _dir: dir, vfs, root }
        }

        async fn commit(&self, name: &str) {
            self.vfs
                .write(&self.root.child(COMMITS_DIR).child(format!("{name}.wrt").as_str()), Vec::new())
                .await
                .expect("commit");
        }

        async fn vac(&self, name: &str, targets: &[&str]) {
            let body: String = targets
                .iter()
                .map(|t| format!("{}\n", self.root.child(crate::fragment::FRAGMENTS_DIR).child(*t)))
                .collect();
            self.vfs
                .write(
                    &self.root.child(COMMITS_DIR).child(format!("{name}.vac").as_str()),
                    body.into_bytes(),
                )
                .await
                .expect("vac");
        }

        async fn load(&self, range: TimestampRange, mode: DirectoryMode) -> ArrayDirectory {
            ArrayDirectory::load(self.vfs.as_ref(), &self.root, range, mode, &CancellationToken::new())
                .await
                .expect("load")
        }
    }

    fn names(filtered: &FilteredFragmentUris) -> Vec<String> {
        filtered.fragment_uris.iter().map(|f| f.name.to_string()).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn classifies_by_window_and_vac_files() {
        let fx = Fixture::new().await;
        fx.commit("__1_1_01A_3").await;
        fx.commit("__3_3_01B_3").await;
        fx.commit("__1_3_01C_3").await;
        fx.vac("__1_3_01C_3", &["__1_1_01A_3", "__3_3_01B_3"]).await;
        // Uncommitted consolidation output: its .vac is ignored.
        fx.vac("__1_1_01Z_3", &["__1_1_01A_3"]).await;

        let read = fx.load(TimestampRange::new(0, 4), DirectoryMode::Read).await;
        let filtered = read.filtered_fragment_uris(false);
        assert_eq!(names(&filtered), vec!["__1_3_01C_3"]);
        assert_eq!(filtered.fragment_uris_to_vacuum.len(), 2);
        assert_eq!(filtered.vac_uris_to_vacuum.len(), 1);
        assert!(filtered.commit_uris_to_vacuum.is_empty());
        assert_eq!(read.filtered_fragment_uris(false), filtered);
        let (dirs, vacs) = read.compute_uris_to_vacuum();
        assert_eq!((dirs.len(), vacs.len()), (2, 1));

        // Partial overlap admits the consolidated fragment and applies its vac.
        let partial = fx.load(TimestampRange::new(0, 2), DirectoryMode::Read).await;
        assert_eq!(names(&partial.filtered_fragment_uris(false)), vec!["__1_3_01C_3"]);
        assert_eq!(names(&partial.filtered_fragment_uris(true)), vec!["__1_1_01A_3"]);

        // A consolidation window cutting through the merged fragment still
        // sees its inputs as superseded.
        let consolidate = fx.load(TimestampRange::new(3, 5), DirectoryMode::Consolidate).await;
        let filtered = consolidate.filtered_fragment_uris(true);
        assert!(names(&filtered).is_empty());
        assert_eq!(filtered.fragment_uris_to_vacuum.len(), 1);

        let vacuum = fx.load(TimestampRange::ALL, DirectoryMode::Vacuum).await;
        let filtered = vacuum.filtered_fragment_uris(true);
        assert_eq!(filtered.commit_uris_to_vacuum.len(), 2);
        assert_eq!(vacuum.commit_uris_to_consolidate().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn equal_ranges_sort_by_uuid() {
        let fx = Fixture::new().await;
        fx.commit("__2_2_01Q_3").await;
        fx.commit("__2_2_01P_3").await;
        fx.commit("__1_1_01R_3").await;
        let dir = fx.load(TimestampRange::ALL, DirectoryMode::Read).await;
        assert_eq!(
            names(&dir.filtered_fragment_uris(false)),
            vec!["__1_1_01R_3", "__2_2_01P_3", "__2_2_01Q_3"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn load_failures_are_classified() {
        let fx = Fixture::new().await;
        fx.commit("__1_1_01A_3").await;

        let faulty = FaultyVfs::new(fx.vfs.clone());
        faulty.fail(FaultOp::List, COMMITS_DIR);
        let err = ArrayDirectory::load(
            &faulty,
            &fx.root,
            TimestampRange::ALL,
            DirectoryMode::Read,
            &CancellationToken::new(),
        )
        .await
        .expect_err("list failure");
        assert_eq!(err.class(), ErrorClass::StorageIo);

        fx.vfs
            .write(&fx.root.child(COMMITS_DIR).child("garbage.wrt"), Vec::new())
            .await
            .expect("write");
        let err = ArrayDirectory::load(
            fx.vfs.as_ref(),
            &fx.root,
            TimestampRange::ALL,
            DirectoryMode::Read,
            &CancellationToken::new(),
        )
        .await
        .expect_err("malformed");
        assert_eq!(err.class(), ErrorClass::Format);

        let missing = fx.root.child("nothing");
        let err = ArrayDirectory::load(
            fx.vfs.as_ref(),
            &missing,
            TimestampRange::ALL,
            DirectoryMode::Read,
            &CancellationToken::new(),
        )
        .await
        .expect_err("missing");
        assert!(matches!(err, DirectoryError::ArrayNotFound(_)));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ArrayDirectory::load(fx.vfs.as_ref(), &fx.root, TimestampRange::ALL, DirectoryMode::Read, &cancel)
            .await
            .expect_err("cancelled");
        assert_eq!(err.class(), ErrorClass::Cancelled);
    }
}
