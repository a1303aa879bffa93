//! Fragment and array-metadata consolidation.
//!
//! A consolidation step merges a run of adjacent fragments into one output
//! fragment by reading them through the global-order reader and streaming the
//! cells into a global-order writer. The output is made durable in three
//! steps: data and metadata, then the `.vac` marker naming the inputs, then
//! the commit marker. Until the commit marker exists nothing changes for
//! readers; once it exists the `.vac` hides the inputs.

mod planner;

use std::{collections::HashSet, sync::Arc};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use self::planner::{StepLimits, plan_step};
use crate::{
    config::{Config, ConfigError},
    crypto::EncryptionKey,
    directory::{ArrayDirectory, DirectoryError, DirectoryMode},
    error::ErrorClass,
    fragment::{
        COMMITS_DIR, FragmentError, FragmentMetadata, FragmentName, FragmentWriter, META_DIR,
        PendingFragment,
    },
    metadata::MetadataDocument,
    observability::{log_debug, log_error, log_info},
    reader::{Query, QueryBuffers, QueryStatus, ReadError, ReadRequest, ReaderOptions, SparseGlobalOrderReader},
    schema::ArraySchema,
    timestamp::TimestampRange,
    vfs::{Path, StorageError, Vfs},
};

/// Inconsistent consolidation inputs.
#[derive(Debug, Error)]
pub enum ConsolidationPlanError {
    /// A requested fragment is not committed or not inside the window.
    #[error("fragment `{0}` is not visible in the consolidation window")]
    FragmentNotFound(String),
    /// The requested fragments are not adjacent in time order.
    #[error("fragments to consolidate are not contiguous in time order")]
    NotContiguous,
    /// A requested fragment was already consolidated away.
    #[error("fragment `{0}` was already consolidated")]
    AlreadyVacuumed(String),
    /// The consolidation window has `start > end`.
    #[error("invalid consolidation window {0}")]
    InvalidWindow(TimestampRange),
}

/// Failures of a consolidation.
#[derive(Debug, Error)]
pub enum ConsolidationError {
    /// Listing the array failed.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    /// Writing the output or loading input metadata failed.
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    /// Reading the inputs failed.
    #[error(transparent)]
    Read(#[from] ReadError),
    /// Inputs are inconsistent.
    #[error(transparent)]
    Plan(#[from] ConsolidationPlanError),
    /// Writing a marker failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The consolidation observed its cancellation token.
    #[error("consolidation cancelled")]
    Cancelled,
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// An array metadata document could not be decoded.
    #[error("malformed array metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl ConsolidationError {
    /// Taxonomy class of this failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            ConsolidationError::Directory(err) => err.class(),
            ConsolidationError::Fragment(err) => err.class(),
            ConsolidationError::Read(err) => err.class(),
            ConsolidationError::Plan(_) => ErrorClass::ConsolidationPlan,
            ConsolidationError::Storage(_) => ErrorClass::StorageIo,
            ConsolidationError::Cancelled => ErrorClass::Cancelled,
            ConsolidationError::Config(_) => ErrorClass::Invalid,
            ConsolidationError::Metadata(_) => ErrorClass::Format,
        }
    }
}

/// One merged run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsolidationStep {
    /// Consumed fragments, oldest first.
    pub inputs: Vec<FragmentName>,
    /// The new fragment.
    pub output: FragmentName,
    /// Cells written to the output.
    pub cells: u64,
    /// Whether the output carries per-cell timestamps.
    pub with_timestamps: bool,
}

/// Outcome of a consolidation call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    /// Steps in execution order. Empty when there was nothing to merge.
    pub steps: Vec<ConsolidationStep>,
}

impl ConsolidationReport {
    /// `true` when nothing was consolidated.
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Merges fragments of one array.
pub struct Consolidator {
    vfs: Arc<dyn Vfs>,
    array_uri: Path,
    schema: Arc<ArraySchema>,
    config: Config,
    key: Option<EncryptionKey>,
    cancel: CancellationToken,
}

impl Consolidator {
    /// Consolidator for the array at `array_uri`.
    pub fn new(
        vfs: Arc<dyn Vfs>,
        array_uri: Path,
        schema: Arc<ArraySchema>,
        config: Config,
        key: Option<EncryptionKey>,
    ) -> Self {
        Self {
            vfs,
            array_uri,
            schema,
            config,
            key,
            cancel: CancellationToken::new(),
        }
    }

    /// Observe `cancel` between steps, tile batches and copy iterations.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn check_cancelled(&self) -> Result<(), ConsolidationError> {
        if self.cancel.is_cancelled() {
            return Err(ConsolidationError::Cancelled);
        }
        Ok(())
    }

    async fn load_directory(&self) -> Result<ArrayDirectory, ConsolidationError> {
        self.config.validate()?;
        let window = self.config.consolidation_window();
        if !window.is_valid() {
            return Err(ConsolidationPlanError::InvalidWindow(window).into());
        }
        Ok(ArrayDirectory::load(
            self.vfs.as_ref(),
            &self.array_uri,
            window,
            DirectoryMode::Consolidate,
            &self.cancel,
        )
        .await?)
    }

    async fn load_metadata(&self, names: &[FragmentName]) -> Result<Vec<Arc<FragmentMetadata>>, ConsolidationError> {
        let loaded = futures::future::try_join_all(names.iter().map(|name| async move {
            FragmentMetadata::load(self.vfs.as_ref(), &self.array_uri, name, &self.schema, self.key.as_ref())
                .await
                .map(Arc::new)
        }))
        .await?;
        Ok(loaded)
    }

    /// Consolidate the fragments fully inside the configured window, in up
    /// to `sm.consolidation.steps` planned steps.
    pub async fn consolidate(&self) -> Result<ConsolidationReport, ConsolidationError> {
        let dir = self.load_directory().await?;
        let names: Vec<FragmentName> = dir
            .filtered_fragment_uris(true)
            .fragment_uris
            .into_iter()
            .map(|fragment| fragment.name)
            .collect();
        let mut working = self.load_metadata(&names).await?;
        let limits = StepLimits::from_config(&self.config);

        let mut report = ConsolidationReport::default();
        while report.steps.len() < self.config.consolidation_steps as usize && working.len() > 1 {
            self.check_cancelled()?;
            let sizes: Vec<u64> = working.iter().map(|f| f.fragment_size()).collect();
            let Some(run) = plan_step(&sizes, limits) else {
                break;
            };
            if run.len() < 2 {
                break;
            }
            let (step, output) = self.consolidate_run(&working[run.clone()]).await?;
            let start = run.start;
            working.drain(run);
            working.insert(start, Arc::new(output));
            report.steps.push(step);
        }
        if report.is_noop() {
            log_debug!(
                "consolidator",
                "consolidation_noop",
                array = %self.array_uri,
                fragments = working.len(),
            );
        }
        Ok(report)
    }

    /// Consolidate an explicit list of fragment names. The fragments must be
    /// visible in the configured window and adjacent in time order.
    pub async fn consolidate_fragments(&self, names: &[String]) -> Result<ConsolidationReport, ConsolidationError> {
        let dir = self.load_directory().await?;
        let filtered = dir.filtered_fragment_uris(true);
        let vacuumed: HashSet<String> = filtered
            .fragment_uris_to_vacuum
            .iter()
            .filter_map(|uri| crate::vfs::file_name(uri).map(str::to_string))
            .collect();
        let visible: Vec<FragmentName> = filtered.fragment_uris.into_iter().map(|f| f.name).collect();

        let mut positions = Vec::with_capacity(names.len());
        for requested in names {
            let leaf = crate::vfs::file_name_str(requested);
            let parsed = FragmentName::parse(leaf).map_err(FragmentError::from)?;
            match visible.iter().position(|name| *name == parsed) {
                Some(pos) => positions.push(pos),
                None if vacuumed.contains(leaf) => {
                    return Err(ConsolidationPlanError::AlreadyVacuumed(leaf.to_string()).into());
                }
                None => return Err(ConsolidationPlanError::FragmentNotFound(leaf.to_string()).into()),
            }
        }
        positions.sort_unstable();
        positions.dedup();
        if positions.windows(2).any(|pair| pair[1] != pair[0] + 1) {
            return Err(ConsolidationPlanError::NotContiguous.into());
        }
        if positions.len() < 2 {
            log_debug!(
                "consolidator",
                "consolidation_noop",
                array = %self.array_uri,
                fragments = positions.len(),
            );
            return Ok(ConsolidationReport::default());
        }
        let selected: Vec<FragmentName> = positions.iter().map(|&pos| visible[pos].clone()).collect();
        let inputs = self.load_metadata(&selected).await?;
        let (step, _) = self.consolidate_run(&inputs).await?;
        Ok(ConsolidationReport { steps: vec![step] })
    }

    /// Merge one run into a committed output fragment.
    async fn consolidate_run(
        &self,
        inputs: &[Arc<FragmentMetadata>],
    ) -> Result<(ConsolidationStep, FragmentMetadata), ConsolidationError> {
        let range = inputs
            .iter()
            .map(|f| f.timestamp_range())
            .reduce(|a, b| a.union(&b))
            .unwrap_or(TimestampRange::ALL);
        let distinct_starts: HashSet<u64> = inputs.iter().map(|f| f.timestamp_range().start.get()).collect();
        let with_timestamps = inputs.iter().any(|f| f.has_timestamps()) || distinct_starts.len() > 1;
        let name = FragmentName::generate(range);
        let input_names: Vec<FragmentName> = inputs.iter().map(|f| f.name().clone()).collect();

        let result = self.write_output(inputs, name.clone(), range, with_timestamps).await;
        let output = match result {
            Ok(output) => output,
            Err(err) => {
                log_error!(
                    "consolidator",
                    "consolidation_failed",
                    array = %self.array_uri,
                    fragment = %name,
                    inputs = inputs.len(),
                    error = %err,
                );
                return Err(err);
            }
        };
        log_info!(
            "consolidator",
            "consolidation_step",
            array = %self.array_uri,
            fragment = %name,
            inputs = inputs.len(),
            cells = output.cell_num(),
            with_timestamps,
        );
        let step = ConsolidationStep {
            inputs: input_names,
            output: name,
            cells: output.cell_num(),
            with_timestamps,
        };
        Ok((step, output))
    }

    /// Cells per copy iteration: the copy-buffer budget split across fields,
    /// bounded by the number of input cells.
    fn copy_cells(&self, inputs: &[Arc<FragmentMetadata>], with_timestamps: bool) -> usize {
        let mut fields: Vec<usize> = self.schema.fields().map(|f| self.schema.cell_size(f)).collect();
        if with_timestamps {
            fields.push(8);
        }
        let per_field = match self.config.consolidation_buffer_size {
            0 => self.config.consolidation_buffers_budget() / fields.len().max(1) as u64,
            size => size,
        };
        let widest = fields.iter().copied().max().unwrap_or(1).max(1) as u64;
        let total: u64 = inputs.iter().map(|f| f.cell_num()).sum();
        (per_field / widest).min(total).max(1) as usize
    }

    async fn write_output(
        &self,
        inputs: &[Arc<FragmentMetadata>],
        name: FragmentName,
        range: TimestampRange,
        with_timestamps: bool,
    ) -> Result<FragmentMetadata, ConsolidationError> {
        let mut writer = FragmentWriter::create(
            self.vfs.clone(),
            &self.array_uri,
            self.schema.clone(),
            name,
            with_timestamps,
            self.key.clone(),
            self.config.consolidation_writer_budget(),
        )
        .await?;
        if let Err(err) = self.copy(inputs, range, with_timestamps, &mut writer).await {
            writer.abort().await;
            return Err(err);
        }
        let pending = writer.finish().await?;
        if let Err(err) = self.write_vac(&pending, inputs).await {
            pending.abort().await;
            return Err(err);
        }
        Ok(pending.commit().await?)
    }

    async fn copy(
        &self,
        inputs: &[Arc<FragmentMetadata>],
        range: TimestampRange,
        with_timestamps: bool,
        writer: &mut FragmentWriter,
    ) -> Result<(), ConsolidationError> {
        let mut request = ReadRequest::new();
        if with_timestamps {
            request = request.with_timestamps();
        }
        let reader = SparseGlobalOrderReader::new(
            self.vfs.clone(),
            self.array_uri.clone(),
            self.schema.clone(),
            inputs.to_vec(),
            range,
            request,
            ReaderOptions::for_consolidation(&self.config),
            self.key.clone(),
            self.cancel.clone(),
        );
        let mut query = Query::new(reader);
        let mut buffers = QueryBuffers::for_schema(
            &self.schema,
            self.copy_cells(inputs, with_timestamps),
            with_timestamps,
        );
        loop {
            self.check_cancelled()?;
            let status = match query.submit(&mut buffers).await {
                Ok(status) => status,
                Err(ReadError::Cancelled) => return Err(ConsolidationError::Cancelled),
                Err(err) => return Err(err.into()),
            };
            let cells = buffers.take_cells(&self.schema)?;
            if !cells.is_empty() {
                writer.write(&cells).await?;
            }
            if status == QueryStatus::Complete {
                return Ok(());
            }
        }
    }

    /// Record the consumed inputs next to the output's future commit marker.
    async fn write_vac(
        &self,
        pending: &PendingFragment,
        inputs: &[Arc<FragmentMetadata>],
    ) -> Result<(), ConsolidationError> {
        self.check_cancelled()?;
        let mut body = String::new();
        for input in inputs {
            body.push_str(&input.uri().to_string());
            body.push('\n');
        }
        let commits = self.array_uri.child(COMMITS_DIR);
        self.vfs.create_dir(&commits).await?;
        self.vfs
            .write(&commits.child(pending.name().vac_file().as_str()), body.into_bytes())
            .await?;
        Ok(())
    }

    /// Merge the array metadata documents inside the window into one. Returns
    /// the new document's name, or `None` when fewer than two were visible.
    pub async fn consolidate_metadata(&self) -> Result<Option<FragmentName>, ConsolidationError> {
        let dir = self.load_directory().await?;
        let metas = dir.array_meta_uris();
        if metas.len() < 2 {
            log_debug!(
                "consolidator",
                "consolidation_noop",
                array = %self.array_uri,
                meta_files = metas.len(),
            );
            return Ok(None);
        }
        let mut merged = MetadataDocument::default();
        let mut range: Option<TimestampRange> = None;
        for meta in &metas {
            self.check_cancelled()?;
            let bytes = self.vfs.read_all(&meta.uri).await?;
            merged.merge(MetadataDocument::decode(&bytes)?);
            range = Some(match range {
                Some(range) => range.union(&meta.name.range()),
                None => meta.name.range(),
            });
        }
        let name = FragmentName::generate(range.unwrap_or(TimestampRange::ALL));
        let meta_dir = self.array_uri.child(META_DIR);

        let mut body = String::new();
        for meta in &metas {
            body.push_str(&meta.uri.to_string());
            body.push('\n');
        }
        self.vfs
            .write(&meta_dir.child(name.vac_file().as_str()), body.into_bytes())
            .await?;
        self.vfs
            .write(&meta_dir.child(name.to_string().as_str()), merged.encode()?)
            .await?;
        log_info!(
            "consolidator",
            "consolidation_step",
            array = %self.array_uri,
            meta_file = %name,
            inputs = metas.len(),
        );
        Ok(Some(name))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        fragment::{CellColumns, FRAGMENTS_DIR, SCHEMA_DIR},
        schema::{Attribute, Datatype, Dimension, encode_column},
        vfs::{
            FusioVfs,
            faulty::{FaultOp, FaultyVfs},
        },
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        vfs: Arc<dyn Vfs>,
        root: Path,
        schema: Arc<ArraySchema>,
    }

    impl Fixture {
        async fn new(allows_dups: bool) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let vfs: Arc<dyn Vfs> = Arc::new(FusioVfs::local());
            let root = FusioVfs::local_path(dir.path()).expect("root");
            let schema = Arc::new(
                ArraySchema::builder()
                    .dimension(Dimension::new("d", Datatype::Int64, [0, 99], 10))
                    .attribute(Attribute::new("a", Datatype::Int32))
                    .capacity(2)
                    .allows_dups(allows_dups)
                    .build()
                    .expect("schema"),
            );
            let schema_dir = root.child(SCHEMA_DIR);
            vfs.create_dir(&schema_dir).await.expect("mkdir");
            vfs.write(
                &schema_dir.child(FragmentName::generate(TimestampRange::new(0, 0)).to_string().as_str()),
                schema.to_json().expect("json"),
            )
            .await
            .expect("schema");
            Self {
                _dir: dir,
                vfs,
                root,
                schema,
            }
        }

        async fn write(&self, ts: u64, cells: &[(i64, i32)]) -> FragmentName {
            let dims: Vec<i64> = cells.iter().map(|c| c.0).collect();
            let attrs: Vec<i32> = cells.iter().map(|c| c.1).collect();
            let columns =
                CellColumns::from_columns(&self.schema, vec![encode_column(&dims), encode_column(&attrs)], None)
                    .expect("columns");
            let name = FragmentName::generate(TimestampRange::new(ts, ts));
            let mut writer = FragmentWriter::create(
                self.vfs.clone(),
                &self.root,
                self.schema.clone(),
                name.clone(),
                false,
                None,
                u64::MAX,
            )
            .await
            .expect("create");
            writer.write(&columns).await.expect("write");
            writer.finish().await.expect("finish").commit().await.expect("commit");
            name
        }

        fn consolidator(&self, config: Config) -> Consolidator {
            Consolidator::new(self.vfs.clone(), self.root.clone(), self.schema.clone(), config, None)
        }

        async fn visible(&self) -> Vec<FragmentName> {
            ArrayDirectory::load(
                self.vfs.as_ref(),
                &self.root,
                TimestampRange::ALL,
                DirectoryMode::Read,
                &CancellationToken::new(),
            )
            .await
            .expect("directory")
            .filtered_fragment_uris(false)
            .fragment_uris
            .into_iter()
            .map(|f| f.name)
            .collect()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn merges_all_fragments_with_timestamps() {
        let fx = Fixture::new(false).await;
        let first = fx.write(1, &[(1, 10), (2, 20)]).await;
        let second = fx.write(3, &[(2, 21), (4, 40)]).await;

        let report = fx.consolidator(Config::default()).consolidate().await.expect("consolidate");
        assert_eq!(report.steps.len(), 1);
        let step = &report.steps[0];
        assert_eq!(step.inputs, vec![first, second]);
        // Both versions of d=2 are kept for reads at older timestamps.
        assert_eq!(step.cells, 4);
        assert!(step.with_timestamps);
        assert_eq!(step.output.range(), TimestampRange::new(1, 3));

        assert_eq!(fx.visible().await, vec![step.output.clone()]);
        let again = fx.consolidator(Config::default()).consolidate().await.expect("noop");
        assert!(again.is_noop());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn same_timestamp_inputs_need_no_timestamps() {
        let fx = Fixture::new(true).await;
        fx.write(5, &[(1, 1)]).await;
        fx.write(5, &[(1, 2)]).await;
        let report = fx.consolidator(Config::default()).consolidate().await.expect("consolidate");
        assert_eq!(report.steps[0].cells, 2);
        assert!(!report.steps[0].with_timestamps);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn explicit_list_must_be_visible_and_contiguous() {
        let fx = Fixture::new(false).await;
        let a = fx.write(1, &[(1, 1)]).await;
        let b = fx.write(2, &[(2, 2)]).await;
        let c = fx.write(3, &[(3, 3)]).await;
        let consolidator = fx.consolidator(Config::default());

        let err = consolidator
            .consolidate_fragments(&[a.to_string(), c.to_string()])
            .await
            .expect_err("gap");
        assert!(matches!(err, ConsolidationError::Plan(ConsolidationPlanError::NotContiguous)));

        let missing = FragmentName::generate(TimestampRange::new(9, 9)).to_string();
        let err = consolidator
            .consolidate_fragments(&[missing])
            .await
            .expect_err("missing");
        assert_eq!(err.class(), ErrorClass::ConsolidationPlan);

        let report = consolidator
            .consolidate_fragments(&[c.to_string(), b.to_string()])
            .await
            .expect("pair");
        assert_eq!(report.steps[0].inputs.len(), 2);

        let err = consolidator
            .consolidate_fragments(&[c.to_string()])
            .await
            .expect_err("consumed");
        assert!(matches!(err, ConsolidationError::Plan(ConsolidationPlanError::AlreadyVacuumed(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_read_leaves_array_unchanged() {
        let fx = Fixture::new(false).await;
        let first = fx.write(1, &[(1, 1)]).await;
        let second = fx.write(2, &[(2, 2)]).await;

        let faulty = Arc::new(FaultyVfs::new(fx.vfs.clone()));
        faulty.fail(FaultOp::Read, "d0.tdb");
        let consolidator = Consolidator::new(faulty, fx.root.clone(), fx.schema.clone(), Config::default(), None);
        let err = consolidator.consolidate().await.expect_err("read failure");
        assert_eq!(err.class(), ErrorClass::StorageIo);

        assert_eq!(fx.visible().await, vec![first, second]);
        let commits = fx.vfs.list(&fx.root.child(COMMITS_DIR)).await.expect("list");
        assert!(commits.iter().all(|uri| !uri.to_string().ends_with(".vac")));
        assert!(fx.vfs.list(&fx.root.child(FRAGMENTS_DIR)).await.expect("list").len() >= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_consolidation_commits_nothing() {
        let fx = Fixture::new(false).await;
        let first = fx.write(1, &[(1, 1)]).await;
        let second = fx.write(2, &[(2, 2)]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fx
            .consolidator(Config::default())
            .with_cancellation(cancel)
            .consolidate()
            .await
            .expect_err("cancelled");
        assert_eq!(err.class(), ErrorClass::Cancelled);
        assert_eq!(fx.visible().await, vec![first, second]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn steps_follow_limits() {
        let fx = Fixture::new(false).await;
        for ts in 1..=4 {
            fx.write(ts, &[(ts as i64, ts as i32)]).await;
        }
        let config = Config::default().with_steps(2, 2, 2, 0.0);
        let report = fx.consolidator(config).consolidate().await.expect("consolidate");
        assert_eq!(report.steps.len(), 2);
        assert_eq!(fx.visible().await.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn metadata_documents_merge() {
        let fx = Fixture::new(false).await;
        crate::metadata::store(
            fx.vfs.as_ref(),
            &fx.root,
            TimestampRange::new(1, 1),
            &MetadataDocument::put("k", serde_json::json!(1)),
        )
        .await
        .expect("put");
        crate::metadata::store(
            fx.vfs.as_ref(),
            &fx.root,
            TimestampRange::new(2, 2),
            &MetadataDocument::put("k", serde_json::json!(2)),
        )
        .await
        .expect("put");
        let name = fx
            .consolidator(Config::default())
            .consolidate_metadata()
            .await
            .expect("consolidate")
            .expect("merged");
        assert_eq!(name.range(), TimestampRange::new(1, 2));

        let dir = ArrayDirectory::load(
            fx.vfs.as_ref(),
            &fx.root,
            TimestampRange::ALL,
            DirectoryMode::Read,
            &CancellationToken::new(),
        )
        .await
        .expect("directory");
        assert_eq!(dir.array_meta_uris().len(), 1);
        assert_eq!(dir.array_meta_uris_to_vacuum().len(), 2);
        let metadata = crate::metadata::load(fx.vfs.as_ref(), &dir).await.expect("load");
        assert_eq!(metadata.get("k"), Some(&serde_json::json!(2)));
    }
}
