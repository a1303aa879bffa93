//! Array handle: the entry point tying schema, writes, time-travel reads,
//! consolidation and vacuum together for one array root.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use arrow_array::RecordBatch;
use futures::future::try_join_all;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    consolidator::{ConsolidationReport, Consolidator},
    crypto::EncryptionKey,
    directory::{ArrayDirectory, DirectoryError, DirectoryMode},
    error::Result,
    fragment::{
        CellColumns, COMMITS_DIR, FRAGMENTS_DIR, FragmentHandle, FragmentName, FragmentWriter, META_DIR,
        SCHEMA_DIR,
    },
    metadata::{self, ArrayMetadata, MetadataDocument},
    observability::log_info,
    reader::{Query, QueryBuffers, QueryStatus, ReadRequest, ReaderOptions, SparseGlobalOrderReader},
    schema::{ArraySchema, SchemaError},
    timestamp::{Timestamp, TimestampRange},
    vacuum::{Vacuum, VacuumReport},
    vfs::{Path, Vfs},
};

/// An opened array.
///
/// Every operation takes its own directory snapshot; the handle only caches
/// the schema and the fragment metadata it has already loaded.
pub struct Array {
    vfs: Arc<dyn Vfs>,
    uri: Path,
    schema: Arc<ArraySchema>,
    config: Config,
    key: Option<EncryptionKey>,
    cancel: CancellationToken,
    handles: Mutex<HashMap<FragmentName, Arc<FragmentHandle>>>,
}

impl Array {
    /// Create an empty array at `uri`.
    pub async fn create(vfs: &dyn Vfs, uri: &Path, schema: &ArraySchema) -> Result<()> {
        schema.validate()?;
        let schema_dir = uri.child(SCHEMA_DIR);
        if !vfs.list(&schema_dir).await?.is_empty() {
            return Err(SchemaError::AlreadyExists(uri.to_string()).into());
        }
        for dir in [SCHEMA_DIR, FRAGMENTS_DIR, COMMITS_DIR, META_DIR] {
            vfs.create_dir(&uri.child(dir)).await?;
        }
        let name = FragmentName::generate(TimestampRange::at(Timestamp::now()));
        vfs.write(&schema_dir.child(name.to_string().as_str()), schema.to_json()?)
            .await?;
        log_info!(
            "array",
            "array_created",
            array = %uri,
            dimensions = schema.dim_num(),
        );
        Ok(())
    }

    /// Open the array at `uri` with its newest schema.
    pub async fn open(vfs: Arc<dyn Vfs>, uri: Path, config: Config, key: Option<EncryptionKey>) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let dir = ArrayDirectory::load(vfs.as_ref(), &uri, TimestampRange::ALL, DirectoryMode::Read, &cancel).await?;
        let schema_uri = dir
            .latest_array_schema_uri()
            .ok_or_else(|| DirectoryError::ArrayNotFound(uri.to_string()))?;
        let schema = ArraySchema::from_json(&vfs.read_all(schema_uri).await?)?;
        Ok(Self {
            vfs,
            uri,
            schema: Arc::new(schema),
            config,
            key,
            cancel,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Share `cancel` with every operation started from this handle.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Array root.
    pub fn uri(&self) -> &Path {
        &self.uri
    }

    /// Schema the array was opened with.
    pub fn schema(&self) -> &Arc<ArraySchema> {
        &self.schema
    }

    /// Configuration the array was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Write `batch` as one fragment stamped `timestamp` (now when `None`).
    /// Returns `None` for an empty batch.
    pub async fn write(&self, batch: &RecordBatch, timestamp: Option<Timestamp>) -> Result<Option<FragmentName>> {
        let mut cells = CellColumns::from_record_batch(&self.schema, batch)?;
        if cells.is_empty() {
            return Ok(None);
        }
        cells.sort_global(&self.schema.global_order());
        let ts = timestamp.unwrap_or_else(Timestamp::now);
        let name = FragmentName::generate(TimestampRange::at(ts));
        let mut writer = FragmentWriter::create(
            self.vfs.clone(),
            &self.uri,
            self.schema.clone(),
            name,
            false,
            self.key.clone(),
            self.config.consolidation_writer_budget(),
        )
        .await?;
        if let Err(err) = writer.write(&cells).await {
            writer.abort().await;
            return Err(err.into());
        }
        let pending = writer.finish().await?;
        let committed = pending.commit().await?;
        Ok(Some(committed.name().clone()))
    }

    async fn handle(&self, name: &FragmentName) -> Arc<FragmentHandle> {
        let mut handles = self.handles.lock().await;
        handles
            .entry(name.clone())
            .or_insert_with(|| Arc::new(FragmentHandle::new(name.clone())))
            .clone()
    }

    /// Start a read of the cells visible in `window`.
    pub async fn query(&self, window: TimestampRange, request: ReadRequest) -> Result<Query> {
        let dir = ArrayDirectory::load(self.vfs.as_ref(), &self.uri, window, DirectoryMode::Read, &self.cancel).await?;
        let visible = dir.filtered_fragment_uris(false).fragment_uris;
        let mut handles = Vec::with_capacity(visible.len());
        for fragment in &visible {
            handles.push(self.handle(&fragment.name).await);
        }
        let fragments = try_join_all(handles.iter().map(|handle| {
            handle.metadata(self.vfs.as_ref(), &self.uri, &self.schema, self.key.as_ref())
        }))
        .await?;
        let reader = SparseGlobalOrderReader::new(
            self.vfs.clone(),
            self.uri.clone(),
            self.schema.clone(),
            fragments,
            window,
            request,
            ReaderOptions::from_config(&self.config),
            self.key.clone(),
            self.cancel.clone(),
        );
        Ok(Query::new(reader))
    }

    /// Run a query to completion with buffers of `cells` cells per field and
    /// return one batch per non-empty submit.
    pub async fn read_all(&self, window: TimestampRange, request: ReadRequest, cells: usize) -> Result<Vec<RecordBatch>> {
        let mut buffers = QueryBuffers::for_schema(&self.schema, cells, request.timestamps);
        let mut query = self.query(window, request).await?;
        let mut batches = Vec::new();
        loop {
            let status = query.submit(&mut buffers).await?;
            if buffers.cell_num() > 0 {
                batches.push(buffers.to_record_batch(&self.schema)?);
            }
            if status == QueryStatus::Complete {
                return Ok(batches);
            }
        }
    }

    fn consolidator(&self) -> Consolidator {
        Consolidator::new(
            self.vfs.clone(),
            self.uri.clone(),
            self.schema.clone(),
            self.config.clone(),
            self.key.clone(),
        )
        .with_cancellation(self.cancel.clone())
    }

    fn vacuumer(&self) -> Vacuum {
        Vacuum::new(self.vfs.clone(), self.uri.clone(), self.config.io_concurrency_level)
            .with_cancellation(self.cancel.clone())
    }

    /// Consolidate the fragments in the configured window. With `vacuum`, a
    /// vacuum pass runs once the consolidation has committed.
    pub async fn consolidate(&self, vacuum: bool) -> Result<ConsolidationReport> {
        let report = self.consolidator().consolidate().await?;
        if vacuum {
            self.vacuum().await?;
        }
        Ok(report)
    }

    /// Consolidate an explicit, time-contiguous list of fragments.
    pub async fn consolidate_fragments(&self, names: &[String]) -> Result<ConsolidationReport> {
        Ok(self.consolidator().consolidate_fragments(names).await?)
    }

    /// Merge the array metadata documents in the configured window.
    pub async fn consolidate_metadata(&self, vacuum: bool) -> Result<Option<FragmentName>> {
        let merged = self.consolidator().consolidate_metadata().await?;
        if vacuum {
            self.vacuum().await?;
        }
        Ok(merged)
    }

    /// Delete everything consolidation has superseded.
    pub async fn vacuum(&self) -> Result<VacuumReport> {
        let report = self.vacuumer().run().await?;
        if report.commits_removed > 0 {
            self.forget_removed_fragments().await?;
        }
        Ok(report)
    }

    /// Drop cached handles of fragments whose commit marker is gone.
    async fn forget_removed_fragments(&self) -> Result<()> {
        let dir = ArrayDirectory::load(
            self.vfs.as_ref(),
            &self.uri,
            TimestampRange::ALL,
            DirectoryMode::Read,
            &self.cancel,
        )
        .await?;
        let committed: HashSet<&FragmentName> = dir.committed_fragments().iter().collect();
        let mut handles = self.handles.lock().await;
        handles.retain(|name, _| committed.contains(name));
        Ok(())
    }

    /// Set `key` to `value` as of `timestamp` (now when `None`).
    pub async fn put_metadata(&self, key: &str, value: Value, timestamp: Option<Timestamp>) -> Result<FragmentName> {
        let ts = timestamp.unwrap_or_else(Timestamp::now);
        metadata::store(
            self.vfs.as_ref(),
            &self.uri,
            TimestampRange::at(ts),
            &MetadataDocument::put(key, value),
        )
        .await
    }

    /// Remove `key` as of `timestamp` (now when `None`).
    pub async fn delete_metadata(&self, key: &str, timestamp: Option<Timestamp>) -> Result<FragmentName> {
        let ts = timestamp.unwrap_or_else(Timestamp::now);
        metadata::store(
            self.vfs.as_ref(),
            &self.uri,
            TimestampRange::at(ts),
            &MetadataDocument::delete(key),
        )
        .await
    }

    /// Array metadata as visible in `window`.
    pub async fn metadata(&self, window: TimestampRange) -> Result<ArrayMetadata> {
        let dir = ArrayDirectory::load(self.vfs.as_ref(), &self.uri, window, DirectoryMode::Read, &self.cancel).await?;
        metadata::load(self.vfs.as_ref(), &dir).await
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::{ArrayRef, Int32Array, Int64Array};
    use serde_json::json;

    use super::*;
    use crate::{
        error::ErrorClass,
        schema::{Attribute, Datatype, Dimension},
        vfs::FusioVfs,
    };

    fn schema(allows_dups: bool) -> ArraySchema {
        ArraySchema::builder()
            .dimension(Dimension::new("d", Datatype::Int64, [0, 99], 10))
            .attribute(Attribute::new("a", Datatype::Int32))
            .capacity(4)
            .allows_dups(allows_dups)
            .build()
            .expect("schema")
    }

    fn batch(dims: &[i64], attrs: &[i32]) -> RecordBatch {
        RecordBatch::try_from_iter([
            ("d", Arc::new(Int64Array::from(dims.to_vec())) as ArrayRef),
            ("a", Arc::new(Int32Array::from(attrs.to_vec())) as ArrayRef),
        ])
        .expect("batch")
    }

    async fn open(dir: &tempfile::TempDir, allows_dups: bool) -> Array {
        let vfs: Arc<dyn Vfs> = Arc::new(FusioVfs::local());
        let root = FusioVfs::local_path(dir.path()).expect("root");
        Array::create(vfs.as_ref(), &root, &schema(allows_dups)).await.expect("create");
        Array::open(vfs, root, Config::default(), None).await.expect("open")
    }

    fn column_i32(batches: &[RecordBatch], name: &str) -> Vec<i32> {
        batches
            .iter()
            .flat_map(|batch| {
                batch
                    .column_by_name(name)
                    .expect("column")
                    .as_any()
                    .downcast_ref::<Int32Array>()
                    .expect("int32")
                    .values()
                    .to_vec()
            })
            .collect()
    }

    async fn read_a(array: &Array) -> Vec<i32> {
        let batches = array
            .read_all(TimestampRange::ALL, ReadRequest::new(), 16)
            .await
            .expect("read");
        column_i32(&batches, "a")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_then_read_sorted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let array = open(&dir, false).await;
        array
            .write(&batch(&[7, 3, 5], &[70, 30, 50]), Some(Timestamp::new(1)))
            .await
            .expect("write");
        assert!(array
            .write(&batch(&[], &[]), Some(Timestamp::new(2)))
            .await
            .expect("empty write")
            .is_none());

        let batches = array
            .read_all(TimestampRange::new(0, 10), ReadRequest::new(), 16)
            .await
            .expect("read");
        assert_eq!(column_i32(&batches, "a"), vec![30, 50, 70]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn create_twice_and_bad_writes_fail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let array = open(&dir, false).await;
        let err = Array::create(&FusioVfs::local(), array.uri(), &schema(false))
            .await
            .expect_err("exists");
        assert_eq!(err.class(), ErrorClass::Invalid);

        let err = array
            .write(&batch(&[1, 1], &[1, 2]), Some(Timestamp::new(1)))
            .await
            .expect_err("duplicate");
        assert_eq!(err.class(), ErrorClass::Invalid);
        let err = array
            .write(&batch(&[100], &[1]), Some(Timestamp::new(1)))
            .await
            .expect_err("domain");
        assert_eq!(err.class(), ErrorClass::Invalid);

        let batches = array
            .read_all(TimestampRange::ALL, ReadRequest::new(), 16)
            .await
            .expect("read");
        assert!(batches.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn vacuum_forgets_cached_fragments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let array = open(&dir, false).await;
        for ts in 1..=3 {
            array
                .write(&batch(&[ts], &[ts as i32]), Some(Timestamp::new(ts as u64)))
                .await
                .expect("write");
        }
        assert_eq!(read_a(&array).await, vec![1, 2, 3]);
        assert_eq!(array.handles.lock().await.len(), 3);

        let report = array.consolidate(true).await.expect("consolidate");
        assert_eq!(report.steps.len(), 1);
        assert!(array.handles.lock().await.is_empty());
        assert_eq!(read_a(&array).await, vec![1, 2, 3]);
        assert_eq!(array.handles.lock().await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn metadata_travels_in_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let array = open(&dir, false).await;
        array
            .put_metadata("owner", json!("ops"), Some(Timestamp::new(1)))
            .await
            .expect("put");
        array
            .put_metadata("rows", json!(3), Some(Timestamp::new(2)))
            .await
            .expect("put");
        array
            .delete_metadata("owner", Some(Timestamp::new(3)))
            .await
            .expect("delete");

        let early = array.metadata(TimestampRange::new(0, 2)).await.expect("metadata");
        assert_eq!(early.get("owner"), Some(&json!("ops")));
        assert_eq!(early.len(), 2);
        let late = array.metadata(TimestampRange::ALL).await.expect("metadata");
        assert_eq!(late.get("owner"), None);
        assert_eq!(late.get("rows"), Some(&json!(3)));

        let merged = array.consolidate_metadata(true).await.expect("consolidate");
        assert!(merged.is_some());
        assert_eq!(array.metadata(TimestampRange::ALL).await.expect("metadata"), late);
    }
}
