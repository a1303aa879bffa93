//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use arrow_array::{ArrayRef, Int32Array, RecordBatch};
use tempfile::TempDir;
use tessera::{
    Array, ArraySchema, Attribute, Config, Datatype, Dimension, FusioVfs, Path, QueryBuffers, QueryStatus,
    ReadRequest, Timestamp, TimestampRange, Vfs,
    crypto::EncryptionKey,
    schema::{ArraySchemaBuilder, TIMESTAMPS_FIELD},
};

/// A temporary array root with a two-dimensional `int32` schema:
/// dimensions `d1`, `d2` over `[1, 4]`, one attribute `a`.
pub struct TestArray {
    _dir: TempDir,
    pub vfs: Arc<dyn Vfs>,
    pub root: Path,
}

impl TestArray {
    pub async fn create(allows_dups: bool) -> Self {
        Self::create_with_capacity(allows_dups, 4).await
    }

    pub async fn create_with_capacity(allows_dups: bool, capacity: u64) -> Self {
        Self::create_with_schema(schema().capacity(capacity).allows_dups(allows_dups)).await
    }

    pub async fn create_with_schema(builder: ArraySchemaBuilder) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let vfs: Arc<dyn Vfs> = Arc::new(FusioVfs::local());
        let root = FusioVfs::local_path(dir.path()).expect("root");
        let schema = builder.build().expect("schema");
        Array::create(vfs.as_ref(), &root, &schema).await.expect("create array");
        Self { _dir: dir, vfs, root }
    }

    pub async fn open(&self) -> Array {
        self.open_with(Config::default()).await
    }

    pub async fn open_with(&self, config: Config) -> Array {
        self.open_with_key(config, None).await
    }

    pub async fn open_with_key(&self, config: Config, key: Option<EncryptionKey>) -> Array {
        Array::open(self.vfs.clone(), self.root.clone(), config, key)
            .await
            .expect("open array")
    }
}

/// The shared schema, capacity 4, duplicates rejected.
pub fn schema() -> ArraySchemaBuilder {
    ArraySchema::builder()
        .dimension(Dimension::new("d1", Datatype::Int32, [1, 4], 2))
        .dimension(Dimension::new("d2", Datatype::Int32, [1, 4], 2))
        .attribute(Attribute::new("a", Datatype::Int32))
        .capacity(4)
}

/// One batch of cells `((d1, d2), a)`.
pub fn cells(cells: &[((i32, i32), i32)]) -> RecordBatch {
    RecordBatch::try_from_iter([
        ("d1", Arc::new(Int32Array::from_iter_values(cells.iter().map(|c| c.0.0))) as ArrayRef),
        ("d2", Arc::new(Int32Array::from_iter_values(cells.iter().map(|c| c.0.1))) as ArrayRef),
        ("a", Arc::new(Int32Array::from_iter_values(cells.iter().map(|c| c.1))) as ArrayRef),
    ])
    .expect("batch")
}

pub async fn write_at(array: &Array, ts: u64, batch: &[((i32, i32), i32)]) {
    array
        .write(&cells(batch), Some(Timestamp::new(ts)))
        .await
        .expect("write");
}

/// Cells returned by a query, concatenated over every submit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadResult {
    pub d1: Vec<i32>,
    pub d2: Vec<i32>,
    pub a: Vec<i32>,
    pub timestamps: Vec<u64>,
    pub submits: usize,
}

impl ReadResult {
    pub fn cells(&self) -> Vec<((i32, i32), i32)> {
        self.d1
            .iter()
            .zip(&self.d2)
            .zip(&self.a)
            .map(|((d1, d2), a)| ((*d1, *d2), *a))
            .collect()
    }
}

/// Submit until complete with buffers of `cells_per_submit` cells.
pub async fn read(array: &Array, window: TimestampRange, request: ReadRequest, cells_per_submit: usize) -> ReadResult {
    let with_timestamps = request.timestamps;
    let mut query = array.query(window, request).await.expect("query");
    let mut buffers = QueryBuffers::for_schema(array.schema(), cells_per_submit, with_timestamps);
    let mut result = ReadResult::default();
    loop {
        let status = query.submit(&mut buffers).await.expect("submit");
        result.submits += 1;
        result.d1.extend(buffers.column::<i32>("d1").expect("d1"));
        result.d2.extend(buffers.column::<i32>("d2").expect("d2"));
        result.a.extend(buffers.column::<i32>("a").expect("a"));
        if with_timestamps {
            result
                .timestamps
                .extend(buffers.column::<u64>(TIMESTAMPS_FIELD).expect("timestamps"));
        }
        match status {
            QueryStatus::Complete => return result,
            QueryStatus::Incomplete => {}
            other => panic!("unexpected status {other:?}"),
        }
    }
}

/// Read everything visible at `end`.
pub async fn read_at(array: &Array, end: u64) -> ReadResult {
    read(array, TimestampRange::new(0, end), ReadRequest::new(), 64).await
}
