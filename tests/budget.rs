mod common;

use common::{TestArray, read, write_at};
use tessera::{Config, ReadRequest, TimestampRange, config::ReaderVariant};

async fn populate(fixture: &TestArray) {
    let array = fixture.open().await;
    let rows = |row: i32, base: i32| -> Vec<((i32, i32), i32)> { (1..=4).map(|col| ((row, col), base + col)).collect() };
    write_at(&array, 1, &[rows(1, 10), rows(2, 20)].concat()).await;
    write_at(&array, 2, &[rows(2, 200), rows(3, 300)].concat()).await;
    write_at(&array, 3, &[rows(1, 1000), rows(4, 4000)].concat()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smaller_budgets_take_more_submits_for_the_same_cells() {
    let fixture = TestArray::create_with_capacity(false, 2).await;
    populate(&fixture).await;

    let unbounded = fixture.open().await;
    let reference = read(&unbounded, TimestampRange::ALL, ReadRequest::new(), 64).await;
    assert_eq!(reference.submits, 1);
    assert_eq!(reference.cells().len(), 16);

    let tight = fixture.open_with(Config::default().with_total_budget(2)).await;
    let bounded = read(&tight, TimestampRange::ALL, ReadRequest::new(), 64).await;
    assert!(bounded.submits > reference.submits);
    assert_eq!(bounded.cells(), reference.cells());

    let small_buffers = read(&tight, TimestampRange::ALL, ReadRequest::new(), 3).await;
    assert!(small_buffers.submits >= 6);
    assert_eq!(small_buffers.cells(), reference.cells());

    let legacy = fixture
        .open_with(
            Config::default()
                .with_total_budget(2)
                .with_reader_variant(ReaderVariant::Legacy),
        )
        .await;
    let single_pass = read(&legacy, TimestampRange::ALL, ReadRequest::new(), 64).await;
    assert_eq!(single_pass.submits, 1);
    assert_eq!(single_pass.cells(), reference.cells());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consolidation_under_a_tight_budget_keeps_every_cell() {
    let fixture = TestArray::create_with_capacity(false, 2).await;
    populate(&fixture).await;
    let reference = read(&fixture.open().await, TimestampRange::ALL, ReadRequest::new(), 64).await;

    let tight = fixture.open_with(Config::default().with_total_budget(64)).await;
    tight.consolidate(true).await.expect("consolidate");
    let after = read(&tight, TimestampRange::ALL, ReadRequest::new(), 5).await;
    assert_eq!(after.cells(), reference.cells());
}
