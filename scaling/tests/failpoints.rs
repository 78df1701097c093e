#![cfg(all(feature = "failpoints", feature = "test-utils"))]

use scaling::concurrency::shutdown::create_shutdown_channel;
use scaling::context::ProcessContext;
use scaling::error::ErrorKind;
use scaling::failpoints::{
    BEFORE_CHANNEL_ACK_FP, BEFORE_CHECKPOINT_PERSIST_FP, INVENTORY_PAGE_FETCH_FP,
};
use scaling::importer::dialect_for;
use scaling::progress::{JobProgress, JobProgressTracker, MemoryJobProgressStore};
use scaling::task::{InventoryTask, TaskResources};
use scaling::test_utils::failpoints::ScalingFailScenario;
use scaling::test_utils::source::MemoryInventorySource;
use scaling::test_utils::target::MemoryImportTarget;
use scaling::test_utils::{order_node, order_row};
use scaling::types::{DatabaseType, InventoryPosition};
use scaling_config::shared::{InputConfig, OutputConfig, ProcessConfig};
use scaling_telemetry::tracing::init_test_tracing;

const JOB_ID: &str = "0130317c30317c3054317c7368617264696e675f6465";

fn process_config() -> ProcessConfig {
    ProcessConfig {
        input: Some(InputConfig {
            batch_size: 2,
            ..InputConfig::default()
        }),
        output: Some(OutputConfig {
            batch_size: 2,
            fetch_timeout_ms: 50,
            ..OutputConfig::default()
        }),
        stream_channel: None,
    }
}

async fn source_with_orders(count: i64) -> MemoryInventorySource {
    let source = MemoryInventorySource::new();
    source
        .add_table(
            order_node(0),
            (1..=count).map(|id| order_row(id, "NEW")).collect(),
        )
        .await;

    source
}

async fn tracker(store: &MemoryJobProgressStore) -> JobProgressTracker<MemoryJobProgressStore> {
    JobProgressTracker::load_or_init(
        JOB_ID,
        0,
        store.clone(),
        JobProgress::new(DatabaseType::MySql),
    )
    .await
    .unwrap()
}

/// Runs one copy of `t_order_0` to its end and returns the outcome.
async fn copy_orders(
    context: &ProcessContext,
    tracker: &JobProgressTracker<MemoryJobProgressStore>,
    target: &MemoryImportTarget,
    source: MemoryInventorySource,
) -> scaling::error::ScalingResult<()> {
    let (shutdown_tx, _shutdown_rx) = create_shutdown_channel();

    InventoryTask::start(
        TaskResources {
            context,
            target: target.clone(),
            dialect: dialect_for(DatabaseType::MySql),
            tracker: tracker.clone(),
            shutdown_tx,
        },
        order_node(0),
        "t_order",
        source,
    )
    .await
    .expect("the table is not finished")
    .wait()
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_before_checkpoint_replays_the_applied_batch() {
    init_test_tracing();

    let context = ProcessContext::new(JOB_ID, process_config()).unwrap();
    let store = MemoryJobProgressStore::new();
    let tracker = tracker(&store).await;
    let target = MemoryImportTarget::new();

    {
        let _scenario = ScalingFailScenario::setup(&[(BEFORE_CHECKPOINT_PERSIST_FP, "1*return")]);

        let err = copy_orders(&context, &tracker, &target, source_with_orders(6).await)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WithFatalFailure);
    }

    // The first batch reached the target but its checkpoint was never written.
    assert!(target.row_count("t_order").await > 0);
    let progress = tracker.snapshot().await;
    assert_eq!(progress.inventory.unfinished_position(&order_node(0)), None);
    assert!(!progress.inventory.is_finished(&order_node(0)));

    // The restart applies the batch again, which the upsert absorbs.
    copy_orders(&context, &tracker, &target, source_with_orders(6).await)
        .await
        .unwrap();
    assert_eq!(target.row_count("t_order").await, 6);
    assert!(
        tracker
            .snapshot()
            .await
            .inventory
            .is_finished(&order_node(0))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoint_is_persisted_before_the_channel_ack() {
    init_test_tracing();

    let context = ProcessContext::new(JOB_ID, process_config()).unwrap();
    let store = MemoryJobProgressStore::new();
    let tracker = tracker(&store).await;
    let target = MemoryImportTarget::new();

    {
        let _scenario = ScalingFailScenario::setup(&[(BEFORE_CHANNEL_ACK_FP, "1*return")]);

        let err = copy_orders(&context, &tracker, &target, source_with_orders(6).await)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WithFatalFailure);
    }

    let progress = tracker.snapshot().await;
    assert!(!progress.inventory.is_finished(&order_node(0)));
    let position = progress
        .inventory
        .unfinished_position(&order_node(0))
        .cloned()
        .expect("the applied batch was checkpointed");
    let InventoryPosition::IntegerPrimaryKey { begin, .. } = position else {
        panic!("integer keys record an integer position, got {position}");
    };
    assert!(begin > 1);

    // The restart picks up after the checkpoint and completes the table.
    copy_orders(&context, &tracker, &target, source_with_orders(6).await)
        .await
        .unwrap();
    assert_eq!(target.row_count("t_order").await, 6);
    assert!(
        tracker
            .snapshot()
            .await
            .inventory
            .is_finished(&order_node(0))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_page_fetch_fails_the_task() {
    init_test_tracing();

    let context = ProcessContext::new(JOB_ID, process_config()).unwrap();
    let store = MemoryJobProgressStore::new();
    let tracker = tracker(&store).await;
    let target = MemoryImportTarget::new();
    let source = source_with_orders(4).await;

    let _scenario = ScalingFailScenario::setup(&[(INVENTORY_PAGE_FETCH_FP, "return(transient)")]);

    let err = copy_orders(&context, &tracker, &target, source.clone())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WithTransientFailure);
    assert!(err.is_transient());
    assert_eq!(source.page_reads().await, 0);
    assert_eq!(target.row_count("t_order").await, 0);
    assert!(
        !tracker
            .snapshot()
            .await
            .inventory
            .is_finished(&order_node(0))
    );
}
