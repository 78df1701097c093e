#![cfg(feature = "test-utils")]

use std::time::Duration;

use scaling::concurrency::shutdown::create_shutdown_channel;
use scaling::context::ProcessContext;
use scaling::error::{ErrorKind, ScalingError};
use scaling::importer::dialect_for;
use scaling::progress::{JobProgress, JobProgressStore, JobProgressTracker, MemoryJobProgressStore};
use scaling::task::{InventoryTask, TaskResources};
use scaling::test_utils::source::MemoryInventorySource;
use scaling::test_utils::target::MemoryImportTarget;
use scaling::test_utils::{order_node, order_row};
use scaling::types::{Cell, Column, DatabaseType};
use scaling_config::shared::{InputConfig, OutputConfig, ProcessConfig, RetryConfig};
use scaling_telemetry::tracing::init_test_tracing;

const JOB_ID: &str = "0130317c30317c3054317c7368617264696e675f6462";

fn process_config() -> ProcessConfig {
    ProcessConfig {
        input: Some(InputConfig {
            batch_size: 3,
            ..InputConfig::default()
        }),
        output: Some(OutputConfig {
            batch_size: 2,
            fetch_timeout_ms: 50,
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 10,
                max_delay_ms: 50,
                backoff_factor: 2.0,
            },
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

async fn tracker(
    store: &MemoryJobProgressStore,
) -> JobProgressTracker<MemoryJobProgressStore> {
    JobProgressTracker::load_or_init(
        JOB_ID,
        0,
        store.clone(),
        JobProgress::new(DatabaseType::MySql),
    )
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn table_is_copied_and_marked_finished() {
    init_test_tracing();

    let context = ProcessContext::new(JOB_ID, process_config()).unwrap();
    let store = MemoryJobProgressStore::new();
    let tracker = tracker(&store).await;
    let target = MemoryImportTarget::new();
    let (shutdown_tx, _shutdown_rx) = create_shutdown_channel();

    let task = InventoryTask::start(
        TaskResources {
            context: &context,
            target: target.clone(),
            dialect: dialect_for(DatabaseType::MySql),
            tracker: tracker.clone(),
            shutdown_tx: shutdown_tx.clone(),
        },
        order_node(0),
        "t_order",
        source_with_orders(10).await,
    )
    .await
    .expect("an unfinished table starts a task");

    task.wait().await.unwrap();

    assert_eq!(target.row_count("t_order").await, 10);
    assert!(
        target
            .executed_sql()
            .await
            .iter()
            .all(|sql| sql.contains("ON DUPLICATE KEY UPDATE"))
    );

    let progress = tracker.snapshot().await;
    assert!(progress.inventory.is_finished(&order_node(0)));
    assert!(progress.inventory.unfinished().is_empty());

    // The persisted checkpoint agrees with the in-memory one.
    let stored = store.load_job_progress(JOB_ID, 0).await.unwrap().unwrap();
    assert_eq!(stored, progress);

    context.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_tables_are_not_copied_again() {
    init_test_tracing();

    let context = ProcessContext::new(JOB_ID, process_config()).unwrap();
    let store = MemoryJobProgressStore::new();
    store
        .insert_document(
            JOB_ID,
            0,
            "status: EXECUTE_INVENTORY_TASK\n\
             sourceDatabaseType: MySQL\n\
             inventory:\n  finished:\n  - ds_0.t_order_0\n  unfinished: {}\n"
                .to_string(),
        )
        .await;
    let tracker = tracker(&store).await;
    let source = source_with_orders(5).await;
    let (shutdown_tx, _shutdown_rx) = create_shutdown_channel();

    let task = InventoryTask::start(
        TaskResources {
            context: &context,
            target: MemoryImportTarget::new(),
            dialect: dialect_for(DatabaseType::MySql),
            tracker,
            shutdown_tx,
        },
        order_node(0),
        "t_order",
        source.clone(),
    )
    .await;

    assert!(task.is_none());
    assert_eq!(source.page_reads().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn copy_resumes_from_the_unfinished_position() {
    init_test_tracing();

    let context = ProcessContext::new(JOB_ID, process_config()).unwrap();
    let store = MemoryJobProgressStore::new();
    store
        .insert_document(
            JOB_ID,
            0,
            "status: EXECUTE_INVENTORY_TASK\n\
             sourceDatabaseType: MySQL\n\
             inventory:\n  finished: []\n  unfinished:\n    ds_0.t_order_0: i,7,\n"
                .to_string(),
        )
        .await;
    let tracker = tracker(&store).await;
    let target = MemoryImportTarget::new();
    let (shutdown_tx, _shutdown_rx) = create_shutdown_channel();

    let task = InventoryTask::start(
        TaskResources {
            context: &context,
            target: target.clone(),
            dialect: dialect_for(DatabaseType::MySql),
            tracker: tracker.clone(),
            shutdown_tx,
        },
        order_node(0),
        "t_order",
        source_with_orders(10).await,
    )
    .await
    .unwrap();
    task.wait().await.unwrap();

    // Rows before the checkpoint were applied by the previous run, not by this one.
    assert_eq!(target.row_count("t_order").await, 4);
    assert!(
        target
            .find_row("t_order", "order_id", &Cell::I64(6))
            .await
            .is_none()
    );
    assert!(
        target
            .find_row("t_order", "order_id", &Cell::I64(7))
            .await
            .is_some()
    );
    assert!(
        tracker
            .snapshot()
            .await
            .inventory
            .is_finished(&order_node(0))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn tables_without_integer_keys_are_rescanned_whole() {
    init_test_tracing();

    let context = ProcessContext::new(JOB_ID, process_config()).unwrap();
    let store = MemoryJobProgressStore::new();
    store
        .insert_document(
            JOB_ID,
            0,
            "status: EXECUTE_INVENTORY_TASK\n\
             sourceDatabaseType: MySQL\n\
             inventory:\n  unfinished:\n    ds_0.t_order_0: s,c,\n"
                .to_string(),
        )
        .await;
    let tracker = tracker(&store).await;
    let source = MemoryInventorySource::new();
    source
        .add_table(
            order_node(0),
            ["a", "b", "c", "d"]
                .into_iter()
                .map(|code| {
                    vec![
                        Column::new("code", code, true),
                        Column::new("status", "NEW", false),
                    ]
                })
                .collect(),
        )
        .await;
    let target = MemoryImportTarget::new();
    let (shutdown_tx, _shutdown_rx) = create_shutdown_channel();

    InventoryTask::start(
        TaskResources {
            context: &context,
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
    .unwrap()
    .wait()
    .await
    .unwrap();

    assert_eq!(target.row_count("t_order").await, 4);
    assert!(
        tracker
            .snapshot()
            .await
            .inventory
            .is_finished(&order_node(0))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn replayed_rows_are_upserted_not_duplicated() {
    init_test_tracing();

    let context = ProcessContext::new(JOB_ID, process_config()).unwrap();
    let store = MemoryJobProgressStore::new();
    let target = MemoryImportTarget::new();
    let (shutdown_tx, _shutdown_rx) = create_shutdown_channel();

    // The same table copied twice, as after a crash between apply and checkpoint.
    for status in ["NEW", "PAID"] {
        let source = MemoryInventorySource::new();
        source
            .add_table(
                order_node(1),
                (1..=4).map(|id| order_row(id, status)).collect(),
            )
            .await;
        let replay_tracker = JobProgressTracker::load_or_init(
            format!("{JOB_ID}-{status}"),
            0,
            store.clone(),
            JobProgress::new(DatabaseType::MySql),
        )
        .await
        .unwrap();

        InventoryTask::start(
            TaskResources {
                context: &context,
                target: target.clone(),
                dialect: dialect_for(DatabaseType::MySql),
                tracker: replay_tracker,
                shutdown_tx: shutdown_tx.clone(),
            },
            order_node(1),
            "t_order",
            source,
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    }

    assert_eq!(target.row_count("t_order").await, 4);
    let row = target
        .find_row("t_order", "order_id", &Cell::I64(3))
        .await
        .unwrap();
    assert_eq!(row.get("status"), Some(&Cell::from("PAID")));
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_apply_failures_are_retried() {
    init_test_tracing();

    let context = ProcessContext::new(JOB_ID, process_config()).unwrap();
    let store = MemoryJobProgressStore::new();
    let tracker = tracker(&store).await;
    let target = MemoryImportTarget::new();
    target
        .fail_next([
            ScalingError::from((ErrorKind::TargetConnectionFailed, "Connection reset")),
            ScalingError::from((ErrorKind::TargetConstraintViolation, "Deadlock found")),
        ])
        .await;
    let (shutdown_tx, _shutdown_rx) = create_shutdown_channel();

    InventoryTask::start(
        TaskResources {
            context: &context,
            target: target.clone(),
            dialect: dialect_for(DatabaseType::MySql),
            tracker: tracker.clone(),
            shutdown_tx,
        },
        order_node(0),
        "t_order",
        source_with_orders(4).await,
    )
    .await
    .unwrap()
    .wait()
    .await
    .unwrap();

    assert_eq!(target.row_count("t_order").await, 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_fail_the_task_and_keep_the_checkpoint() {
    init_test_tracing();

    let context = ProcessContext::new(JOB_ID, process_config()).unwrap();
    let store = MemoryJobProgressStore::new();
    let tracker = tracker(&store).await;
    let target = MemoryImportTarget::new();
    target
        .fail_next(
            (0..3).map(|_| ScalingError::from((ErrorKind::TargetConnectionFailed, "Timed out"))),
        )
        .await;
    let (shutdown_tx, _shutdown_rx) = create_shutdown_channel();

    let task = InventoryTask::start(
        TaskResources {
            context: &context,
            target: target.clone(),
            dialect: dialect_for(DatabaseType::MySql),
            tracker: tracker.clone(),
            shutdown_tx: shutdown_tx.clone(),
        },
        order_node(0),
        "t_order",
        source_with_orders(6).await,
    )
    .await
    .unwrap();

    let err = task.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ImportRetriesExhausted);
    assert!(err.to_string().contains("last checkpoint"));
    assert_eq!(target.executions().await, 3);
    assert!(shutdown_tx.is_shutdown());

    // Nothing was applied, so nothing was checkpointed.
    let progress = tracker.snapshot().await;
    assert!(!progress.inventory.is_finished(&order_node(0)));
    assert_eq!(progress.inventory.unfinished_position(&order_node(0)), None);
    assert_eq!(target.row_count("t_order").await, 0);

    tokio::time::timeout(Duration::from_secs(5), context.shutdown())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn source_read_failures_fail_the_task() {
    init_test_tracing();

    let context = ProcessContext::new(JOB_ID, process_config()).unwrap();
    let store = MemoryJobProgressStore::new();
    let tracker = tracker(&store).await;
    let target = MemoryImportTarget::new();
    let source = source_with_orders(6).await;
    source
        .fail_next_reads([ScalingError::from((
            ErrorKind::SourceQueryFailed,
            "Table was dropped concurrently",
        ))])
        .await;
    let (shutdown_tx, _shutdown_rx) = create_shutdown_channel();

    let err = InventoryTask::start(
        TaskResources {
            context: &context,
            target: target.clone(),
            dialect: dialect_for(DatabaseType::MySql),
            tracker: tracker.clone(),
            shutdown_tx: shutdown_tx.clone(),
        },
        order_node(0),
        "t_order",
        source.clone(),
    )
    .await
    .unwrap()
    .wait()
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SourceQueryFailed);
    assert!(shutdown_tx.is_shutdown());
    assert_eq!(source.page_reads().await, 1);
    assert_eq!(target.row_count("t_order").await, 0);
    assert!(
        !tracker
            .snapshot()
            .await
            .inventory
            .is_finished(&order_node(0))
    );
}

/// Starts a copy of `t_order_0` and returns the error it fails with.
async fn copy_fails(
    context: &ProcessContext,
    tracker: &JobProgressTracker<MemoryJobProgressStore>,
    target: &MemoryImportTarget,
    source: &MemoryInventorySource,
) -> ScalingError {
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
        source.clone(),
    )
    .await
    .expect("the table is not finished")
    .wait()
    .await
    .unwrap_err()
}

#[tokio::test(flavor = "multi_thread")]
async fn tables_without_a_unique_key_are_refused_on_every_start() {
    init_test_tracing();

    let context = ProcessContext::new(JOB_ID, process_config()).unwrap();
    let store = MemoryJobProgressStore::new();
    let source = MemoryInventorySource::new();
    source
        .add_table(
            order_node(0),
            (0..5)
                .map(|_| vec![Column::new("status", "NEW", false)])
                .collect(),
        )
        .await;
    let target = MemoryImportTarget::new();

    let fresh = tracker(&store).await;
    let err = copy_fails(&context, &fresh, &target, &source).await;
    assert_eq!(err.kind(), ErrorKind::InvalidData);

    // A restart from a position that cannot be resumed is refused the same way.
    store
        .insert_document(
            JOB_ID,
            0,
            "status: EXECUTE_INVENTORY_TASK\n\
             sourceDatabaseType: MySQL\n\
             inventory:\n  unfinished:\n    ds_0.t_order_0: u,,\n"
                .to_string(),
        )
        .await;
    let restarted = tracker(&store).await;
    let err = copy_fails(&context, &restarted, &target, &source).await;
    assert_eq!(err.kind(), ErrorKind::InvalidData);

    assert_eq!(source.page_reads().await, 0);
    assert_eq!(target.row_count("t_order").await, 0);
    assert!(
        !restarted
            .snapshot()
            .await
            .inventory
            .is_finished(&order_node(0))
    );
}
