//! Pipeline integration tests
//!
//! Drive the full reader → queue → dispatcher → broker → handler path with
//! a [`ReplaySource`] standing in for the binlog, and check what ends up in
//! the index and the checkpoint store.

mod common;

use async_trait::async_trait;
use common::*;
use smartoj_sync::{
    broker::{Job, LocalBroker, RetryPolicy, TaskBroker},
    checkpoint::{FilePositionStore, MemoryPositionStore, PositionStore},
    dispatcher::Dispatcher,
    event::{Batch, BinlogPosition, ChangeRecord, Row},
    events::ProgressNotifier,
    pipeline::{Pipeline, PipelineState},
    queue::BatchSender,
    reader::{ChangeSource, ReaderExit, ReaderHandle, ReplaySource},
    Result, SyncError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

const CHECKPOINT_KEY: &str = "smartoj";

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
    }
}

fn pipeline(
    batches: Vec<Batch>,
    store: Arc<dyn PositionStore>,
    broker: Arc<dyn TaskBroker>,
) -> Pipeline {
    Pipeline::new(
        Box::new(ReplaySource::new(batches)),
        store,
        broker,
        ProgressNotifier::new("integration"),
    )
}

// ============================================================================
// End-to-end scenario
// ============================================================================

mod scenario_tests {
    use super::*;

    #[tokio::test]
    async fn test_question_lifecycle_through_local_broker() {
        init_test_logging();
        let dir = TempDir::new().unwrap();
        let harness = Harness::seeded();
        // the directory reads live rows, which already carry the new name
        harness.directory.set_tag(7, "arrays");

        let all = batches(vec![
            insert_question(42, "Two Sum", 100),
            insert_link(1, 42, 7, 200),
            rename_tag(7, "array", "arrays", 300),
            delete_link(1, 42, 7, 400),
            delete_question(42, "Two Sum", 500),
        ]);

        // first run stops before the question is deleted
        let store = Arc::new(FilePositionStore::new(dir.path(), CHECKPOINT_KEY).await.unwrap());
        let broker = Arc::new(LocalBroker::start(harness.handlers.clone(), 1, 16, fast_retry()));
        let mut first = pipeline(all[..4].to_vec(), store.clone(), broker.clone());
        first.start().await.unwrap();
        let exit = first.wait().await.unwrap();

        assert_eq!(exit.reader, ReaderExit::StreamEnded);
        assert!(exit.dispatcher.is_ok());
        assert_eq!(exit.stats.batches, 4);
        assert_eq!(store.load().await.unwrap(), Some(pos(400)));

        let doc = harness.document(42).expect("document indexed");
        assert_eq!(doc.title, "Two Sum");
        assert!(doc.tags.is_empty());
        let stats = broker.stats();
        assert_eq!(stats.accepted, 4);
        assert_eq!(stats.dead_lettered, 0);

        // second run resumes after 400 and only sees the delete
        let store = Arc::new(FilePositionStore::new(dir.path(), CHECKPOINT_KEY).await.unwrap());
        let broker = Arc::new(LocalBroker::start(harness.handlers.clone(), 1, 16, fast_retry()));
        let mut second = pipeline(all, store.clone(), broker.clone());
        second.start().await.unwrap();
        let exit = second.wait().await.unwrap();

        assert_eq!(exit.stats.batches, 1);
        assert_eq!(broker.stats().accepted, 1);
        assert!(harness.document(42).is_none());
        assert_eq!(store.load().await.unwrap(), Some(pos(500)));
        assert_eq!(second.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_reply_notification_through_pipeline() {
        let harness = Harness::seeded();
        let store = Arc::new(MemoryPositionStore::new());
        let broker = Arc::new(LocalBroker::start(harness.handlers.clone(), 2, 16, fast_retry()));

        let mut run = pipeline(
            batches(vec![
                insert_comment(1, 5, None, "how do I start?", 100),
                insert_comment(2, 9, Some(1), "use a hash map", 200),
            ]),
            store,
            broker.clone(),
        );
        run.start().await.unwrap();
        run.wait().await.unwrap();

        let records = harness.notifications.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].recipient_id, 5);
        assert_eq!(records[0].sender_id, Some(9));
        assert_eq!(records[0].content, "bob replied to your comment: use a hash map");
        assert_eq!(broker.stats().skipped, 1);
    }
}

// ============================================================================
// Crash safety and replay
// ============================================================================

mod recovery_tests {
    use super::*;

    fn history() -> Vec<Batch> {
        batches(vec![
            insert_question(42, "Two Sum", 100),
            insert_link(1, 42, 7, 200),
            retitle_question(42, "Two Sum", "Two Sum II", 300),
            insert_link(2, 42, 8, 300),
            delete_link(1, 42, 7, 400),
        ])
    }

    #[tokio::test]
    async fn test_rejection_mid_batch_then_restart_converges() {
        init_test_logging();
        let dir = TempDir::new().unwrap();
        let harness = Harness::seeded();

        // the broker refuses the second record of the 300 batch
        let store = Arc::new(FilePositionStore::new(dir.path(), CHECKPOINT_KEY).await.unwrap());
        let broker = Arc::new(InlineBroker::new(harness.handlers.clone()).rejecting_from(3));
        let mut crashed = pipeline(history(), store.clone(), broker.clone());
        crashed.start().await.unwrap();
        let exit = crashed.wait().await.unwrap();

        assert!(matches!(exit.dispatcher, Err(SyncError::Broker(_))));
        assert!(!exit.is_clean());
        assert_eq!(broker.accepted(), 3);
        assert_eq!(exit.stats.batches, 2);
        assert_eq!(store.load().await.unwrap(), Some(pos(200)));

        // restart from the file, as a new process would
        let store = Arc::new(FilePositionStore::new(dir.path(), CHECKPOINT_KEY).await.unwrap());
        let broker = harness.inline_broker();
        let mut restarted = pipeline(history(), store.clone(), broker.clone());
        restarted.start().await.unwrap();
        let exit = restarted.wait().await.unwrap();

        assert!(exit.dispatcher.is_ok());
        assert_eq!(exit.stats.batches, 2);
        // the retitle at 300 is delivered a second time
        assert_eq!(broker.accepted(), 3);
        assert_eq!(store.load().await.unwrap(), Some(pos(400)));

        let clean = Harness::seeded();
        let mut reference = pipeline(
            history(),
            Arc::new(MemoryPositionStore::new()),
            clean.inline_broker(),
        );
        reference.start().await.unwrap();
        reference.wait().await.unwrap();

        assert_eq!(harness.documents(), clean.documents());
        let doc = harness.document(42).unwrap();
        assert_eq!(doc.title, "Two Sum II");
        assert_eq!(doc.tags, vec!["dp"]);
    }

    #[tokio::test]
    async fn test_checkpoint_failure_stops_before_advancing() {
        let harness = Harness::seeded();
        let store = Arc::new(MemoryPositionStore::with_position(pos(100)));
        store.fail_saves(true);

        let mut run = pipeline(history(), store.clone(), harness.inline_broker());
        run.start().await.unwrap();
        let exit = run.wait().await.unwrap();

        assert!(matches!(exit.dispatcher, Err(SyncError::Checkpoint(_))));
        assert_eq!(exit.stats.batches, 0);
        assert_eq!(store.current(), Some(pos(100)));
    }

    #[tokio::test]
    async fn test_crash_between_accept_and_checkpoint_replays_batch() {
        init_test_logging();
        let harness = Harness::seeded();
        let store = Arc::new(MemoryPositionStore::new());
        store.fail_saves(true);

        // the 100 batch is accepted, then its checkpoint write fails
        let broker = harness.inline_broker();
        let mut crashed = pipeline(history(), store.clone(), broker.clone());
        crashed.start().await.unwrap();
        let exit = crashed.wait().await.unwrap();

        assert!(matches!(exit.dispatcher, Err(SyncError::Checkpoint(_))));
        assert_eq!(broker.accepted(), 1);
        assert_eq!(store.current(), None);
        assert!(harness.document(42).is_some());

        // restart on the same store once it is writable again
        store.fail_saves(false);
        let broker = harness.inline_broker();
        let mut restarted = pipeline(history(), store.clone(), broker.clone());
        restarted.start().await.unwrap();
        let exit = restarted.wait().await.unwrap();

        assert!(exit.dispatcher.is_ok());
        // every record again, the question insert at 100 included
        assert_eq!(exit.stats.batches, 4);
        assert_eq!(broker.accepted(), 5);
        assert_eq!(store.current(), Some(pos(400)));

        let clean = Harness::seeded();
        let mut reference = pipeline(
            history(),
            Arc::new(MemoryPositionStore::new()),
            clean.inline_broker(),
        );
        reference.start().await.unwrap();
        reference.wait().await.unwrap();

        assert_eq!(harness.documents(), clean.documents());
        let doc = harness.document(42).unwrap();
        assert_eq!(doc.title, "Two Sum II");
        assert_eq!(doc.tags, vec!["dp"]);
    }

    fn current_thread() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_runtime_dropped_after_checkpoint_loses_nothing() {
        let harness = Harness::seeded();
        let store = Arc::new(MemoryPositionStore::new());

        let runtime = current_thread();
        runtime.block_on(async {
            let broker = Arc::new(LocalBroker::start(harness.handlers.clone(), 2, 16, fast_retry()));
            let dispatcher = Dispatcher::new(broker, store.clone(), ProgressNotifier::new("crash"));
            dispatcher
                .dispatch(Batch::new(vec![insert_question(42, "Two Sum", 100)], pos(100)))
                .await
                .unwrap();
        });
        // process dies without a broker shutdown
        drop(runtime);

        assert_eq!(store.current(), Some(pos(100)));
        assert_eq!(harness.document(42).unwrap().title, "Two Sum");
    }

    #[test]
    fn test_runtime_dropped_mid_job_leaves_checkpoint_behind() {
        let harness = Harness::seeded();
        harness.index.set_unavailable(true);
        let store = Arc::new(MemoryPositionStore::new());
        let slow_retry = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
        };

        let runtime = current_thread();
        let outcome = runtime.block_on(async {
            let broker = Arc::new(LocalBroker::start(harness.handlers.clone(), 1, 16, slow_retry));
            let dispatcher = Dispatcher::new(broker, store.clone(), ProgressNotifier::new("crash"));
            tokio::time::timeout(
                Duration::from_millis(100),
                dispatcher.dispatch(Batch::new(vec![insert_question(42, "Two Sum", 100)], pos(100))),
            )
            .await
        });
        assert!(outcome.is_err(), "dispatch returned while the job was still retrying");
        drop(runtime);

        assert_eq!(store.current(), None);
        assert!(harness.document(42).is_none());

        // a restart replays the batch the crash interrupted
        harness.index.set_unavailable(false);
        let runtime = current_thread();
        runtime.block_on(async {
            let mut restarted = pipeline(
                batches(vec![insert_question(42, "Two Sum", 100)]),
                store.clone(),
                harness.inline_broker(),
            );
            restarted.start().await.unwrap();
            assert!(restarted.wait().await.unwrap().dispatcher.is_ok());
        });

        assert_eq!(store.current(), Some(pos(100)));
        assert_eq!(harness.document(42).unwrap().title, "Two Sum");
    }

    #[tokio::test]
    async fn test_malformed_and_unregistered_records_are_skipped() {
        let harness = Harness::seeded();
        let store = Arc::new(MemoryPositionStore::new());

        let mut malformed = retitle_question(42, "Two Sum", "Two Sum II", 200);
        malformed.before = None;
        let unregistered = ChangeRecord::insert(
            "submit_record",
            Row::new().with("id", 3i64).with("question_id", 42i64),
            pos(200),
        );

        let mut run = pipeline(
            vec![
                Batch::new(vec![insert_question(42, "Two Sum", 100)], pos(100)),
                Batch::new(
                    vec![malformed, unregistered, insert_link(1, 42, 7, 200)],
                    pos(200),
                ),
            ],
            store.clone(),
            harness.inline_broker(),
        );
        run.start().await.unwrap();
        let exit = run.wait().await.unwrap();

        assert!(exit.dispatcher.is_ok());
        assert_eq!(exit.stats.skipped, 2);
        assert_eq!(exit.stats.records, 2);
        assert_eq!(store.current(), Some(pos(200)));
        let doc = harness.document(42).unwrap();
        assert_eq!(doc.title, "Two Sum");
        assert_eq!(doc.tags, vec!["array"]);
    }
}

// ============================================================================
// Backpressure
// ============================================================================

mod backpressure_tests {
    use super::*;

    /// Counts batches the queue has accepted.
    struct CountingSource {
        batches: Vec<Batch>,
        sent: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChangeSource for CountingSource {
        async fn start_position(&self, stored: Option<BinlogPosition>) -> Result<BinlogPosition> {
            Ok(stored.unwrap_or_else(|| pos(4)))
        }

        fn spawn(
            self: Box<Self>,
            _start: BinlogPosition,
            sender: BatchSender,
            _notifier: ProgressNotifier,
        ) -> Result<ReaderHandle> {
            let CountingSource { batches, sent } = *self;
            ReaderHandle::spawn("counting-reader", move |control| {
                for batch in batches {
                    if control.is_stopped() {
                        return ReaderExit::Stopped;
                    }
                    if sender.send_blocking(batch).is_err() {
                        return ReaderExit::QueueClosed;
                    }
                    sent.fetch_add(1, Ordering::SeqCst);
                }
                ReaderExit::StreamEnded
            })
        }
    }

    /// Holds every submission until a permit is released.
    struct GatedBroker {
        gate: Semaphore,
        accepted: AtomicUsize,
    }

    #[async_trait]
    impl TaskBroker for GatedBroker {
        async fn submit(&self, _job: Job) -> Result<()> {
            self.gate
                .acquire()
                .await
                .map_err(|_| SyncError::broker("gate closed"))?
                .forget();
            self.accepted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reader_blocks_when_queue_is_full() {
        let sent = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            batches: (1..=6)
                .map(|i| Batch::new(vec![insert_question(i, "q", i as u64 * 100)], pos(i as u64 * 100)))
                .collect(),
            sent: sent.clone(),
        };
        let broker = Arc::new(GatedBroker {
            gate: Semaphore::new(0),
            accepted: AtomicUsize::new(0),
        });
        let store = Arc::new(MemoryPositionStore::new());

        let mut run = Pipeline::new(
            Box::new(source),
            store.clone(),
            broker.clone(),
            ProgressNotifier::new("backpressure"),
        )
        .with_queue_capacity(2);
        run.start().await.unwrap();

        // one batch held by the dispatcher, two buffered, the fourth blocked
        for _ in 0..100 {
            if sent.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 3);
        assert_eq!(store.current(), None);

        broker.gate.add_permits(6);
        let exit = run.wait().await.unwrap();

        assert_eq!(exit.reader, ReaderExit::StreamEnded);
        assert_eq!(sent.load(Ordering::SeqCst), 6);
        assert_eq!(broker.accepted.load(Ordering::SeqCst), 6);
        assert_eq!(store.current(), Some(pos(600)));
    }
}
