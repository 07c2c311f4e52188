//! One tick of the crawl: read the crawl fresh, then either dispatch workers
//! for outstanding items, re-enqueue failures for another pass, or finalize.
//!
//! Pass transitions happen under [`PASS_LOCK`] and re-read the store after
//! taking it, so two overlapping ticks never resubmit or finalize twice.

use crawlbatch_core::{
    Acquire, AggregateRange, PASS_LOCK, PassState, RunKey, TaskKind, TickId, now_ms, task_catalog,
};
use std::{sync::Arc, time::Duration};
use tracing::{Instrument, debug, info, info_span};

use crate::config::CrawlSettings;
use crate::dispatch::Dispatcher;
use crate::error::TickError;
use crate::finalize::Finalizer;
use crate::store::CrawlStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No crawl is queued for this archive and location.
    NoActiveRun,
    /// Every pass has run; nothing left to do.
    AlreadyFinalized { passes: u32 },
    Dispatched {
        pass: u32,
        outstanding: u64,
        started: Vec<TaskKind>,
        skipped: Vec<TaskKind>,
        failed: Vec<TaskKind>,
    },
    Resubmitted { pass: u32, resubmitted: u64 },
    Finalized { passes: u32, aggregate: AggregateRange },
    /// Another tick is in the middle of a pass transition, or already made it.
    TransitionInProgress,
}

pub struct Orchestrator {
    store: Arc<dyn CrawlStore>,
    dispatcher: Dispatcher,
    finalizer: Arc<dyn Finalizer>,
    crawl: CrawlSettings,
    poll_interval: Duration,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        store: Arc<dyn CrawlStore>,
        dispatcher: Dispatcher,
        finalizer: Arc<dyn Finalizer>,
        crawl: CrawlSettings,
        poll_interval: Duration,
    ) -> Self {
        Self { store, dispatcher, finalizer, crawl, poll_interval }
    }

    pub async fn tick(&self) -> Result<TickOutcome, TickError> {
        let tick_id = TickId::new();
        let span = info_span!("tick", %tick_id, location = %self.crawl.location);
        self.run_tick().instrument(span).await
    }

    async fn run_tick(&self) -> Result<TickOutcome, TickError> {
        let Some(label) =
            self.store.active_run_label(&self.crawl.archive, &self.crawl.location).await?
        else {
            debug!("no crawl to advance");
            return Ok(TickOutcome::NoActiveRun);
        };
        let run = RunKey::new(label, &self.crawl.archive, &self.crawl.location);

        let passes = self.store.current_pass(&run).await?;
        if passes >= self.crawl.max_passes {
            // Cron keeps firing after completion; stay quiet.
            debug!(%run, passes, "crawl already finalized");
            return Ok(TickOutcome::AlreadyFinalized { passes });
        }

        let outstanding = self.store.outstanding_count(&run).await?;
        match PassState::evaluate(passes, self.crawl.max_passes, outstanding) {
            PassState::Active { pass, outstanding } => self.advance(&run, pass, outstanding).await,
            PassState::Terminal => Ok(TickOutcome::AlreadyFinalized { passes }),
            PassState::Resubmit { .. } | PassState::Finalizing { .. } => {
                self.transition(&run).await
            }
        }
    }

    async fn advance(
        &self,
        run: &RunKey,
        pass: u32,
        outstanding: u64,
    ) -> Result<TickOutcome, TickError> {
        info!(%run, pass, outstanding, "dispatching tasks");
        let dispatched = self.dispatcher.dispatch(run, &task_catalog(self.crawl.parse_shards))?;
        let started = dispatched.workers.started();
        let report = dispatched.workers.wait_all(self.poll_interval).await;

        let summary = self.store.status_summary(run).await?;
        info!(%summary, "tick summary");

        Ok(TickOutcome::Dispatched {
            pass,
            outstanding,
            started,
            skipped: dispatched.skipped,
            failed: report.failed,
        })
    }

    async fn transition(&self, run: &RunKey) -> Result<TickOutcome, TickError> {
        let guard = match self
            .dispatcher
            .locks()
            .try_acquire(&run.location, PASS_LOCK)
            .map_err(TickError::PassLock)?
        {
            Acquire::Acquired(lock) => lock,
            Acquire::Busy => {
                info!(%run, "pass transition already running");
                return Ok(TickOutcome::TransitionInProgress);
            }
        };

        // The state seen before taking the lock may already be stale.
        let passes = self.store.current_pass(run).await?;
        let outstanding = self.store.outstanding_count(run).await?;
        let outcome = match PassState::evaluate(passes, self.crawl.max_passes, outstanding) {
            PassState::Resubmit { next_pass } => self.resubmit(run, next_pass).await,
            PassState::Finalizing { final_pass } => self.finalize(run, final_pass).await,
            PassState::Active { .. } | PassState::Terminal => {
                Ok(TickOutcome::TransitionInProgress)
            }
        };

        guard.release();
        outcome
    }

    async fn resubmit(&self, run: &RunKey, next_pass: u32) -> Result<TickOutcome, TickError> {
        let resubmitted =
            self.store.advance_pass(run, next_pass, self.crawl.max_item_attempts).await?;
        info!(
            %run,
            pass = next_pass,
            resubmitted,
            "Resubmitted failures - going around once again..."
        );
        Ok(TickOutcome::Resubmitted { pass: next_pass, resubmitted })
    }

    /// Record first, then the finalizer, which reads the range just written.
    /// The final pass count goes in only after the finalizer succeeds, so a
    /// failed finalization is retried by the next tick instead of being lost.
    async fn finalize(&self, run: &RunKey, final_pass: u32) -> Result<TickOutcome, TickError> {
        info!(%run, "DONE with tests. Copying...");

        let aggregate = self.store.aggregate_range(run).await?;
        self.store.finalize_run(run, &aggregate).await?;

        self.finalizer.finalize(run).await.map_err(TickError::Finalize)?;

        self.store.set_pass_count(run, final_pass).await?;
        self.store.set_finish_time(run, now_ms()).await?;

        info!(
            %run,
            pages = aggregate.num_pages,
            requests = aggregate.num_requests,
            errors = aggregate.num_errors,
            "DONE with crawl!"
        );
        Ok(TickOutcome::Finalized { passes: final_pass, aggregate })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{allow_requeue, block_requeue, force_status, seeded_store};
    use crate::store::SqliteStore;
    use crate::tasks::TaskOperations;
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use crawlbatch_core::{ItemStatus, LockManager, ShardSpec};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeOps {
        calls: Mutex<Vec<String>>,
        submit_started: Notify,
        release_submit: Option<Notify>,
    }

    impl FakeOps {
        fn gated() -> Self {
            Self { release_submit: Some(Notify::new()), ..Self::default() }
        }

        fn calls(&self) -> Vec<String> {
            let mut calls = self.calls.lock().expect("calls").clone();
            calls.sort();
            calls
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().expect("calls").push(call.into());
        }
    }

    #[async_trait]
    impl TaskOperations for FakeOps {
        async fn submit_batch(&self, _run: &RunKey) -> Result<u64> {
            self.record("submit");
            self.submit_started.notify_one();
            if let Some(release) = &self.release_submit {
                release.notified().await;
            }
            Ok(0)
        }
        async fn poll_status(&self, _run: &RunKey) -> Result<u64> {
            self.record("status");
            Ok(0)
        }
        async fn fetch_results(&self, _run: &RunKey) -> Result<u64> {
            self.record("obtain");
            bail!("wpt unreachable")
        }
        async fn fill_shard(&self, _run: &RunKey, shard: ShardSpec) -> Result<u64> {
            self.record(format!("fill {}", shard.index));
            Ok(0)
        }
    }

    /// Records the crawl record as the finalizer sees it.
    struct RecordingFinalizer {
        store: SqliteStore,
        seen: Mutex<Vec<AggregateRange>>,
        fail: bool,
    }

    #[async_trait]
    impl Finalizer for RecordingFinalizer {
        async fn finalize(&self, run: &RunKey) -> Result<()> {
            let crawl = self.store.fetch_run(run).await?.expect("crawl");
            self.seen.lock().expect("seen").push(crawl.aggregate);
            if self.fail {
                bail!("dump directory not writable");
            }
            Ok(())
        }
    }

    struct Harness {
        store: SqliteStore,
        run: RunKey,
        ops: Arc<FakeOps>,
        finalizer: Arc<RecordingFinalizer>,
        locks: LockManager,
        orchestrator: Orchestrator,
        _dir: TempDir,
    }

    impl Harness {
        async fn new(urls: usize, max_passes: u32, ops: FakeOps) -> Self {
            Self::build(urls, max_passes, ops, false).await
        }

        async fn build(urls: usize, max_passes: u32, ops: FakeOps, fail_finalize: bool) -> Self {
            let (store, run) = seeded_store(urls).await;
            let dir = tempfile::tempdir().expect("tempdir");
            let locks = LockManager::new(dir.path());
            let ops = Arc::new(ops);
            let finalizer = Arc::new(RecordingFinalizer {
                store: store.clone(),
                seen: Mutex::new(Vec::new()),
                fail: fail_finalize,
            });
            let crawl = CrawlSettings {
                archive: run.archive.clone(),
                location: run.location.clone(),
                max_passes,
                parse_shards: 2,
                max_item_attempts: None,
            };
            let orchestrator = Orchestrator::new(
                Arc::new(store.clone()),
                Dispatcher::new(locks.clone(), ops.clone(), crawl.parse_shards),
                finalizer.clone(),
                crawl,
                Duration::from_millis(20),
            );
            Self { store, run, ops, finalizer, locks, orchestrator, _dir: dir }
        }

        async fn settle_all(&self, ids: impl IntoIterator<Item = i64>, status: ItemStatus) {
            for id in ids {
                force_status(&self.store, id, status).await;
            }
        }

        async fn passes(&self) -> u32 {
            self.store.current_pass(&self.run).await.expect("passes")
        }

        fn finalize_calls(&self) -> usize {
            self.finalizer.seen.lock().expect("seen").len()
        }
    }

    #[tokio::test]
    async fn no_crawl_is_a_no_op() {
        let store = SqliteStore::open_in_memory().expect("store");
        let dir = tempfile::tempdir().expect("tempdir");
        let ops = Arc::new(FakeOps::default());
        let orchestrator = Orchestrator::new(
            Arc::new(store.clone()),
            Dispatcher::new(LockManager::new(dir.path()), ops.clone(), 2),
            Arc::new(RecordingFinalizer { store, seen: Mutex::new(Vec::new()), fail: false }),
            CrawlSettings::default(),
            Duration::from_millis(20),
        );

        assert_eq!(orchestrator.tick().await.expect("tick"), TickOutcome::NoActiveRun);
        assert!(ops.calls().is_empty());
    }

    #[tokio::test]
    async fn outstanding_items_dispatch_every_task_without_advancing_pass() {
        let h = Harness::new(3, 2, FakeOps::default()).await;
        h.settle_all([1], ItemStatus::Done).await;

        let outcome = h.orchestrator.tick().await.expect("tick");
        let TickOutcome::Dispatched { pass, outstanding, started, skipped, failed } = outcome else {
            panic!("expected dispatch, got {outcome:?}");
        };
        assert_eq!(pass, 0);
        assert_eq!(outstanding, 2);
        assert_eq!(started, task_catalog(2));
        assert!(skipped.is_empty());
        assert_eq!(failed, [TaskKind::Obtain]);

        assert_eq!(h.ops.calls(), ["fill 0", "fill 1", "obtain", "status", "submit"]);
        assert_eq!(h.passes().await, 0);
        assert_eq!(h.finalize_calls(), 0);
    }

    #[tokio::test]
    async fn drained_first_pass_resubmits_failures() {
        let h = Harness::new(3, 2, FakeOps::default()).await;
        h.settle_all([1, 2], ItemStatus::Done).await;
        h.settle_all([3], ItemStatus::Failed).await;

        let outcome = h.orchestrator.tick().await.expect("tick");
        assert_eq!(outcome, TickOutcome::Resubmitted { pass: 1, resubmitted: 1 });
        assert_eq!(h.passes().await, 1);
        assert_eq!(h.finalize_calls(), 0);
        assert!(h.ops.calls().is_empty());

        let item = h.store.fetch_item(3).await.expect("fetch").expect("item");
        assert_eq!(item.status, ItemStatus::Queued);
    }

    #[tokio::test]
    async fn failed_resubmit_keeps_the_retry_pass() {
        let h = Harness::new(2, 2, FakeOps::default()).await;
        h.settle_all([1], ItemStatus::Done).await;
        h.settle_all([2], ItemStatus::Failed).await;

        block_requeue(&h.store).await;
        let err = h.orchestrator.tick().await.expect_err("requeue fails");
        assert!(matches!(err, TickError::Persistence(_)));
        assert_eq!(h.passes().await, 0);

        allow_requeue(&h.store).await;
        let outcome = h.orchestrator.tick().await.expect("tick");
        assert_eq!(outcome, TickOutcome::Resubmitted { pass: 1, resubmitted: 1 });
        assert_eq!(h.finalize_calls(), 0);
        let item = h.store.fetch_item(2).await.expect("fetch").expect("item");
        assert_eq!(item.status, ItemStatus::Queued);
    }

    #[tokio::test]
    async fn drained_last_pass_finalizes_once() {
        let h = Harness::new(2, 2, FakeOps::default()).await;
        h.store.set_pass_count(&h.run, 1).await.expect("pass");
        h.settle_all([1], ItemStatus::Done).await;
        h.settle_all([2], ItemStatus::Failed).await;

        let outcome = h.orchestrator.tick().await.expect("tick");
        let TickOutcome::Finalized { passes, aggregate } = outcome else {
            panic!("expected finalize, got {outcome:?}");
        };
        assert_eq!(passes, 2);
        assert_eq!(aggregate.num_errors, 1);

        // The finalizer saw the aggregate already on the record.
        assert_eq!(h.finalizer.seen.lock().expect("seen").as_slice(), [aggregate.clone()]);

        let crawl = h.store.fetch_run(&h.run).await.expect("fetch").expect("crawl");
        assert_eq!(crawl.passes, 2);
        assert_eq!(crawl.aggregate, aggregate);
        assert!(crawl.is_finished());

        for _ in 0..3 {
            let again = h.orchestrator.tick().await.expect("tick");
            assert_eq!(again, TickOutcome::AlreadyFinalized { passes: 2 });
        }
        assert_eq!(h.finalize_calls(), 1);
        assert!(h.ops.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_first_pass_of_single_pass_crawl_finalizes_without_dispatch() {
        let h = Harness::new(1, 1, FakeOps::default()).await;
        h.settle_all([1], ItemStatus::Done).await;

        let outcome = h.orchestrator.tick().await.expect("tick");
        assert!(matches!(outcome, TickOutcome::Finalized { passes: 1, .. }));
        assert!(h.ops.calls().is_empty());
        assert_eq!(h.finalize_calls(), 1);
    }

    #[tokio::test]
    async fn failed_finalization_is_retried_by_next_tick() {
        let h = Harness::build(1, 1, FakeOps::default(), true).await;
        h.settle_all([1], ItemStatus::Done).await;

        let err = h.orchestrator.tick().await.expect_err("finalizer fails");
        assert!(matches!(err, TickError::Finalize(_)));
        assert_eq!(h.passes().await, 0);
        let crawl = h.store.fetch_run(&h.run).await.expect("fetch").expect("crawl");
        assert!(!crawl.is_finished());

        assert!(h.orchestrator.tick().await.is_err());
        assert_eq!(h.finalize_calls(), 2);
    }

    #[tokio::test]
    async fn held_pass_lock_defers_transition() {
        let h = Harness::new(1, 2, FakeOps::default()).await;
        h.settle_all([1], ItemStatus::Done).await;

        let Acquire::Acquired(held) = h.locks.try_acquire("IE8", PASS_LOCK).expect("lock") else {
            panic!("pass lock busy");
        };
        assert_eq!(h.orchestrator.tick().await.expect("tick"), TickOutcome::TransitionInProgress);
        assert_eq!(h.passes().await, 0);

        held.release();
        assert!(matches!(
            h.orchestrator.tick().await.expect("tick"),
            TickOutcome::Resubmitted { pass: 1, .. }
        ));
    }

    #[tokio::test]
    async fn busy_task_is_skipped_without_blocking_the_rest() {
        let h = Harness::new(2, 2, FakeOps::default()).await;
        let Acquire::Acquired(held) = h.locks.try_acquire("IE8", "status").expect("lock") else {
            panic!("status lock busy");
        };

        let outcome = h.orchestrator.tick().await.expect("tick");
        let TickOutcome::Dispatched { started, skipped, .. } = outcome else {
            panic!("expected dispatch, got {outcome:?}");
        };
        assert_eq!(skipped, [TaskKind::Status]);
        assert_eq!(
            started,
            [TaskKind::Submit, TaskKind::Obtain, TaskKind::Parse(1), TaskKind::Parse(2)]
        );
        assert_eq!(h.ops.calls(), ["fill 0", "fill 1", "obtain", "submit"]);
        held.release();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_ticks_never_run_a_task_twice() {
        let h = Arc::new(Harness::new(2, 2, FakeOps::gated()).await);

        let first = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.orchestrator.tick().await })
        };
        h.ops.submit_started.notified().await;

        let second = h.orchestrator.tick().await.expect("second tick");
        let TickOutcome::Dispatched { skipped, .. } = second else {
            panic!("expected dispatch, got {second:?}");
        };
        assert!(skipped.contains(&TaskKind::Submit));

        if let Some(release) = &h.ops.release_submit {
            release.notify_one();
        }
        let first = first.await.expect("join").expect("first tick");
        assert!(matches!(first, TickOutcome::Dispatched { .. }));

        let submits = h.ops.calls().iter().filter(|call| call.as_str() == "submit").count();
        assert_eq!(submits, 1);
    }
}
