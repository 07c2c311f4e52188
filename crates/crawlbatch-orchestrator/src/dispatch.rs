//! Fans a tick out into one worker per unlocked task and collects them.
//!
//! Locks for every task are attempted before any worker is spawned, so a
//! task still running from an earlier tick only removes itself from this
//! tick; it never delays the others. Each worker runs as its own runtime task
//! under a supervisor that holds the [`TaskLock`], so a worker that panics is
//! still observed and its lock still comes back to the collector.

use crawlbatch_core::{Acquire, LockManager, RunKey, TaskKind, TaskLock};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    task::{Id, JoinError, JoinSet},
    time,
};
use tracing::{error, info, warn};

use crate::error::TickError;
use crate::tasks::{TaskOperations, run_task};

#[derive(Clone)]
pub struct Dispatcher {
    locks: LockManager,
    ops: Arc<dyn TaskOperations>,
    parse_shards: u32,
}

impl Dispatcher {
    #[must_use]
    pub fn new(locks: LockManager, ops: Arc<dyn TaskOperations>, parse_shards: u32) -> Self {
        Self { locks, ops, parse_shards }
    }

    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn dispatch(&self, run: &RunKey, tasks: &[TaskKind]) -> Result<Dispatched, TickError> {
        let mut acquired = Vec::with_capacity(tasks.len());
        let mut skipped = Vec::new();

        for &task in tasks {
            match self.locks.try_acquire(&run.location, &task.name()) {
                Ok(Acquire::Acquired(lock)) => acquired.push((task, lock)),
                Ok(Acquire::Busy) => {
                    info!(%task, "task already running, skipping");
                    skipped.push(task);
                }
                // Locks taken so far are dropped with `acquired`.
                Err(source) => return Err(TickError::Spawn { task, source }),
            }
        }

        let mut workers = Workers::default();
        for (task, lock) in acquired {
            info!(%task, "starting task");
            workers.spawn(task, lock, run.clone(), Arc::clone(&self.ops), self.parse_shards);
        }
        Ok(Dispatched { workers, skipped })
    }
}

pub struct Dispatched {
    pub workers: Workers,
    pub skipped: Vec<TaskKind>,
}

struct WorkerExit {
    task: TaskKind,
    lock: TaskLock,
    outcome: Result<anyhow::Result<u64>, JoinError>,
}

/// Outstanding workers for one tick, keyed by their supervisor's task id.
#[derive(Default)]
pub struct Workers {
    set: JoinSet<WorkerExit>,
    running: HashMap<Id, TaskKind>,
}

impl Workers {
    fn spawn(
        &mut self,
        task: TaskKind,
        lock: TaskLock,
        run: RunKey,
        ops: Arc<dyn TaskOperations>,
        parse_shards: u32,
    ) {
        let work = async move { run_task(ops.as_ref(), &run, task, parse_shards).await };
        let handle = self.set.spawn(async move {
            let outcome = tokio::spawn(work).await;
            WorkerExit { task, lock, outcome }
        });
        self.running.insert(handle.id(), task);
    }

    #[must_use]
    pub fn started(&self) -> Vec<TaskKind> {
        let mut tasks: Vec<TaskKind> = self.running.values().copied().collect();
        tasks.sort_by_key(|task| task_order(*task));
        tasks
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.set.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Waits for every worker, releasing each lock as its worker exits.
    /// Every `poll_interval` without an exit the remaining tasks are logged.
    pub async fn wait_all(mut self, poll_interval: Duration) -> CollectReport {
        let mut report = CollectReport::default();

        while !self.set.is_empty() {
            let joined = match time::timeout(poll_interval, self.set.join_next_with_id()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    let running: Vec<String> = self.started().iter().map(TaskKind::name).collect();
                    info!(running = %running.join(","), "waiting for tasks");
                    continue;
                }
            };

            let (id, exit) = match joined {
                Ok(joined) => joined,
                Err(err) => {
                    // Supervisors only await, so they end this way only when
                    // cancelled. The lock was dropped with the supervisor.
                    if let Some(task) = self.running.remove(&err.id()) {
                        error!(%task, %err, "worker supervisor lost");
                        report.failed.push(task);
                    }
                    continue;
                }
            };

            self.running.remove(&id);
            exit.lock.release();
            match exit.outcome {
                Ok(Ok(processed)) => {
                    info!(task = %exit.task, processed, "...DONE with task");
                    report.completed.push(exit.task);
                }
                Ok(Err(err)) => {
                    warn!(task = %exit.task, error = %format!("{err:#}"), "task failed");
                    report.failed.push(exit.task);
                }
                Err(err) => {
                    let panicked = err.is_panic();
                    warn!(task = %exit.task, panicked, "worker terminated abnormally");
                    report.failed.push(exit.task);
                }
            }
        }

        report.completed.sort_by_key(|task| task_order(*task));
        report.failed.sort_by_key(|task| task_order(*task));
        report
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectReport {
    pub completed: Vec<TaskKind>,
    pub failed: Vec<TaskKind>,
}

fn task_order(task: TaskKind) -> (u8, u32) {
    match task {
        TaskKind::Submit => (0, 0),
        TaskKind::Status => (1, 0),
        TaskKind::Obtain => (2, 0),
        TaskKind::Parse(n) => (3, n),
    }
}
