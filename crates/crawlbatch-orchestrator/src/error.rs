use crawlbatch_core::{LockError, TaskKind};
use thiserror::Error;

use crate::store::StoreError;

/// Failures that abort a tick. A busy task or a failed worker never shows up
/// here: the first is skipped, the second is reported and retried next pass.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("failed to start task {task}: {source}")]
    Spawn { task: TaskKind, source: LockError },
    #[error("failed to take the pass transition lock: {0}")]
    PassLock(LockError),
    #[error(transparent)]
    Persistence(#[from] StoreError),
    #[error("finalization failed: {0:#}")]
    Finalize(anyhow::Error),
}
