//! What each dispatched task actually does to the crawl.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use crawlbatch_core::{ItemStatus, RunKey, ShardSpec, TaskKind};
use crawlbatch_protocol::{Envelope, TestResult};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::{PageFill, RequestFill, SqliteStore, StatusItem};
use crate::wpt::WptApi;

/// Per-task operations. Each returns the number of items it moved forward.
#[async_trait]
pub trait TaskOperations: Send + Sync {
    async fn submit_batch(&self, run: &RunKey) -> Result<u64>;
    async fn poll_status(&self, run: &RunKey) -> Result<u64>;
    async fn fetch_results(&self, run: &RunKey) -> Result<u64>;
    async fn fill_shard(&self, run: &RunKey, shard: ShardSpec) -> Result<u64>;
}

/// Routes `task` to its operation. Parse tasks are numbered from 1 and are
/// translated to the zero-based shard the fill step expects.
pub async fn run_task(
    ops: &dyn TaskOperations,
    run: &RunKey,
    task: TaskKind,
    parse_shards: u32,
) -> Result<u64> {
    match task {
        TaskKind::Submit => ops.submit_batch(run).await,
        TaskKind::Status => ops.poll_status(run).await,
        TaskKind::Obtain => ops.fetch_results(run).await,
        TaskKind::Parse(_) => {
            let shard = task
                .shard(parse_shards)
                .ok_or_else(|| anyhow!("{task} is outside the {parse_shards} configured shards"))?;
            ops.fill_shard(run, shard).await
        }
    }
}

/// Task operations backed by the crawl store and a WebPagetest server.
///
/// A WebPagetest error fails only the item it was about; the loop moves on
/// and the next pass resubmits it. Only store errors end the task early.
#[derive(Clone)]
pub struct WptTaskOperations {
    store: SqliteStore,
    api: Arc<dyn WptApi>,
    batch_size: u32,
}

impl WptTaskOperations {
    #[must_use]
    pub fn new(store: SqliteStore, api: Arc<dyn WptApi>, batch_size: u32) -> Self {
        Self { store, api, batch_size }
    }
}

#[async_trait]
impl TaskOperations for WptTaskOperations {
    async fn submit_batch(&self, run: &RunKey) -> Result<u64> {
        let items =
            self.store.items_in_status(run, ItemStatus::Queued, Some(self.batch_size)).await?;
        let mut submitted = 0;
        for item in items {
            let envelope = match self.api.submit(&item.url).await {
                Ok(envelope) => envelope,
                Err(err) => {
                    self.fail(&item, ItemStatus::Queued, &format!("{err:#}")).await?;
                    continue;
                }
            };
            match envelope.data {
                Some(submission) if envelope.status_code == crawlbatch_protocol::STATUS_OK => {
                    if self.store.mark_submitted(item.id, &submission.test_id).await? {
                        submitted += 1;
                    }
                }
                _ => {
                    let reason = format!("{} {}", envelope.status_code, envelope.status_text);
                    warn!(url = %item.url, %reason, "submission rejected");
                    self.store
                        .transition_item(
                            item.id,
                            ItemStatus::Queued,
                            ItemStatus::Failed,
                            Some(&reason),
                        )
                        .await?;
                }
            }
        }
        Ok(submitted)
    }

    async fn poll_status(&self, run: &RunKey) -> Result<u64> {
        let items = self.store.items_in_status(run, ItemStatus::Submitted, None).await?;
        let mut finished = 0;
        for item in items {
            let Some(test_id) = item.wpt_id.as_deref() else {
                self.fail(&item, ItemStatus::Submitted, "missing test id").await?;
                continue;
            };

            let envelope = match self.api.test_status(test_id).await {
                Ok(envelope) => envelope,
                Err(err) => {
                    self.fail(&item, ItemStatus::Submitted, &format!("{err:#}")).await?;
                    continue;
                }
            };
            if envelope.is_ok() {
                if self
                    .store
                    .transition_item(item.id, ItemStatus::Submitted, ItemStatus::Completed, None)
                    .await?
                {
                    finished += 1;
                }
            } else if envelope.is_error() {
                let reason = format!("{} {}", envelope.status_code, envelope.status_text);
                self.fail(&item, ItemStatus::Submitted, &reason).await?;
            } else {
                debug!(%test_id, code = envelope.status_code, "test still running");
            }
        }
        Ok(finished)
    }

    async fn fetch_results(&self, run: &RunKey) -> Result<u64> {
        let items = self.store.items_in_status(run, ItemStatus::Completed, None).await?;
        let mut obtained = 0;
        for item in items {
            let Some(test_id) = item.wpt_id.as_deref() else {
                self.fail(&item, ItemStatus::Completed, "missing test id").await?;
                continue;
            };
            let body = match self.api.fetch_result(test_id).await {
                Ok(body) => body,
                Err(err) => {
                    self.fail(&item, ItemStatus::Completed, &format!("{err:#}")).await?;
                    continue;
                }
            };
            if self.store.store_result(item.id, &body).await? {
                obtained += 1;
            }
        }
        Ok(obtained)
    }

    async fn fill_shard(&self, run: &RunKey, shard: ShardSpec) -> Result<u64> {
        let items = self.store.items_for_shard(run, ItemStatus::Obtained, shard).await?;
        let mut filled = 0;
        for item in items {
            match page_fill(&item) {
                Ok(page) => {
                    self.store.record_page(run, item.id, &page).await?;
                    filled += 1;
                }
                Err(err) => {
                    self.fail(&item, ItemStatus::Obtained, &format!("{err:#}")).await?;
                }
            }
        }
        debug!(%shard, filled, "shard filled");
        Ok(filled)
    }
}

impl WptTaskOperations {
    async fn fail(&self, item: &StatusItem, from: ItemStatus, reason: &str) -> Result<()> {
        warn!(url = %item.url, %reason, "item failed");
        self.store.transition_item(item.id, from, ItemStatus::Failed, Some(reason)).await?;
        Ok(())
    }
}

/// Turns a stored result document into the page and request rows to insert.
pub fn page_fill(item: &StatusItem) -> Result<PageFill> {
    let raw = item.result_json.as_deref().context("no result stored")?;
    let envelope: Envelope<TestResult> =
        serde_json::from_str(raw).context("malformed result document")?;
    if !envelope.is_ok() {
        bail!("result reported {} {}", envelope.status_code, envelope.status_text);
    }
    let result = envelope.data.context("result has no data")?;
    let view = result.first_view().context("result has no first view")?;

    Ok(PageFill {
        url: view.url.clone().or(result.url.clone()).unwrap_or_else(|| item.url.clone()),
        wpt_id: item.wpt_id.clone(),
        load_time_ms: view.load_time_ms,
        ttfb_ms: view.ttfb_ms,
        bytes_total: view.bytes_in,
        req_total: view.request_count(),
        requests: view
            .requests
            .iter()
            .map(|request| RequestFill {
                url: request.full_url.clone(),
                status_code: request.response_code,
                bytes: request.bytes_in,
                content_type: request.content_type.clone(),
            })
            .collect(),
    })
}
