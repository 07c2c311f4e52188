use anyhow::{Context, Result};
use async_trait::async_trait;
use crawlbatch_core::RunKey;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use crate::store::{PageRecord, RunStats, SqliteStore};

/// The one-time aggregation run when a crawl's last pass completes. It runs
/// after the crawl record carries its final range and counts.
#[async_trait]
pub trait Finalizer: Send + Sync {
    async fn finalize(&self, run: &RunKey) -> Result<()>;
}

/// Computes per-crawl averages into `stats` and dumps the crawl's pages as
/// JSON lines.
#[derive(Debug, Clone)]
pub struct StatsFinalizer {
    store: SqliteStore,
    dump_dir: PathBuf,
}

impl StatsFinalizer {
    #[must_use]
    pub fn new(store: SqliteStore, dump_dir: impl Into<PathBuf>) -> Self {
        Self { store, dump_dir: dump_dir.into() }
    }

    #[must_use]
    pub fn dump_path(&self, run: &RunKey) -> PathBuf {
        let name: String = format!("{}-{}", run.label, run.location)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') { c } else { '_' })
            .collect();
        self.dump_dir.join(format!("{name}.jsonl"))
    }
}

#[async_trait]
impl Finalizer for StatsFinalizer {
    async fn finalize(&self, run: &RunKey) -> Result<()> {
        let crawl =
            self.store.fetch_run(run).await?.with_context(|| format!("crawl {run} vanished"))?;

        let pages = match (crawl.aggregate.min_page_id, crawl.aggregate.max_page_id) {
            (Some(min), Some(max)) => self.store.pages_in_range(min, max).await?,
            _ => Vec::new(),
        };

        let stats = compute_stats(&pages);
        self.store.write_stats(run, &stats).await?;

        let path = self.dump_path(run);
        write_dump(&path, &pages).await?;
        info!(pages = stats.num_pages, dump = %path.display(), "stats and dump written");
        Ok(())
    }
}

#[must_use]
pub fn compute_stats(pages: &[PageRecord]) -> RunStats {
    if pages.is_empty() {
        return RunStats {
            num_pages: 0,
            avg_load_time_ms: 0.0,
            avg_bytes_total: 0.0,
            avg_req_total: 0.0,
        };
    }

    let n = pages.len() as f64;
    let mean =
        |field: fn(&PageRecord) -> u64| pages.iter().map(|p| field(p) as f64).sum::<f64>() / n;
    RunStats {
        num_pages: pages.len() as u64,
        avg_load_time_ms: mean(|p: &PageRecord| p.load_time_ms),
        avg_bytes_total: mean(|p: &PageRecord| p.bytes_total),
        avg_req_total: mean(|p: &PageRecord| p.req_total),
    }
}

async fn write_dump(path: &Path, pages: &[PageRecord]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create dump directory {}", parent.display()))?;
    }

    let mut body = String::new();
    for page in pages {
        body.push_str(&serde_json::to_string(page)?);
        body.push('\n');
    }
    fs::write(path, body).await.with_context(|| format!("failed to write dump {}", path.display()))
}
