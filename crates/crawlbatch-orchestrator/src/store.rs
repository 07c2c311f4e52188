//! The crawl store: crawl records, per-URL status items, and the page and
//! request rows filled from test results. Every read goes to SQLite so
//! concurrent ticks (separate processes) always see the committed state.

use async_trait::async_trait;
use crawlbatch_core::{AggregateRange, CrawlRun, ItemStatus, RunKey, ShardSpec, now_ms};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to prepare database directory {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("crawl {0} not found")]
    RunNotFound(RunKey),
    #[error("invalid item status in store: {0}")]
    InvalidStatus(String),
}

/// Item counts per status for one crawl.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSummary {
    counts: Vec<(ItemStatus, u64)>,
}

impl StatusSummary {
    #[must_use]
    pub fn count(&self, status: ItemStatus) -> u64 {
        self.counts.iter().find(|(s, _)| *s == status).map_or(0, |(_, n)| *n)
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|(_, n)| n).sum()
    }
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for status in ItemStatus::ALL {
            write!(f, "{}={} ", status, self.count(status))?;
        }
        write!(f, "total={}", self.total())
    }
}

/// Narrow interface the tick uses to read and advance a crawl.
#[async_trait]
pub trait CrawlStore: Send + Sync {
    async fn active_run_label(
        &self,
        archive: &str,
        location: &str,
    ) -> Result<Option<String>, StoreError>;
    async fn current_pass(&self, run: &RunKey) -> Result<u32, StoreError>;
    async fn set_pass_count(&self, run: &RunKey, passes: u32) -> Result<(), StoreError>;
    async fn outstanding_count(&self, run: &RunKey) -> Result<u64, StoreError>;
    /// Records `next_pass` and re-enqueues failed items for it in one
    /// transaction; returns how many went back. On error neither is applied.
    async fn advance_pass(
        &self,
        run: &RunKey,
        next_pass: u32,
        max_item_attempts: Option<u32>,
    ) -> Result<u64, StoreError>;
    async fn aggregate_range(&self, run: &RunKey) -> Result<AggregateRange, StoreError>;
    async fn finalize_run(&self, run: &RunKey, aggregate: &AggregateRange)
    -> Result<(), StoreError>;
    async fn set_finish_time(&self, run: &RunKey, finished_at_ms: u64) -> Result<(), StoreError>;
    async fn status_summary(&self, run: &RunKey) -> Result<StatusSummary, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusItem {
    pub id: i64,
    pub url: String,
    pub wpt_id: Option<String>,
    pub status: ItemStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub result_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFill {
    pub url: String,
    pub wpt_id: Option<String>,
    pub load_time_ms: u64,
    pub ttfb_ms: u64,
    pub bytes_total: u64,
    pub req_total: u64,
    pub requests: Vec<RequestFill>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFill {
    pub url: String,
    pub status_code: i64,
    pub bytes: u64,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageRecord {
    pub page_id: i64,
    pub url: String,
    pub wpt_id: Option<String>,
    pub load_time_ms: u64,
    pub ttfb_ms: u64,
    pub bytes_total: u64,
    pub req_total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStats {
    pub num_pages: u64,
    pub avg_load_time_ms: f64,
    pub avg_bytes_total: f64,
    pub avg_req_total: f64,
}

#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|source| StoreError::Io { path: parent.to_path_buf(), source })?;
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self { db: Arc::new(Mutex::new(conn)) })
    }

    pub async fn create_run(&self, run: &RunKey) -> Result<CrawlRun, StoreError> {
        let crawl = CrawlRun::new(run.clone());
        let db = self.db.lock().await;
        db.execute(
            "
            INSERT INTO crawls (label, archive, location, passes, started_at_ms)
            VALUES (?1, ?2, ?3, 0, ?4)
            ",
            params![run.label, run.archive, run.location, crawl.started_at_ms],
        )?;
        Ok(crawl)
    }

    pub async fn fetch_run(&self, run: &RunKey) -> Result<Option<CrawlRun>, StoreError> {
        let db = self.db.lock().await;
        let crawl = db
            .query_row(
                "
                SELECT passes, min_pageid, max_pageid, num_pages, num_requests, num_errors,
                       started_at_ms, finished_at_ms
                FROM crawls
                WHERE label = ?1 AND archive = ?2 AND location = ?3
                ",
                params![run.label, run.archive, run.location],
                |row| {
                    Ok(CrawlRun {
                        key: run.clone(),
                        passes: get_unsigned(row, 0)?,
                        aggregate: AggregateRange {
                            min_page_id: row.get(1)?,
                            max_page_id: row.get(2)?,
                            num_pages: get_unsigned(row, 3)?,
                            num_requests: get_unsigned(row, 4)?,
                            num_errors: get_unsigned(row, 5)?,
                        },
                        started_at_ms: get_unsigned(row, 6)?,
                        finished_at_ms: get_optional_unsigned(row, 7)?,
                    })
                },
            )
            .optional()?;
        Ok(crawl)
    }

    /// Queues one status item per URL; returns how many were added.
    pub async fn enqueue_urls(&self, run: &RunKey, urls: &[String]) -> Result<u64, StoreError> {
        let now = now_ms();
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO status (label, archive, location, url, status, attempts, updated_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
                ",
            )?;
            for url in urls {
                stmt.execute(params![
                    run.label,
                    run.archive,
                    run.location,
                    url,
                    ItemStatus::Queued.as_str(),
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(urls.len() as u64)
    }

    pub async fn items_in_status(
        &self,
        run: &RunKey,
        status: ItemStatus,
        limit: Option<u32>,
    ) -> Result<Vec<StatusItem>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "
            SELECT statusid, url, wpt_id, status, attempts, error, result_json
            FROM status
            WHERE label = ?1 AND archive = ?2 AND location = ?3 AND status = ?4
            ORDER BY statusid
            LIMIT ?5
            ",
        )?;
        let limit = limit.map_or(-1, i64::from);
        let rows = stmt.query_map(
            params![run.label, run.archive, run.location, status.as_str(), limit],
            map_item_row,
        )?;
        collect_items(rows)
    }

    /// Items in `status` whose id falls in `shard`.
    pub async fn items_for_shard(
        &self,
        run: &RunKey,
        status: ItemStatus,
        shard: ShardSpec,
    ) -> Result<Vec<StatusItem>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "
            SELECT statusid, url, wpt_id, status, attempts, error, result_json
            FROM status
            WHERE label = ?1 AND archive = ?2 AND location = ?3 AND status = ?4
              AND statusid % ?5 = ?6
            ORDER BY statusid
            ",
        )?;
        let rows = stmt.query_map(
            params![run.label, run.archive, run.location, status.as_str(), shard.total, shard.index],
            map_item_row,
        )?;
        collect_items(rows)
    }

    pub async fn fetch_item(&self, id: i64) -> Result<Option<StatusItem>, StoreError> {
        let db = self.db.lock().await;
        let raw = db
            .query_row(
                "
                SELECT statusid, url, wpt_id, status, attempts, error, result_json
                FROM status WHERE statusid = ?1
                ",
                params![id],
                map_item_row,
            )
            .optional()?;
        raw.map(RawItem::into_item).transpose()
    }

    /// Moves an item from `from` to `to`. Returns false if the item was no
    /// longer in `from`, e.g. because another tick already moved it.
    pub async fn transition_item(
        &self,
        id: i64,
        from: ItemStatus,
        to: ItemStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE status SET status = ?3, error = ?4, updated_at_ms = ?5 WHERE statusid = ?1 AND status = ?2",
            params![id, from.as_str(), to.as_str(), error, now_ms()],
        )?;
        Ok(changed > 0)
    }

    pub async fn mark_submitted(&self, id: i64, wpt_id: &str) -> Result<bool, StoreError> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE status SET status = ?2, wpt_id = ?3, error = NULL, updated_at_ms = ?4 WHERE statusid = ?1 AND status = ?5",
            params![
                id,
                ItemStatus::Submitted.as_str(),
                wpt_id,
                now_ms(),
                ItemStatus::Queued.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    pub async fn store_result(&self, id: i64, result_json: &str) -> Result<bool, StoreError> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE status SET status = ?2, result_json = ?3, updated_at_ms = ?4 WHERE statusid = ?1 AND status = ?5",
            params![
                id,
                ItemStatus::Obtained.as_str(),
                result_json,
                now_ms(),
                ItemStatus::Completed.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    /// Writes the page and its requests and marks the item done, atomically.
    pub async fn record_page(
        &self,
        run: &RunKey,
        item_id: i64,
        page: &PageFill,
    ) -> Result<i64, StoreError> {
        let now = now_ms();
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute(
            "
            INSERT INTO pages (
              statusid, label, archive, location, url, wpt_id,
              load_time_ms, ttfb_ms, bytes_total, req_total, created_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ",
            params![
                item_id,
                run.label,
                run.archive,
                run.location,
                page.url,
                page.wpt_id,
                page.load_time_ms,
                page.ttfb_ms,
                page.bytes_total,
                page.req_total,
                now
            ],
        )?;
        let page_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO requests (pageid, url, status_code, bytes, content_type) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for request in &page.requests {
                stmt.execute(params![
                    page_id,
                    request.url,
                    request.status_code,
                    request.bytes,
                    request.content_type
                ])?;
            }
        }
        tx.execute(
            "UPDATE status SET status = ?2, result_json = NULL, updated_at_ms = ?3 WHERE statusid = ?1",
            params![item_id, ItemStatus::Done.as_str(), now],
        )?;
        tx.commit()?;
        Ok(page_id)
    }

    pub async fn pages_in_range(
        &self,
        min_page_id: i64,
        max_page_id: i64,
    ) -> Result<Vec<PageRecord>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "
            SELECT pageid, url, wpt_id, load_time_ms, ttfb_ms, bytes_total, req_total
            FROM pages
            WHERE pageid >= ?1 AND pageid <= ?2
            ORDER BY pageid
            ",
        )?;
        let rows = stmt.query_map(params![min_page_id, max_page_id], |row| {
            Ok(PageRecord {
                page_id: row.get(0)?,
                url: row.get(1)?,
                wpt_id: row.get(2)?,
                load_time_ms: get_unsigned(row, 3)?,
                ttfb_ms: get_unsigned(row, 4)?,
                bytes_total: get_unsigned(row, 5)?,
                req_total: get_unsigned(row, 6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn write_stats(&self, run: &RunKey, stats: &RunStats) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.execute(
            "
            INSERT INTO stats (
              label, archive, location, num_pages, avg_load_time_ms, avg_bytes_total,
              avg_req_total, computed_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(label, archive, location) DO UPDATE SET
              num_pages=excluded.num_pages,
              avg_load_time_ms=excluded.avg_load_time_ms,
              avg_bytes_total=excluded.avg_bytes_total,
              avg_req_total=excluded.avg_req_total,
              computed_at_ms=excluded.computed_at_ms
            ",
            params![
                run.label,
                run.archive,
                run.location,
                stats.num_pages,
                stats.avg_load_time_ms,
                stats.avg_bytes_total,
                stats.avg_req_total,
                now_ms()
            ],
        )?;
        Ok(())
    }

    pub async fn fetch_stats(&self, run: &RunKey) -> Result<Option<RunStats>, StoreError> {
        let db = self.db.lock().await;
        let stats = db
            .query_row(
                "
                SELECT num_pages, avg_load_time_ms, avg_bytes_total, avg_req_total
                FROM stats WHERE label = ?1 AND archive = ?2 AND location = ?3
                ",
                params![run.label, run.archive, run.location],
                |row| {
                    Ok(RunStats {
                        num_pages: get_unsigned(row, 0)?,
                        avg_load_time_ms: row.get(1)?,
                        avg_bytes_total: row.get(2)?,
                        avg_req_total: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(stats)
    }
}

#[async_trait]
impl CrawlStore for SqliteStore {
    async fn active_run_label(
        &self,
        archive: &str,
        location: &str,
    ) -> Result<Option<String>, StoreError> {
        let db = self.db.lock().await;
        let label = db
            .query_row(
                "
                SELECT c.label FROM crawls c
                WHERE c.archive = ?1 AND c.location = ?2
                  AND EXISTS(
                    SELECT 1 FROM status s
                    WHERE s.label = c.label AND s.archive = c.archive AND s.location = c.location
                  )
                ORDER BY c.started_at_ms DESC, c.rowid DESC
                LIMIT 1
                ",
                params![archive, location],
                |row| row.get(0),
            )
            .optional()?;
        Ok(label)
    }

    async fn current_pass(&self, run: &RunKey) -> Result<u32, StoreError> {
        let db = self.db.lock().await;
        let passes: Option<u32> = db
            .query_row(
                "SELECT passes FROM crawls WHERE label = ?1 AND archive = ?2 AND location = ?3",
                params![run.label, run.archive, run.location],
                |row| get_unsigned(row, 0),
            )
            .optional()?;
        passes.ok_or_else(|| StoreError::RunNotFound(run.clone()))
    }

    async fn set_pass_count(&self, run: &RunKey, passes: u32) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE crawls SET passes = ?4 WHERE label = ?1 AND archive = ?2 AND location = ?3",
            params![run.label, run.archive, run.location, passes],
        )?;
        ensure_changed(changed, run)
    }

    async fn outstanding_count(&self, run: &RunKey) -> Result<u64, StoreError> {
        let db = self.db.lock().await;
        let count = db.query_row(
            "
            SELECT COUNT(*) FROM status
            WHERE label = ?1 AND archive = ?2 AND location = ?3 AND status NOT IN (?4, ?5)
            ",
            params![
                run.label,
                run.archive,
                run.location,
                ItemStatus::Done.as_str(),
                ItemStatus::Failed.as_str()
            ],
            |row| get_unsigned(row, 0),
        )?;
        Ok(count)
    }

    async fn advance_pass(
        &self,
        run: &RunKey,
        next_pass: u32,
        max_item_attempts: Option<u32>,
    ) -> Result<u64, StoreError> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let changed = tx.execute(
            "UPDATE crawls SET passes = ?4 WHERE label = ?1 AND archive = ?2 AND location = ?3",
            params![run.label, run.archive, run.location, next_pass],
        )?;
        ensure_changed(changed, run)?;

        let requeued = tx.execute(
            "
            UPDATE status
            SET status = ?4, attempts = attempts + 1, wpt_id = NULL, error = NULL,
                result_json = NULL, updated_at_ms = ?6
            WHERE label = ?1 AND archive = ?2 AND location = ?3 AND status = ?5
              AND (?7 IS NULL OR attempts < ?7)
            ",
            params![
                run.label,
                run.archive,
                run.location,
                ItemStatus::Queued.as_str(),
                ItemStatus::Failed.as_str(),
                now_ms(),
                max_item_attempts
            ],
        )?;
        tx.commit()?;
        Ok(requeued as u64)
    }

    async fn aggregate_range(&self, run: &RunKey) -> Result<AggregateRange, StoreError> {
        let db = self.db.lock().await;
        let (min_page_id, max_page_id): (Option<i64>, Option<i64>) = db.query_row(
            "SELECT MIN(pageid), MAX(pageid) FROM pages WHERE label = ?1 AND archive = ?2 AND location = ?3",
            params![run.label, run.archive, run.location],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let (num_pages, num_requests) = match (min_page_id, max_page_id) {
            (Some(min), Some(max)) => {
                let pages = db.query_row(
                    "SELECT COUNT(*) FROM pages WHERE pageid >= ?1 AND pageid <= ?2",
                    params![min, max],
                    |row| get_unsigned(row, 0),
                )?;
                let requests = db.query_row(
                    "SELECT COUNT(*) FROM requests WHERE pageid >= ?1 AND pageid <= ?2",
                    params![min, max],
                    |row| get_unsigned(row, 0),
                )?;
                (pages, requests)
            }
            _ => (0, 0),
        };

        let num_errors = db.query_row(
            "
            SELECT COUNT(*) FROM status
            WHERE label = ?1 AND archive = ?2 AND location = ?3 AND status = ?4
            ",
            params![run.label, run.archive, run.location, ItemStatus::Failed.as_str()],
            |row| get_unsigned(row, 0),
        )?;

        Ok(AggregateRange {
            min_page_id,
            max_page_id,
            num_pages,
            num_requests,
            num_errors,
        })
    }

    async fn finalize_run(
        &self,
        run: &RunKey,
        aggregate: &AggregateRange,
    ) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "
            UPDATE crawls
            SET min_pageid = ?4, max_pageid = ?5, num_pages = ?6, num_requests = ?7, num_errors = ?8
            WHERE label = ?1 AND archive = ?2 AND location = ?3
            ",
            params![
                run.label,
                run.archive,
                run.location,
                aggregate.min_page_id,
                aggregate.max_page_id,
                aggregate.num_pages,
                aggregate.num_requests,
                aggregate.num_errors
            ],
        )?;
        ensure_changed(changed, run)
    }

    async fn set_finish_time(&self, run: &RunKey, finished_at_ms: u64) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE crawls SET finished_at_ms = ?4 WHERE label = ?1 AND archive = ?2 AND location = ?3",
            params![run.label, run.archive, run.location, finished_at_ms],
        )?;
        ensure_changed(changed, run)
    }

    async fn status_summary(&self, run: &RunKey) -> Result<StatusSummary, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "
            SELECT status, COUNT(*) FROM status
            WHERE label = ?1 AND archive = ?2 AND location = ?3
            GROUP BY status
            ",
        )?;
        let rows = stmt.query_map(params![run.label, run.archive, run.location], |row| {
            Ok((row.get::<_, String>(0)?, get_unsigned::<u64>(row, 1)?))
        })?;

        let mut counts = Vec::new();
        for row in rows {
            let (raw, count) = row?;
            let status = ItemStatus::parse(&raw).ok_or(StoreError::InvalidStatus(raw))?;
            counts.push((status, count));
        }
        Ok(StatusSummary { counts })
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS crawls (
          label TEXT NOT NULL,
          archive TEXT NOT NULL,
          location TEXT NOT NULL,
          passes INTEGER NOT NULL DEFAULT 0,
          min_pageid INTEGER,
          max_pageid INTEGER,
          num_pages INTEGER NOT NULL DEFAULT 0,
          num_requests INTEGER NOT NULL DEFAULT 0,
          num_errors INTEGER NOT NULL DEFAULT 0,
          started_at_ms INTEGER NOT NULL,
          finished_at_ms INTEGER,
          PRIMARY KEY (label, archive, location)
        );

        CREATE TABLE IF NOT EXISTS status (
          statusid INTEGER PRIMARY KEY AUTOINCREMENT,
          label TEXT NOT NULL,
          archive TEXT NOT NULL,
          location TEXT NOT NULL,
          url TEXT NOT NULL,
          wpt_id TEXT,
          status TEXT NOT NULL,
          attempts INTEGER NOT NULL DEFAULT 1,
          error TEXT,
          result_json TEXT,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS status_by_run
          ON status (label, archive, location, status);

        CREATE TABLE IF NOT EXISTS pages (
          pageid INTEGER PRIMARY KEY AUTOINCREMENT,
          statusid INTEGER NOT NULL,
          label TEXT NOT NULL,
          archive TEXT NOT NULL,
          location TEXT NOT NULL,
          url TEXT NOT NULL,
          wpt_id TEXT,
          load_time_ms INTEGER NOT NULL,
          ttfb_ms INTEGER NOT NULL,
          bytes_total INTEGER NOT NULL,
          req_total INTEGER NOT NULL,
          created_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS pages_by_run ON pages (label, archive, location);

        CREATE TABLE IF NOT EXISTS requests (
          requestid INTEGER PRIMARY KEY AUTOINCREMENT,
          pageid INTEGER NOT NULL,
          url TEXT NOT NULL,
          status_code INTEGER NOT NULL,
          bytes INTEGER NOT NULL,
          content_type TEXT,
          FOREIGN KEY(pageid) REFERENCES pages(pageid)
        );

        CREATE INDEX IF NOT EXISTS requests_by_page ON requests (pageid);

        CREATE TABLE IF NOT EXISTS stats (
          label TEXT NOT NULL,
          archive TEXT NOT NULL,
          location TEXT NOT NULL,
          num_pages INTEGER NOT NULL,
          avg_load_time_ms REAL NOT NULL,
          avg_bytes_total REAL NOT NULL,
          avg_req_total REAL NOT NULL,
          computed_at_ms INTEGER NOT NULL,
          PRIMARY KEY (label, archive, location)
        );
        ",
    )?;
    Ok(())
}

fn ensure_changed(changed: usize, run: &RunKey) -> Result<(), StoreError> {
    if changed == 0 {
        return Err(StoreError::RunNotFound(run.clone()));
    }
    Ok(())
}

struct RawItem {
    id: i64,
    url: String,
    wpt_id: Option<String>,
    status: String,
    attempts: u32,
    error: Option<String>,
    result_json: Option<String>,
}

impl RawItem {
    fn into_item(self) -> Result<StatusItem, StoreError> {
        let status =
            ItemStatus::parse(&self.status).ok_or(StoreError::InvalidStatus(self.status))?;
        Ok(StatusItem {
            id: self.id,
            url: self.url,
            wpt_id: self.wpt_id,
            status,
            attempts: self.attempts,
            error: self.error,
            result_json: self.result_json,
        })
    }
}

/// Reads an integer column that must be non-negative and fit `T`. Anything
/// else means the row is corrupt, and is reported rather than wrapped.
fn get_unsigned<T: TryFrom<i64>>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let value: i64 = row.get(idx)?;
    T::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn get_optional_unsigned<T: TryFrom<i64>>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|value| {
            T::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
        })
        .transpose()
}

fn map_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawItem> {
    Ok(RawItem {
        id: row.get(0)?,
        url: row.get(1)?,
        wpt_id: row.get(2)?,
        status: row.get(3)?,
        attempts: get_unsigned(row, 4)?,
        error: row.get(5)?,
        result_json: row.get(6)?,
    })
}

fn collect_items(
    rows: impl Iterator<Item = rusqlite::Result<RawItem>>,
) -> Result<Vec<StatusItem>, StoreError> {
    rows.map(|row| row?.into_item()).collect()
}
