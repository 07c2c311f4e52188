mod lock;
mod pass;

pub use lock::{Acquire, LockError, LockManager, PASS_LOCK, TaskLock};
pub use pass::PassState;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TickId(pub Uuid);

impl TickId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TickId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TickId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of one crawl execution, passed to every store and task call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub label: String,
    pub archive: String,
    pub location: String,
}

impl RunKey {
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        archive: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self { label: label.into(), archive: archive.into(), location: location.into() }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.archive, self.label, self.location)
    }
}

/// Range and counts frozen onto a crawl record when its last pass completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRange {
    pub min_page_id: Option<i64>,
    pub max_page_id: Option<i64>,
    pub num_pages: u64,
    pub num_requests: u64,
    pub num_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlRun {
    pub key: RunKey,
    pub passes: u32,
    pub aggregate: AggregateRange,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
}

impl CrawlRun {
    #[must_use]
    pub fn new(key: RunKey) -> Self {
        Self {
            key,
            passes: 0,
            aggregate: AggregateRange::default(),
            started_at_ms: now_ms(),
            finished_at_ms: None,
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished_at_ms.is_some()
    }
}

/// Lifecycle of a single URL within a crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    Submitted,
    Completed,
    Obtained,
    Done,
    Failed,
}

impl ItemStatus {
    pub const ALL: [Self; 6] = [
        Self::Queued,
        Self::Submitted,
        Self::Completed,
        Self::Obtained,
        Self::Done,
        Self::Failed,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Submitted => "submitted",
            Self::Completed => "completed",
            Self::Obtained => "obtained",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == raw)
    }

    /// Items neither parsed nor failed still hold the current pass open.
    #[must_use]
    pub fn is_outstanding(self) -> bool {
        !matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named unit of work dispatched per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Submit,
    Status,
    Obtain,
    /// Parse shard, numbered from 1 as in configuration.
    Parse(u32),
}

impl TaskKind {
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Submit => "submit".to_string(),
            Self::Status => "status".to_string(),
            Self::Obtain => "obtain".to_string(),
            Self::Parse(n) => format!("parse{n}"),
        }
    }

    /// Zero-based shard handled by a parse task, `None` for the other tasks.
    #[must_use]
    pub fn shard(&self, total: u32) -> Option<ShardSpec> {
        match self {
            Self::Parse(n) => ShardSpec::from_one_based(total, *n),
            _ => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// The fixed task catalog: submit, status, obtain, then `parse1..=parseN`.
#[must_use]
pub fn task_catalog(parse_shards: u32) -> Vec<TaskKind> {
    let mut tasks = vec![TaskKind::Submit, TaskKind::Status, TaskKind::Obtain];
    tasks.extend((1..=parse_shards).map(TaskKind::Parse));
    tasks
}

/// A slice of pending work owned by one parse task. Items are assigned by
/// `id mod total`, so every id belongs to exactly one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardSpec {
    pub total: u32,
    pub index: u32,
}

impl ShardSpec {
    #[must_use]
    pub fn from_one_based(total: u32, number: u32) -> Option<Self> {
        (1..=total).contains(&number).then(|| Self { total, index: number - 1 })
    }

    #[must_use]
    pub fn owns(&self, item_id: i64) -> bool {
        item_id.rem_euclid(i64::from(self.total)) == i64::from(self.index)
    }
}

impl fmt::Display for ShardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index + 1, self.total)
    }
}

#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_id_is_unique() {
        assert_ne!(TickId::new(), TickId::new());
    }

    #[test]
    fn catalog_lists_fixed_tasks_then_parse_shards() {
        let names: Vec<String> = task_catalog(3).iter().map(TaskKind::name).collect();
        assert_eq!(names, ["submit", "status", "obtain", "parse1", "parse2", "parse3"]);
    }

    #[test]
    fn parse_task_maps_to_zero_based_shard() {
        assert_eq!(TaskKind::Parse(1).shard(4), Some(ShardSpec { total: 4, index: 0 }));
        assert_eq!(TaskKind::Parse(4).shard(4), Some(ShardSpec { total: 4, index: 3 }));
        assert_eq!(TaskKind::Parse(5).shard(4), None);
        assert_eq!(TaskKind::Parse(0).shard(4), None);
        assert_eq!(TaskKind::Submit.shard(4), None);
    }

    #[test]
    fn shards_partition_item_ids() {
        let total = 4;
        let shards: Vec<ShardSpec> = task_catalog(total)
            .iter()
            .filter_map(|task| task.shard(total))
            .collect();
        assert_eq!(shards.len(), total as usize);

        for id in -20..200_i64 {
            let owners = shards.iter().filter(|shard| shard.owns(id)).count();
            assert_eq!(owners, 1, "item {id} owned by {owners} shards");
        }
    }

    #[test]
    fn item_status_round_trips_through_text() {
        for status in ItemStatus::ALL {
            assert_eq!(ItemStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ItemStatus::parse("bogus"), None);
        assert!(ItemStatus::Obtained.is_outstanding());
        assert!(!ItemStatus::Failed.is_outstanding());
    }
}
