pub mod config;
pub mod dispatch;
pub mod error;
pub mod finalize;
pub mod store;
pub mod tasks;
pub mod tick;
pub mod wpt;

/// URLs to enqueue from a list file: one per line, blank lines and `#`
/// comments ignored.
#[must_use]
pub fn parse_url_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
