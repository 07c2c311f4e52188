//! JSON payloads returned by a WebPagetest server.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const STATUS_OK: u16 = 200;
/// Status codes at or above this mark a rejected or failed test.
pub const STATUS_ERROR_FLOOR: u16 = 400;

/// Every WebPagetest JSON endpoint wraps its payload in this envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(rename = "statusText", default)]
    pub status_text: String,
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status_code == STATUS_OK
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status_code >= STATUS_ERROR_FLOOR
    }
}

/// `runtest.php?f=json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    #[serde(rename = "testId")]
    pub test_id: String,
    #[serde(rename = "jsonUrl", default)]
    pub json_url: Option<String>,
}

/// `testStatus.php?f=json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestStatus {
    #[serde(rename = "testId", default)]
    pub test_id: Option<String>,
    #[serde(rename = "statusCode", default)]
    pub status_code: Option<u16>,
    #[serde(rename = "statusText", default)]
    pub status_text: Option<String>,
}

/// `jsonResult.php`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub runs: BTreeMap<String, RunResult>,
}

impl TestResult {
    /// First view of the lowest numbered run that has one.
    #[must_use]
    pub fn first_view(&self) -> Option<&ViewResult> {
        let mut runs: Vec<(u32, &RunResult)> = self
            .runs
            .iter()
            .filter_map(|(number, run)| number.parse::<u32>().ok().map(|n| (n, run)))
            .collect();
        runs.sort_by_key(|(number, _)| *number);
        runs.into_iter().find_map(|(_, run)| run.first_view.as_ref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(rename = "firstView", default)]
    pub first_view: Option<ViewResult>,
    #[serde(rename = "repeatView", default)]
    pub repeat_view: Option<ViewResult>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewResult {
    #[serde(rename = "URL", default)]
    pub url: Option<String>,
    #[serde(rename = "loadTime", default)]
    pub load_time_ms: u64,
    #[serde(rename = "TTFB", default)]
    pub ttfb_ms: u64,
    #[serde(rename = "bytesIn", default)]
    pub bytes_in: u64,
    #[serde(rename = "requestsFull", default)]
    pub requests_full: Option<u64>,
    #[serde(default)]
    pub requests: Vec<RequestResult>,
}

impl ViewResult {
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.requests_full.unwrap_or(self.requests.len() as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResult {
    #[serde(default)]
    pub full_url: String,
    #[serde(rename = "responseCode", default)]
    pub response_code: i64,
    #[serde(rename = "bytesIn", default)]
    pub bytes_in: u64,
    #[serde(rename = "contentType", default)]
    pub content_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_submission_envelope() {
        let raw = r#"{"statusCode":200,"statusText":"Ok","data":{"testId":"240101_AB_1","jsonUrl":"http://wpt/jsonResult.php?test=240101_AB_1"}}"#;
        let envelope: Envelope<Submission> = serde_json::from_str(raw).expect("parse");
        assert!(envelope.is_ok());
        assert_eq!(envelope.data.expect("data").test_id, "240101_AB_1");
    }

    #[test]
    fn rejected_submission_has_no_data() {
        let raw = r#"{"statusCode":400,"statusText":"Invalid URL"}"#;
        let envelope: Envelope<Submission> = serde_json::from_str(raw).expect("parse");
        assert!(envelope.is_error());
        assert!(envelope.data.is_none());
    }

    #[test]
    fn first_view_prefers_lowest_run_number() {
        let raw = r#"{
            "id": "240101_AB_1",
            "url": "http://example.com/",
            "runs": {
                "2": {"firstView": {"loadTime": 900, "TTFB": 90, "bytesIn": 10, "requests": []}},
                "1": {"firstView": {"loadTime": 1200, "TTFB": 150, "bytesIn": 5120, "requests": [
                    {"full_url": "http://example.com/", "responseCode": 200, "bytesIn": 4096, "contentType": "text/html"},
                    {"full_url": "http://example.com/a.js", "responseCode": 404, "bytesIn": 1024}
                ]}}
            }
        }"#;
        let result: TestResult = serde_json::from_str(raw).expect("parse");
        let view = result.first_view().expect("first view");
        assert_eq!(view.load_time_ms, 1200);
        assert_eq!(view.request_count(), 2);
        assert_eq!(view.requests[1].response_code, 404);
        assert_eq!(view.requests[1].content_type, None);
    }
}
