use anyhow::{Context, Result};
use async_trait::async_trait;
use crawlbatch_protocol::{Envelope, Submission, TestStatus};
use reqwest::Client;

use crate::config::WptSettings;

/// The WebPagetest calls the crawl tasks make. Errors are per call: a
/// failing test id says nothing about the next one.
#[async_trait]
pub trait WptApi: Send + Sync {
    async fn submit(&self, url: &str) -> Result<Envelope<Submission>>;
    async fn test_status(&self, test_id: &str) -> Result<Envelope<TestStatus>>;
    /// Raw result document; parsing is left to the fill step.
    async fn fetch_result(&self, test_id: &str) -> Result<String>;
}

/// Thin client for the WebPagetest JSON endpoints the crawl tasks use.
#[derive(Debug, Clone)]
pub struct WptClient {
    http: Client,
    server: String,
    location: String,
    api_key: Option<String>,
    runs: u32,
}

impl WptClient {
    pub fn new(settings: &WptSettings, location: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            server: settings.server.trim_end_matches('/').to_string(),
            location: location.to_string(),
            api_key: settings.api_key.clone(),
            runs: settings.runs,
        })
    }

    fn endpoint(&self, page: &str) -> String {
        format!("{}/{}", self.server, page)
    }
}

#[async_trait]
impl WptApi for WptClient {
    async fn submit(&self, url: &str) -> Result<Envelope<Submission>> {
        let runs = self.runs.to_string();
        let mut query = vec![
            ("url", url),
            ("f", "json"),
            ("location", self.location.as_str()),
            ("runs", runs.as_str()),
            ("fvonly", "1"),
        ];
        if let Some(key) = &self.api_key {
            query.push(("k", key.as_str()));
        }

        let envelope = self
            .http
            .get(self.endpoint("runtest.php"))
            .query(&query)
            .send()
            .await
            .with_context(|| format!("submit {url}"))?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("decode submission for {url}"))?;
        Ok(envelope)
    }

    async fn test_status(&self, test_id: &str) -> Result<Envelope<TestStatus>> {
        let envelope = self
            .http
            .get(self.endpoint("testStatus.php"))
            .query(&[("f", "json"), ("test", test_id)])
            .send()
            .await
            .with_context(|| format!("status of {test_id}"))?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("decode status of {test_id}"))?;
        Ok(envelope)
    }

    async fn fetch_result(&self, test_id: &str) -> Result<String> {
        let body = self
            .http
            .get(self.endpoint("jsonResult.php"))
            .query(&[("test", test_id), ("requests", "1")])
            .send()
            .await
            .with_context(|| format!("result of {test_id}"))?
            .error_for_status()?
            .text()
            .await
            .with_context(|| format!("read result of {test_id}"))?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_join_without_double_slash() {
        let settings =
            WptSettings { server: "https://wpt.example.org/".to_string(), ..Default::default() };
        let client = WptClient::new(&settings, "IE8").expect("client");
        assert_eq!(client.endpoint("runtest.php"), "https://wpt.example.org/runtest.php");
    }
}
