//! Minimal Elasticsearch REST client shared by the search input and the index
//! output.
use std::time::Duration;

use agent_protocol::{DriverError, Record};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct EsClient {
    driver: &'static str,
    http: Client,
    base: String,
}

#[derive(Debug, Deserialize)]
struct ClusterInfo {
    #[serde(default)]
    cluster_name: Option<String>,
    #[serde(default)]
    version: Option<Version>,
}

#[derive(Debug, Deserialize)]
struct Version {
    number: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    took: u64,
    hits: Hits,
}

#[derive(Debug, Deserialize)]
struct Hits {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_source", default)]
    source: Value,
}

impl EsClient {
    pub fn new(driver: &'static str, host: &str) -> Result<Self, DriverError> {
        let host = host.trim().trim_end_matches('/');
        if host.is_empty() {
            return Err(DriverError::invalid(driver, "`host` must not be empty"));
        }
        let base = if host.contains("://") {
            host.to_string()
        } else {
            format!("http://{host}")
        };
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DriverError::invalid(driver, e))?;
        Ok(Self { driver, http, base })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// `GET /`: fails when the cluster is unreachable or answers with an error.
    pub async fn info(&self) -> Result<(), DriverError> {
        let res = self
            .http
            .get(format!("{}/", self.base))
            .send()
            .await
            .map_err(|e| self.backend(e))?;
        let res = self.check(res).await?;
        let info: ClusterInfo = res.json().await.map_err(|e| self.backend(e))?;
        info!(
            driver = self.driver,
            host = %self.base,
            cluster = info.cluster_name.as_deref().unwrap_or("?"),
            version = info.version.as_ref().map(|v| v.number.as_str()).unwrap_or("?"),
            "connected to elasticsearch"
        );
        Ok(())
    }

    /// Runs one search and returns the `_source` of every hit.
    pub async fn search(&self, index: &str, body: &Value) -> Result<Vec<Record>, DriverError> {
        let res = self
            .http
            .post(format!("{}/{}/_search", self.base, index))
            .query(&[("track_total_hits", "true")])
            .json(body)
            .send()
            .await
            .map_err(|e| self.backend(e))?;
        let res = self.check(res).await?;
        let found: SearchResponse = res.json().await.map_err(|e| self.backend(e))?;
        debug!(driver = self.driver, index, hits = found.hits.hits.len(), took_ms = found.took, "search finished");
        Ok(found
            .hits
            .hits
            .into_iter()
            .filter_map(|hit| match hit.source {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }

    /// Indexes one document with an auto-generated id, refreshing the index.
    pub async fn index(&self, index: &str, doc: &Record) -> Result<(), DriverError> {
        let res = self
            .http
            .post(format!("{}/{}/_doc", self.base, index))
            .query(&[("refresh", "true")])
            .json(doc)
            .send()
            .await
            .map_err(|e| self.backend(e))?;
        self.check(res).await.map(drop)
    }

    async fn check(&self, res: Response) -> Result<Response, DriverError> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        Err(DriverError::backend(self.driver, format!("{status}: {body}")))
    }

    fn backend(&self, e: reqwest::Error) -> DriverError {
        DriverError::backend(self.driver, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_normalization() {
        let c = EsClient::new("t", "localhost:9200/").unwrap();
        assert_eq!(c.base_url(), "http://localhost:9200");
        let c = EsClient::new("t", "https://es.internal").unwrap();
        assert_eq!(c.base_url(), "https://es.internal");
        assert!(EsClient::new("t", "  ").is_err());
    }

    #[tokio::test]
    async fn info_reports_http_errors() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/")
            .with_status(503)
            .with_body("down")
            .create_async()
            .await;
        let c = EsClient::new("t", &server.url()).unwrap();
        match c.info().await {
            Err(DriverError::Backend { message, .. }) => assert!(message.contains("503")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
