use std::collections::VecDeque;

use agent_protocol::{DriverError, InputDriver, Record, driver::parse_config};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::elasticsearch::EsClient;

pub const NAME: &str = "elasticsearch";

#[derive(Debug, Deserialize)]
struct EsInputConfig {
    host: String,
    #[serde(alias = "quries", default)]
    queries: Vec<QueryConfig>,
}

#[derive(Debug, Deserialize)]
struct QueryConfig {
    index: String,
    /// JSON text, or a mapping written inline in the YAML config.
    body: Value,
}

#[derive(Debug, Clone)]
struct Query {
    index: String,
    body: Value,
}

/// Runs a fixed list of searches once, in order, and emits the `_source` of
/// every hit. Exhausted after the last query.
pub struct ElasticsearchInput {
    client: EsClient,
    queries: VecDeque<Query>,
    hits: VecDeque<Record>,
}

impl ElasticsearchInput {
    pub fn from_config(config: &Value) -> Result<Self, DriverError> {
        let cfg: EsInputConfig = parse_config(NAME, config)?;
        let client = EsClient::new(NAME, &cfg.host)?;
        let queries = cfg
            .queries
            .into_iter()
            .map(|q| {
                let body = match q.body {
                    Value::String(text) => serde_json::from_str(&text).map_err(|e| {
                        DriverError::invalid(NAME, format!("query body for `{}` is not valid JSON: {e}", q.index))
                    })?,
                    Value::Object(map) => Value::Object(map),
                    other => {
                        return Err(DriverError::invalid(
                            NAME,
                            format!("query body for `{}` must be JSON text or a mapping, got {other}", q.index),
                        ));
                    }
                };
                Ok(Query { index: q.index, body })
            })
            .collect::<Result<VecDeque<_>, DriverError>>()?;
        Ok(Self {
            client,
            queries,
            hits: VecDeque::new(),
        })
    }
}

#[async_trait]
impl InputDriver for ElasticsearchInput {
    fn name(&self) -> &str {
        NAME
    }

    async fn start(&mut self) -> Result<(), DriverError> {
        self.client.info().await
    }

    async fn emit(&mut self) -> Result<Option<Record>, DriverError> {
        loop {
            if let Some(hit) = self.hits.pop_front() {
                return Ok(Some(hit));
            }
            let Some(query) = self.queries.front().cloned() else {
                return Ok(None);
            };
            // a failed query stays queued and is retried on the next emit
            let hits = self.client.search(&query.index, &query.body).await?;
            self.queries.pop_front();
            debug!(driver = NAME, index = %query.index, hits = hits.len(), "query done");
            self.hits.extend(hits);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    #[test]
    fn rejects_invalid_query_json() {
        let cfg = json!({"type": "elasticsearch", "host": "localhost:9200",
            "quries": [{"index": "logs", "body": "{not json"}]});
        assert!(matches!(
            ElasticsearchInput::from_config(&cfg),
            Err(DriverError::InvalidConfig { .. })
        ));
        assert!(ElasticsearchInput::from_config(&json!({"type": "elasticsearch"})).is_err());
    }

    #[tokio::test]
    async fn emits_hits_of_each_query_in_order() {
        let mut server = mockito::Server::new_async().await;
        let info = server
            .mock("GET", "/")
            .with_status(200)
            .with_body(r#"{"cluster_name":"test","version":{"number":"8.11.0"}}"#)
            .create_async()
            .await;
        let first = server
            .mock("POST", "/logs/_search")
            .match_query(Matcher::UrlEncoded("track_total_hits".into(), "true".into()))
            .match_body(Matcher::Json(json!({"query": {"match_all": {}}})))
            .with_status(200)
            .with_body(
                r#"{"took":3,"hits":{"total":{"value":2},"hits":[
                    {"_id":"1","_source":{"message":"a"}},
                    {"_id":"2","_source":{"message":"b"}}]}}"#,
            )
            .create_async()
            .await;
        let second = server
            .mock("POST", "/audit/_search")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"took":1,"hits":{"hits":[{"_id":"9","_source":{"message":"c"}}]}}"#)
            .create_async()
            .await;

        let mut input = ElasticsearchInput::from_config(&json!({
            "type": "elasticsearch",
            "host": server.url(),
            "queries": [
                {"index": "logs", "body": "{\"query\": {\"match_all\": {}}}"},
                {"index": "audit", "body": {"query": {"term": {"kind": "login"}}}}
            ]
        }))
        .unwrap();

        input.start().await.unwrap();
        let mut got = Vec::new();
        while let Some(r) = input.emit().await.unwrap() {
            got.push(r["message"].clone());
        }
        assert_eq!(got, vec![json!("a"), json!("b"), json!("c")]);

        info.assert_async().await;
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn search_error_is_reported_and_retried() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/logs/_search")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body(r#"{"error":{"type":"boom","reason":"nope"}}"#)
            .expect(1)
            .create_async()
            .await;

        let mut input = ElasticsearchInput::from_config(&json!({
            "type": "elasticsearch",
            "host": server.url(),
            "queries": [{"index": "logs", "body": "{}"}]
        }))
        .unwrap();
        assert!(matches!(input.emit().await, Err(DriverError::Backend { .. })));
        failing.assert_async().await;
        failing.remove_async().await;

        let _recovered = server
            .mock("POST", "/logs/_search")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"hits":{"hits":[{"_source":{"message":"late"}}]}}"#)
            .create_async()
            .await;
        assert_eq!(input.emit().await.unwrap().unwrap()["message"], json!("late"));
        assert!(input.emit().await.unwrap().is_none());
    }
}
