use agent_protocol::{DriverError, OutputDriver, Record, driver::parse_config};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::trace;

use crate::elasticsearch::EsClient;

pub const NAME: &str = "elasticsearch";

#[derive(Debug, Deserialize)]
struct EsOutputConfig {
    host: String,
    index: String,
}

/// Indexes every record as a new document.
pub struct ElasticsearchOutput {
    client: EsClient,
    index: String,
}

impl ElasticsearchOutput {
    pub fn from_config(config: &Value) -> Result<Self, DriverError> {
        let cfg: EsOutputConfig = parse_config(NAME, config)?;
        if cfg.index.trim().is_empty() {
            return Err(DriverError::invalid(NAME, "`index` must not be empty"));
        }
        Ok(Self {
            client: EsClient::new(NAME, &cfg.host)?,
            index: cfg.index,
        })
    }
}

#[async_trait]
impl OutputDriver for ElasticsearchOutput {
    fn name(&self) -> &str {
        NAME
    }

    async fn start(&mut self) -> Result<(), DriverError> {
        self.client.info().await
    }

    async fn send(&mut self, record: Record) -> Result<(), DriverError> {
        self.client.index(&self.index, &record).await?;
        trace!(driver = NAME, index = %self.index, "record indexed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn requires_host_and_index() {
        assert!(ElasticsearchOutput::from_config(&json!({"type": "elasticsearch", "host": "h"})).is_err());
        assert!(ElasticsearchOutput::from_config(&json!({"type": "elasticsearch", "index": "i"})).is_err());
        assert!(
            ElasticsearchOutput::from_config(&json!({"type": "elasticsearch", "host": "h", "index": " "})).is_err()
        );
    }

    #[tokio::test]
    async fn indexes_each_record_with_refresh() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/logs/_doc")
            .match_query(Matcher::UrlEncoded("refresh".into(), "true".into()))
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({"message": "a\n"})))
            .with_status(201)
            .with_body(r#"{"result":"created","_version":1}"#)
            .create_async()
            .await;

        let mut out = ElasticsearchOutput::from_config(&json!({
            "type": "elasticsearch", "host": server.url(), "index": "logs"
        }))
        .unwrap();
        out.send(rec(json!({"message": "a\n"}))).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_document_is_a_per_record_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/logs/_doc")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"error":{"type":"mapper_parsing_exception"}}"#)
            .create_async()
            .await;

        let mut out = ElasticsearchOutput::from_config(&json!({
            "type": "elasticsearch", "host": server.url(), "index": "logs"
        }))
        .unwrap();
        match out.send(rec(json!({"message": 1}))).await {
            Err(DriverError::Backend { message, .. }) => assert!(message.contains("mapper_parsing_exception")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
