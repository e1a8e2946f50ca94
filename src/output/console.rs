use agent_protocol::{DriverError, OutputDriver, Record, driver::parse_config};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub const NAME: &str = "console";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
    /// Only the `message` field, as-is.
    Message,
}

#[derive(Debug, Deserialize)]
struct ConsoleConfig {
    #[serde(default)]
    format: Format,
}

/// Prints every record to stdout.
pub struct ConsoleOutput {
    format: Format,
    out: Box<dyn AsyncWrite + Send + Unpin>,
}

impl ConsoleOutput {
    pub fn from_config(config: &Value) -> Result<Self, DriverError> {
        let cfg: ConsoleConfig = parse_config(NAME, config)?;
        Ok(Self {
            format: cfg.format,
            out: Box::new(tokio::io::stdout()),
        })
    }

    pub fn with_writer<W>(mut self, out: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.out = Box::new(out);
        self
    }

    fn render(&self, record: &Record) -> Result<String, DriverError> {
        match self.format {
            Format::Json => {
                let mut line = serde_json::to_string(record).map_err(|e| DriverError::backend(NAME, e))?;
                line.push('\n');
                Ok(line)
            }
            Format::Message => {
                let mut line = match record.get("message") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                if !line.ends_with('\n') {
                    line.push('\n');
                }
                Ok(line)
            }
        }
    }
}

#[async_trait]
impl OutputDriver for ConsoleOutput {
    fn name(&self) -> &str {
        NAME
    }

    async fn send(&mut self, record: Record) -> Result<(), DriverError> {
        let line = self.render(&record)?;
        self.out.write_all(line.as_bytes()).await?;
        self.out.flush().await?;
        Ok(())
    }

    async fn stop(&mut self) {
        let _ = self.out.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn prints_json_lines() {
        let (w, mut r) = tokio::io::duplex(256);
        let mut out = ConsoleOutput::from_config(&json!({"type": "console"})).unwrap().with_writer(w);
        out.send(rec(json!({"message": "a\n"}))).await.unwrap();
        drop(out);

        let mut text = String::new();
        r.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "{\"message\":\"a\\n\"}\n");
    }

    #[tokio::test]
    async fn message_format_keeps_single_newline() {
        let (w, mut r) = tokio::io::duplex(256);
        let mut out = ConsoleOutput::from_config(&json!({"type": "console", "format": "message"}))
            .unwrap()
            .with_writer(w);
        out.send(rec(json!({"message": "a\n"}))).await.unwrap();
        out.send(rec(json!({"message": "b"}))).await.unwrap();
        drop(out);

        let mut text = String::new();
        r.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "a\nb\n");
    }

    #[test]
    fn rejects_unknown_format() {
        assert!(ConsoleOutput::from_config(&json!({"type": "console", "format": "xml"})).is_err());
    }
}
