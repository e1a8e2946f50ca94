// driver contract shared by the agent and every source/sink implementation
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

/// One log/event record as it travels from an input, through the pipeline,
/// to an output.
pub type Record = Map<String, Value>;

/// Key every driver sub-config uses to name its implementation.
pub const TYPE_FIELD: &str = "type";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("unknown driver `{0}`")]
    UnknownDriver(String),

    #[error("invalid config for driver `{driver}`: {reason}")]
    InvalidConfig { driver: String, reason: String },

    #[error("driver `{driver}` failed: {message}")]
    Backend { driver: String, message: String },

    #[error("driver io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    pub fn invalid(driver: impl Into<String>, reason: impl ToString) -> Self {
        DriverError::InvalidConfig {
            driver: driver.into(),
            reason: reason.to_string(),
        }
    }

    pub fn backend(driver: impl Into<String>, message: impl ToString) -> Self {
        DriverError::Backend {
            driver: driver.into(),
            message: message.to_string(),
        }
    }
}

/// A source of records.
///
/// `emit` may block for as long as it needs (waiting on a terminal, polling a
/// remote index, ...). The agent drops the pending `emit` future when it is
/// stopped, so implementations must not rely on it running to completion.
#[async_trait]
pub trait InputDriver: Send + 'static {
    fn name(&self) -> &str;

    /// Background setup before the first `emit`.
    async fn start(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Produce the next record. `Ok(None)` means the source is exhausted.
    async fn emit(&mut self) -> Result<Option<Record>, DriverError>;

    /// Release whatever `start` acquired.
    async fn stop(&mut self) {}
}

/// A sink for records. A failed `send` is reported for that record only; the
/// agent keeps feeding the driver.
#[async_trait]
pub trait OutputDriver: Send + 'static {
    fn name(&self) -> &str;

    async fn start(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn send(&mut self, record: Record) -> Result<(), DriverError>;

    async fn stop(&mut self) {}
}

/// One pipeline step. Returning `Ok(None)` filters the record out.
pub trait Transform: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn apply(&self, record: Record) -> Result<Option<Record>, DriverError>;
}

/// Read the `type` discriminator of a driver sub-config.
pub fn driver_type(config: &Value) -> Result<&str, DriverError> {
    match config.get(TYPE_FIELD) {
        Some(Value::String(name)) => Ok(name.as_str()),
        Some(other) => Err(DriverError::invalid(
            "<unknown>",
            format!("`{TYPE_FIELD}` must be a string, got {other}"),
        )),
        None => Err(DriverError::invalid(
            "<unknown>",
            format!("missing `{TYPE_FIELD}` field"),
        )),
    }
}

/// Deserialize a driver's typed settings out of its raw sub-config.
pub fn parse_config<T: DeserializeOwned>(driver: &str, config: &Value) -> Result<T, DriverError> {
    serde_json::from_value(config.clone()).map_err(|e| DriverError::invalid(driver, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn reads_type_field() {
        let cfg = json!({"type": "console", "prompt": ">"});
        assert_eq!(driver_type(&cfg).unwrap(), "console");
    }

    #[test]
    fn rejects_missing_or_non_string_type() {
        assert!(matches!(
            driver_type(&json!({"host": "x"})),
            Err(DriverError::InvalidConfig { .. })
        ));
        assert!(matches!(
            driver_type(&json!({"type": 3})),
            Err(DriverError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn parse_config_maps_serde_errors_to_invalid_config() {
        #[derive(Deserialize)]
        #[allow(dead_code)]
        struct Es {
            host: String,
        }

        let err = parse_config::<Es>("elasticsearch", &json!({"type": "elasticsearch"}))
            .err()
            .unwrap();
        match err {
            DriverError::InvalidConfig { driver, reason } => {
                assert_eq!(driver, "elasticsearch");
                assert!(reason.contains("host"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
