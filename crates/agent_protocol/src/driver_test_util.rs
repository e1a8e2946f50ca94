//! In-memory drivers for tests. Enabled with the `test-utils` feature.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Notify;

use crate::driver::{DriverError, InputDriver, OutputDriver, Record, parse_config};

pub const STATIC_INPUT: &str = "static";
pub const COLLECTING_OUTPUT: &str = "collect";

#[derive(Debug, Deserialize)]
struct StaticInputConfig {
    #[serde(default)]
    records: Vec<Record>,
}

/// Emits the `records` listed in its config, then reports exhaustion.
pub struct StaticInput {
    pending: VecDeque<Record>,
}

impl StaticInput {
    pub fn new(records: impl IntoIterator<Item = Record>) -> Self {
        Self {
            pending: records.into_iter().collect(),
        }
    }

    pub fn from_config(config: &Value) -> Result<Self, DriverError> {
        let cfg: StaticInputConfig = parse_config(STATIC_INPUT, config)?;
        Ok(Self::new(cfg.records))
    }
}

#[async_trait]
impl InputDriver for StaticInput {
    fn name(&self) -> &str {
        STATIC_INPUT
    }

    async fn emit(&mut self) -> Result<Option<Record>, DriverError> {
        Ok(self.pending.pop_front())
    }
}

/// Shared view of everything a [`CollectingOutput`] received.
#[derive(Clone, Default)]
pub struct Collected {
    records: Arc<Mutex<Vec<Record>>>,
    notify: Arc<Notify>,
}

impl Collected {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `n` records arrived. Returns what was collected,
    /// even if the deadline passed first.
    pub async fn wait_for(&self, n: usize, deadline: Duration) -> Vec<Record> {
        let _ = tokio::time::timeout(deadline, async {
            loop {
                let notified = self.notify.notified();
                if self.len() >= n {
                    break;
                }
                notified.await;
            }
        })
        .await;
        self.records()
    }

    fn push(&self, record: Record) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
        self.notify.notify_waiters();
    }
}

/// Output driver that appends every record to a [`Collected`] handle.
pub struct CollectingOutput {
    sink: Collected,
    fail_on: Option<String>,
}

impl CollectingOutput {
    pub fn new(sink: Collected) -> Self {
        Self { sink, fail_on: None }
    }

    /// Reject records whose `message` equals `value`, to exercise per-record
    /// failures.
    pub fn failing_on(mut self, value: impl Into<String>) -> Self {
        self.fail_on = Some(value.into());
        self
    }
}

#[async_trait]
impl OutputDriver for CollectingOutput {
    fn name(&self) -> &str {
        COLLECTING_OUTPUT
    }

    async fn send(&mut self, record: Record) -> Result<(), DriverError> {
        if let Some(bad) = &self.fail_on {
            if record.get("message").and_then(Value::as_str) == Some(bad.as_str()) {
                return Err(DriverError::backend(COLLECTING_OUTPUT, "rejected record"));
            }
        }
        self.sink.push(record);
        Ok(())
    }
}

/// Build a `{"message": text}` record.
pub fn message(text: &str) -> Record {
    let mut record = Record::new();
    record.insert("message".into(), Value::String(text.to_string()));
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn static_input_drains_then_exhausts() {
        let mut input =
            StaticInput::from_config(&json!({"type": "static", "records": [{"message": "a"}]}))
                .unwrap();
        assert_eq!(input.emit().await.unwrap(), Some(message("a")));
        assert_eq!(input.emit().await.unwrap(), None);
    }

    #[tokio::test]
    async fn collecting_output_wakes_waiters() {
        let sink = Collected::new();
        let mut out = CollectingOutput::new(sink.clone()).failing_on("bad");

        let waiter = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.wait_for(2, Duration::from_secs(2)).await })
        };
        out.send(message("one")).await.unwrap();
        assert!(out.send(message("bad")).await.is_err());
        out.send(message("two")).await.unwrap();

        let got = waiter.await.unwrap();
        assert_eq!(got, vec![message("one"), message("two")]);
    }
}
