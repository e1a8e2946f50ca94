use std::{sync::Arc, time::Duration};

use agent_protocol::{InputDriver, Record};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc::Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Agent, AgentError, AgentState, DEFAULT_STOP_TIMEOUT, INPUT, TaskSlot};
use crate::{connector::Connector, registry::DriverRegistry};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

type Driver = Box<dyn InputDriver>;

#[derive(Default)]
struct Inner {
    connector: Option<Connector>,
    config: Option<Value>,
    driver: Option<Driver>,
    task: Option<TaskSlot<Driver>>,
}

/// Pulls records from its driver and pushes them onto the connector.
pub struct InputAgent {
    registry: Arc<DriverRegistry>,
    stop_timeout: Duration,
    retry_delay: Duration,
    inner: Mutex<Inner>,
}

impl InputAgent {
    pub fn new(registry: Arc<DriverRegistry>) -> Self {
        Self {
            registry,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Delay before retrying after the driver failed to start or emit.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    fn build(&self, config: &Value) -> Result<Driver, AgentError> {
        self.registry
            .build_input(config)
            .map_err(|e| AgentError::driver(INPUT, e))
    }
}

#[async_trait]
impl Agent for InputAgent {
    fn name(&self) -> &str {
        INPUT
    }

    async fn state(&self) -> AgentState {
        let inner = self.inner.lock().await;
        if inner.task.is_some() {
            AgentState::Running
        } else if inner.driver.is_some() {
            AgentState::Configured
        } else {
            AgentState::Unconfigured
        }
    }

    async fn set_connector(&self, connector: Connector) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        if let Some(bound) = &inner.connector {
            if bound.same_as(&connector) {
                return Ok(());
            }
            if inner.task.is_some() {
                return Err(AgentError::ConnectorMismatch(INPUT.into()));
            }
        }
        inner.connector = Some(connector);
        Ok(())
    }

    async fn validate_config(&self, config: Option<&Value>) -> Result<(), AgentError> {
        match config {
            Some(cfg) => self.build(cfg).map(drop),
            None => Ok(()),
        }
    }

    async fn set_config(&self, config: Option<&Value>) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        if inner.task.is_some() {
            return Err(AgentError::Running(INPUT.into()));
        }
        let driver = config.map(|cfg| self.build(cfg)).transpose()?;
        match &driver {
            Some(d) => info!(agent = INPUT, driver = d.name(), "input configured"),
            None => info!(agent = INPUT, "input disabled"),
        }
        inner.driver = driver;
        inner.config = config.cloned();
        Ok(())
    }

    async fn run(&self) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        if inner.task.is_some() {
            return Ok(());
        }
        let tx = inner
            .connector
            .as_ref()
            .map(Connector::input_sender)
            .ok_or_else(|| AgentError::NoConnector(INPUT.into()))?;
        let Some(driver) = inner.driver.take() else {
            info!(agent = INPUT, "no input driver configured, not starting");
            return Ok(());
        };
        info!(agent = INPUT, driver = driver.name(), "starting input");
        let retry = self.retry_delay;
        inner.task = Some(TaskSlot::spawn(move |cancel| pump(driver, tx, cancel, retry)));
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        let Some(task) = inner.task.take() else {
            return Ok(());
        };
        match task.stop(INPUT, self.stop_timeout).await {
            Ok(driver) => {
                inner.driver = Some(driver);
                info!(agent = INPUT, "input stopped");
                Ok(())
            }
            Err(e) => {
                // the driver went down with the task; rebuild it from config
                inner.driver = inner.config.as_ref().and_then(|cfg| self.build(cfg).ok());
                Err(e)
            }
        }
    }
}

async fn pump(mut driver: Driver, tx: Sender<Record>, cancel: CancellationToken, retry: Duration) -> Driver {
    let name = driver.name().to_string();

    loop {
        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = driver.start() => Some(r),
        };
        match started {
            None => return driver,
            Some(Ok(())) => break,
            Some(Err(e)) => {
                warn!(agent = INPUT, driver = %name, error = %e, "driver failed to start, retrying");
                let cancelled = tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(retry) => false,
                };
                if cancelled {
                    return driver;
                }
            }
        }
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = driver.emit() => r,
        };
        match next {
            Ok(Some(record)) => {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    p = tx.reserve() => Some(p),
                };
                match permit {
                    Some(Ok(permit)) => permit.send(record),
                    Some(Err(_)) => {
                        warn!(agent = INPUT, "connector closed, input exiting");
                        break;
                    }
                    None => {
                        debug!(agent = INPUT, "stopped with a record in hand, dropping it");
                        break;
                    }
                }
            }
            Ok(None) => {
                info!(agent = INPUT, driver = %name, "source exhausted");
                cancel.cancelled().await;
                break;
            }
            Err(e) => {
                warn!(agent = INPUT, driver = %name, error = %e, "emit failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(retry) => {}
                }
            }
        }
    }

    driver.stop().await;
    driver
}
