use std::{sync::Arc, time::Duration};

use agent_protocol::{OutputDriver, Record};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Agent, AgentError, AgentState, DEFAULT_STOP_TIMEOUT, OUTPUT, TaskSlot};
use crate::{
    connector::{Connector, Inbound},
    registry::DriverRegistry,
};

type Driver = Box<dyn OutputDriver>;

#[derive(Default)]
struct Inner {
    connector: Option<Connector>,
    config: Option<Value>,
    driver: Option<Driver>,
    task: Option<TaskSlot<Driver>>,
}

/// Hands every record arriving on the output channel to its driver.
pub struct OutputAgent {
    registry: Arc<DriverRegistry>,
    stop_timeout: Duration,
    inner: Mutex<Inner>,
}

impl OutputAgent {
    pub fn new(registry: Arc<DriverRegistry>) -> Self {
        Self {
            registry,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    fn build(&self, config: &Value) -> Result<Driver, AgentError> {
        self.registry
            .build_output(config)
            .map_err(|e| AgentError::driver(OUTPUT, e))
    }
}

#[async_trait]
impl Agent for OutputAgent {
    fn name(&self) -> &str {
        OUTPUT
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
                return Err(AgentError::ConnectorMismatch(OUTPUT.into()));
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
            return Err(AgentError::Running(OUTPUT.into()));
        }
        let driver = config.map(|cfg| self.build(cfg)).transpose()?;
        match &driver {
            Some(d) => info!(agent = OUTPUT, driver = d.name(), "output configured"),
            None => info!(agent = OUTPUT, "output disabled"),
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
        let rx = inner
            .connector
            .as_ref()
            .map(Connector::output_receiver)
            .ok_or_else(|| AgentError::NoConnector(OUTPUT.into()))?;
        let Some(driver) = inner.driver.take() else {
            info!(agent = OUTPUT, "no output driver configured, not starting");
            return Ok(());
        };
        info!(agent = OUTPUT, driver = driver.name(), "starting output");
        inner.task = Some(TaskSlot::spawn(move |cancel| sink(driver, rx, cancel)));
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        let Some(task) = inner.task.take() else {
            return Ok(());
        };
        match task.stop(OUTPUT, self.stop_timeout).await {
            Ok(driver) => {
                inner.driver = Some(driver);
                info!(agent = OUTPUT, "output stopped");
                Ok(())
            }
            Err(e) => {
                inner.driver = inner.config.as_ref().and_then(|cfg| self.build(cfg).ok());
                Err(e)
            }
        }
    }
}

async fn deliver(driver: &mut Driver, record: Record) {
    if let Err(e) = driver.send(record).await {
        warn!(agent = OUTPUT, driver = driver.name(), error = %e, "failed to deliver record");
    }
}

async fn sink(mut driver: Driver, rx: Inbound, cancel: CancellationToken) -> Driver {
    if let Err(e) = driver.start().await {
        warn!(agent = OUTPUT, driver = driver.name(), error = %e, "driver start failed, records may not be delivered");
    }

    let mut rx = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        guard = rx.lock_owned() => Some(guard),
    };

    if let Some(rx) = rx.as_mut() {
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = rx.recv() => r,
            };
            match received {
                Some(record) => deliver(&mut driver, record).await,
                None => break,
            }
        }

        let mut drained = 0usize;
        while let Ok(record) = rx.try_recv() {
            deliver(&mut driver, record).await;
            drained += 1;
        }
        debug!(agent = OUTPUT, drained, "output drained");
    }

    driver.stop().await;
    driver
}
