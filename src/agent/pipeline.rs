use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use agent_protocol::Record;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc::Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Agent, AgentError, AgentState, DEFAULT_STOP_TIMEOUT, PIPELINE, TaskSlot};
use crate::{
    connector::{Connector, Inbound},
    pipeline::PipelineStage,
    registry::DriverRegistry,
};

/// Per-record bound on forwarding while draining after a stop request.
pub const DRAIN_SEND_TIMEOUT: Duration = Duration::from_millis(500);

type SharedStage = Arc<RwLock<Arc<PipelineStage>>>;

struct Inner {
    connector: Option<Connector>,
    configured: bool,
    task: Option<TaskSlot<()>>,
}

/// Moves records from the input channel to the output channel through the
/// configured [`PipelineStage`]. The stage can be replaced while running.
pub struct PipelineAgent {
    registry: Arc<DriverRegistry>,
    stop_timeout: Duration,
    stage: SharedStage,
    inner: Mutex<Inner>,
}

impl PipelineAgent {
    pub fn new(registry: Arc<DriverRegistry>) -> Self {
        Self {
            registry,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            stage: Arc::new(RwLock::new(Arc::new(PipelineStage::passthrough()))),
            inner: Mutex::new(Inner {
                connector: None,
                configured: false,
                task: None,
            }),
        }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// The stage currently applied to records.
    pub fn stage(&self) -> Arc<PipelineStage> {
        current(&self.stage)
    }

    fn build(&self, config: Option<&Value>) -> Result<PipelineStage, AgentError> {
        PipelineStage::from_config(&self.registry, config).map_err(|e| AgentError::driver(PIPELINE, e))
    }
}

fn current(stage: &SharedStage) -> Arc<PipelineStage> {
    match stage.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

#[async_trait]
impl Agent for PipelineAgent {
    fn name(&self) -> &str {
        PIPELINE
    }

    async fn state(&self) -> AgentState {
        let inner = self.inner.lock().await;
        if inner.task.is_some() {
            AgentState::Running
        } else if inner.configured {
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
                return Err(AgentError::ConnectorMismatch(PIPELINE.into()));
            }
        }
        inner.connector = Some(connector);
        Ok(())
    }

    async fn validate_config(&self, config: Option<&Value>) -> Result<(), AgentError> {
        self.build(config).map(drop)
    }

    /// Allowed while running: the task picks the new stage up with the next
    /// record.
    async fn set_config(&self, config: Option<&Value>) -> Result<(), AgentError> {
        let next = Arc::new(self.build(config)?);
        let mut inner = self.inner.lock().await;
        info!(agent = PIPELINE, steps = ?next.step_names(), running = inner.task.is_some(), "pipeline configured");
        match self.stage.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        inner.configured = true;
        Ok(())
    }

    async fn run(&self) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        if inner.task.is_some() {
            return Ok(());
        }
        let connector = inner
            .connector
            .as_ref()
            .ok_or_else(|| AgentError::NoConnector(PIPELINE.into()))?;
        let rx = connector.pipeline_receiver();
        let tx = connector.pipeline_sender();
        if !inner.configured {
            info!(agent = PIPELINE, "no pipeline configured, forwarding records unchanged");
        }
        let stage = self.stage.clone();
        inner.task = Some(TaskSlot::spawn(move |cancel| process(rx, tx, stage, cancel)));
        info!(agent = PIPELINE, "starting pipeline");
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        let Some(task) = inner.task.take() else {
            return Ok(());
        };
        task.stop(PIPELINE, self.stop_timeout).await?;
        info!(agent = PIPELINE, "pipeline stopped");
        Ok(())
    }
}

fn transform(stage: &SharedStage, record: Record) -> Option<Record> {
    match current(stage).process(record) {
        Ok(out) => out,
        Err(e) => {
            warn!(agent = PIPELINE, error = %e, "transform failed, dropping record");
            None
        }
    }
}

async fn process(rx: Inbound, tx: Sender<Record>, stage: SharedStage, cancel: CancellationToken) {
    let mut rx = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        guard = rx.lock_owned() => guard,
    };
    let mut pending = None;

    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = rx.recv() => r,
        };
        let Some(record) = received else {
            break;
        };
        let Some(out) = transform(&stage, record) else {
            continue;
        };
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            p = tx.reserve() => Some(p),
        };
        match permit {
            Some(Ok(permit)) => permit.send(out),
            Some(Err(_)) => {
                warn!(agent = PIPELINE, "output channel closed, pipeline exiting");
                return;
            }
            None => {
                pending = Some(out);
                break;
            }
        }
    }

    // input is already stopped by now, forward what it left behind
    let mut drained = 0usize;
    if let Some(out) = pending {
        if forward(&tx, out).await {
            drained += 1;
        }
    }
    while let Ok(record) = rx.try_recv() {
        if let Some(out) = transform(&stage, record) {
            if !forward(&tx, out).await {
                break;
            }
            drained += 1;
        }
    }
    debug!(agent = PIPELINE, drained, "pipeline drained");
}

async fn forward(tx: &Sender<Record>, record: Record) -> bool {
    match tx.send_timeout(record, DRAIN_SEND_TIMEOUT).await {
        Ok(()) => true,
        Err(e) => {
            warn!(agent = PIPELINE, error = %e, "could not forward record while draining");
            false
        }
    }
}
