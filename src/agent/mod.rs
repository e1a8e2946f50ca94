pub mod input;
pub mod output;
pub mod pipeline;

use std::{future::Future, time::Duration};

use agent_protocol::DriverError;
use async_trait::async_trait;
use serde_json::Value;
use strum_macros::{AsRefStr, Display};
use thiserror::Error;
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::connector::Connector;

pub use input::InputAgent;
pub use output::OutputAgent;
pub use pipeline::PipelineAgent;

pub const INPUT: &str = "input";
pub const PIPELINE: &str = "pipeline";
pub const OUTPUT: &str = "output";

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum AgentState {
    Unconfigured,
    Configured,
    Running,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{agent}: {source}")]
    Driver {
        agent: String,
        #[source]
        source: DriverError,
    },

    #[error("{0}: no connector bound")]
    NoConnector(String),

    #[error("{0}: cannot reconfigure while running, stop it first")]
    Running(String),

    #[error("{0}: already running on a different connector")]
    ConnectorMismatch(String),

    #[error("{agent}: task did not stop within {after:?} and was aborted")]
    StopTimeout { agent: String, after: Duration },

    #[error("{agent}: task failed: {reason}")]
    TaskFailed { agent: String, reason: String },
}

impl AgentError {
    pub(crate) fn driver(agent: &str, source: DriverError) -> Self {
        AgentError::Driver {
            agent: agent.to_string(),
            source,
        }
    }
}

/// One stage of the agent: input, pipeline or output.
///
/// `set_connector` binds the shared bus, `set_config` installs the driver
/// described by the agent's sub-config (`None` leaves it unconfigured),
/// `run` spawns the processing task and `stop` cancels it and waits for it.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn state(&self) -> AgentState;

    async fn set_connector(&self, connector: Connector) -> Result<(), AgentError>;

    /// Dry run of `set_config`: builds the driver and throws it away.
    async fn validate_config(&self, config: Option<&Value>) -> Result<(), AgentError>;

    async fn set_config(&self, config: Option<&Value>) -> Result<(), AgentError>;

    async fn run(&self) -> Result<(), AgentError>;

    async fn stop(&self) -> Result<(), AgentError>;
}

/// A spawned agent task together with the token that stops it.
pub(crate) struct TaskSlot<T> {
    cancel: CancellationToken,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> TaskSlot<T> {
    pub(crate) fn spawn<F, Fut>(task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task(cancel.clone()));
        Self { cancel, handle }
    }

    /// Cancel and wait at most `grace` for the task to return.
    pub(crate) async fn stop(mut self, agent: &str, grace: Duration) -> Result<T, AgentError> {
        self.cancel.cancel();
        match timeout(grace, &mut self.handle).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(AgentError::TaskFailed {
                agent: agent.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => {
                warn!(agent, ?grace, "agent task ignored cancellation, aborting");
                self.handle.abort();
                Err(AgentError::StopTimeout {
                    agent: agent.to_string(),
                    after: grace,
                })
            }
        }
    }
}
