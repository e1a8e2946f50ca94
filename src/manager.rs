//! The agent control plane.
//!
//! [`AgentsManager`] owns the three role-agents and the connector between
//! them, applies configuration, serves the control RPC and keeps the
//! heartbeat loop to the controller alive.
use std::{
    net::SocketAddr,
    sync::{
        Arc, OnceLock, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use agent_protocol::{
    jsonrpc::{self, Method},
    message::{HeartBeat, HeartBeatRequest, ResponseHeader, Status, UpdateConfigRequest, UpdateConfigResponse},
    rpc_server::{self, RpcHandler},
};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    agent::{Agent, AgentError, AgentState, DEFAULT_STOP_TIMEOUT, InputAgent, OutputAgent, PIPELINE, PipelineAgent},
    config::{AgentsManagerConfig, ConfigError, Content, parse_content},
    connector::{Connector, ConnectorError, DEFAULT_CAPACITY},
    heartbeat::{self, HeartbeatSource},
    registry::DriverRegistry,
};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("cannot bind control endpoint {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub channel_capacity: usize,
    pub stop_timeout: Duration,
    /// Host part of the control listener address.
    pub bind_host: String,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CAPACITY,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            bind_host: "0.0.0.0".to_string(),
        }
    }
}

struct Services {
    rpc: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
}

pub struct AgentsManager {
    input: Arc<dyn Agent>,
    pipeline: Arc<dyn Agent>,
    output: Arc<dyn Agent>,
    config: RwLock<Arc<AgentsManagerConfig>>,
    running: AtomicBool,
    /// Serializes configuration changes and start/stop, so a whole-config
    /// commit never interleaves with agents starting or stopping.
    update_lock: Mutex<()>,
    bind_host: String,
    rpc_addr: OnceLock<SocketAddr>,
    services: Mutex<Option<Services>>,
    shutdown: CancellationToken,
}

impl AgentsManager {
    pub async fn new(registry: Arc<DriverRegistry>) -> Result<Arc<Self>, ManagerError> {
        Self::with_options(registry, ManagerOptions::default()).await
    }

    pub async fn with_options(registry: Arc<DriverRegistry>, options: ManagerOptions) -> Result<Arc<Self>, ManagerError> {
        let input = Arc::new(InputAgent::new(registry.clone()).with_stop_timeout(options.stop_timeout));
        let pipeline = Arc::new(PipelineAgent::new(registry.clone()).with_stop_timeout(options.stop_timeout));
        let output = Arc::new(OutputAgent::new(registry).with_stop_timeout(options.stop_timeout));
        Self::with_agents(input, pipeline, output, options).await
    }

    /// Build a manager around caller-provided role-agents.
    pub async fn with_agents(
        input: Arc<dyn Agent>,
        pipeline: Arc<dyn Agent>,
        output: Arc<dyn Agent>,
        options: ManagerOptions,
    ) -> Result<Arc<Self>, ManagerError> {
        let connector = Connector::with_capacity(options.channel_capacity)?;
        for agent in [&input, &pipeline, &output] {
            agent.set_connector(connector.clone()).await?;
        }
        debug!(capacity = connector.capacity(), "connector bound to all agents");

        Ok(Arc::new(Self {
            input,
            pipeline,
            output,
            config: RwLock::new(Arc::new(AgentsManagerConfig::empty())),
            running: AtomicBool::new(false),
            update_lock: Mutex::new(()),
            bind_host: options.bind_host,
            rpc_addr: OnceLock::new(),
            services: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }))
    }

    fn agents(&self) -> [&Arc<dyn Agent>; 3] {
        [&self.input, &self.pipeline, &self.output]
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<AgentsManagerConfig> {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn replace_config(&self, next: AgentsManagerConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }

    pub fn status(&self) -> Status {
        if self.running.load(Ordering::SeqCst) {
            Status::Running
        } else {
            Status::Stop
        }
    }

    /// Address the control endpoint is bound to, once `run` bound it.
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.rpc_addr.get().copied()
    }

    pub async fn agent_states(&self) -> Vec<(String, AgentState)> {
        let mut states = Vec::with_capacity(3);
        for agent in self.agents() {
            states.push((agent.name().to_string(), agent.state().await));
        }
        states
    }

    /// Validate and apply a complete configuration.
    ///
    /// Nothing is mutated unless the top-level keys validate and every
    /// role-agent accepts its sub-config in a dry run.
    pub async fn set_config(&self, content: Content) -> Result<(), ManagerError> {
        let _guard = self.update_lock.lock().await;
        if self.running.load(Ordering::SeqCst) {
            return Err(ManagerError::Rejected(
                "agents are running, stop them before replacing the whole configuration".into(),
            ));
        }
        let next = AgentsManagerConfig::from_content(content)?;

        for agent in self.agents() {
            agent.validate_config(next.section(agent.name())).await?;
        }
        for agent in self.agents() {
            agent.set_config(next.section(agent.name())).await?;
        }

        info!(id = next.id, controller = %next.controller, port = next.rpc_port, "configuration applied");
        self.replace_config(next);
        Ok(())
    }

    /// Swap the pipeline stage without touching input or output.
    pub async fn update_pipeline(&self, value: Value) -> Result<(), ManagerError> {
        let _guard = self.update_lock.lock().await;
        let section = (!value.is_null()).then_some(&value);
        self.pipeline.set_config(section).await?;
        let next = self.config().with_section(PIPELINE, value);
        self.replace_config(next);
        info!(agent = PIPELINE, "pipeline reloaded");
        Ok(())
    }

    async fn apply_update(&self, bytes: &[u8]) -> Result<(), ManagerError> {
        let mut content = parse_content(bytes)?;
        let Some(pipeline) = content.remove(PIPELINE) else {
            return Err(ManagerError::Rejected(format!(
                "update must contain a `{PIPELINE}` section"
            )));
        };
        if !content.is_empty() {
            let keys: Vec<&str> = content.keys().map(String::as_str).collect();
            return Err(ManagerError::Rejected(format!(
                "only `{PIPELINE}` can change at runtime, got: {}",
                keys.join(", ")
            )));
        }
        self.update_pipeline(pipeline).await
    }

    /// `updateConfig`: hot-reload of the pipeline section.
    pub async fn update_config(&self, request: UpdateConfigRequest) -> UpdateConfigResponse {
        match self.apply_update(&request.config).await {
            Ok(()) => UpdateConfigResponse {
                header: ResponseHeader::ok(),
                heartbeat: Some(self.heartbeat()),
            },
            Err(e) => {
                warn!(error = %e, "config update rejected");
                UpdateConfigResponse {
                    header: ResponseHeader::failed(e.to_string()),
                    heartbeat: None,
                }
            }
        }
    }

    /// `getHeartBeat`.
    pub fn get_heartbeat(&self, _request: HeartBeatRequest) -> HeartBeat {
        self.heartbeat()
    }

    /// Fresh status report built from the current snapshot.
    pub fn heartbeat(&self) -> HeartBeat {
        let config = self.config();
        let rpc_port = match self.rpc_addr() {
            Some(addr) => addr.port().to_string(),
            None => config.rpc_port_string(),
        };
        let bytes = config.to_yaml_bytes().unwrap_or_else(|e| {
            warn!(error = %e, "could not serialize config for heartbeat");
            Vec::new()
        });
        HeartBeat {
            status: self.status(),
            id: config.id,
            rpc_port,
            config: bytes,
        }
    }

    /// Start everything. Returns once the tasks are launched.
    ///
    /// The control listener is bound before any agent starts; the RPC server
    /// and the heartbeat loop are started on the first call only.
    pub async fn run(self: &Arc<Self>) -> Result<(), ManagerError> {
        let _guard = self.update_lock.lock().await;
        let mut services = self.services.lock().await;
        let config = self.config();

        let listener = match *services {
            Some(_) => None,
            None => {
                let addr = format!("{}:{}", self.bind_host, config.rpc_port);
                let listener = TcpListener::bind(&addr).await.map_err(|source| {
                    error!(%addr, error = %source, "control endpoint unavailable");
                    ManagerError::Bind { addr, source }
                })?;
                if let Ok(local) = listener.local_addr() {
                    let _ = self.rpc_addr.set(local);
                }
                Some(listener)
            }
        };

        self.running.store(true, Ordering::SeqCst);
        for agent in [&self.output, &self.pipeline, &self.input] {
            agent.run().await?;
        }
        info!(id = config.id, "agents running");

        if let Some(listener) = listener {
            let rpc = tokio::spawn(rpc_server::serve(listener, self.clone(), self.shutdown.child_token()));
            let heartbeat = heartbeat::spawn(
                self.clone(),
                &config.controller,
                config.heartbeat,
                self.shutdown.child_token(),
            );
            *services = Some(Services { rpc, heartbeat });
        }
        Ok(())
    }

    /// Stop input, then pipeline, then output. Every agent is asked to stop
    /// even if an earlier one failed; the first failure is returned.
    pub async fn stop(&self) -> Result<(), ManagerError> {
        let _guard = self.update_lock.lock().await;
        let mut first = None;
        for agent in self.agents() {
            if let Err(e) = agent.stop().await {
                warn!(agent = agent.name(), error = %e, "agent did not stop cleanly");
                first.get_or_insert(e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("agents stopped");
        first.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Stop the agents and tear down the RPC server and heartbeat loop.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        let stopped = self.stop().await;
        self.shutdown.cancel();
        if let Some(services) = self.services.lock().await.take() {
            let _ = services.rpc.await;
            if let Some(hb) = services.heartbeat {
                let _ = hb.await;
            }
        }
        info!("manager shut down");
        stopped
    }
}

impl HeartbeatSource for AgentsManager {
    fn heartbeat(&self) -> HeartBeat {
        AgentsManager::heartbeat(self)
    }
}

#[async_trait]
impl RpcHandler for AgentsManager {
    async fn handle(&self, method: Method, params: Option<Value>) -> Result<Value, jsonrpc::Error> {
        match method {
            Method::UpdateConfig => {
                let request: UpdateConfigRequest = serde_json::from_value(params.unwrap_or(Value::Null))
                    .map_err(jsonrpc::Error::invalid_params)?;
                let response = self.update_config(request).await;
                serde_json::to_value(response).map_err(jsonrpc::Error::internal)
            }
            Method::GetHeartBeat => {
                serde_json::to_value(self.get_heartbeat(HeartBeatRequest {})).map_err(jsonrpc::Error::internal)
            }
            Method::UpdateAgentStatus => Err(jsonrpc::Error::new(jsonrpc::METHOD_NOT_FOUND, "Method not found")),
        }
    }
}
