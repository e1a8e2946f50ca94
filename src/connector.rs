use std::sync::Arc;

use agent_protocol::Record;
use thiserror::Error;
use tokio::sync::{
    Mutex,
    mpsc::{self, Receiver, Sender},
};

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("connector capacity must be greater than zero")]
    ZeroCapacity,
}

/// Receiving end of one connector channel. Shared so that a restarted agent
/// task picks up the same queue (and anything still buffered in it).
pub type Inbound = Arc<Mutex<Receiver<Record>>>;

/// In-process bus between the three role-agents: input -> pipeline on the
/// first channel, pipeline -> output on the second. Both channels are bounded
/// so a slow sink applies backpressure all the way to the source.
#[derive(Debug, Clone)]
pub struct Connector {
    capacity: usize,
    to_pipeline: Sender<Record>,
    pipeline_in: Inbound,
    to_output: Sender<Record>,
    output_in: Inbound,
}

impl Connector {
    pub fn new() -> Result<Self, ConnectorError> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Result<Self, ConnectorError> {
        if capacity == 0 {
            return Err(ConnectorError::ZeroCapacity);
        }
        let (to_pipeline, pipeline_rx) = mpsc::channel(capacity);
        let (to_output, output_rx) = mpsc::channel(capacity);
        Ok(Self {
            capacity,
            to_pipeline,
            pipeline_in: Arc::new(Mutex::new(pipeline_rx)),
            to_output,
            output_in: Arc::new(Mutex::new(output_rx)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Outbound handle of the input agent.
    pub fn input_sender(&self) -> Sender<Record> {
        self.to_pipeline.clone()
    }

    /// Inbound handle of the pipeline agent.
    pub fn pipeline_receiver(&self) -> Inbound {
        self.pipeline_in.clone()
    }

    /// Outbound handle of the pipeline agent.
    pub fn pipeline_sender(&self) -> Sender<Record> {
        self.to_output.clone()
    }

    /// Inbound handle of the output agent.
    pub fn output_receiver(&self) -> Inbound {
        self.output_in.clone()
    }

    /// Records waiting on each channel: `(input -> pipeline, pipeline -> output)`.
    pub fn buffered(&self) -> (usize, usize) {
        (
            self.capacity - self.to_pipeline.capacity(),
            self.capacity - self.to_output.capacity(),
        )
    }

    /// Both clones refer to the same channels.
    pub fn same_as(&self, other: &Connector) -> bool {
        self.to_pipeline.same_channel(&other.to_pipeline) && self.to_output.same_channel(&other.to_output)
    }
}
