pub mod agent;
pub mod config;
pub mod connector;
pub mod elasticsearch;
pub mod heartbeat;
pub mod input;
pub mod logger;
pub mod manager;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod watcher;

pub use manager::{AgentsManager, ManagerError, ManagerOptions};
pub use registry::DriverRegistry;
