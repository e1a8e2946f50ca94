//! DriverRegistry: maps driver names to constructors for inputs, outputs and
//! pipeline transforms. Role-agents resolve drivers through an injected
//! registry instead of a process-wide table.
use std::sync::Arc;

use agent_protocol::{
    DriverError, InputDriver, OutputDriver, Transform,
    driver::driver_type,
};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{input, output, pipeline::transforms};

pub type InputCtor = Arc<dyn Fn(&Value) -> Result<Box<dyn InputDriver>, DriverError> + Send + Sync>;
pub type OutputCtor = Arc<dyn Fn(&Value) -> Result<Box<dyn OutputDriver>, DriverError> + Send + Sync>;
pub type TransformCtor = Arc<dyn Fn(&Value) -> Result<Arc<dyn Transform>, DriverError> + Send + Sync>;

#[derive(Default)]
pub struct DriverRegistry {
    inputs: DashMap<String, InputCtor>,
    outputs: DashMap<String, OutputCtor>,
    transforms: DashMap<String, TransformCtor>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every driver this crate ships.
    pub fn with_builtins() -> Arc<Self> {
        let registry = Self::new();

        registry.register_input(input::console::NAME, |cfg| {
            Ok(Box::new(input::console::ConsoleInput::from_config(cfg)?))
        });
        registry.register_input(input::elasticsearch::NAME, |cfg| {
            Ok(Box::new(input::elasticsearch::ElasticsearchInput::from_config(cfg)?))
        });

        registry.register_output(output::console::NAME, |cfg| {
            Ok(Box::new(output::console::ConsoleOutput::from_config(cfg)?))
        });
        registry.register_output(output::elasticsearch::NAME, |cfg| {
            Ok(Box::new(output::elasticsearch::ElasticsearchOutput::from_config(cfg)?))
        });

        registry.register_transform(transforms::TRIM, |cfg| {
            Ok(Arc::new(transforms::Trim::from_config(cfg)?))
        });
        registry.register_transform(transforms::REGEX_FILTER, |cfg| {
            Ok(Arc::new(transforms::RegexFilter::from_config(cfg)?))
        });
        registry.register_transform(transforms::ADD_FIELDS, |cfg| {
            Ok(Arc::new(transforms::AddFields::from_config(cfg)?))
        });

        Arc::new(registry)
    }

    pub fn register_input<F>(&self, name: &str, ctor: F)
    where
        F: Fn(&Value) -> Result<Box<dyn InputDriver>, DriverError> + Send + Sync + 'static,
    {
        if self.inputs.insert(name.to_string(), Arc::new(ctor)).is_some() {
            warn!(driver = name, "input driver registered twice, keeping the last one");
        } else {
            debug!(driver = name, "registered input driver");
        }
    }

    pub fn register_output<F>(&self, name: &str, ctor: F)
    where
        F: Fn(&Value) -> Result<Box<dyn OutputDriver>, DriverError> + Send + Sync + 'static,
    {
        if self.outputs.insert(name.to_string(), Arc::new(ctor)).is_some() {
            warn!(driver = name, "output driver registered twice, keeping the last one");
        } else {
            debug!(driver = name, "registered output driver");
        }
    }

    pub fn register_transform<F>(&self, name: &str, ctor: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Transform>, DriverError> + Send + Sync + 'static,
    {
        if self.transforms.insert(name.to_string(), Arc::new(ctor)).is_some() {
            warn!(driver = name, "transform registered twice, keeping the last one");
        } else {
            debug!(driver = name, "registered transform");
        }
    }

    pub fn resolve_input(&self, name: &str) -> Result<InputCtor, DriverError> {
        self.inputs
            .get(name)
            .map(|c| c.value().clone())
            .ok_or_else(|| DriverError::UnknownDriver(name.to_string()))
    }

    pub fn resolve_output(&self, name: &str) -> Result<OutputCtor, DriverError> {
        self.outputs
            .get(name)
            .map(|c| c.value().clone())
            .ok_or_else(|| DriverError::UnknownDriver(name.to_string()))
    }

    pub fn resolve_transform(&self, name: &str) -> Result<TransformCtor, DriverError> {
        self.transforms
            .get(name)
            .map(|c| c.value().clone())
            .ok_or_else(|| DriverError::UnknownDriver(name.to_string()))
    }

    /// Resolve by the config's `type` field and construct.
    pub fn build_input(&self, config: &Value) -> Result<Box<dyn InputDriver>, DriverError> {
        let ctor = self.resolve_input(driver_type(config)?)?;
        ctor(config)
    }

    pub fn build_output(&self, config: &Value) -> Result<Box<dyn OutputDriver>, DriverError> {
        let ctor = self.resolve_output(driver_type(config)?)?;
        ctor(config)
    }

    pub fn build_transform(&self, config: &Value) -> Result<Arc<dyn Transform>, DriverError> {
        let ctor = self.resolve_transform(driver_type(config)?)?;
        ctor(config)
    }

    pub fn input_names(&self) -> Vec<String> {
        sorted_keys(self.inputs.iter().map(|e| e.key().clone()))
    }

    pub fn output_names(&self) -> Vec<String> {
        sorted_keys(self.outputs.iter().map(|e| e.key().clone()))
    }

    pub fn transform_names(&self) -> Vec<String> {
        sorted_keys(self.transforms.iter().map(|e| e.key().clone()))
    }
}

fn sorted_keys(keys: impl Iterator<Item = String>) -> Vec<String> {
    let mut names: Vec<String> = keys.collect();
    names.sort();
    names
}
