pub mod transforms;

use std::sync::Arc;

use agent_protocol::{DriverError, Record, Transform, driver::TYPE_FIELD};
use serde_json::Value;

use crate::registry::DriverRegistry;

const STEPS_FIELD: &str = "steps";

/// Ordered chain of transforms the pipeline agent runs every record
/// through. An empty chain forwards records untouched.
#[derive(Clone, Default)]
pub struct PipelineStage {
    steps: Vec<Arc<dyn Transform>>,
}

impl std::fmt::Debug for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStage")
            .field("steps", &self.step_names())
            .finish()
    }
}

impl PipelineStage {
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn new(steps: Vec<Arc<dyn Transform>>) -> Self {
        Self { steps }
    }

    /// Accepts `null`, `{}`, a single step `{type: ..}` or `{steps: [..]}`.
    pub fn from_config(registry: &DriverRegistry, config: Option<&Value>) -> Result<Self, DriverError> {
        let config = match config {
            None | Some(Value::Null) => return Ok(Self::passthrough()),
            Some(Value::Object(map)) if map.is_empty() => return Ok(Self::passthrough()),
            Some(c @ Value::Object(_)) => c,
            Some(other) => {
                return Err(DriverError::invalid(
                    "pipeline",
                    format!("expected a mapping, got {other}"),
                ));
            }
        };

        if config.get(TYPE_FIELD).is_some() {
            return Ok(Self::new(vec![registry.build_transform(config)?]));
        }
        match config.get(STEPS_FIELD) {
            Some(Value::Array(steps)) => {
                let steps = steps
                    .iter()
                    .map(|step| registry.build_transform(step))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::new(steps))
            }
            Some(Value::Null) => Ok(Self::passthrough()),
            Some(other) => Err(DriverError::invalid(
                "pipeline",
                format!("`{STEPS_FIELD}` must be a list, got {other}"),
            )),
            None => Err(DriverError::invalid(
                "pipeline",
                format!("expected `{TYPE_FIELD}` or `{STEPS_FIELD}`"),
            )),
        }
    }

    /// Runs the record through every step. `Ok(None)` means a step dropped it.
    pub fn process(&self, record: Record) -> Result<Option<Record>, DriverError> {
        let mut current = record;
        for step in &self.steps {
            match step.apply(current)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    pub fn is_passthrough(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}
