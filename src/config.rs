use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::agent::{INPUT, OUTPUT, PIPELINE};

pub const ID: &str = "id";
pub const CONTROLLER: &str = "controller";
pub const RPC_PORT: &str = "rpcport";
pub const HEARTBEAT: &str = "heartbeat";

/// Top-level keys every agent configuration must carry.
pub const MANDATORY_FIELDS: [&str; 6] = [INPUT, OUTPUT, PIPELINE, ID, CONTROLLER, RPC_PORT];

/// Parsed configuration document: a mapping from top-level key to an
/// arbitrary structured value.
pub type Content = Map<String, Value>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing mandatory field(s): {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("config must be a mapping at the top level")]
    NotAMapping,

    #[error("could not parse config: {0}")]
    Parse(String),

    #[error("invalid value for `{field}`: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not serialize config: {0}")]
    Serialize(String),
}

impl ConfigError {
    fn invalid(field: &str, reason: impl ToString) -> Self {
        ConfigError::InvalidField {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Raw content plus the set of keys it must contain before anyone trusts it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigBase {
    mandatory_fields: BTreeSet<String>,
    content: Content,
}

impl ConfigBase {
    pub fn new<I, S>(mandatory_fields: I, content: Content) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mandatory_fields: mandatory_fields.into_iter().map(Into::into).collect(),
            content,
        }
    }

    /// A base with the agent's fixed mandatory-field schema.
    pub fn agent(content: Content) -> Self {
        Self::new(MANDATORY_FIELDS, content)
    }

    /// Reports every missing field at once, in a stable order.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing: Vec<String> = self
            .mandatory_fields
            .iter()
            .filter(|f| !self.content.contains_key(f.as_str()))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingFields(missing))
        }
    }

    pub fn mandatory_fields(&self) -> &BTreeSet<String> {
        &self.mandatory_fields
    }

    pub fn content(&self) -> &Content {
        &self.content
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub interval_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            reconnect_backoff_ms: 5_000,
            request_timeout_ms: 1_000,
            connect_timeout_ms: 1_000,
        }
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Validated, typed view over an agent configuration. Replaced as a whole on
/// every accepted update.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentsManagerConfig {
    base: ConfigBase,
    pub id: u64,
    /// Empty when the agent runs without a controller.
    pub controller: String,
    pub rpc_port: u16,
    pub heartbeat: HeartbeatSettings,
}

impl AgentsManagerConfig {
    /// Configuration of a manager nobody configured yet.
    pub fn empty() -> Self {
        Self {
            base: ConfigBase::agent(Content::new()),
            ..Default::default()
        }
    }

    pub fn from_content(content: Content) -> Result<Self, ConfigError> {
        let base = ConfigBase::agent(content);
        base.validate()?;
        let content = base.content();

        let id = parse_id(&content[ID])?;
        let controller = match &content[CONTROLLER] {
            Value::Null => String::new(),
            Value::String(s) => s.trim().to_string(),
            other => return Err(ConfigError::invalid(CONTROLLER, format!("expected a string, got {other}"))),
        };
        let rpc_port = parse_port(&content[RPC_PORT])?;
        let heartbeat = match content.get(HEARTBEAT) {
            None | Some(Value::Null) => HeartbeatSettings::default(),
            Some(v) => serde_json::from_value(v.clone()).map_err(|e| ConfigError::invalid(HEARTBEAT, e))?,
        };

        Ok(Self {
            base,
            id,
            controller,
            rpc_port,
            heartbeat,
        })
    }

    pub fn content(&self) -> &Content {
        self.base.content()
    }

    /// Sub-configuration of one role-agent. An explicit `null` reads as unset.
    pub fn section(&self, name: &str) -> Option<&Value> {
        match self.base.content().get(name) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v),
        }
    }

    /// Copy of this config with one top-level key replaced.
    pub fn with_section(&self, name: &str, value: Value) -> Self {
        let mut next = self.clone();
        next.base.content.insert(name.to_string(), value);
        next
    }

    pub fn has_controller(&self) -> bool {
        !self.controller.is_empty()
    }

    pub fn rpc_port_string(&self) -> String {
        self.rpc_port.to_string()
    }

    pub fn to_yaml_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        if self.base.content().is_empty() {
            return Ok(Vec::new());
        }
        serde_yaml_bw::to_string(self.base.content())
            .map(String::into_bytes)
            .map_err(|e| ConfigError::Serialize(e.to_string()))
    }
}

fn parse_id(value: &Value) -> Result<u64, ConfigError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| ConfigError::invalid(ID, format!("{n} is not an unsigned integer"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|e| ConfigError::invalid(ID, format!("`{s}`: {e}"))),
        other => Err(ConfigError::invalid(ID, format!("expected an integer, got {other}"))),
    }
}

fn parse_port(value: &Value) -> Result<u16, ConfigError> {
    let port = match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().trim_start_matches(':').parse().ok(),
        _ => None,
    };
    port.ok_or_else(|| ConfigError::invalid(RPC_PORT, format!("{value} is not a TCP port")))
}

/// Parse a YAML document into top-level content.
pub fn parse_content(bytes: &[u8]) -> Result<Content, ConfigError> {
    let text = std::str::from_utf8(bytes).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let value: Value = serde_yaml_bw::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ConfigError::NotAMapping),
    }
}

pub fn load_config_file(path: &Path) -> Result<Content, ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "loaded config file");
    parse_content(&bytes)
}
