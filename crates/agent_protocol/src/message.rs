use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, Display, AsRefStr)]
pub enum Status {
    #[default]
    Stop,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, Display)]
#[allow(clippy::upper_case_acronyms)]
pub enum ErrorType {
    #[default]
    OK,
    FAILED,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Error {
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResponseHeader {
    pub error: Error,
}

impl ResponseHeader {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Error {
                error_type: ErrorType::FAILED,
                message: message.into(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.error_type == ErrorType::OK
    }
}

/// Status report exchanged between an agent and its controller. `config` is
/// the agent's current configuration serialized as YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HeartBeat {
    pub status: Status,
    pub id: u64,
    pub rpc_port: String,
    #[serde(default)]
    pub config: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UpdateConfigRequest {
    /// YAML document; only a top-level `pipeline` key is honored.
    pub config: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UpdateConfigResponse {
    pub header: ResponseHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HeartBeat>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HeartBeatRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UpdateAgentStatusRequest {
    pub heartbeat: HeartBeat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UpdateAgentStatusResponse {
    pub header: ResponseHeader,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn heartbeat_wire_shape() {
        let hb = HeartBeat {
            status: Status::Running,
            id: 42,
            rpc_port: "9000".into(),
            config: b"id: 42\n".to_vec(),
        };
        let v = serde_json::to_value(&hb).unwrap();
        assert_eq!(v["status"], json!("Running"));
        assert_eq!(v["rpcPort"], json!("9000"));
        assert_eq!(v["id"], json!(42));
    }

    #[test]
    fn failed_header_serializes_type_field() {
        let v = serde_json::to_value(ResponseHeader::failed("no pipeline")).unwrap();
        assert_eq!(v, json!({"error": {"type": "FAILED", "message": "no pipeline"}}));
        assert!(ResponseHeader::ok().is_ok());
    }

    #[test]
    fn update_config_response_without_heartbeat() {
        let resp: UpdateConfigResponse =
            serde_json::from_value(json!({"header": {"error": {"type": "OK"}}})).unwrap();
        assert!(resp.header.is_ok());
        assert!(resp.heartbeat.is_none());
    }
}
