use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

/// JSON‑RPC 2.0 core types for the agent control plane, one document per line.
///
/// Usage example:
/// ```ignore
/// use agent_protocol::jsonrpc::{Id, Method, Request};
///
/// let req = Request::call(Id::Number(1), Method::GetHeartBeat, None);
/// let s = serde_json::to_string(&req).unwrap();
/// ```
pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Methods spoken on the control plane. The agent serves `updateConfig` and
/// `getHeartBeat`; the controller serves `updateAgentStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "camelCase")]
pub enum Method {
    UpdateConfig,
    GetHeartBeat,
    UpdateAgentStatus,
}

/// `id` MAY be a string, number or null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Omitted for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Error {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Error {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_params(detail: impl ToString) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: "Invalid params".into(),
            data: Some(Value::String(detail.to_string())),
        }
    }

    pub fn internal(detail: impl ToString) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: "Internal error".into(),
            data: Some(Value::String(detail.to_string())),
        }
    }
}

/// Exactly one of `result` or `error` must be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    pub id: Id,
}

/// Lets a reader parse a line without inspecting it first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Request {
    pub fn call(id: Id, method: Method, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.to_string(),
            params,
            id: Some(id),
        }
    }
}

impl Response {
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn fail(id: Id, error: Error) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_uses_camel_case_method_names() {
        let req = Request::call(Id::Number(1), Method::UpdateConfig, Some(json!({"config": []})));
        let s = serde_json::to_string(&req).unwrap();
        assert!(s.contains("\"method\":\"updateConfig\""));

        let de: Request = serde_json::from_str(&s).unwrap();
        assert_eq!(de.method.parse::<Method>().unwrap(), Method::UpdateConfig);
        assert_eq!(de.id, Some(Id::Number(1)));
    }

    #[test]
    fn method_parse() {
        assert_eq!("getHeartBeat".parse::<Method>().unwrap(), Method::GetHeartBeat);
        assert_eq!(Method::UpdateAgentStatus.as_ref(), "updateAgentStatus");
        assert!("nope".parse::<Method>().is_err());
    }

    #[test]
    fn message_distinguishes_requests_from_responses() {
        let line = r#"{"jsonrpc":"2.0","result":{"ok":true},"id":"abc"}"#;
        match serde_json::from_str::<Message>(line).unwrap() {
            Message::Response(resp) => {
                assert_eq!(resp.id, Id::String("abc".into()));
                assert_eq!(resp.result.unwrap()["ok"], json!(true));
            }
            other => panic!("expected response, got {other:?}"),
        }

        let line = r#"{"jsonrpc":"2.0","method":"getHeartBeat","id":7}"#;
        assert!(matches!(
            serde_json::from_str::<Message>(line).unwrap(),
            Message::Request(_)
        ));
    }

    #[test]
    fn failure_response_omits_result() {
        let resp = Response::fail(Id::Null, Error::new(METHOD_NOT_FOUND, "Method not found"));
        let v = serde_json::to_value(&resp).unwrap();
        assert!(v.get("result").is_none());
        assert_eq!(v["error"]["code"], json!(-32601));
    }
}
