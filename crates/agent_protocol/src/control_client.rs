use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
    time::timeout,
};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    jsonrpc::{Id, Message, Method, Request},
    message::{
        HeartBeat, HeartBeatRequest, UpdateAgentStatusRequest, UpdateAgentStatusResponse,
        UpdateConfigRequest, UpdateConfigResponse,
    },
};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("rpc call timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("rpc codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },
}

impl RpcError {
    /// True when the underlying stream is unusable and the caller should
    /// reconnect.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, RpcError::ConnectionLost(_))
    }
}

struct Conn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// A JSON-RPC client over one TCP connection. Calls are serialized; a
/// response whose id does not match the pending call (left over from a call
/// that timed out) is skipped.
pub struct RpcClient {
    conn: Mutex<Conn>,
}

impl RpcClient {
    pub async fn connect(addr: &str, connect_timeout: Duration) -> Result<Self, RpcError> {
        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(RpcError::Connect {
                    addr: addr.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(RpcError::Connect {
                    addr: addr.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no answer within {connect_timeout:?}"),
                    ),
                });
            }
        };
        stream.set_nodelay(true).ok();
        let (read, writer) = stream.into_split();
        debug!(peer = addr, "rpc connection established");
        Ok(Self {
            conn: Mutex::new(Conn {
                reader: BufReader::new(read),
                writer,
            }),
        })
    }

    /// Send `method` with optional `params` and deserialize the result into `R`.
    pub async fn call<R>(
        &self,
        method: Method,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<R, RpcError>
    where
        R: DeserializeOwned,
    {
        let id = Id::String(Uuid::new_v4().to_string());
        let req = Request::call(id.clone(), method, params);
        let mut line = serde_json::to_string(&req)?;
        line.push('\n');

        let mut conn = self.conn.lock().await;
        let value = match timeout(deadline, exchange(&mut conn, &line, &id)).await {
            Ok(res) => res?,
            Err(_) => return Err(RpcError::Timeout(deadline)),
        };
        Ok(serde_json::from_value(value)?)
    }

    pub async fn call_with<P, R>(
        &self,
        method: Method,
        params: &P,
        deadline: Duration,
    ) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        self.call(method, Some(params), deadline).await
    }
}

async fn exchange(conn: &mut Conn, line: &str, id: &Id) -> Result<Value, RpcError> {
    conn.writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| RpcError::ConnectionLost(e.to_string()))?;
    conn.writer
        .flush()
        .await
        .map_err(|e| RpcError::ConnectionLost(e.to_string()))?;

    let mut buf = String::new();
    loop {
        buf.clear();
        let n = conn
            .reader
            .read_line(&mut buf)
            .await
            .map_err(|e| RpcError::ConnectionLost(e.to_string()))?;
        if n == 0 {
            return Err(RpcError::ConnectionLost("peer closed the connection".into()));
        }
        let text = buf.trim();
        if text.is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(text)? {
            Message::Response(resp) if &resp.id == id => {
                if let Some(err) = resp.error {
                    return Err(RpcError::Remote {
                        code: err.code,
                        message: err.message,
                    });
                }
                return Ok(resp.result.unwrap_or(Value::Null));
            }
            Message::Response(resp) => {
                trace!(?resp.id, "discarding stale rpc response");
            }
            Message::Request(req) => {
                trace!(method = %req.method, "ignoring request on client connection");
            }
        }
    }
}

/// Agent-side client for the controller's status endpoint.
pub struct ControllerClient {
    inner: RpcClient,
}

impl ControllerClient {
    pub async fn connect(addr: &str, connect_timeout: Duration) -> Result<Self, RpcError> {
        Ok(Self {
            inner: RpcClient::connect(addr, connect_timeout).await?,
        })
    }

    pub async fn update_agent_status(
        &self,
        heartbeat: HeartBeat,
        deadline: Duration,
    ) -> Result<UpdateAgentStatusResponse, RpcError> {
        self.inner
            .call_with(
                Method::UpdateAgentStatus,
                &UpdateAgentStatusRequest { heartbeat },
                deadline,
            )
            .await
    }
}

/// Controller-side client for an agent's control endpoint.
pub struct AgentClient {
    inner: RpcClient,
}

impl AgentClient {
    pub async fn connect(addr: &str, connect_timeout: Duration) -> Result<Self, RpcError> {
        Ok(Self {
            inner: RpcClient::connect(addr, connect_timeout).await?,
        })
    }

    pub async fn update_config(
        &self,
        config: Vec<u8>,
        deadline: Duration,
    ) -> Result<UpdateConfigResponse, RpcError> {
        self.inner
            .call_with(Method::UpdateConfig, &UpdateConfigRequest { config }, deadline)
            .await
    }

    pub async fn get_heartbeat(&self, deadline: Duration) -> Result<HeartBeat, RpcError> {
        self.inner
            .call_with(Method::GetHeartBeat, &HeartBeatRequest {}, deadline)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::Response;
    use serde_json::json;
    use tokio::net::TcpListener;

    const DEADLINE: Duration = Duration::from_secs(2);

    async fn read_request(reader: &mut BufReader<OwnedReadHalf>) -> Request {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    #[tokio::test]
    async fn connect_failure_is_not_connection_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = RpcClient::connect(&addr, DEADLINE).await.err().unwrap();
        assert!(matches!(err, RpcError::Connect { .. }));
        assert!(!err.is_connection_lost());
    }

    #[tokio::test]
    async fn skips_responses_with_foreign_ids() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            let req = read_request(&mut reader).await;
            assert_eq!(req.method, "getHeartBeat");

            let stale = Response::success(Id::String("old".into()), json!({"stale": true}));
            let fresh = Response::success(
                req.id.unwrap(),
                json!({"status": "Running", "id": 3, "rpcPort": "7000", "config": []}),
            );
            for resp in [stale, fresh] {
                let mut line = serde_json::to_string(&resp).unwrap();
                line.push('\n');
                write.write_all(line.as_bytes()).await.unwrap();
            }
        });

        let client = AgentClient::connect(&addr, DEADLINE).await.unwrap();
        let hb = client.get_heartbeat(DEADLINE).await.unwrap();
        assert_eq!(hb.id, 3);
        assert_eq!(hb.rpc_port, "7000");
    }

    #[tokio::test]
    async fn remote_error_and_closed_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            let req = read_request(&mut reader).await;
            let resp = Response::fail(
                req.id.unwrap(),
                crate::jsonrpc::Error::new(crate::jsonrpc::METHOD_NOT_FOUND, "Method not found"),
            );
            let mut line = serde_json::to_string(&resp).unwrap();
            line.push('\n');
            write.write_all(line.as_bytes()).await.unwrap();
            // second request: hang up without answering
            let _ = read_request(&mut reader).await;
        });

        let client = ControllerClient::connect(&addr, DEADLINE).await.unwrap();
        let err = client
            .update_agent_status(HeartBeat::default(), DEADLINE)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RpcError::Remote { code: -32601, .. }));
        assert!(!err.is_connection_lost());

        let err = client
            .update_agent_status(HeartBeat::default(), DEADLINE)
            .await
            .err()
            .unwrap();
        assert!(err.is_connection_lost());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        let client = RpcClient::connect(&addr, DEADLINE).await.unwrap();
        let err = client
            .call::<Value>(Method::GetHeartBeat, None, Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RpcError::Timeout(_)));
        assert!(!err.is_connection_lost());
    }
}
