//! A tiny controller: remembers the last heartbeat of every agent that
//! reports in and acknowledges it.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use agent_protocol::{
    jsonrpc::{self, Method},
    message::{HeartBeat, ResponseHeader, UpdateAgentStatusRequest, UpdateAgentStatusResponse},
    rpc_server::{RpcHandler, serve_connection},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::{net::TcpListener, sync::Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub heartbeat: HeartBeat,
    pub received: usize,
    pub last_seen: DateTime<Utc>,
}

#[derive(Default)]
pub struct ControllerService {
    agents: DashMap<u64, AgentRecord>,
    notify: Notify,
    rejecting: AtomicBool,
    connections: AtomicUsize,
}

impl ControllerService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer every status report with `FAILED` (the report is still recorded).
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn agents(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.agents.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn record_of(&self, id: u64) -> Option<AgentRecord> {
        self.agents.get(&id).map(|r| r.value().clone())
    }

    pub fn heartbeat_of(&self, id: u64) -> Option<HeartBeat> {
        self.record_of(id).map(|r| r.heartbeat)
    }

    pub fn count_of(&self, id: u64) -> usize {
        self.agents.get(&id).map(|r| r.received).unwrap_or_default()
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Wait until agent `id` reported at least `n` times and return its last
    /// heartbeat, or `None` when `deadline` passes first.
    pub async fn wait_for_heartbeats(&self, id: u64, n: usize, deadline: Duration) -> Option<HeartBeat> {
        self.wait_until(id, deadline, |r| r.received >= n).await
    }

    /// Wait until the last heartbeat of agent `id` satisfies `pred`.
    pub async fn wait_until<F>(&self, id: u64, deadline: Duration, pred: F) -> Option<HeartBeat>
    where
        F: Fn(&AgentRecord) -> bool,
    {
        tokio::time::timeout(deadline, async {
            loop {
                let notified = self.notify.notified();
                if let Some(record) = self.record_of(id) {
                    if pred(&record) {
                        return record.heartbeat;
                    }
                }
                notified.await;
            }
        })
        .await
        .ok()
    }

    fn record(&self, heartbeat: HeartBeat) {
        let id = heartbeat.id;
        debug!(agent = id, status = %heartbeat.status, port = %heartbeat.rpc_port, "heartbeat received");
        self.agents
            .entry(id)
            .and_modify(|r| {
                r.heartbeat = heartbeat.clone();
                r.received += 1;
                r.last_seen = Utc::now();
            })
            .or_insert_with(|| {
                info!(agent = id, "new agent reported in");
                AgentRecord {
                    heartbeat: heartbeat.clone(),
                    received: 1,
                    last_seen: Utc::now(),
                }
            });
        self.notify.notify_waiters();
    }

    /// Serve `updateAgentStatus` on `listener` until `cancel` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.connections.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(serve_connection(stream, peer, self.clone(), cancel.child_token()));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

#[async_trait]
impl RpcHandler for ControllerService {
    async fn handle(&self, method: Method, params: Option<Value>) -> Result<Value, jsonrpc::Error> {
        match method {
            Method::UpdateAgentStatus => {
                let req: UpdateAgentStatusRequest =
                    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(jsonrpc::Error::invalid_params)?;
                self.record(req.heartbeat);
                let header = if self.rejecting.load(Ordering::SeqCst) {
                    ResponseHeader::failed("controller is rejecting reports")
                } else {
                    ResponseHeader::ok()
                };
                serde_json::to_value(UpdateAgentStatusResponse { header }).map_err(jsonrpc::Error::internal)
            }
            _ => Err(jsonrpc::Error::new(jsonrpc::METHOD_NOT_FOUND, "Method not found")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_protocol::{control_client::ControllerClient, message::Status};

    #[tokio::test]
    async fn records_heartbeats_per_agent() {
        let service = ControllerService::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        tokio::spawn(service.clone().serve(listener, cancel.clone()));

        let client = ControllerClient::connect(&addr, Duration::from_secs(1)).await.unwrap();
        for status in [Status::Stop, Status::Running] {
            let resp = client
                .update_agent_status(
                    HeartBeat {
                        status,
                        id: 5,
                        rpc_port: "9000".into(),
                        config: b"id: 5\n".to_vec(),
                    },
                    Duration::from_secs(1),
                )
                .await
                .unwrap();
            assert!(resp.header.is_ok());
        }

        assert_eq!(service.agents(), vec![5]);
        assert_eq!(service.count_of(5), 2);
        assert_eq!(service.heartbeat_of(5).unwrap().status, Status::Running);

        service.set_rejecting(true);
        let resp = client
            .update_agent_status(HeartBeat { id: 6, ..Default::default() }, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!resp.header.is_ok());
        assert_eq!(service.count_of(6), 1);
        assert_eq!(service.connections(), 1);
        cancel.cancel();
    }
}
