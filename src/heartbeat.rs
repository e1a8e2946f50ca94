//! Push loop that keeps the controller informed about this agent.
//!
//! Connect, push a heartbeat every `interval`, reconnect after a fixed backoff
//! when the connection is lost. Nothing in here is fatal: the loop only ends
//! when its cancellation token fires.
use std::{sync::Arc, time::Duration};

use agent_protocol::{control_client::ControllerClient, message::HeartBeat};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::HeartbeatSettings;

/// Anything that can describe the agent's current status.
pub trait HeartbeatSource: Send + Sync + 'static {
    fn heartbeat(&self) -> HeartBeat;
}

/// Spawn the loop, or do nothing when no controller is configured.
pub fn spawn<S>(
    source: Arc<S>,
    controller: &str,
    settings: HeartbeatSettings,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>>
where
    S: HeartbeatSource + ?Sized,
{
    let controller = controller.trim();
    if controller.is_empty() {
        info!("no controller configured, running headless");
        return None;
    }
    let controller = controller.to_string();
    Some(tokio::spawn(async move {
        run(source, controller, settings, cancel).await;
    }))
}

/// Returns true when cancelled before `d` elapsed.
async fn pause(cancel: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(d) => false,
    }
}

pub async fn run<S>(source: Arc<S>, controller: String, settings: HeartbeatSettings, cancel: CancellationToken)
where
    S: HeartbeatSource + ?Sized,
{
    info!(%controller, interval = ?settings.interval(), "heartbeat loop started");
    let mut attempts: u64 = 0;

    'reconnect: loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => break 'reconnect,
            c = ControllerClient::connect(&controller, settings.connect_timeout()) => c,
        };
        let client = match connected {
            Ok(client) => {
                info!(%controller, attempts, "connected to controller");
                attempts = 0;
                client
            }
            Err(e) => {
                attempts += 1;
                warn!(%controller, attempts, error = %e, retry_in = ?settings.reconnect_backoff(), "controller unreachable");
                if pause(&cancel, settings.reconnect_backoff()).await {
                    break 'reconnect;
                }
                continue 'reconnect;
            }
        };

        loop {
            let heartbeat = source.heartbeat();
            let pushed = tokio::select! {
                _ = cancel.cancelled() => break 'reconnect,
                r = client.update_agent_status(heartbeat, settings.request_timeout()) => r,
            };
            match pushed {
                Ok(resp) if resp.header.is_ok() => trace!(%controller, "heartbeat delivered"),
                Ok(resp) => warn!(%controller, message = %resp.header.error.message, "controller rejected heartbeat"),
                Err(e) if e.is_connection_lost() => {
                    warn!(%controller, error = %e, "controller connection lost, reconnecting");
                    continue 'reconnect;
                }
                Err(e) => warn!(%controller, error = %e, "heartbeat push failed"),
            }
            if pause(&cancel, settings.interval()).await {
                break 'reconnect;
            }
        }
    }
    debug!(%controller, "heartbeat loop stopped");
}
