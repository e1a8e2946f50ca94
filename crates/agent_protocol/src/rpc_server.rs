//! Line-framed JSON-RPC server. Each accepted TCP connection gets its own task
//! that reads one request per line, dispatches it to an [`RpcHandler`] and
//! writes the response back on the same connection.
//!
//! * Requests → method dispatch → JSON-RPC response
//! * Notifications (no `id`) → handled, no response
//! * Unparsable lines → `-32700`, unknown methods → `-32601`

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, UnboundedSender},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::jsonrpc::{self, Id, Message, Method, Request, Response};

#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, method: Method, params: Option<Value>) -> Result<Value, jsonrpc::Error>;
}

/// Accept connections until `cancel` fires.
pub async fn serve<H>(listener: TcpListener, handler: Arc<H>, cancel: CancellationToken)
where
    H: RpcHandler + ?Sized,
{
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    info!(addr = %local, "control rpc server listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = handler.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        serve_connection(stream, peer, handler, cancel).await;
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }
    info!(addr = %local, "control rpc server stopped");
}

/// Serve a single already-accepted connection until the peer hangs up or
/// `cancel` fires.
pub async fn serve_connection<H>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    cancel: CancellationToken,
) where
    H: RpcHandler + ?Sized,
{
    debug!(%peer, "control connection accepted");
    let (read, write) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut w = BufWriter::new(write);
        while let Some(line) = rx.recv().await {
            if w.write_all(line.as_bytes()).await.is_err() || w.flush().await.is_err() {
                break;
            }
        }
    });

    let mut reader = BufReader::new(read);
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_line(&mut line) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%peer, error = %e, "control connection read failed");
                break;
            }
        }
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        match serde_json::from_str::<Message>(text) {
            Ok(Message::Request(req)) => handle_request(handler.as_ref(), req, &tx).await,
            Ok(Message::Response(_)) => {}
            Err(e) => enqueue(
                &tx,
                Response::fail(
                    Id::Null,
                    jsonrpc::Error {
                        code: jsonrpc::PARSE_ERROR,
                        message: "Parse error".into(),
                        data: Some(Value::String(e.to_string())),
                    },
                ),
            ),
        }
    }

    drop(tx);
    let _ = writer.await;
    debug!(%peer, "control connection closed");
}

fn enqueue(tx: &UnboundedSender<String>, resp: Response) {
    match serde_json::to_string(&resp) {
        Ok(mut line) => {
            line.push('\n');
            let _ = tx.send(line);
        }
        Err(e) => warn!(error = %e, "could not encode rpc response"),
    }
}

async fn handle_request<H>(handler: &H, req: Request, tx: &UnboundedSender<String>)
where
    H: RpcHandler + ?Sized,
{
    let result = match req.method.parse::<Method>() {
        Ok(method) => handler.handle(method, req.params).await,
        Err(_) => Err(jsonrpc::Error::new(
            jsonrpc::METHOD_NOT_FOUND,
            "Method not found",
        )),
    };

    let Some(id) = req.id else {
        if let Err(e) = result {
            debug!(method = %req.method, code = e.code, "notification failed");
        }
        return;
    };
    match result {
        Ok(value) => enqueue(tx, Response::success(id, value)),
        Err(err) => enqueue(tx, Response::fail(id, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(
            &self,
            method: Method,
            params: Option<Value>,
        ) -> Result<Value, jsonrpc::Error> {
            match method {
                Method::GetHeartBeat => Ok(json!({"echo": params})),
                _ => Err(jsonrpc::Error::invalid_params("unsupported here")),
            }
        }
    }

    async fn start() -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::new(Echo), cancel.clone()));
        (addr, cancel)
    }

    async fn roundtrip(addr: SocketAddr, lines: &[&str], expect: usize) -> Vec<Value> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        for l in lines {
            write.write_all(format!("{l}\n").as_bytes()).await.unwrap();
        }
        let mut reader = BufReader::new(read);
        let mut out = Vec::new();
        for _ in 0..expect {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            out.push(serde_json::from_str(line.trim()).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn dispatches_and_reports_errors() {
        let (addr, cancel) = start().await;
        let replies = roundtrip(
            addr,
            &[
                r#"{"jsonrpc":"2.0","method":"getHeartBeat","params":{"a":1},"id":1}"#,
                r#"{"jsonrpc":"2.0","method":"nope","id":2}"#,
                r#"not json"#,
                r#"{"jsonrpc":"2.0","method":"updateConfig","id":"x"}"#,
            ],
            4,
        )
        .await;

        assert_eq!(replies[0]["result"]["echo"], json!({"a": 1}));
        assert_eq!(replies[0]["id"], json!(1));
        assert_eq!(replies[1]["error"]["code"], json!(jsonrpc::METHOD_NOT_FOUND));
        assert_eq!(replies[2]["error"]["code"], json!(jsonrpc::PARSE_ERROR));
        assert_eq!(replies[2]["id"], Value::Null);
        assert_eq!(replies[3]["error"]["code"], json!(jsonrpc::INVALID_PARAMS));
        cancel.cancel();
    }

    #[tokio::test]
    async fn notifications_get_no_reply() {
        let (addr, cancel) = start().await;
        let replies = roundtrip(
            addr,
            &[
                r#"{"jsonrpc":"2.0","method":"getHeartBeat"}"#,
                r#"{"jsonrpc":"2.0","method":"getHeartBeat","id":9}"#,
            ],
            1,
        )
        .await;
        assert_eq!(replies[0]["id"], json!(9));
        cancel.cancel();
    }
}
