use std::{
    io::{BufRead, BufReader},
    sync::{Arc, OnceLock},
};

use agent_protocol::{DriverError, InputDriver, Record, driver::parse_config};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex, mpsc},
};
use tracing::{debug, warn};

pub const NAME: &str = "console";

const LINE_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
struct ConsoleConfig {
    #[serde(default = "default_prompt")]
    prompt: String,
    #[serde(default = "default_field")]
    field: String,
}

fn default_prompt() -> String {
    ">".to_string()
}

fn default_field() -> String {
    "message".to_string()
}

type Lines = Arc<Mutex<mpsc::Receiver<std::io::Result<String>>>>;

/// Read `reader` line by line on a dedicated OS thread. A read blocked on
/// that thread is never waited for by the runtime, so a stopped input does
/// not hold up process exit.
fn spawn_line_reader<R>(mut reader: R) -> Lines
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    let spawned = std::thread::Builder::new()
        .name("console-input".into())
        .spawn(move || {
            loop {
                let mut line = String::new();
                let item = match reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => Ok(line),
                    Err(e) => Err(e),
                };
                let failed = item.is_err();
                if tx.blocking_send(item).is_err() || failed {
                    break;
                }
            }
            debug!("console reader finished");
        });
    if let Err(e) = spawned {
        warn!(error = %e, "could not start console reader, input is exhausted");
    }
    Arc::new(Mutex::new(rx))
}

/// Process stdin, shared by every console input so a replaced driver does
/// not lose a line to its predecessor's reader.
fn stdin_lines() -> Lines {
    static STDIN: OnceLock<Lines> = OnceLock::new();
    STDIN
        .get_or_init(|| spawn_line_reader(BufReader::new(std::io::stdin())))
        .clone()
}

/// Reads one line per record from a terminal. The line is kept verbatim,
/// trailing newline included; end of input exhausts the source.
pub struct ConsoleInput {
    prompt: String,
    field: String,
    /// Stdin is attached on the first `emit`, so building the driver for a
    /// dry run reads nothing.
    lines: Option<Lines>,
    echo: Box<dyn AsyncWrite + Send + Unpin>,
}

impl ConsoleInput {
    pub fn from_config(config: &Value) -> Result<Self, DriverError> {
        let cfg: ConsoleConfig = parse_config(NAME, config)?;
        Ok(Self {
            prompt: cfg.prompt,
            field: cfg.field,
            lines: None,
            echo: Box::new(tokio::io::stdout()),
        })
    }

    /// Read from `reader` and write prompts to `echo` instead of the terminal.
    pub fn with_io<R, W>(mut self, reader: R, echo: W) -> Self
    where
        R: BufRead + Send + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.lines = Some(spawn_line_reader(reader));
        self.echo = Box::new(echo);
        self
    }
}

#[async_trait]
impl InputDriver for ConsoleInput {
    fn name(&self) -> &str {
        NAME
    }

    async fn emit(&mut self) -> Result<Option<Record>, DriverError> {
        if !self.prompt.is_empty() {
            self.echo.write_all(self.prompt.as_bytes()).await?;
            self.echo.flush().await?;
        }
        let lines = self.lines.get_or_insert_with(stdin_lines).clone();
        let Some(line) = lines.lock().await.recv().await else {
            return Ok(None);
        };
        let mut record = Record::new();
        record.insert(self.field.clone(), Value::String(line?));
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn emits_lines_then_exhausts() {
        let (echo_w, mut echo_r) = tokio::io::duplex(64);
        let mut console = ConsoleInput::from_config(&json!({"type": "console", "prompt": "$ "}))
            .unwrap()
            .with_io(&b"a\nb\n"[..], echo_w);

        assert_eq!(console.emit().await.unwrap().unwrap()["message"], json!("a\n"));
        assert_eq!(console.emit().await.unwrap().unwrap()["message"], json!("b\n"));
        assert!(console.emit().await.unwrap().is_none());

        let mut prompts = vec![0u8; 6];
        tokio::io::AsyncReadExt::read_exact(&mut echo_r, &mut prompts).await.unwrap();
        assert_eq!(&prompts, b"$ $ $ ");
    }

    /// A reader fed chunk by chunk from the test; blocks while no chunk is
    /// queued and reports end of input once the sender is dropped.
    struct Chunks(std::sync::mpsc::Receiver<Vec<u8>>);

    impl std::io::Read for Chunks {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let Ok(chunk) = self.0.recv() else {
                return Ok(0);
            };
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn blocked_read_does_not_hold_runtime_shutdown() {
        let (release, held) = std::sync::mpsc::channel();
        let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap();
        let started = Instant::now();
        runtime.block_on(async {
            let mut console = ConsoleInput::from_config(&json!({"type": "console", "prompt": ""}))
                .unwrap()
                .with_io(BufReader::new(Chunks(held)), tokio::io::sink());
            let pending = tokio::time::timeout(Duration::from_millis(50), console.emit()).await;
            assert!(pending.is_err());
        });
        drop(runtime);
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(release);
    }

    #[tokio::test]
    async fn cancelled_emit_loses_no_line() {
        let (feed, read) = std::sync::mpsc::channel();
        let mut console = ConsoleInput::from_config(&json!({"type": "console", "prompt": ""}))
            .unwrap()
            .with_io(BufReader::new(Chunks(read)), tokio::io::sink());

        assert!(tokio::time::timeout(Duration::from_millis(50), console.emit()).await.is_err());
        feed.send(b"late\n".to_vec()).unwrap();
        assert_eq!(console.emit().await.unwrap().unwrap()["message"], json!("late\n"));

        drop(feed);
        assert!(console.emit().await.unwrap().is_none());
    }
}
