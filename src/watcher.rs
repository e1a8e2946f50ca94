//! Hot reload of the pipeline section from the agent's config file.
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    agent::PIPELINE,
    config::load_config_file,
    manager::{AgentsManager, ManagerError},
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("cannot watch {path}: {source}")]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// What a reload did with the file it read.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reload {
    pub pipeline_applied: bool,
    /// Top-level keys that changed but only take effect after a restart.
    pub ignored: Vec<String>,
}

/// Re-read `path` and apply its `pipeline` section if it differs from the
/// running one.
pub async fn reload(manager: &AgentsManager, path: &Path) -> Result<Reload, ManagerError> {
    let mut content = load_config_file(path)?;
    let current = manager.config();

    let wanted = content.remove(PIPELINE).unwrap_or(Value::Null);
    let running = current.content().get(PIPELINE).cloned().unwrap_or(Value::Null);

    let mut ignored: Vec<String> = content
        .iter()
        .filter(|(k, v)| current.content().get(k.as_str()) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    ignored.extend(
        current
            .content()
            .keys()
            .filter(|k| k.as_str() != PIPELINE && !content.contains_key(k.as_str()))
            .cloned(),
    );
    ignored.sort();

    let pipeline_applied = wanted != running;
    if pipeline_applied {
        manager.update_pipeline(wanted).await?;
    }
    Ok(Reload {
        pipeline_applied,
        ignored,
    })
}

/// Polls one config file and feeds changes to the manager until dropped.
pub struct ConfigWatcher {
    _watcher: PollWatcher,
    dispatch: JoinHandle<()>,
}

impl ConfigWatcher {
    pub fn spawn(path: PathBuf, manager: Arc<AgentsManager>, poll_interval: Duration) -> Result<Self, WatchError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

        let mut watcher = PollWatcher::new(
            move |res| {
                // nobody listening anymore
                let _ = tx.send(res);
            },
            Config::default()
                .with_poll_interval(poll_interval)
                .with_compare_contents(true),
        )
        .map_err(|source| WatchError::Notify {
            path: path.clone(),
            source,
        })?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Notify {
                path: path.clone(),
                source,
            })?;
        info!(path = %path.display(), ?poll_interval, "watching config file");

        let dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(Event {
                        kind: EventKind::Create(_) | EventKind::Modify(_),
                        ..
                    }) => match reload(&manager, &path).await {
                        Ok(outcome) => {
                            if !outcome.ignored.is_empty() {
                                warn!(keys = ?outcome.ignored, "config change needs a restart, ignored");
                            }
                            if !outcome.pipeline_applied {
                                debug!(path = %path.display(), "pipeline unchanged");
                            }
                        }
                        Err(e) => warn!(path = %path.display(), error = %e, "config reload failed"),
                    },
                    Ok(Event {
                        kind: EventKind::Remove(_),
                        ..
                    }) => warn!(path = %path.display(), "config file removed, keeping current config"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "watcher error"),
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            dispatch,
        })
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::parse_content, registry::DriverRegistry};
    use std::fs;
    use tempfile::TempDir;

    const BASE: &str = "id: 3\ncontroller: ''\nrpcport: 0\ninput: ~\noutput: ~\n";

    async fn configured(dir: &TempDir, pipeline: &str) -> (Arc<AgentsManager>, PathBuf) {
        let path = dir.path().join("agent.yaml");
        let text = format!("{BASE}pipeline: {pipeline}\n");
        fs::write(&path, &text).unwrap();
        let manager = AgentsManager::new(DriverRegistry::with_builtins()).await.unwrap();
        manager.set_config(parse_content(text.as_bytes()).unwrap()).await.unwrap();
        (manager, path)
    }

    fn pipeline_type(manager: &AgentsManager) -> Option<String> {
        manager
            .config()
            .section(PIPELINE)
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    #[tokio::test]
    async fn unchanged_file_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let (manager, path) = configured(&tmp, "{type: trim}").await;
        assert_eq!(reload(&manager, &path).await.unwrap(), Reload::default());
    }

    #[tokio::test]
    async fn applies_pipeline_and_reports_other_changes() {
        let tmp = TempDir::new().unwrap();
        let (manager, path) = configured(&tmp, "{type: trim}").await;

        fs::write(
            &path,
            "id: 4\ncontroller: ''\nrpcport: 0\ninput: ~\noutput: ~\npipeline: {type: regex_filter, pattern: err}\n",
        )
        .unwrap();
        let outcome = reload(&manager, &path).await.unwrap();
        assert!(outcome.pipeline_applied);
        assert_eq!(outcome.ignored, ["id"]);
        assert_eq!(pipeline_type(&manager).as_deref(), Some("regex_filter"));
        assert_eq!(manager.config().id, 3);
    }

    #[tokio::test]
    async fn broken_pipeline_keeps_running_one() {
        let tmp = TempDir::new().unwrap();
        let (manager, path) = configured(&tmp, "{type: trim}").await;

        fs::write(&path, format!("{BASE}pipeline: {{type: no_such_step}}\n")).unwrap();
        assert!(reload(&manager, &path).await.is_err());
        assert_eq!(pipeline_type(&manager).as_deref(), Some("trim"));
    }

    #[tokio::test]
    async fn watcher_picks_up_edits() {
        let tmp = TempDir::new().unwrap();
        let (manager, path) = configured(&tmp, "~").await;
        let _watcher = ConfigWatcher::spawn(path.clone(), manager.clone(), Duration::from_millis(50)).unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        fs::write(&path, format!("{BASE}pipeline: {{type: trim}}\n")).unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline_type(&manager).is_none() {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await;
        assert!(seen.is_ok(), "edit was not applied");
    }
}
