//! Docker engine event loop
//!
//! Maintains a single connection to the engine: on connect, every running
//! container is pushed to the configurator, then a filtered event stream
//! keeps the set current. A broken stream is retried every thirty seconds
//! until the watcher is closed.

use crate::configurator::Configurator;
use crate::container::Container;
use crate::error::{Error, Result};
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerInspectResponse, ContainerSummary};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Engine URI, e.g. `unix:///var/run/docker.sock` or `tcp://host:2375`.
    pub host: String,
}

pub struct Watcher {
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    /// Create the watcher and immediately begin connecting to the engine.
    pub fn new(cfg: WatcherConfig, configurator: Arc<Configurator>) -> Watcher {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(cfg, configurator, shutdown_rx));
        Watcher {
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop watching and wait for the loop to exit. Idempotent.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run(cfg: WatcherConfig, configurator: Arc<Configurator>, shutdown_rx: watch::Receiver<bool>) {
    loop {
        match connect(&cfg.host) {
            Ok(client) => match watch_events(&client, &configurator, shutdown_rx.clone()).await {
                Ok(()) => return,
                Err(err) => error!(error = %err, "event stream failed"),
            },
            Err(err) => error!(host = %cfg.host, error = %err, "failed to connect to engine"),
        }

        info!(delay = ?RECONNECT_DELAY, "reconnecting to engine");
        let mut shutdown = shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = shutdown.changed() => return,
        }
    }
}

fn connect(host: &str) -> Result<Docker> {
    if let Some(path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(path, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            .map_err(Error::Engine)
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            .map_err(Error::Engine)
    } else {
        Err(Error::Fatal(format!(
            "invalid docker host '{host}': expected unix:// or tcp://"
        )))
    }
}

/// Push the containers already running, then translate events until the
/// stream breaks or the watcher is closed. `Ok(())` means a clean
/// shutdown.
async fn watch_events(
    client: &Docker,
    configurator: &Configurator,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    client.ping().await?;
    info!("connected to engine");

    let running = client
        .list_containers(Some(ListContainersOptions::<String>::default()))
        .await?;
    for summary in &running {
        if let Some(container) = container_from_summary(summary) {
            info!(id = %container.id, domains = ?container.domains, "discovered running container");
            if configurator.add(container).await.is_err() {
                return Ok(());
            }
        }
    }

    let mut filters = HashMap::new();
    filters.insert(
        "event".to_string(),
        vec!["start".to_string(), "die".to_string()],
    );
    let mut events = client.events(Some(EventsOptions::<String> {
        filters,
        ..Default::default()
    }));

    let mut shutdown = shutdown_rx;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            event = events.next() => match event {
                Some(Ok(message)) => {
                    let Some(id) = message.actor.and_then(|actor| actor.id) else {
                        continue;
                    };
                    match message.action.as_deref() {
                        Some("start") => {
                            if handle_start(client, configurator, &id).await.is_err() {
                                return Ok(());
                            }
                        }
                        Some("die") => {
                            debug!(id = %id, "container died");
                            if configurator.remove(id).await.is_err() {
                                return Ok(());
                            }
                        }
                        _ => {}
                    }
                }
                Some(Err(err)) => return Err(err.into()),
                None => return Err(Error::Fatal("event stream closed".into())),
            }
        }
    }
}

/// Inspect a started container and hand it to the configurator when it
/// carries the proxy labels. The error is only returned when the
/// configurator is gone.
async fn handle_start(client: &Docker, configurator: &Configurator, id: &str) -> Result<()> {
    let details = match client.inspect_container(id, None).await {
        Ok(details) => details,
        Err(err) => {
            warn!(id = %id, error = %err, "failed to inspect container");
            return Ok(());
        }
    };
    match container_from_inspect(&details) {
        Some(container) => {
            info!(id = %container.id, domains = ?container.domains, "container started");
            configurator.add(container).await
        }
        None => {
            debug!(id = %id, "container has no proxy labels");
            Ok(())
        }
    }
}

fn container_from_summary(summary: &ContainerSummary) -> Option<Container> {
    let id = summary.id.as_deref()?;
    let name = summary
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|name| name.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.to_string());
    Container::from_labels(id, &name, summary.labels.as_ref()?)
}

fn container_from_inspect(details: &ContainerInspectResponse) -> Option<Container> {
    let id = details.id.as_deref()?;
    let name = details
        .name
        .as_deref()
        .map(|name| name.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.to_string());
    let labels = details.config.as_ref()?.labels.as_ref()?;
    Container::from_labels(id, &name, labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::ContainerConfig;

    fn labels() -> HashMap<String, String> {
        HashMap::from([
            ("cloudanchor.domains".to_string(), "example.test".to_string()),
            ("cloudanchor.addr".to_string(), "10.0.0.5:8080".to_string()),
        ])
    }

    #[test]
    fn test_container_from_summary() {
        let summary = ContainerSummary {
            id: Some("c1".to_string()),
            names: Some(vec!["/web".to_string()]),
            labels: Some(labels()),
            ..Default::default()
        };
        let container = container_from_summary(&summary).unwrap();
        assert_eq!(container.id, "c1");
        assert_eq!(container.name, "web");
        assert_eq!(container.domains, vec!["example.test"]);
    }

    #[test]
    fn test_container_from_summary_without_labels() {
        let summary = ContainerSummary {
            id: Some("c1".to_string()),
            ..Default::default()
        };
        assert!(container_from_summary(&summary).is_none());
    }

    #[test]
    fn test_container_from_inspect() {
        let details = ContainerInspectResponse {
            id: Some("c2".to_string()),
            name: Some("/api".to_string()),
            config: Some(ContainerConfig {
                labels: Some(labels()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let container = container_from_inspect(&details).unwrap();
        assert_eq!(container.id, "c2");
        assert_eq!(container.name, "api");
        assert_eq!(container.addr, "10.0.0.5:8080");
    }

    #[test]
    fn test_connect_rejects_unknown_scheme() {
        assert!(matches!(connect("ssh://host"), Err(Error::Fatal(_))));
    }
}
