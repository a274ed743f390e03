//! Reconciliation of the server configuration with the container set
//!
//! The configurator owns the live container map. Container starts are
//! staged and debounced so that a compose-style burst of events collapses
//! into a single render, reload, and certificate batch; removals apply
//! immediately. When the certificate manager reports renewed domains, the
//! configuration is rendered again with TLS enabled for them.

use crate::acme::AcmeProvider;
use crate::certmanager::CertManager;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::store::CertStore;
use crate::templates::{self, ServerType, VirtualHost};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Quiet interval before staged container adds are applied.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(10);

/// Where and how the managed server configuration is written.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub server: ServerType,
    /// Configuration file, fully regenerated on every render.
    pub file: PathBuf,
    /// Pidfile of the server process to signal after a render.
    pub pidfile: PathBuf,
    /// `host:port` the port-80 ACME location proxies to.
    pub auth_addr: String,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, Container>,
    tls_domains: HashSet<String>,
}

pub struct Configurator {
    add_tx: mpsc::Sender<Container>,
    remove_tx: mpsc::Sender<String>,
    shared: Arc<Mutex<State>>,
    manager: Arc<CertManager>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Configurator {
    /// Create the configurator, its certificate manager, and start the
    /// reconciliation loop.
    pub fn new(
        cfg: ProxyConfig,
        provider: Box<dyn AcmeProvider>,
        store: Arc<CertStore>,
        challenge_addr: SocketAddr,
    ) -> Configurator {
        let (add_tx, add_rx) = mpsc::channel(16);
        let (remove_tx, remove_rx) = mpsc::channel(16);
        let (renewed_tx, renewed_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let manager = Arc::new(CertManager::new(
            provider,
            store,
            challenge_addr,
            Box::new(move |domains| {
                let _ = renewed_tx.send(domains);
            }),
        ));
        let shared = Arc::new(Mutex::new(State::default()));

        let worker = ConfigLoop {
            cfg,
            manager: Arc::clone(&manager),
            shared: Arc::clone(&shared),
            add_rx,
            remove_rx,
            renewed_rx,
            shutdown_rx,
        };
        let handle = tokio::spawn(worker.run());

        Configurator {
            add_tx,
            remove_tx,
            shared,
            manager,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stage a container for addition on the next debounce fire.
    pub async fn add(&self, container: Container) -> Result<()> {
        self.add_tx.send(container).await.map_err(|_| Error::Canceled)
    }

    /// Remove a container. A container still sitting in the debounce stage
    /// is dropped without any effect on the server.
    pub async fn remove(&self, id: String) -> Result<()> {
        self.remove_tx.send(id).await.map_err(|_| Error::Canceled)
    }

    /// Snapshot of the committed containers, sorted by name.
    pub fn containers(&self) -> Vec<Container> {
        let shared = self.shared.lock();
        let mut out: Vec<Container> = shared.containers.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn cert_manager(&self) -> &Arc<CertManager> {
        &self.manager
    }

    /// Stop the reconciliation loop, then close the certificate manager.
    /// Idempotent.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.manager.close().await;
    }
}

struct ConfigLoop {
    cfg: ProxyConfig,
    manager: Arc<CertManager>,
    shared: Arc<Mutex<State>>,
    add_rx: mpsc::Receiver<Container>,
    remove_rx: mpsc::Receiver<String>,
    renewed_rx: mpsc::UnboundedReceiver<Vec<String>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConfigLoop {
    async fn run(mut self) {
        let mut pending: HashMap<String, Container> = HashMap::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let mut shutdown = self.shutdown_rx.clone();
            tokio::select! {
                _ = shutdown.changed() => return,
                Some(container) = self.add_rx.recv() => {
                    debug!(id = %container.id, domains = ?container.domains, "staging container");
                    pending.insert(container.id.clone(), container);
                    deadline = Some(Instant::now() + DEBOUNCE_WINDOW);
                }
                Some(id) = self.remove_rx.recv() => {
                    if pending.remove(&id).is_some() {
                        debug!(id = %id, "dropped staged container");
                        if pending.is_empty() {
                            deadline = None;
                        }
                    } else {
                        self.remove_container(&id);
                    }
                }
                _ = wait_until(deadline) => {
                    deadline = None;
                    if !pending.is_empty() {
                        self.commit_staged(std::mem::take(&mut pending));
                    }
                }
                Some(domains) = self.renewed_rx.recv() => {
                    self.enable_tls(domains);
                }
            }
        }
    }

    /// Merge the debounce stage into the live set, publish the new
    /// configuration, and hand the domains to the certificate manager.
    fn commit_staged(&self, staged: HashMap<String, Container>) {
        let mut domains = Vec::new();
        {
            let mut shared = self.shared.lock();
            for (id, container) in staged {
                domains.extend(container.domains.iter().cloned());
                shared.containers.insert(id, container);
            }
        }
        info!(domains = ?domains, "adding containers to server configuration");
        self.render_and_reload();
        self.manager.add(domains);
    }

    fn remove_container(&self, id: &str) {
        let domains = {
            let mut shared = self.shared.lock();
            let Some(container) = shared.containers.remove(id) else {
                return;
            };
            for domain in &container.domains {
                shared.tls_domains.remove(domain);
            }
            container.domains
        };
        info!(id = %id, domains = ?domains, "removing container from server configuration");
        self.render_and_reload();
        self.manager.remove(domains);
    }

    fn enable_tls(&self, domains: Vec<String>) {
        info!(domains = ?domains, "enabling TLS for renewed domains");
        {
            let mut shared = self.shared.lock();
            for domain in domains {
                shared.tls_domains.insert(domain);
            }
        }
        self.render_and_reload();
    }

    /// Rewrite the configuration file and signal the server. Reload
    /// failures are logged only: the file on disk remains the source of
    /// truth for the next manual reload.
    fn render_and_reload(&self) {
        if let Err(err) = self.render() {
            error!(error = %err, "failed to write server configuration");
            return;
        }
        if let Err(err) = reload(&self.cfg.pidfile) {
            warn!(error = %err, "failed to reload server");
        }
    }

    fn render(&self) -> Result<()> {
        let view = self.view();
        debug!(
            path = %self.cfg.file.display(),
            hosts = view.len(),
            "writing {} configuration",
            self.cfg.server
        );
        fs::write(&self.cfg.file, templates::render(self.cfg.server, &view))?;
        Ok(())
    }

    /// Build the configuration view: one entry per (container, domain)
    /// pair, ordered by container name then label order.
    fn view(&self) -> Vec<VirtualHost> {
        let shared = self.shared.lock();
        let mut containers: Vec<&Container> = shared.containers.values().collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

        let mut hosts = Vec::new();
        for container in containers {
            for domain in &container.domains {
                hosts.push(VirtualHost {
                    name: domain.clone(),
                    addr: container.addr.clone(),
                    key_path: self.manager.key_path(domain),
                    cert_path: self.manager.cert_path(domain),
                    auth_addr: self.cfg.auth_addr.clone(),
                    enable_tls: shared.tls_domains.contains(domain),
                });
            }
        }
        hosts
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Ask the server process named in the pidfile to reread its
/// configuration.
pub fn reload(pidfile: &Path) -> Result<()> {
    let raw = fs::read_to_string(pidfile).map_err(|source| Error::PidfileUnreadable {
        path: pidfile.to_path_buf(),
        source,
    })?;
    let pid: i32 = raw
        .trim()
        .parse()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| Error::PidfileCorrupt(pidfile.to_path_buf()))?;
    debug!(pid, "signaling server to reload");
    if unsafe { libc::kill(pid, libc::SIGHUP) } != 0 {
        return Err(Error::ReloadFailed {
            pid,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}
