//! Certificate lifecycle management
//!
//! Tracks one state record per domain, issues certificates for pending
//! domains, and renews existing ones ahead of expiry. All issuance runs on
//! a single loop task: domains are marked, batched into one order, proven
//! via HTTP-01 one at a time, and written to the store before the caller
//! is notified through the renewal callback.

use crate::acme::AcmeProvider;
use crate::error::{Error, Result};
use crate::keys;
use crate::responder::ChallengeResponder;
use crate::store::{CertStore, FileKind, ACCOUNT_SLUG};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Renewals start this far ahead of expiry, leaving ample room for CA
/// outages within a 90-day validity.
const RENEW_HEADROOM_DAYS: i64 = 14;

/// Fixed delay before a failed loop pass is retried.
const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Invoked with the renewed domains after their files are durably written,
/// so the proxy configuration can be re-rendered with TLS enabled.
pub type RenewedCallback = Box<dyn Fn(Vec<String>) + Send + Sync>;

/// Lifecycle stage of a tracked domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Known but not in use; files may still exist on disk.
    Inactive,
    /// Certificate on disk and tracked for renewal.
    Active,
    /// Marked for issuance on the next loop pass.
    Pending,
    /// Issuance in flight.
    Renewing,
    /// Removed while issuance was in flight; becomes inactive when the
    /// flight lands.
    Canceled,
}

#[derive(Debug)]
struct DomainState {
    active: bool,
    current: Lifecycle,
    expires_at: Option<DateTime<Utc>>,
}

/// Snapshot of one domain's state, for observability and tests.
#[derive(Debug, Clone)]
pub struct DomainStatus {
    pub domain: String,
    pub active: bool,
    pub lifecycle: Lifecycle,
    pub expires_at: Option<DateTime<Utc>>,
}

type DomainMap = HashMap<String, DomainState>;

pub struct CertManager {
    store: Arc<CertStore>,
    shared: Arc<Mutex<DomainMap>>,
    trigger_tx: mpsc::Sender<()>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CertManager {
    /// Create the manager and start its renewal loop.
    pub fn new(
        provider: Box<dyn AcmeProvider>,
        store: Arc<CertStore>,
        challenge_addr: SocketAddr,
        callback: RenewedCallback,
    ) -> CertManager {
        let shared = Arc::new(Mutex::new(DomainMap::new()));
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let renewal = ManagerLoop {
            provider,
            store: Arc::clone(&store),
            shared: Arc::clone(&shared),
            responder: ChallengeResponder::new(challenge_addr),
            callback,
            trigger_rx,
            shutdown_rx,
        };
        let handle = tokio::spawn(renewal.run());

        CertManager {
            store,
            shared,
            trigger_tx,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Mark domains as in use. Unknown domains are created pending
    /// issuance; known ones are reactivated. Idempotent and non-blocking:
    /// issuance happens on the manager's own loop.
    pub fn add<I>(&self, domains: I)
    where
        I: IntoIterator<Item = String>,
    {
        {
            let mut shared = self.shared.lock();
            for domain in domains {
                match shared.get_mut(&domain) {
                    Some(state) => {
                        match state.current {
                            Lifecycle::Inactive => state.current = Lifecycle::Active,
                            Lifecycle::Canceled => state.current = Lifecycle::Renewing,
                            _ => {}
                        }
                        state.active = true;
                    }
                    None => {
                        debug!(domain = %domain, "tracking new domain");
                        shared.insert(
                            domain,
                            DomainState {
                                active: true,
                                current: Lifecycle::Pending,
                                expires_at: None,
                            },
                        );
                    }
                }
            }
        }
        let _ = self.trigger_tx.try_send(());
    }

    /// Mark domains as no longer in use. Files on disk are kept; an
    /// in-flight renewal for the domain is canceled.
    pub fn remove<I>(&self, domains: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut shared = self.shared.lock();
        for domain in domains {
            if let Some(state) = shared.get_mut(&domain) {
                match state.current {
                    Lifecycle::Pending => state.current = Lifecycle::Inactive,
                    Lifecycle::Renewing => state.current = Lifecycle::Canceled,
                    _ => {}
                }
                state.active = false;
            }
        }
    }

    /// Path of the domain's private key, regardless of issuance status.
    pub fn key_path(&self, domain: &str) -> PathBuf {
        self.store.path(&CertStore::slug(domain), FileKind::Key)
    }

    /// Path of the domain's certificate bundle, regardless of issuance
    /// status.
    pub fn cert_path(&self, domain: &str) -> PathBuf {
        self.store.path(&CertStore::slug(domain), FileKind::Cert)
    }

    /// Snapshot of every tracked domain, sorted by name.
    pub fn domains(&self) -> Vec<DomainStatus> {
        let shared = self.shared.lock();
        let mut out: Vec<DomainStatus> = shared
            .iter()
            .map(|(domain, state)| DomainStatus {
                domain: domain.clone(),
                active: state.active,
                lifecycle: state.current,
                expires_at: state.expires_at,
            })
            .collect();
        out.sort_by(|a, b| a.domain.cmp(&b.domain));
        out
    }

    /// Stop the renewal loop and wait for it to drain. Idempotent.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct ManagerLoop {
    provider: Box<dyn AcmeProvider>,
    store: Arc<CertStore>,
    shared: Arc<Mutex<DomainMap>>,
    responder: ChallengeResponder,
    callback: RenewedCallback,
    trigger_rx: mpsc::Receiver<()>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ManagerLoop {
    async fn run(mut self) {
        loop {
            let mut shutdown = self.shutdown_rx.clone();
            let init = tokio::select! {
                _ = shutdown.changed() => return,
                result = self.init() => result,
            };
            match init {
                Ok(()) => break,
                Err(err) => {
                    error!(error = %err, "certificate manager initialization failed");
                    if !self.backoff().await {
                        return;
                    }
                }
            }
        }

        loop {
            let wait = self.next_trigger();
            let mut shutdown = self.shutdown_rx.clone();
            tokio::select! {
                _ = shutdown.changed() => return,
                Some(()) = self.trigger_rx.recv() => {}
                _ = wait_for(wait) => {}
            }

            let batch = self.take_pending();
            if batch.is_empty() {
                continue;
            }
            info!(domains = ?batch, "renewing certificate");

            let mut shutdown = self.shutdown_rx.clone();
            let result = tokio::select! {
                _ = shutdown.changed() => Err(Error::Canceled),
                result = self.renew_batch(&batch) => result,
            };
            match result {
                Ok((renewed, expires)) => {
                    info!(domains = ?renewed, expires = %expires, "renewal complete");
                    if !renewed.is_empty() {
                        (self.callback)(renewed);
                    }
                }
                // Shutdown aborts the flight without touching the batch;
                // state is rebuilt from disk on the next start.
                Err(Error::Canceled) => return,
                Err(err) => {
                    error!(error = %err, "certificate renewal failed");
                    self.revert(&batch);
                    if !self.backoff().await {
                        return;
                    }
                }
            }
        }
    }

    /// Adopt or register the ACME account, then take stock of the store.
    async fn init(&mut self) -> Result<()> {
        let saved = self.store.read_key(ACCOUNT_SLUG)?;
        if let Some(credentials) = self.provider.init_account(saved.as_deref()).await? {
            self.store.write_key(ACCOUNT_SLUG, &credentials)?;
        }
        self.load_certs()
    }

    /// Materialize domain state for every stored certificate, deleting the
    /// files of any that is unusable.
    fn load_certs(&mut self) -> Result<()> {
        for slug in self.store.cert_slugs()? {
            let Some(domain) = CertStore::domain_for_file(&format!("{slug}.crt")) else {
                continue;
            };
            match self.load_cert(&slug) {
                Ok(expires_at) => {
                    debug!(domain = %domain, expires = %expires_at, "loaded certificate");
                    self.shared.lock().insert(
                        domain,
                        DomainState {
                            active: false,
                            current: Lifecycle::Active,
                            expires_at: Some(expires_at),
                        },
                    );
                }
                Err(err) => {
                    warn!(domain = %domain, error = %err, "removing unusable certificate");
                    self.store.remove(&slug)?;
                }
            }
        }
        Ok(())
    }

    fn load_cert(&self, slug: &str) -> Result<DateTime<Utc>> {
        if self.store.read_key(slug)?.is_none() {
            return Err(Error::InvalidKey);
        }
        let bundle = self.store.read_bundle(slug)?.ok_or(Error::InvalidCert)?;
        let ders = keys::decode_cert_bundle(&bundle)?;
        let expires_at = keys::not_after(&ders[0])?;
        if Utc::now() >= expires_at {
            return Err(Error::InvalidCert);
        }
        Ok(expires_at)
    }

    fn take_pending(&self) -> Vec<String> {
        select_pending(&mut self.shared.lock(), Utc::now())
    }

    fn next_trigger(&self) -> Option<Duration> {
        compute_next_trigger(&self.shared.lock(), Utc::now())
    }

    /// Run the full issuance flow for one batch of domains.
    async fn renew_batch(&mut self, domains: &[String]) -> Result<(Vec<String>, DateTime<Utc>)> {
        if domains.is_empty() {
            return Err(Error::NoDomains);
        }

        let mut order = self.provider.new_order(domains).await?;
        let authorizations = order.authorizations().await?;
        for auth in &authorizations {
            if auth.valid {
                debug!(domain = %auth.domain, "authorization already valid");
                continue;
            }
            let challenge = auth
                .http01
                .as_ref()
                .ok_or_else(|| Error::NoChallenges(auth.domain.clone()))?;
            debug!(domain = %auth.domain, token = %challenge.token, "performing http-01 challenge");
            let listener = self
                .responder
                .serve(&challenge.token, &challenge.response)
                .await?;
            let outcome = async {
                order.ready(&challenge.url).await?;
                order.wait_authorized(&auth.domain).await
            }
            .await;
            listener.stop().await;
            outcome?;
        }

        let key = tokio::task::spawn_blocking(keys::generate_key)
            .await
            .map_err(|_| Error::Canceled)??;
        let csr = keys::build_csr(&key, domains)?;
        let chain = order.issue(&csr).await?;

        let ders = keys::decode_cert_bundle(&chain)?;
        let expires_at = keys::not_after(&ders[0])?;
        let key_pem = keys::encode_private_key(&key)?;
        for domain in domains {
            let slug = CertStore::slug(domain);
            self.store.write_key(&slug, key_pem.as_bytes())?;
            self.store.write_cert_bundle(&slug, chain.as_bytes())?;
        }

        Ok((self.commit(domains, expires_at), expires_at))
    }

    /// Final transitions after the files for a batch are on disk. Returns
    /// the domains that ended up active.
    fn commit(&self, domains: &[String], expires_at: DateTime<Utc>) -> Vec<String> {
        let mut shared = self.shared.lock();
        let mut renewed = Vec::new();
        for domain in domains {
            if let Some(state) = shared.get_mut(domain) {
                state.expires_at = Some(expires_at);
                if state.current == Lifecycle::Canceled {
                    state.current = Lifecycle::Inactive;
                } else {
                    state.current = Lifecycle::Active;
                    renewed.push(domain.clone());
                }
            }
        }
        renewed
    }

    /// Roll a failed batch back so the next pass retries it.
    fn revert(&self, domains: &[String]) {
        let mut shared = self.shared.lock();
        for domain in domains {
            if let Some(state) = shared.get_mut(domain) {
                match state.current {
                    Lifecycle::Canceled => state.current = Lifecycle::Inactive,
                    Lifecycle::Renewing => state.current = Lifecycle::Pending,
                    _ => {}
                }
            }
        }
    }

    /// Sleep out the retry delay; false when shut down in the meantime.
    async fn backoff(&mut self) -> bool {
        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(RETRY_DELAY) => true,
            _ = shutdown.changed() => false,
        }
    }
}

async fn wait_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

fn renew_at(state: &DomainState) -> DateTime<Utc> {
    state.expires_at.unwrap_or(DateTime::UNIX_EPOCH) - chrono::Duration::days(RENEW_HEADROOM_DAYS)
}

/// Collect the domains due for renewal and mark them in flight: every
/// active domain that is pending or whose certificate expires within the
/// headroom.
fn select_pending(map: &mut DomainMap, now: DateTime<Utc>) -> Vec<String> {
    let mut due = Vec::new();
    for (domain, state) in map.iter_mut() {
        if !state.active {
            continue;
        }
        let expiring = state.current == Lifecycle::Active && now >= renew_at(state);
        if state.current == Lifecycle::Pending || expiring {
            state.current = Lifecycle::Renewing;
            due.push(domain.clone());
        }
    }
    due.sort();
    due
}

/// Delay until the next scheduled pass, `None` when there is nothing to
/// watch.
fn compute_next_trigger(map: &DomainMap, now: DateTime<Utc>) -> Option<Duration> {
    let mut next: Option<DateTime<Utc>> = None;
    for state in map.values() {
        if !state.active {
            continue;
        }
        match state.current {
            Lifecycle::Pending => return Some(Duration::ZERO),
            Lifecycle::Active => {
                let at = renew_at(state);
                if next.map(|n| at < n).unwrap_or(true) {
                    next = Some(at);
                }
            }
            _ => {}
        }
    }
    next.map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
}
