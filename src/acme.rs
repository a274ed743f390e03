//! Narrow facade over the ACME client
//!
//! The certificate manager drives issuance through the [`AcmeProvider`]
//! and [`AcmeOrder`] traits so that the renewal state machine can be
//! exercised against a test double. The production implementation wraps
//! `instant-acme`.

use crate::error::{Error, Result};
use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Directory URL used when none is configured. Staging keeps development
/// runs clear of production rate limits.
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_ATTEMPTS: u32 = 30;

/// Well-known path at which an HTTP-01 token must be served.
pub fn http01_path(token: &str) -> String {
    format!("/.well-known/acme-challenge/{token}")
}

/// An `http-01` challenge offered for a domain, together with the
/// key-authorization bytes the responder must serve.
#[derive(Debug, Clone)]
pub struct Http01Challenge {
    pub token: String,
    pub url: String,
    pub response: String,
}

/// Authorization state for one domain of an order.
#[derive(Debug, Clone)]
pub struct DomainAuthorization {
    pub domain: String,
    /// Already proven, no challenge required.
    pub valid: bool,
    pub http01: Option<Http01Challenge>,
}

#[async_trait]
pub trait AcmeOrder: Send {
    /// Current authorizations for every domain in the order.
    async fn authorizations(&mut self) -> Result<Vec<DomainAuthorization>>;

    /// Tell the CA the challenge response is in place.
    async fn ready(&mut self, challenge_url: &str) -> Result<()>;

    /// Block until the CA has validated (or rejected) the domain.
    async fn wait_authorized(&mut self, domain: &str) -> Result<()>;

    /// Finalize the order with a CSR and fetch the PEM certificate chain.
    async fn issue(&mut self, csr_der: &[u8]) -> Result<String>;
}

#[async_trait]
pub trait AcmeProvider: Send + Sync {
    /// Adopt previously persisted account credentials, or register a new
    /// account with the CA (terms of service accepted). Returns the
    /// credential bytes to persist when a registration happened.
    async fn init_account(&mut self, saved: Option<&[u8]>) -> Result<Option<Vec<u8>>>;

    /// Open a new order covering the given domains.
    async fn new_order(&self, domains: &[String]) -> Result<Box<dyn AcmeOrder>>;
}

/// ACME directory backed by `instant-acme`.
pub struct AcmeDirectory {
    url: String,
    account: Option<Account>,
}

impl AcmeDirectory {
    pub fn new(url: impl Into<String>) -> AcmeDirectory {
        AcmeDirectory {
            url: url.into(),
            account: None,
        }
    }
}

#[async_trait]
impl AcmeProvider for AcmeDirectory {
    async fn init_account(&mut self, saved: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = saved {
            match serde_json::from_slice::<AccountCredentials>(bytes) {
                Ok(credentials) => match Account::from_credentials(credentials).await {
                    Ok(account) => {
                        debug!("adopted existing ACME account");
                        self.account = Some(account);
                        return Ok(None);
                    }
                    Err(err) => {
                        warn!(error = %err, "saved ACME account rejected, registering a new one")
                    }
                },
                Err(err) => {
                    warn!(error = %err, "saved ACME credentials unreadable, registering a new one")
                }
            }
        }

        info!(directory = %self.url, "registering new ACME account");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.url,
            None,
        )
        .await
        .map_err(Error::acme)?;
        let bytes = serde_json::to_vec(&credentials).map_err(Error::acme)?;
        self.account = Some(account);
        Ok(Some(bytes))
    }

    async fn new_order(&self, domains: &[String]) -> Result<Box<dyn AcmeOrder>> {
        let account = self
            .account
            .as_ref()
            .ok_or_else(|| Error::Fatal("ACME account not initialized".into()))?;
        let identifiers: Vec<Identifier> =
            domains.iter().map(|d| Identifier::Dns(d.clone())).collect();
        let order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(Error::acme)?;
        Ok(Box::new(LiveOrder { order }))
    }
}

struct LiveOrder {
    order: Order,
}

#[async_trait]
impl AcmeOrder for LiveOrder {
    async fn authorizations(&mut self) -> Result<Vec<DomainAuthorization>> {
        let authorizations = self.order.authorizations().await.map_err(Error::acme)?;
        let mut out = Vec::with_capacity(authorizations.len());
        for authz in &authorizations {
            let domain = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };
            let http01 = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .map(|c| Http01Challenge {
                    token: c.token.clone(),
                    url: c.url.clone(),
                    response: self.order.key_authorization(c).as_str().to_string(),
                });
            out.push(DomainAuthorization {
                domain,
                valid: matches!(authz.status, AuthorizationStatus::Valid),
                http01,
            });
        }
        Ok(out)
    }

    async fn ready(&mut self, challenge_url: &str) -> Result<()> {
        self.order
            .set_challenge_ready(challenge_url)
            .await
            .map_err(Error::acme)
    }

    async fn wait_authorized(&mut self, domain: &str) -> Result<()> {
        for attempt in 1..=POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;
            self.order.refresh().await.map_err(Error::acme)?;
            let authorizations = self.order.authorizations().await.map_err(Error::acme)?;
            let authz = authorizations
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d.as_str() == domain));
            match authz.map(|a| &a.status) {
                Some(AuthorizationStatus::Valid) => {
                    debug!(domain, "authorization valid");
                    return Ok(());
                }
                Some(AuthorizationStatus::Pending) => {
                    debug!(domain, attempt, "authorization pending");
                }
                Some(status) => {
                    return Err(Error::Acme(format!(
                        "authorization for {domain} failed: {status:?}"
                    )));
                }
                None => {
                    return Err(Error::Acme(format!("authorization for {domain} not found")));
                }
            }
        }
        Err(Error::Acme(format!("authorization timeout for {domain}")))
    }

    async fn issue(&mut self, csr_der: &[u8]) -> Result<String> {
        for _ in 0..POLL_ATTEMPTS {
            match self.order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => return Err(Error::Acme("order invalid".into())),
                OrderStatus::Pending | OrderStatus::Processing => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    self.order.refresh().await.map_err(Error::acme)?;
                }
            }
        }

        self.order.finalize(csr_der).await.map_err(Error::acme)?;

        for _ in 0..POLL_ATTEMPTS {
            if let Some(chain) = self.order.certificate().await.map_err(Error::acme)? {
                return Ok(chain);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            self.order.refresh().await.map_err(Error::acme)?;
        }
        Err(Error::Acme("timed out waiting for certificate".into()))
    }
}
