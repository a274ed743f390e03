//! Test doubles and fixtures shared by the lifecycle tests
//!
//! `MockAcme` implements the ACME provider seam with canned challenges and
//! self-signed certificates so the renewal machinery can run without a CA.

#![allow(dead_code)]

use async_trait::async_trait;
use cloudanchor::acme::{AcmeOrder, AcmeProvider, DomainAuthorization, Http01Challenge};
use cloudanchor::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::Semaphore;

/// Self-signed PEM certificate expiring at the given instant.
pub fn cert_pem(domains: &[&str], not_after: OffsetDateTime) -> String {
    let mut params =
        rcgen::CertificateParams::new(domains.iter().map(|d| d.to_string()).collect::<Vec<_>>())
            .unwrap();
    params.not_after = not_after;
    let key = rcgen::KeyPair::generate().unwrap();
    params.self_signed(&key).unwrap().pem()
}

pub struct MockAcme {
    /// Whether authorizations offer an http-01 challenge.
    pub offer_http01: bool,
    /// Validity of issued certificates.
    pub validity: Duration,
    /// Orders that fail before this many have been attempted.
    pub failures_left: Arc<AtomicUsize>,
    /// Domain batches of every order opened, in order.
    pub orders: Arc<Mutex<Vec<Vec<String>>>>,
    /// Number of fresh account registrations.
    pub registrations: Arc<AtomicUsize>,
    /// When set, every order acquires a permit before proceeding, letting
    /// a test hold a batch in flight.
    pub hold_orders: Option<Arc<Semaphore>>,
    /// When set, issuance acquires a permit before returning the chain.
    pub hold_issue: Option<Arc<Semaphore>>,
}

impl MockAcme {
    pub fn new() -> MockAcme {
        MockAcme {
            offer_http01: true,
            validity: Duration::days(90),
            failures_left: Arc::new(AtomicUsize::new(0)),
            orders: Arc::new(Mutex::new(Vec::new())),
            registrations: Arc::new(AtomicUsize::new(0)),
            hold_orders: None,
            hold_issue: None,
        }
    }

    pub fn without_http01() -> MockAcme {
        MockAcme {
            offer_http01: false,
            ..MockAcme::new()
        }
    }
}

#[async_trait]
impl AcmeProvider for MockAcme {
    async fn init_account(&mut self, saved: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        if saved.is_some() {
            return Ok(None);
        }
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(Some(br#"{"mock":"account"}"#.to_vec()))
    }

    async fn new_order(&self, domains: &[String]) -> Result<Box<dyn AcmeOrder>> {
        if let Some(gate) = &self.hold_orders {
            gate.acquire()
                .await
                .map_err(|_| Error::Acme("order gate closed".into()))?
                .forget();
        }
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Acme("synthetic order failure".into()));
        }
        self.orders.lock().push(domains.to_vec());
        Ok(Box::new(MockOrder {
            domains: domains.to_vec(),
            offer_http01: self.offer_http01,
            validity: self.validity,
            hold_issue: self.hold_issue.clone(),
        }))
    }
}

pub struct MockOrder {
    domains: Vec<String>,
    offer_http01: bool,
    validity: Duration,
    hold_issue: Option<Arc<Semaphore>>,
}

#[async_trait]
impl AcmeOrder for MockOrder {
    async fn authorizations(&mut self) -> Result<Vec<DomainAuthorization>> {
        Ok(self
            .domains
            .iter()
            .map(|domain| DomainAuthorization {
                domain: domain.clone(),
                valid: false,
                http01: self.offer_http01.then(|| Http01Challenge {
                    token: format!("token-{domain}"),
                    url: format!("https://acme.invalid/chal/{domain}"),
                    response: format!("token-{domain}.mock-thumbprint"),
                }),
            })
            .collect())
    }

    async fn ready(&mut self, _challenge_url: &str) -> Result<()> {
        Ok(())
    }

    async fn wait_authorized(&mut self, _domain: &str) -> Result<()> {
        Ok(())
    }

    async fn issue(&mut self, _csr_der: &[u8]) -> Result<String> {
        if let Some(gate) = &self.hold_issue {
            gate.acquire()
                .await
                .map_err(|_| Error::Acme("issue gate closed".into()))?
                .forget();
        }
        let domains: Vec<&str> = self.domains.iter().map(String::as_str).collect();
        Ok(cert_pem(&domains, OffsetDateTime::now_utc() + self.validity))
    }
}
