//! Cloudanchor - keeps a reverse proxy in sync with running containers
//!
//! A sidecar daemon that:
//! - Watches the Docker engine for containers labeled with the domains
//!   they serve and the backend address to proxy to
//! - Regenerates a single nginx or Apache configuration file as containers
//!   start and die, coalescing bursts of events into one reload
//! - Provisions and renews TLS certificates for the advertised domains
//!   from an ACME certificate authority via HTTP-01 challenges
//! - Switches virtual hosts from challenge-only to TLS-terminating once
//!   their certificates are on disk

pub mod acme;
pub mod certmanager;
pub mod configurator;
pub mod container;
pub mod error;
pub mod keys;
pub mod responder;
pub mod store;
pub mod templates;
pub mod watcher;
