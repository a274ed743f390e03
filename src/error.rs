//! Error types shared across the daemon

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The surrounding loop or context was shut down.
    #[error("operation canceled")]
    Canceled,

    #[error("invalid private key")]
    InvalidKey,

    #[error("invalid certificate")]
    InvalidCert,

    #[error("no domains specified")]
    NoDomains,

    #[error("no suitable challenge offered for {0}")]
    NoChallenges(String),

    #[error("unable to read pidfile {path}: {source}")]
    PidfileUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("pidfile {0} does not contain a valid pid")]
    PidfileCorrupt(PathBuf),

    #[error("unable to signal server process {pid}: {source}")]
    ReloadFailed { pid: i32, source: std::io::Error },

    #[error("container engine error: {0}")]
    Engine(#[from] bollard::errors::Error),

    #[error("ACME error: {0}")]
    Acme(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Fatal(String),
}

impl Error {
    /// Wrap a collaborator failure from the ACME client.
    pub fn acme(err: impl std::fmt::Display) -> Self {
        Error::Acme(err.to_string())
    }
}
