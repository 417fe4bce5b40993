//! Runnerfleet: keeps a fleet of ephemeral self-hosted CI runners at a target size
//!
//! Each runner lives in two places at once: as a compute instance on a
//! virtualization host and as a registration on the CI service. The manager
//! merges both views, garbage-collects whatever went offline, and grows or
//! shrinks the idle pool toward the requested quantity.

pub mod binary;
pub mod clients;
pub mod config;
pub mod manager;
pub mod retry;
pub mod runner;
pub mod token;
pub mod view;

use thiserror::Error;

pub use clients::ClientError;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Runner binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Runner binary file operation failed: {0}")]
    BinaryIo(String),

    #[error("Runner binary download failed: {0}")]
    BinaryDownload(String),

    #[error("Runner binary integrity check failed: {0}")]
    BinaryIntegrity(String),

    #[error("Runner binary is corrupt: {0}")]
    BinaryCorrupt(String),

    #[error("Token error: {0}")]
    Token(String),

    #[error("Runner create error: {0}")]
    RunnerCreate(String),

    #[error("Runner remove error: {0}")]
    RunnerRemove(String),

    #[error("{error} (cleanup also failed: {cleanup})")]
    RunnerCreateCleanup {
        #[source]
        error: Box<FleetError>,
        cleanup: Box<FleetError>,
    },

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;
