use std::io;
use std::path::PathBuf;

use exec_channel::request::RequestError;
use exec_channel::transport::TransportError;
use thiserror::Error;
use workspace_client::ClientError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("no API server configured; pass --server or set CLOUDSHELL_SERVER")]
    MissingServer,
    #[error("invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("failed to read {path:?}: {source}")]
    ReadFile { path: PathBuf, source: io::Error },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid exec request: {0}")]
    Request(#[from] RequestError),
    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),
    #[error("workspace request failed: {0}")]
    Workspace(#[from] ClientError),
    #[error("{0}")]
    SessionClosed(String),
}
