use thiserror::Error;
use tokio::sync::mpsc;

pub mod mock;
pub mod websocket;

pub use mock::{MockConnector, MockSocket};
pub use websocket::{Backoff, TlsOptions, WebSocketConfig, WebSocketConnector};

/// Close code browsers report when the connection dropped without a close
/// handshake.
pub const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
    #[error("tls configuration failed: {0}")]
    Tls(String),
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub was_clean: bool,
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseEvent {
    pub fn clean(code: u16, reason: impl Into<String>) -> Self {
        Self {
            was_clean: true,
            code: Some(code),
            reason: reason.into(),
        }
    }

    pub fn abnormal() -> Self {
        Self {
            was_clean: false,
            code: Some(CLOSE_ABNORMAL),
            reason: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Close(CloseEvent),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Path and query relative to the API server root.
    pub path: String,
    pub subprotocols: Vec<String>,
    pub reconnect: bool,
    /// Human readable name used in logs.
    pub label: String,
}

/// Write side of a live connection.
pub trait SessionHandle: Send + Sync {
    fn send(&self, text: String) -> Result<(), TransportError>;

    /// Tears the connection down. Idempotent; no events follow.
    fn destroy(&self);
}

pub struct Connection {
    pub handle: Box<dyn SessionHandle>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens exec connections. Implementations must not block: the handshake
/// happens in the background and is reported through [`TransportEvent::Open`].
pub trait Connector: Send + Sync {
    fn connect(&self, request: ConnectRequest) -> Connection;
}
