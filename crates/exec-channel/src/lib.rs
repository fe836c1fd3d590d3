//! Exec channel: interactive terminal sessions over the Kubernetes pod exec
//! WebSocket (`base64.channel.k8s.io`).
//!
//! Responsibilities:
//! - building the exec request path and subprotocol list
//! - decoding and encoding channel-tagged base64 frames
//! - driving one session per open call, detecting shell-less containers
//! - explaining abnormal closes from the backing workspace resource

pub mod activity;
pub mod adapter;
pub mod frame;
pub mod request;
pub mod session;
pub mod terminal;
pub mod transport;
pub mod utf8;
pub mod workspace;

pub use activity::{ActivityTicker, DEFAULT_ACTIVITY_INTERVAL};
pub use adapter::{AdapterOptions, AdapterStatus, ExecAdapter};
pub use frame::{Channel, ExecStatus, Frame, FrameError};
pub use request::{
    impersonation_subprotocols, ClientFlavor, ExecParams, RequestError, BASE64_CHANNEL_PROTOCOL,
    DEFAULT_SHELL_COMMAND,
};
pub use session::{close_reason, Effect, ExecSession, SessionState, CLOSED_MESSAGE, MISSING_SHELL_DIAGNOSTIC};
pub use terminal::TerminalSink;
pub use transport::{
    Backoff, CloseEvent, ConnectRequest, Connection, Connector, SessionHandle, TlsOptions,
    TransportError, TransportEvent, WebSocketConfig, WebSocketConnector,
};
pub use utf8::Utf8Accumulator;
pub use workspace::{
    InMemoryWorkspaceStore, StoreError, Workspace, WorkspaceMetadata, WorkspaceStore,
    STOPPED_BY_ANNOTATION,
};
