use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{
    connect_async_tls_with_config, Connector as TlsConnector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{
    CloseEvent, ConnectRequest, Connection, Connector, SessionHandle, TransportError,
    TransportEvent,
};

/// Status code reported when a close frame carried no code.
const CLOSE_NO_STATUS: u16 = 1005;

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// PEM bundle trusted in addition to the system roots.
    pub ca_pem: Option<Vec<u8>>,
    pub insecure: bool,
}

/// Delay schedule between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// `None` retries until the connection is destroyed.
    pub max_attempts: Option<usize>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl Backoff {
    fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

/// Connection settings for the Kubernetes API server.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// API server root, e.g. `https://api.cluster.local:6443`. A path prefix
    /// (for proxies that mount the API below `/`) is kept.
    pub server: Url,
    pub bearer_token: Option<String>,
    pub tls: TlsOptions,
    pub backoff: Backoff,
}

impl WebSocketConfig {
    pub fn new(server: Url) -> Self {
        Self {
            server,
            bearer_token: None,
            tls: TlsOptions::default(),
            backoff: Backoff::default(),
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// WebSocket URL for a resource path such as `/api/v1/.../exec?...`.
    pub fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        let mut url = self.server.clone();
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TransportError::Endpoint(format!(
                    "unsupported scheme '{other}'"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| TransportError::Endpoint(format!("cannot switch {} to {scheme}", self.server)))?;

        let (resource, query) = match path.split_once('?') {
            Some((resource, query)) => (resource, Some(query)),
            None => (path, None),
        };
        let prefix = url.path().trim_end_matches('/').to_string();
        let resource = resource.trim_start_matches('/');
        url.set_path(&format!("{prefix}/{resource}"));
        url.set_query(query);
        url.set_fragment(None);
        Ok(url)
    }

    fn client_request(&self, request: &ConnectRequest) -> Result<Request, TransportError> {
        let url = self.endpoint(&request.path)?;
        let mut client_request = url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Endpoint(err.to_string()))?;
        let headers = client_request.headers_mut();
        if !request.subprotocols.is_empty() {
            let protocols = HeaderValue::from_str(&request.subprotocols.join(", "))
                .map_err(|err| TransportError::Endpoint(format!("invalid subprotocol: {err}")))?;
            headers.insert(SEC_WEBSOCKET_PROTOCOL, protocols);
        }
        if let Some(token) = self.bearer_token.as_deref() {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| TransportError::Endpoint("bearer token is not a valid header".into()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Ok(client_request)
    }
}

/// Exec connector backed by tokio-tungstenite.
#[derive(Clone)]
pub struct WebSocketConnector {
    inner: Arc<Inner>,
}

struct Inner {
    config: WebSocketConfig,
    tls: Option<TlsConnector>,
}

impl WebSocketConnector {
    pub fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let tls = tls_connector(&config.tls)?;
        Ok(Self {
            inner: Arc::new(Inner { config, tls }),
        })
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.inner.config
    }
}

fn tls_connector(options: &TlsOptions) -> Result<Option<TlsConnector>, TransportError> {
    if options.ca_pem.is_none() && !options.insecure {
        return Ok(None);
    }
    let mut builder = native_tls::TlsConnector::builder();
    if let Some(pem) = options.ca_pem.as_deref() {
        let certificate = native_tls::Certificate::from_pem(pem)
            .map_err(|err| TransportError::Tls(format!("invalid CA bundle: {err}")))?;
        builder.add_root_certificate(certificate);
    }
    if options.insecure {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    let connector = builder
        .build()
        .map_err(|err| TransportError::Tls(err.to_string()))?;
    Ok(Some(TlsConnector::NativeTls(connector)))
}

impl Connector for WebSocketConnector {
    fn connect(&self, request: ConnectRequest) -> Connection {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(drive(
            self.inner.clone(),
            request,
            outgoing_rx,
            events_tx,
            shutdown_rx,
        ));

        Connection {
            handle: Box::new(WebSocketHandle {
                outgoing: outgoing_tx,
                shutdown: shutdown_tx,
            }),
            events: events_rx,
        }
    }
}

struct WebSocketHandle {
    outgoing: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
}

impl SessionHandle for WebSocketHandle {
    fn send(&self, text: String) -> Result<(), TransportError> {
        if *self.shutdown.borrow() {
            return Err(TransportError::Closed);
        }
        self.outgoing.send(text).map_err(|_| TransportError::Closed)
    }

    fn destroy(&self) {
        self.shutdown.send_replace(true);
    }
}

impl Inner {
    async fn open(&self, request: &ConnectRequest) -> Result<Stream, TransportError> {
        let client_request = self.config.client_request(request)?;
        let (stream, response) =
            connect_async_tls_with_config(client_request, None, true, self.tls.clone())
                .await
                .map_err(|err| TransportError::Handshake(err.to_string()))?;
        debug!(
            target: "exec::transport",
            label = %request.label,
            status = %response.status(),
            protocol = ?response.headers().get(SEC_WEBSOCKET_PROTOCOL),
            "websocket handshake complete"
        );
        Ok(stream)
    }
}

enum PumpExit {
    Destroyed,
    Closed(CloseEvent),
}

/// Connection loop: connect, pump frames until the socket closes, then
/// reconnect with backoff while `reconnect` is set and the handle lives.
async fn drive(
    inner: Arc<Inner>,
    request: ConnectRequest,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let backoff = inner.config.backoff;
    let mut delay = backoff.initial;
    let mut attempts = 0usize;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let connected = tokio::select! {
            result = inner.open(&request) => result,
            _ = shutdown.changed() => return,
        };

        match connected {
            Ok(stream) => {
                attempts = 0;
                delay = backoff.initial;
                info!(target: "exec::transport", label = %request.label, "exec websocket connected");
                if events.send(TransportEvent::Open).is_err() {
                    return;
                }
                match pump(stream, &mut outgoing, &events, &mut shutdown).await {
                    PumpExit::Destroyed => return,
                    PumpExit::Closed(close) => {
                        debug!(
                            target: "exec::transport",
                            label = %request.label,
                            clean = close.was_clean,
                            code = ?close.code,
                            "exec websocket closed"
                        );
                        if events.send(TransportEvent::Close(close)).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(target: "exec::transport", label = %request.label, error = %err, "exec websocket connect failed");
                let _ = events.send(TransportEvent::Error(err.to_string()));
                if events.send(TransportEvent::Close(CloseEvent::abnormal())).is_err() {
                    return;
                }
            }
        }

        if !request.reconnect {
            return;
        }
        attempts += 1;
        if let Some(max) = backoff.max_attempts {
            if attempts > max {
                warn!(
                    target: "exec::transport",
                    label = %request.label,
                    attempts = max,
                    "exhausted reconnect attempts"
                );
                return;
            }
        }

        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
        debug!(target: "exec::transport", label = %request.label, attempt = attempts, "reconnecting exec websocket");
        delay = backoff.next(delay);
    }
}

async fn pump(
    stream: Stream,
    outgoing: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> PumpExit {
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    })))
                    .await;
                return PumpExit::Destroyed;
            }
            Some(text) = outgoing.recv() => {
                trace!(target: "exec::transport", bytes = text.len(), "sending frame");
                if let Err(err) = sink.send(Message::Text(text)).await {
                    let _ = events.send(TransportEvent::Error(err.to_string()));
                    return PumpExit::Closed(CloseEvent::abnormal());
                }
            }
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if events.send(TransportEvent::Message(text)).is_err() {
                        return PumpExit::Destroyed;
                    }
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        if events.send(TransportEvent::Message(text)).is_err() {
                            return PumpExit::Destroyed;
                        }
                    }
                    Err(_) => {
                        warn!(target: "exec::transport", "dropping non-utf8 binary message");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    // Let tungstenite flush its close reply before the socket drops.
                    let _ = sink.flush().await;
                    let close = match frame {
                        Some(frame) => CloseEvent::clean(u16::from(frame.code), frame.reason.into_owned()),
                        None => CloseEvent::clean(CLOSE_NO_STATUS, ""),
                    };
                    return PumpExit::Closed(close);
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = events.send(TransportEvent::Error(err.to_string()));
                    return PumpExit::Closed(CloseEvent::abnormal());
                }
                None => return PumpExit::Closed(CloseEvent::abnormal()),
            },
        }
    }
}
