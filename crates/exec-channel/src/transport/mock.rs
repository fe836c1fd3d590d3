use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{
    CloseEvent, ConnectRequest, Connection, Connector, SessionHandle, TransportError,
    TransportEvent,
};

/// In-memory connector. Each `connect` call produces a [`MockSocket`] the
/// test drives by hand.
#[derive(Clone, Default)]
pub struct MockConnector {
    sockets: Arc<Mutex<Vec<MockSocket>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sockets(&self) -> Vec<MockSocket> {
        self.sockets.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<MockSocket> {
        self.sockets.lock().unwrap().last().cloned()
    }

    pub fn connect_count(&self) -> usize {
        self.sockets.lock().unwrap().len()
    }
}

impl Connector for MockConnector {
    fn connect(&self, request: ConnectRequest) -> Connection {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let socket = MockSocket {
            request,
            events: Arc::new(Mutex::new(Some(events_tx))),
            sent: Arc::new(Mutex::new(Vec::new())),
            destroyed: Arc::new(AtomicBool::new(false)),
        };
        self.sockets.lock().unwrap().push(socket.clone());
        Connection {
            handle: Box::new(MockHandle {
                sent: socket.sent.clone(),
                destroyed: socket.destroyed.clone(),
            }),
            events: events_rx,
        }
    }
}

/// Server side of a mock connection.
#[derive(Clone)]
pub struct MockSocket {
    pub request: ConnectRequest,
    events: Arc<Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>>,
    sent: Arc<Mutex<Vec<String>>>,
    destroyed: Arc<AtomicBool>,
}

impl MockSocket {
    pub fn open(&self) {
        self.emit(TransportEvent::Open);
    }

    pub fn deliver(&self, frame: impl Into<String>) {
        self.emit(TransportEvent::Message(frame.into()));
    }

    pub fn close(&self, event: CloseEvent) {
        self.emit(TransportEvent::Close(event));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(TransportEvent::Error(message.into()));
    }

    /// Ends the event stream, as a transport does once it stops reconnecting.
    pub fn finish(&self) {
        self.events.lock().unwrap().take();
    }

    /// Frames the client wrote.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: TransportEvent) {
        if self.is_destroyed() {
            return;
        }
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }
}

struct MockHandle {
    sent: Arc<Mutex<Vec<String>>>,
    destroyed: Arc<AtomicBool>,
}

impl SessionHandle for MockHandle {
    fn send(&self, text: String) -> Result<(), TransportError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}
