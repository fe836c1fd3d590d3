//! The exec channel adapter.
//!
//! [`ExecAdapter`] is a cheap handle; the session, the terminal and the
//! transport connection are owned by a single worker task that applies one
//! [`ExecSession`] transition per transport event. Asynchronous side work
//! (stop-reason lookups, workspace restarts, activity ticks) runs on spawned
//! tasks and reports back through the worker's queue tagged with the
//! generation it was started under. `open()` and `close()` bump the
//! generation on the caller's thread, so results from a session that has
//! since been replaced or closed are discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::activity::{ActivityTicker, DEFAULT_ACTIVITY_INTERVAL};
use crate::request::{ClientFlavor, ExecParams, RequestError};
use crate::session::{Effect, ExecSession, SessionState};
use crate::terminal::TerminalSink;
use crate::transport::{ConnectRequest, Connection, Connector, SessionHandle, TransportEvent};
use crate::workspace::{StoreError, Workspace, WorkspaceStore};

#[derive(Debug, Clone)]
pub struct AdapterOptions {
    pub client: ClientFlavor,
    pub reconnect: bool,
    pub activity_interval: Duration,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            client: ClientFlavor::default(),
            reconnect: true,
            activity_interval: DEFAULT_ACTIVITY_INTERVAL,
        }
    }
}

/// What a host needs to render around the terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterStatus {
    pub state: SessionState,
    /// Set once a session ended with a message for the user.
    pub error: Option<String>,
}

enum Command {
    Open { generation: u64, params: ExecParams },
    Input(String),
    Close,
    Restart,
}

enum Completion {
    StopReason {
        generation: u64,
        reason: Option<String>,
        outcome: Result<Workspace, StoreError>,
    },
    Restarted {
        generation: u64,
        params: ExecParams,
        outcome: Result<(), StoreError>,
    },
}

pub struct ExecAdapter {
    commands: mpsc::UnboundedSender<Command>,
    generation: Arc<AtomicU64>,
    status: watch::Receiver<AdapterStatus>,
    task: JoinHandle<()>,
}

impl ExecAdapter {
    /// Starts the worker on the current tokio runtime.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        terminal: Box<dyn TerminalSink>,
        store: Option<Arc<dyn WorkspaceStore>>,
        options: AdapterOptions,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(AdapterStatus::default());
        let generation = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            connector,
            terminal,
            store,
            ticker: ActivityTicker::new(options.activity_interval),
            options,
            generation: generation.clone(),
            status: status_tx,
            completions: completions_tx,
            active: None,
            last_params: None,
            workspace: None,
            detached_error: None,
        };
        let task = tokio::spawn(worker.run(commands_rx, completions_rx));

        Self {
            commands: commands_tx,
            generation,
            status: status_rx,
            task,
        }
    }

    /// Replaces any live session with a new one for `params`.
    pub fn open(&self, params: ExecParams) -> Result<(), RequestError> {
        params.validate()?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.commands.send(Command::Open { generation, params });
        Ok(())
    }

    /// Sends keystrokes. Dropped silently unless a session is open.
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.commands.send(Command::Input(text.into()));
    }

    /// Tears the session down. Safe to call repeatedly.
    pub fn close(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let _ = self.commands.send(Command::Close);
    }

    /// Starts the workspace again (when the last close looked it up) and
    /// reopens the last session.
    pub fn restart(&self) {
        let _ = self.commands.send(Command::Restart);
    }

    pub fn status(&self) -> AdapterStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AdapterStatus> {
        self.status.clone()
    }

    /// Closes the session and waits for the worker to exit.
    pub async fn shutdown(self) {
        self.close();
        let ExecAdapter { commands, task, .. } = self;
        drop(commands);
        if let Err(err) = task.await {
            warn!(target: "exec::adapter", error = %err, "adapter worker ended abnormally");
        }
    }
}

struct Active {
    generation: u64,
    session: ExecSession,
    handle: Box<dyn SessionHandle>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

struct Worker {
    connector: Arc<dyn Connector>,
    terminal: Box<dyn TerminalSink>,
    store: Option<Arc<dyn WorkspaceStore>>,
    options: AdapterOptions,
    ticker: ActivityTicker,
    generation: Arc<AtomicU64>,
    status: watch::Sender<AdapterStatus>,
    completions: mpsc::UnboundedSender<Completion>,
    active: Option<Active>,
    last_params: Option<ExecParams>,
    /// Resource returned by the last stop-reason lookup, used by restart.
    workspace: Option<Workspace>,
    /// Error to report while no session is installed.
    detached_error: Option<String>,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(completion) = completions.recv() => self.on_completion(completion),
                event = next_event(&mut self.active) => self.on_transport(event),
            }
            self.publish();
        }
        self.release();
        self.publish();
        debug!(target: "exec::adapter", "adapter worker stopped");
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Open { generation, params } => {
                if generation != self.current_generation() {
                    debug!(target: "exec::adapter", generation, "skipping superseded open");
                    return;
                }
                self.release();
                self.workspace = None;
                self.last_params = Some(params.clone());
                self.connect(generation, params);
            }
            Command::Input(text) => self.on_input(text),
            Command::Close => {
                self.release();
                self.last_params = None;
                self.workspace = None;
                self.detached_error = None;
            }
            Command::Restart => self.on_restart(),
        }
    }

    fn connect(&mut self, generation: u64, params: ExecParams) {
        let request = ConnectRequest {
            path: params.resource_path(),
            subprotocols: params.protocols(),
            reconnect: self.options.reconnect,
            label: format!("{}-terminal", params.pod),
        };
        info!(
            target: "exec::adapter",
            namespace = %params.namespace,
            pod = %params.pod,
            container = %params.container,
            generation,
            "opening exec session"
        );
        let Connection { handle, events } = self.connector.connect(request);
        let mut session = ExecSession::new(params, self.options.client);
        let effects = session.begin();
        self.detached_error = None;
        self.active = Some(Active {
            generation,
            session,
            handle,
            events: Some(events),
        });
        self.apply(effects);
    }

    /// Destroys the installed session, if any.
    fn release(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        for effect in active.session.close() {
            if effect == Effect::Destroy {
                active.handle.destroy();
            }
        }
        debug!(target: "exec::adapter", generation = active.generation, "exec session released");
    }

    fn on_input(&mut self, text: String) {
        let current = self.current_generation();
        let Some(active) = self.active.as_ref().filter(|active| active.generation == current) else {
            return;
        };
        let Some(frame) = active.session.input(&text) else {
            return;
        };
        match active.handle.send(frame) {
            Ok(()) => self.record_activity(),
            Err(err) => debug!(target: "exec::adapter", error = %err, "dropping input"),
        }
    }

    fn on_restart(&mut self) {
        let Some(params) = self.last_params.clone() else {
            debug!(target: "exec::adapter", "restart requested without a previous session");
            return;
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.release();

        match (self.workspace.take(), self.store.clone()) {
            (Some(workspace), Some(store)) => {
                info!(
                    target: "exec::adapter",
                    workspace = %workspace.metadata.name,
                    namespace = %workspace.metadata.namespace,
                    "starting workspace"
                );
                let completions = self.completions.clone();
                tokio::spawn(async move {
                    let outcome = store.start(&workspace).await;
                    let _ = completions.send(Completion::Restarted {
                        generation,
                        params,
                        outcome,
                    });
                });
            }
            _ => self.connect(generation, params),
        }
    }

    fn on_transport(&mut self, event: Option<TransportEvent>) {
        let current = self.current_generation();
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.generation != current {
            // A close or open is already queued behind this event.
            return;
        }

        let effects = match event {
            None => {
                active.events = None;
                if active.session.state() != SessionState::ErrorClosed {
                    info!(target: "exec::adapter", "exec transport finished; releasing session");
                    self.release();
                }
                return;
            }
            Some(TransportEvent::Open) => active.session.on_open(),
            Some(TransportEvent::Message(raw)) => {
                let effects = active.session.on_frame(&raw);
                self.record_activity();
                effects
            }
            Some(TransportEvent::Close(close)) => active.session.on_close(&close),
            Some(TransportEvent::Error(message)) => {
                active.session.on_error(&message);
                Vec::new()
            }
        };
        self.apply(effects);
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ResetTerminal => self.terminal.reset(),
                Effect::Output(text) => self.terminal.on_data_received(&text),
                Effect::ConnectionClosed(message) => self.terminal.on_connection_closed(&message),
                Effect::Destroy => {
                    if let Some(active) = self.active.as_ref() {
                        active.handle.destroy();
                    }
                }
                Effect::LookupStopReason { reason } => self.lookup_stop_reason(reason),
            }
        }
    }

    fn lookup_stop_reason(&mut self, reason: Option<String>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let params = active.session.params();
        match (self.store.clone(), params.workspace.clone()) {
            (Some(store), Some(name)) => {
                let generation = active.generation;
                let namespace = params.namespace.clone();
                let completions = self.completions.clone();
                tokio::spawn(async move {
                    let outcome = store.fetch(&name, &namespace).await;
                    let _ = completions.send(Completion::StopReason {
                        generation,
                        reason,
                        outcome,
                    });
                });
            }
            _ => {
                let effects = active.session.on_stop_reason(reason.as_deref(), None);
                self.apply(effects);
            }
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::StopReason {
                generation,
                reason,
                outcome,
            } => {
                if generation != self.current_generation()
                    || self.active.as_ref().map(|active| active.generation) != Some(generation)
                {
                    debug!(target: "exec::adapter", generation, "discarding stale stop reason");
                    return;
                }
                let stopped_by = match outcome {
                    Ok(workspace) => {
                        let stopped_by = workspace.stopped_by().map(str::to_string);
                        self.workspace = Some(workspace);
                        stopped_by
                    }
                    Err(err) => {
                        warn!(target: "exec::adapter", error = %err, "workspace lookup failed");
                        None
                    }
                };
                if let Some(active) = self.active.as_mut() {
                    let effects = active
                        .session
                        .on_stop_reason(reason.as_deref(), stopped_by.as_deref());
                    self.apply(effects);
                }
            }
            Completion::Restarted {
                generation,
                params,
                outcome,
            } => {
                if generation != self.current_generation() {
                    debug!(target: "exec::adapter", generation, "discarding stale restart");
                    return;
                }
                match outcome {
                    Ok(()) => self.connect(generation, params),
                    Err(err) => {
                        warn!(target: "exec::adapter", error = %err, "workspace restart failed");
                        let message = format!("Failed to restart the terminal: {err}");
                        self.terminal.on_connection_closed(&message);
                        self.last_params = Some(params);
                        self.detached_error = Some(message);
                    }
                }
            }
        }
    }

    fn record_activity(&mut self) {
        let (Some(store), Some(active)) = (self.store.clone(), self.active.as_ref()) else {
            return;
        };
        let params = active.session.params();
        let Some(name) = params.workspace.clone() else {
            return;
        };
        if !self.ticker.record(Instant::now()) {
            return;
        }
        let namespace = params.namespace.clone();
        tokio::spawn(async move {
            if let Err(err) = store.activity_tick(&name, &namespace).await {
                debug!(target: "exec::adapter", error = %err, "activity tick failed");
            }
        });
    }

    fn publish(&self) {
        let status = match self.active.as_ref() {
            Some(active) => AdapterStatus {
                state: active.session.state(),
                error: active.session.error().map(str::to_string),
            },
            None => AdapterStatus {
                state: SessionState::Idle,
                error: self.detached_error.clone(),
            },
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// Next event of the installed session; pending forever without one.
async fn next_event(active: &mut Option<Active>) -> Option<TransportEvent> {
    match active.as_mut().and_then(|active| active.events.as_mut()) {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MISSING_SHELL_DIAGNOSTIC;
    use crate::transport::{CloseEvent, MockConnector};
    use crate::workspace::{InMemoryWorkspaceStore, STOPPED_BY_ANNOTATION};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use tokio::time::sleep;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Reset,
        Data(String),
        Closed(String),
    }

    #[derive(Clone, Default)]
    struct RecordingTerminal {
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl RecordingTerminal {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn closed_messages(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Closed(message) => Some(message),
                    _ => None,
                })
                .collect()
        }
    }

    impl TerminalSink for RecordingTerminal {
        fn reset(&mut self) {
            self.calls.lock().unwrap().push(Call::Reset);
        }

        fn on_data_received(&mut self, text: &str) {
            self.calls.lock().unwrap().push(Call::Data(text.to_string()));
        }

        fn on_connection_closed(&mut self, message: &str) {
            self.calls.lock().unwrap().push(Call::Closed(message.to_string()));
        }
    }

    /// Holds every fetch until the test releases it.
    #[derive(Default)]
    struct GatedStore {
        inner: InMemoryWorkspaceStore,
        fetch_started: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl WorkspaceStore for GatedStore {
        async fn fetch(&self, name: &str, namespace: &str) -> Result<Workspace, StoreError> {
            self.fetch_started.notify_one();
            self.release.notified().await;
            self.inner.fetch(name, namespace).await
        }

        async fn start(&self, workspace: &Workspace) -> Result<(), StoreError> {
            self.inner.start(workspace).await
        }
    }

    struct Harness<S = InMemoryWorkspaceStore> {
        adapter: ExecAdapter,
        connector: MockConnector,
        terminal: RecordingTerminal,
        store: Arc<S>,
    }

    fn harness() -> Harness {
        harness_with(Arc::new(InMemoryWorkspaceStore::new()))
    }

    fn harness_with<S: WorkspaceStore + 'static>(store: Arc<S>) -> Harness<S> {
        let connector = MockConnector::new();
        let terminal = RecordingTerminal::default();
        let adapter = ExecAdapter::spawn(
            Arc::new(connector.clone()),
            Box::new(terminal.clone()),
            Some(store.clone() as Arc<dyn WorkspaceStore>),
            AdapterOptions::default(),
        );
        Harness {
            adapter,
            connector,
            terminal,
            store,
        }
    }

    fn frame(tag: char, text: &str) -> String {
        format!("{tag}{}", STANDARD.encode(text))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    }

    fn idle_timeout_workspace() -> Workspace {
        Workspace::new("terminal-1", "ns1").with_annotation(STOPPED_BY_ANNOTATION, "IdleTimeout")
    }

    async fn open_session<S>(h: &Harness<S>, params: ExecParams) -> crate::transport::MockSocket {
        let before = h.connector.connect_count();
        h.adapter.open(params).expect("valid params");
        wait_until(|| h.connector.connect_count() > before).await;
        let socket = h.connector.last().expect("socket");
        socket.open();
        let mut status = h.adapter.subscribe();
        status
            .wait_for(|status| status.state == SessionState::Open)
            .await
            .expect("status");
        socket
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn open_builds_request_and_forwards_output() {
        let h = harness();
        let socket = open_session(&h, ExecParams::new("ns1", "p1", "c1")).await;

        assert!(socket.request.path.starts_with("/api/v1/namespaces/ns1/pods/p1/exec?"));
        assert_eq!(socket.request.subprotocols, vec!["base64.channel.k8s.io".to_string()]);
        assert!(socket.request.reconnect);

        socket.deliver(frame('1', "$ "));
        wait_until(|| h.terminal.calls().contains(&Call::Data("$ ".into()))).await;
        assert_eq!(
            h.terminal.calls(),
            vec![
                Call::Closed("connecting to c1".into()),
                Call::Reset,
                Call::Data("$ ".into()),
            ]
        );
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn send_encodes_stdin_frames() {
        let h = harness();
        h.adapter.send("ignored before open");
        let socket = open_session(&h, ExecParams::new("ns1", "p1", "c1")).await;
        h.adapter.send("ls\r");
        wait_until(|| !socket.sent().is_empty()).await;
        assert_eq!(socket.sent(), vec!["0bHMN".to_string()]);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn error_frame_without_diagnostic_keeps_session() {
        let h = harness();
        let socket = open_session(&h, ExecParams::new("ns1", "p1", "c1")).await;
        socket.deliver(frame('1', "$ "));
        socket.deliver(frame('3', &format!("exec failed: {MISSING_SHELL_DIAGNOSTIC}")));
        socket.deliver(frame('1', "still here"));
        wait_until(|| h.terminal.calls().contains(&Call::Data("still here".into()))).await;
        assert!(!socket.is_destroyed());
        assert_eq!(h.adapter.status().state, SessionState::Open);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn missing_shell_diagnostic_tears_down() {
        let h = harness();
        let socket = open_session(&h, ExecParams::new("ns1", "p1", "c1")).await;
        socket.deliver(frame('1', "$ "));
        socket.deliver(frame('1', &format!("OCI runtime exec failed: {MISSING_SHELL_DIAGNOSTIC}\r\n")));
        socket.deliver(frame('3', "{}"));

        let mut status = h.adapter.subscribe();
        let status = status
            .wait_for(|status| status.state == SessionState::ErrorClosed)
            .await
            .expect("status")
            .clone();
        let message = status.error.expect("error message");
        assert!(message.contains("c1"), "{message}");
        assert!(message.contains("kubectl -n ns1 exec p1"), "{message}");
        assert!(socket.is_destroyed());
        assert_eq!(h.terminal.closed_messages().last(), Some(&message));
        assert_eq!(h.store.fetch_count(), 0);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn clean_close_surfaces_nothing() {
        let h = harness();
        let socket = open_session(&h, ExecParams::new("ns1", "p1", "c1").with_workspace("terminal-1")).await;
        socket.close(CloseEvent::clean(1000, ""));
        socket.deliver(frame('1', "after"));
        wait_until(|| h.terminal.calls().contains(&Call::Data("after".into()))).await;
        assert_eq!(h.store.fetch_count(), 0);
        assert_eq!(h.terminal.closed_messages(), vec!["connecting to c1".to_string()]);
        assert!(!socket.is_destroyed());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn unclean_close_reports_stopped_by_annotation() {
        let h = harness();
        h.store.insert(
            Workspace::new("terminal-1", "ns1").with_annotation(STOPPED_BY_ANNOTATION, "IdleTimeout"),
        );
        let socket = open_session(&h, ExecParams::new("ns1", "p1", "c1").with_workspace("terminal-1")).await;
        socket.close(CloseEvent::abnormal());

        let mut status = h.adapter.subscribe();
        let status = status
            .wait_for(|status| status.error.is_some())
            .await
            .expect("status")
            .clone();
        assert_eq!(status.state, SessionState::ErrorClosed);
        let message = status.error.unwrap();
        assert!(message.contains("IdleTimeout"), "{message}");
        assert!(socket.is_destroyed());
        assert_eq!(h.store.fetch_count(), 1);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn close_event_reason_wins() {
        let h = harness();
        h.store.insert(
            Workspace::new("terminal-1", "ns1").with_annotation(STOPPED_BY_ANNOTATION, "IdleTimeout"),
        );
        let socket = open_session(&h, ExecParams::new("ns1", "p1", "c1").with_workspace("terminal-1")).await;
        socket.close(CloseEvent {
            was_clean: false,
            code: Some(1011),
            reason: "pod deleted".into(),
        });
        let mut status = h.adapter.subscribe();
        let status = status.wait_for(|status| status.error.is_some()).await.unwrap().clone();
        assert_eq!(status.error.as_deref(), Some("pod deleted"));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn failed_lookup_falls_back_to_generic_message() {
        let h = harness();
        h.store.fail_fetches("forbidden");
        let socket = open_session(&h, ExecParams::new("ns1", "p1", "c1").with_workspace("terminal-1")).await;
        socket.close(CloseEvent::abnormal());
        let mut status = h.adapter.subscribe();
        let status = status.wait_for(|status| status.error.is_some()).await.unwrap().clone();
        assert_eq!(
            status.error.as_deref(),
            Some("The terminal connection has closed.")
        );
        assert!(socket.is_destroyed());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn no_workspace_skips_lookup() {
        let h = harness();
        let socket = open_session(&h, ExecParams::new("ns1", "p1", "c1")).await;
        socket.error("connection reset");
        socket.close(CloseEvent::abnormal());
        let mut status = h.adapter.subscribe();
        let status = status.wait_for(|status| status.error.is_some()).await.unwrap().clone();
        assert_eq!(status.error.as_deref(), Some("The terminal connection has closed."));
        assert_eq!(h.store.fetch_count(), 0);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn close_discards_in_flight_lookup() {
        let store = Arc::new(GatedStore::default());
        store.inner.insert(idle_timeout_workspace());
        let h = harness_with(store.clone());
        let socket = open_session(&h, ExecParams::new("ns1", "p1", "c1").with_workspace("terminal-1")).await;
        socket.close(CloseEvent::abnormal());
        store.fetch_started.notified().await;

        h.adapter.close();
        h.adapter.close();
        let mut status = h.adapter.subscribe();
        status
            .wait_for(|status| status.state == SessionState::Idle)
            .await
            .expect("idle");

        store.release.notify_one();
        wait_until(|| store.inner.fetch_count() == 1).await;
        sleep(Duration::from_millis(20)).await;
        assert!(socket.is_destroyed());
        assert_eq!(h.adapter.status(), AdapterStatus::default());
        assert_eq!(h.terminal.closed_messages(), vec!["connecting to c1".to_string()]);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn reopen_discards_in_flight_lookup() {
        let store = Arc::new(GatedStore::default());
        store.inner.insert(idle_timeout_workspace());
        let h = harness_with(store.clone());
        let first = open_session(&h, ExecParams::new("ns1", "p1", "c1").with_workspace("terminal-1")).await;
        first.close(CloseEvent::abnormal());
        store.fetch_started.notified().await;

        let second = open_session(&h, ExecParams::new("ns1", "p2", "c1")).await;
        store.release.notify_one();
        wait_until(|| store.inner.fetch_count() == 1).await;
        sleep(Duration::from_millis(20)).await;

        assert!(first.is_destroyed());
        assert!(!second.is_destroyed());
        assert_eq!(
            h.adapter.status(),
            AdapterStatus {
                state: SessionState::Open,
                error: None,
            }
        );
        assert_eq!(
            h.terminal.closed_messages(),
            vec!["connecting to c1".to_string(), "connecting to c1".to_string()]
        );
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn repeated_unclean_close_reports_once() {
        let store = Arc::new(GatedStore::default());
        store.inner.insert(idle_timeout_workspace());
        let h = harness_with(store.clone());
        let socket = open_session(&h, ExecParams::new("ns1", "p1", "c1").with_workspace("terminal-1")).await;
        socket.close(CloseEvent::abnormal());
        store.fetch_started.notified().await;
        socket.close(CloseEvent::abnormal());
        socket.deliver(frame('1', "marker"));
        wait_until(|| h.terminal.calls().contains(&Call::Data("marker".into()))).await;

        store.release.notify_one();
        let mut status = h.adapter.subscribe();
        status.wait_for(|status| status.error.is_some()).await.unwrap();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(store.inner.fetch_count(), 1);
        let reported = h
            .terminal
            .closed_messages()
            .into_iter()
            .filter(|message| message.contains("IdleTimeout"))
            .count();
        assert_eq!(reported, 1);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn split_character_reaches_terminal_whole() {
        let h = harness();
        let socket = open_session(&h, ExecParams::new("ns1", "p1", "c1")).await;
        let bytes = "é".as_bytes();
        socket.deliver(format!("1{}", STANDARD.encode(&bytes[..1])));
        socket.deliver(format!("1{}", STANDARD.encode(&bytes[1..])));
        socket.deliver(frame('1', "!"));
        wait_until(|| h.terminal.calls().contains(&Call::Data("!".into()))).await;
        let output: String = h
            .terminal
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Data(text) => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(output, "é!");
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn reopening_destroys_previous_session() {
        let h = harness();
        let first = open_session(&h, ExecParams::new("ns1", "p1", "c1")).await;
        let second = open_session(&h, ExecParams::new("ns1", "p2", "c1")).await;
        assert!(first.is_destroyed());
        assert!(!second.is_destroyed());

        first.deliver(frame('1', "stale"));
        second.deliver(frame('1', "fresh"));
        wait_until(|| h.terminal.calls().contains(&Call::Data("fresh".into()))).await;
        assert!(!h.terminal.calls().contains(&Call::Data("stale".into())));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn reconnect_resets_terminal_and_buffer() {
        let h = harness();
        let socket = open_session(&h, ExecParams::new("ns1", "p1", "c1")).await;
        socket.deliver(frame('1', &format!("{MISSING_SHELL_DIAGNOSTIC}")));
        socket.close(CloseEvent::clean(1000, ""));
        socket.open();
        socket.deliver(frame('3', "{}"));
        socket.deliver(frame('1', "$ "));
        wait_until(|| h.terminal.calls().contains(&Call::Data("$ ".into()))).await;
        assert!(!socket.is_destroyed());
        let resets = h.terminal.calls().iter().filter(|call| **call == Call::Reset).count();
        assert_eq!(resets, 2);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn restart_starts_workspace_and_reopens() {
        let h = harness();
        h.store.insert(
            Workspace::new("terminal-1", "ns1").with_annotation(STOPPED_BY_ANNOTATION, "IdleTimeout"),
        );
        let socket = open_session(&h, ExecParams::new("ns1", "p1", "c1").with_workspace("terminal-1")).await;
        socket.close(CloseEvent::abnormal());
        let mut status = h.adapter.subscribe();
        status.wait_for(|status| status.error.is_some()).await.unwrap();

        h.adapter.restart();
        wait_until(|| h.connector.connect_count() == 2).await;
        assert_eq!(h.store.started(), vec!["ns1/terminal-1".to_string()]);
        let reopened = h.connector.last().unwrap();
        reopened.open();
        status
            .wait_for(|status| status.state == SessionState::Open && status.error.is_none())
            .await
            .unwrap();
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn finished_transport_returns_to_idle() {
        let h = harness();
        let socket = open_session(&h, ExecParams::new("ns1", "p1", "c1")).await;
        socket.close(CloseEvent::clean(1000, ""));
        socket.finish();
        let mut status = h.adapter.subscribe();
        status
            .wait_for(|status| status.state == SessionState::Idle)
            .await
            .expect("idle");
        assert!(socket.is_destroyed());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn activity_is_throttled_per_workspace() {
        let h = harness();
        let socket = open_session(&h, ExecParams::new("ns1", "p1", "c1").with_workspace("terminal-1")).await;
        h.adapter.send("a");
        h.adapter.send("b");
        socket.deliver(frame('1', "ab"));
        wait_until(|| h.terminal.calls().contains(&Call::Data("ab".into()))).await;
        wait_until(|| !h.store.ticks().is_empty()).await;
        sleep(Duration::from_millis(20)).await;
        assert_eq!(h.store.ticks(), vec!["ns1/terminal-1".to_string()]);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn invalid_params_are_rejected_up_front() {
        let h = harness();
        assert_eq!(
            h.adapter.open(ExecParams::new("ns1", "", "c1")),
            Err(RequestError::MissingField("pod"))
        );
        sleep(Duration::from_millis(20)).await;
        assert_eq!(h.connector.connect_count(), 0);
        h.adapter.shutdown().await;
    }
}
