//! Per-connection state machine for an exec session.
//!
//! The machine does no I/O. Each transition consumes one transport event and
//! returns the [`Effect`]s the owner must carry out, so the same logic can be
//! driven from a tokio task, a test, or any other event loop.

use tracing::{debug, trace, warn};

use crate::frame::{Channel, ExecStatus, Frame};
use crate::request::{ClientFlavor, ExecParams};
use crate::transport::CloseEvent;
use crate::utf8::Utf8Accumulator;

/// What the runtime prints when the image has no `/bin/sh`. Matching on the
/// preceding output frame is a heuristic: if the runtime splits this line
/// across frames the diagnostic is missed and the session ends through the
/// normal close path instead.
pub const MISSING_SHELL_DIAGNOSTIC: &str =
    r#"starting container process caused "exec: \"sh\": executable file not found in $PATH""#;

pub const CLOSED_MESSAGE: &str = "The terminal connection has closed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    ErrorClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    ResetTerminal,
    Output(String),
    ConnectionClosed(String),
    Destroy,
    /// Ask the workspace store why the connection dropped.
    LookupStopReason { reason: Option<String> },
}

#[derive(Debug)]
pub struct ExecSession {
    params: ExecParams,
    client: ClientFlavor,
    state: SessionState,
    last_output: String,
    /// Partial characters per output channel: stdout, stderr, control.
    decoders: [Utf8Accumulator; 3],
    lookup_pending: bool,
    error: Option<String>,
    destroyed: bool,
}

impl ExecSession {
    pub fn new(params: ExecParams, client: ClientFlavor) -> Self {
        Self {
            params,
            client,
            state: SessionState::Idle,
            last_output: String::new(),
            decoders: Default::default(),
            lookup_pending: false,
            error: None,
            destroyed: false,
        }
    }

    pub fn params(&self) -> &ExecParams {
        &self.params
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn last_output(&self) -> &str {
        &self.last_output
    }

    /// The transport has been asked to connect.
    pub fn begin(&mut self) -> Vec<Effect> {
        self.state = SessionState::Connecting;
        self.reset_output();
        self.lookup_pending = false;
        self.error = None;
        vec![Effect::ConnectionClosed(format!(
            "connecting to {}",
            self.params.container
        ))]
    }

    pub fn on_open(&mut self) -> Vec<Effect> {
        debug!(
            target: "exec::session",
            namespace = %self.params.namespace,
            pod = %self.params.pod,
            container = %self.params.container,
            "exec stream open"
        );
        self.reset_output();
        self.state = SessionState::Open;
        vec![Effect::ResetTerminal]
    }

    pub fn on_frame(&mut self, raw: &str) -> Vec<Effect> {
        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target: "exec::session", error = %err, len = raw.len(), "dropping malformed frame");
                return Vec::new();
            }
        };

        match frame.channel {
            Channel::Error => self.on_error_channel(&frame),
            Channel::Stdin => {
                warn!(target: "exec::session", "server wrote to the stdin channel; dropping frame");
                Vec::new()
            }
            Channel::Stdout | Channel::Stderr | Channel::Control => {
                let text = self.decoder(frame.channel).push(&frame.payload);
                trace!(target: "exec::session", channel = ?frame.channel, bytes = frame.payload.len(), "output frame");
                if text.is_empty() {
                    return Vec::new();
                }
                self.last_output.clone_from(&text);
                vec![Effect::Output(text)]
            }
        }
    }

    fn on_error_channel(&mut self, frame: &Frame) -> Vec<Effect> {
        if self.last_output.contains(MISSING_SHELL_DIAGNOSTIC) {
            let message = self.missing_shell_message();
            warn!(
                target: "exec::session",
                namespace = %self.params.namespace,
                pod = %self.params.pod,
                container = %self.params.container,
                "container has no /bin/sh"
            );
            self.last_output.clear();
            self.error = Some(message.clone());
            self.state = SessionState::ErrorClosed;
            return self.destroy_with(vec![Effect::ResetTerminal, Effect::ConnectionClosed(message)]);
        }

        if frame.payload.is_empty() {
            return Vec::new();
        }
        match ExecStatus::parse(&frame.payload) {
            Some(status) if status.is_success() => {
                debug!(target: "exec::session", "remote process exited cleanly");
            }
            Some(status) => {
                warn!(
                    target: "exec::session",
                    status = status.status.as_deref().unwrap_or_default(),
                    reason = status.reason.as_deref().unwrap_or_default(),
                    message = status.message.as_deref().unwrap_or_default(),
                    "error channel reported failure"
                );
            }
            None => {
                warn!(target: "exec::session", payload = %frame.text(), "unstructured error channel data");
            }
        }
        Vec::new()
    }

    pub fn on_close(&mut self, event: &CloseEvent) -> Vec<Effect> {
        if event.was_clean {
            debug!(target: "exec::session", code = ?event.code, "exec stream closed cleanly");
            return Vec::new();
        }
        debug!(target: "exec::session", code = ?event.code, reason = %event.reason, "exec stream closed unexpectedly");
        if self.lookup_pending || self.state == SessionState::ErrorClosed {
            return Vec::new();
        }
        self.state = SessionState::ErrorClosed;
        self.lookup_pending = true;
        let reason = Some(event.reason.clone()).filter(|reason| !reason.is_empty());
        vec![Effect::LookupStopReason { reason }]
    }

    /// Result of the stop-reason lookup started by [`ExecSession::on_close`].
    pub fn on_stop_reason(
        &mut self,
        event_reason: Option<&str>,
        stopped_by: Option<&str>,
    ) -> Vec<Effect> {
        let message = close_reason(event_reason, stopped_by);
        self.lookup_pending = false;
        self.error = Some(message.clone());
        self.state = SessionState::ErrorClosed;
        self.destroy_with(vec![Effect::ConnectionClosed(message)])
    }

    pub fn on_error(&self, message: &str) {
        warn!(
            target: "exec::session",
            pod = %self.params.pod,
            error = %message,
            "exec transport error"
        );
    }

    pub fn close(&mut self) -> Vec<Effect> {
        self.last_output.clear();
        if matches!(self.state, SessionState::Idle | SessionState::Closing) {
            return Vec::new();
        }
        self.state = SessionState::Closing;
        self.destroy_with(Vec::new())
    }

    /// Stdin frame for `text`, or `None` when nothing should be sent.
    pub fn input(&self, text: &str) -> Option<String> {
        if self.state != SessionState::Open || text.is_empty() {
            return None;
        }
        Some(Frame::stdin(text))
    }

    fn decoder(&mut self, channel: Channel) -> &mut Utf8Accumulator {
        let index = match channel {
            Channel::Stderr => 1,
            Channel::Control => 2,
            _ => 0,
        };
        &mut self.decoders[index]
    }

    fn reset_output(&mut self) {
        self.last_output.clear();
        self.decoders.iter_mut().for_each(Utf8Accumulator::clear);
    }

    fn destroy_with(&mut self, mut effects: Vec<Effect>) -> Vec<Effect> {
        if !self.destroyed {
            self.destroyed = true;
            effects.push(Effect::Destroy);
        }
        effects
    }

    fn missing_shell_message(&self) -> String {
        format!(
            "This container doesn't have a /bin/sh shell. Try specifying your command in a terminal with:\r\n\r\n {} -n {} exec {} -c {} -ti <command>",
            self.client.as_str(),
            self.params.namespace,
            self.params.pod,
            self.params.container
        )
    }
}

/// Close reason shown to the user: the transport's own reason wins, then the
/// workspace's stopped-by annotation, then a generic message.
pub fn close_reason(event_reason: Option<&str>, stopped_by: Option<&str>) -> String {
    if let Some(reason) = event_reason.map(str::trim).filter(|reason| !reason.is_empty()) {
        return reason.to_string();
    }
    if let Some(stopped_by) = stopped_by.map(str::trim).filter(|value| !value.is_empty()) {
        return format!("The terminal connection has closed due to {stopped_by}.");
    }
    CLOSED_MESSAGE.to_string()
}
