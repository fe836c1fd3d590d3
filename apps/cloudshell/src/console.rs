//! Local terminal plumbing: the [`TerminalSink`] that renders the remote
//! session on stdout, raw mode, and the stdin reader thread.

use std::io::{self, Read, Write};
use std::thread;

use crossterm::cursor::MoveTo;
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, Clear, ClearType};
use exec_channel::terminal::TerminalSink;
use exec_channel::utf8::Utf8Accumulator;
use tokio::sync::mpsc;
use tracing::{trace, warn, Level};

use crate::telemetry::logging as logctl;

/// `Ctrl-]`, as telnet and `kubectl attach` use it.
pub const DETACH_KEY: u8 = 0x1d;

/// Renders the remote session on a local writer (stdout by default).
pub struct ConsoleTerminal<W: Write + Send = io::Stdout> {
    out: W,
}

impl ConsoleTerminal<io::Stdout> {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write + Send> ConsoleTerminal<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write(&mut self, text: &str) {
        if let Err(err) = self
            .out
            .write_all(text.as_bytes())
            .and_then(|()| self.out.flush())
        {
            warn!(target: "cloudshell::console", error = %err, "terminal write failed");
        }
    }
}

impl<W: Write + Send> TerminalSink for ConsoleTerminal<W> {
    fn reset(&mut self) {
        if let Err(err) = execute!(self.out, Clear(ClearType::All), MoveTo(0, 0)) {
            warn!(target: "cloudshell::console", error = %err, "terminal reset failed");
        }
    }

    fn on_data_received(&mut self, text: &str) {
        self.write(text);
    }

    fn on_connection_closed(&mut self, message: &str) {
        self.write(&format!("\r\n\x1b[2m{}\x1b[0m\r\n", crlf(message)));
    }
}

/// Raw mode keeps every newline bare, so lone `\n` is widened to `\r\n`.
fn crlf(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut previous = None;
    for ch in message.chars() {
        if ch == '\n' && previous != Some('\r') {
            out.push('\r');
        }
        out.push(ch);
        previous = Some(ch);
    }
    out
}

pub struct RawModeGuard(bool);

impl RawModeGuard {
    pub fn new(enable: bool) -> Self {
        if enable {
            match enable_raw_mode() {
                Ok(()) => Self(true),
                Err(err) => {
                    eprintln!("⚠️  failed to enable raw mode: {err}");
                    Self(false)
                }
            }
        } else {
            Self(false)
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.0 {
            let _ = disable_raw_mode();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Text(String),
    Detach,
    Eof,
}

/// Splits a read at the detach key. Returns the bytes to forward and whether
/// the key was present.
pub fn split_detach(bytes: &[u8]) -> (&[u8], bool) {
    match bytes.iter().position(|&byte| byte == DETACH_KEY) {
        Some(index) => (&bytes[..index], true),
        None => (bytes, false),
    }
}

/// Turns raw reads into [`InputEvent`]s. Returns `false` once reading should
/// stop.
pub fn translate_input(
    accumulator: &mut Utf8Accumulator,
    bytes: &[u8],
    events: &mpsc::UnboundedSender<InputEvent>,
) -> bool {
    let (forward, detach) = split_detach(bytes);
    let text = accumulator.push(forward);
    if !text.is_empty() && events.send(InputEvent::Text(text)).is_err() {
        return false;
    }
    if detach {
        let _ = events.send(InputEvent::Detach);
        return false;
    }
    true
}

/// Reads stdin on a dedicated thread until EOF or the detach key.
pub fn spawn_stdin_forwarder(events: mpsc::UnboundedSender<InputEvent>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buffer = [0u8; 1024];
        let mut accumulator = Utf8Accumulator::default();
        loop {
            match stdin.read(&mut buffer) {
                Ok(0) => {
                    let _ = events.send(InputEvent::Eof);
                    break;
                }
                Ok(n) => {
                    let bytes = &buffer[..n];
                    if tracing::enabled!(Level::TRACE) {
                        trace!(
                            target: "cloudshell::stdin",
                            bytes = n,
                            dump = %logctl::hexdump(bytes),
                            "stdin read"
                        );
                    }
                    if !translate_input(&mut accumulator, bytes, &events) {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(target: "cloudshell::stdin", error = %err, "local input error");
                    let _ = events.send(InputEvent::Eof);
                    break;
                }
            }
        }
        trace!(target: "cloudshell::stdin", "stdin forwarder exited");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_key_stops_forwarding() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut accumulator = Utf8Accumulator::default();
        assert!(translate_input(&mut accumulator, b"ls\r", &tx));
        assert!(!translate_input(&mut accumulator, b"exit\x1dignored", &tx));
        assert_eq!(rx.try_recv().unwrap(), InputEvent::Text("ls\r".into()));
        assert_eq!(rx.try_recv().unwrap(), InputEvent::Text("exit".into()));
        assert_eq!(rx.try_recv().unwrap(), InputEvent::Detach);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn split_character_is_forwarded_once_complete() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut accumulator = Utf8Accumulator::default();
        let bytes = "é".as_bytes();
        assert!(translate_input(&mut accumulator, &bytes[..1], &tx));
        assert!(rx.try_recv().is_err());
        assert!(translate_input(&mut accumulator, &bytes[1..], &tx));
        assert_eq!(rx.try_recv().unwrap(), InputEvent::Text("é".into()));
    }

    #[test]
    fn console_renders_output_and_close_messages() {
        let mut console = ConsoleTerminal::new(Vec::new());
        console.on_data_received("$ ");
        console.on_connection_closed("line one\nline two");
        let rendered = String::from_utf8(console.into_inner()).unwrap();
        assert!(rendered.starts_with("$ \r\n"));
        assert!(rendered.contains("line one\r\nline two"));
    }

    #[test]
    fn crlf_leaves_existing_pairs_alone() {
        assert_eq!(crlf("a\r\n\r\nb\nc"), "a\r\n\r\nb\r\nc");
    }
}
