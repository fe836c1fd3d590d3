//! Framing for the `base64.channel.k8s.io` exec sub-protocol.
//!
//! Every WebSocket text message is one ASCII digit naming the logical stream
//! followed by the standard (padded) base64 encoding of the payload:
//!
//! - 0: stdin (client to server only)
//! - 1: stdout
//! - 2: stderr (only when no TTY was requested)
//! - 3: error channel, carries a `Status` object when the process ends
//! - 4: control
//!
//! See kubernetes/kubernetes#13885 for the protocol description.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Stdin,
    Stdout,
    Stderr,
    Error,
    Control,
}

impl Channel {
    pub fn from_tag(tag: char) -> Option<Self> {
        match tag {
            '0' => Some(Channel::Stdin),
            '1' => Some(Channel::Stdout),
            '2' => Some(Channel::Stderr),
            '3' => Some(Channel::Error),
            '4' => Some(Channel::Control),
            _ => None,
        }
    }

    pub fn tag(self) -> char {
        match self {
            Channel::Stdin => '0',
            Channel::Stdout => '1',
            Channel::Stderr => '2',
            Channel::Error => '3',
            Channel::Control => '4',
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown channel tag {0:?}")]
    UnknownChannel(char),
    #[error("invalid base64 payload: {0}")]
    Payload(String),
}

/// A decoded exec frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: Channel,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn decode(raw: &str) -> Result<Self, FrameError> {
        let mut chars = raw.chars();
        let tag = chars.next().ok_or(FrameError::Empty)?;
        let channel = Channel::from_tag(tag).ok_or(FrameError::UnknownChannel(tag))?;
        let payload = STANDARD
            .decode(chars.as_str())
            .map_err(|err| FrameError::Payload(err.to_string()))?;
        Ok(Self { channel, payload })
    }

    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(1 + self.payload.len().div_ceil(3) * 4);
        out.push(self.channel.tag());
        STANDARD.encode_string(&self.payload, &mut out);
        out
    }

    /// Wire text for a stdin frame carrying `text`.
    pub fn stdin(text: &str) -> String {
        Frame {
            channel: Channel::Stdin,
            payload: text.as_bytes().to_vec(),
        }
        .encode()
    }

    /// Payload as text; invalid UTF-8 sequences are replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// The subset of a Kubernetes `Status` object the error channel carries.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ExecStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ExecStatus {
    /// Best effort: the error channel is not guaranteed to carry JSON.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }

    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some("Success")
    }
}
