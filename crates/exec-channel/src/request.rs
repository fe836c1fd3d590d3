use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;
use url::form_urlencoded;

/// Subprotocol selecting the base64 text framing of the exec stream.
pub const BASE64_CHANNEL_PROTOCOL: &str = "base64.channel.k8s.io";

/// Interactive shell started when no command is given. `sh -i` alone does not
/// get a usable TERM inside most images.
pub const DEFAULT_SHELL_COMMAND: [&str; 4] = ["sh", "-i", "-c", "TERM=xterm sh"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("{0} must not be empty")]
    MissingField(&'static str),
    #[error("command must contain at least one token")]
    EmptyCommand,
}

/// Which client the user is told to retry with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientFlavor {
    #[default]
    Kubectl,
    Oc,
}

impl ClientFlavor {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientFlavor::Kubectl => "kubectl",
            ClientFlavor::Oc => "oc",
        }
    }
}

/// Everything needed to attach to one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecParams {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub command: Option<Vec<String>>,
    /// Extra subprotocols offered ahead of the channel protocol, usually
    /// impersonation markers.
    pub subprotocols: Vec<String>,
    /// Workspace resource backing the pod, consulted for close reasons.
    pub workspace: Option<String>,
}

impl ExecParams {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
            command: None,
            subprotocols: Vec::new(),
            workspace: None,
        }
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_subprotocols(mut self, subprotocols: Vec<String>) -> Self {
        self.subprotocols = subprotocols;
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.namespace.trim().is_empty() {
            return Err(RequestError::MissingField("namespace"));
        }
        if self.pod.trim().is_empty() {
            return Err(RequestError::MissingField("pod"));
        }
        if self.container.trim().is_empty() {
            return Err(RequestError::MissingField("container"));
        }
        if matches!(&self.command, Some(command) if command.is_empty()) {
            return Err(RequestError::EmptyCommand);
        }
        Ok(())
    }

    pub fn command_tokens(&self) -> Vec<&str> {
        match &self.command {
            Some(command) => command.iter().map(String::as_str).collect(),
            None => DEFAULT_SHELL_COMMAND.to_vec(),
        }
    }

    /// Path and query of the pod `exec` subresource, relative to the API
    /// server root.
    pub fn resource_path(&self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query
            .append_pair("stdout", "1")
            .append_pair("stdin", "1")
            .append_pair("stderr", "1")
            .append_pair("tty", "1")
            .append_pair("container", &self.container);
        for token in self.command_tokens() {
            query.append_pair("command", token);
        }
        format!(
            "/api/v1/namespaces/{}/pods/{}/exec?{}",
            encode_segment(&self.namespace),
            encode_segment(&self.pod),
            query.finish()
        )
    }

    /// Caller subprotocols followed by the channel protocol marker.
    pub fn protocols(&self) -> Vec<String> {
        let mut protocols = self.subprotocols.clone();
        protocols.push(BASE64_CHANNEL_PROTOCOL.to_string());
        protocols
    }
}

fn encode_segment(segment: &str) -> String {
    form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}

/// Subprotocols asking the API server to impersonate `user` and `groups`.
pub fn impersonation_subprotocols(user: Option<&str>, groups: &[String]) -> Vec<String> {
    let mut protocols = Vec::new();
    if let Some(user) = user.filter(|user| !user.is_empty()) {
        protocols.push(format!(
            "Impersonate-User.{}",
            URL_SAFE_NO_PAD.encode(user.as_bytes())
        ));
    }
    for group in groups.iter().filter(|group| !group.is_empty()) {
        protocols.push(format!(
            "Impersonate-Group.{}",
            URL_SAFE_NO_PAD.encode(group.as_bytes())
        ));
    }
    protocols
}
