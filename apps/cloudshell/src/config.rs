use std::fs;
use std::path::Path;

use exec_channel::transport::{TlsOptions, WebSocketConfig, WebSocketConnector};
use tracing::debug;
use url::Url;
use workspace_client::{ClientConfig, WorkspaceApi, WorkspaceClient};

use crate::cli::ClusterArgs;
use crate::error::CliError;

/// Validated connection settings for one API server.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub server: Url,
    pub token: Option<String>,
    pub ca_pem: Option<Vec<u8>>,
    pub insecure: bool,
    pub workspace_api: WorkspaceApi,
    pub activity_endpoint: Option<Url>,
}

impl ClusterConfig {
    /// Parses URLs and reads the token and CA files named on the command line.
    pub fn resolve(args: &ClusterArgs) -> Result<Self, CliError> {
        let server = args
            .server
            .as_deref()
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .ok_or(CliError::MissingServer)?;
        let server = parse_url(server)?;
        if !matches!(server.scheme(), "http" | "https") {
            return Err(CliError::InvalidArgument(format!(
                "--server must be an http(s) URL, got '{server}'"
            )));
        }

        let token = match (&args.token, &args.token_file) {
            (Some(token), _) => Some(token.trim().to_string()),
            (None, Some(path)) => Some(read_file(path).map(|bytes| {
                String::from_utf8_lossy(&bytes).trim().to_string()
            })?),
            (None, None) => None,
        }
        .filter(|token| !token.is_empty());

        let ca_pem = args
            .certificate_authority
            .as_deref()
            .map(read_file)
            .transpose()?;

        let workspace_api = match args.workspace_api.as_deref() {
            Some(api) => api.parse::<WorkspaceApi>()?,
            None => WorkspaceApi::default(),
        };

        let activity_endpoint = args
            .activity_endpoint
            .as_deref()
            .map(parse_url)
            .transpose()?;

        debug!(
            server = %server,
            token = token.is_some(),
            custom_ca = ca_pem.is_some(),
            workspace_api = %workspace_api,
            "cluster configuration resolved"
        );

        Ok(Self {
            server,
            token,
            ca_pem,
            insecure: args.insecure_skip_tls_verify.unwrap_or(false),
            workspace_api,
            activity_endpoint,
        })
    }

    pub fn websocket_config(&self) -> WebSocketConfig {
        let config = WebSocketConfig::new(self.server.clone()).with_tls(TlsOptions {
            ca_pem: self.ca_pem.clone(),
            insecure: self.insecure,
        });
        match &self.token {
            Some(token) => config.with_bearer_token(token.clone()),
            None => config,
        }
    }

    pub fn connector(&self) -> Result<WebSocketConnector, CliError> {
        Ok(WebSocketConnector::new(self.websocket_config())?)
    }

    pub fn workspace_client(&self) -> Result<WorkspaceClient, CliError> {
        let mut config = ClientConfig::new(self.server.clone());
        config.bearer_token = self.token.clone();
        config.ca_pem = self.ca_pem.clone();
        config.insecure = self.insecure;
        config.api = self.workspace_api.clone();
        config.activity_endpoint = self.activity_endpoint.clone();
        Ok(WorkspaceClient::new(config)?)
    }
}

fn parse_url(value: &str) -> Result<Url, CliError> {
    Url::parse(value).map_err(|source| CliError::InvalidUrl {
        url: value.to_string(),
        source,
    })
}

fn read_file(path: &Path) -> Result<Vec<u8>, CliError> {
    fs::read(path).map_err(|source| CliError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}
