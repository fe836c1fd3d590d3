//! Asynchronous client for the workspace custom resource that backs a cloud
//! shell pod.
//!
//! Used by the adapter to explain why a terminal connection dropped, to start
//! a stopped workspace again and to keep an idle timer from stopping it.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use exec_channel::workspace::{StoreError, Workspace, WorkspaceStore};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Certificate, Client, Response, StatusCode};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

const MERGE_PATCH: &str = "application/merge-patch+json";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("workspace {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },
    #[error("{0} cannot be used as a base URL")]
    InvalidBase(Url),
    #[error("invalid workspace api `{0}`; expected GROUP/VERSION/PLURAL")]
    InvalidApi(String),
}

impl From<ClientError> for StoreError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NotFound { namespace, name } => StoreError::NotFound { namespace, name },
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Group, version and plural of the workspace resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceApi {
    pub group: String,
    pub version: String,
    pub plural: String,
}

impl Default for WorkspaceApi {
    fn default() -> Self {
        Self {
            group: "workspace.devfile.io".into(),
            version: "v1alpha2".into(),
            plural: "devworkspaces".into(),
        }
    }
}

impl FromStr for WorkspaceApi {
    type Err = ClientError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.trim().split('/').collect();
        match parts.as_slice() {
            [group, version, plural]
                if [group, version, plural].iter().all(|part| !part.is_empty()) =>
            {
                Ok(Self {
                    group: group.to_string(),
                    version: version.to_string(),
                    plural: plural.to_string(),
                })
            }
            _ => Err(ClientError::InvalidApi(value.to_string())),
        }
    }
}

impl fmt::Display for WorkspaceApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.version, self.plural)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: Url,
    pub bearer_token: Option<String>,
    /// PEM bundle trusted in addition to the system roots.
    pub ca_pem: Option<Vec<u8>>,
    pub insecure: bool,
    pub api: WorkspaceApi,
    /// Base URL of the activity tick endpoint; ticks are skipped without one.
    pub activity_endpoint: Option<Url>,
}

impl ClientConfig {
    pub fn new(server: Url) -> Self {
        Self {
            server,
            bearer_token: None,
            ca_pem: None,
            insecure: false,
            api: WorkspaceApi::default(),
            activity_endpoint: None,
        }
    }
}

#[derive(Clone)]
pub struct WorkspaceClient {
    http: Client,
    config: ClientConfig,
}

impl WorkspaceClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let mut builder = Client::builder().danger_accept_invalid_certs(config.insecure);
        if let Some(pem) = &config.ca_pem {
            builder = builder.add_root_certificate(Certificate::from_pem(pem)?);
        }
        Ok(Self {
            http: builder.build()?,
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// `{server}/apis/{group}/{version}/namespaces/{ns}/{plural}/{name}`
    pub fn resource_url(&self, name: &str, namespace: &str) -> Result<Url, ClientError> {
        let api = &self.config.api;
        join(
            &self.config.server,
            &[
                "apis",
                &api.group,
                &api.version,
                "namespaces",
                namespace,
                &api.plural,
                name,
            ],
        )
    }

    pub async fn get(&self, name: &str, namespace: &str) -> Result<Workspace, ClientError> {
        let url = self.resource_url(name, namespace)?;
        debug!(target: "workspace::client", %url, "fetching workspace");
        let res = self.authorize(self.http.get(url)).send().await?;
        let res = check(res, name, namespace).await?;
        Ok(res.json::<Workspace>().await?)
    }

    /// Sets `spec.started` with a JSON merge patch.
    pub async fn start(&self, name: &str, namespace: &str) -> Result<(), ClientError> {
        let url = self.resource_url(name, namespace)?;
        debug!(target: "workspace::client", %url, "starting workspace");
        let body = json!({ "spec": { "started": true } });
        let res = self
            .authorize(self.http.patch(url))
            .header(CONTENT_TYPE, MERGE_PATCH)
            .body(body.to_string())
            .send()
            .await?;
        check(res, name, namespace).await?;
        Ok(())
    }

    /// Posts `{activity_endpoint}/{ns}/{name}/activity/tick`. Returns
    /// `Ok(false)` when no endpoint is configured.
    pub async fn tick(&self, name: &str, namespace: &str) -> Result<bool, ClientError> {
        let Some(base) = &self.config.activity_endpoint else {
            return Ok(false);
        };
        let url = join(base, &[namespace, name, "activity", "tick"])?;
        trace!(target: "workspace::client", %url, "activity tick");
        let res = self.authorize(self.http.post(url)).send().await?;
        check(res, name, namespace).await?;
        Ok(true)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn join(base: &Url, segments: &[&str]) -> Result<Url, ClientError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ClientError::InvalidBase(base.clone()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn check(res: Response, name: &str, namespace: &str) -> Result<Response, ClientError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }
    let body = res.text().await.unwrap_or_default();
    Err(ClientError::UnexpectedStatus { status, body })
}

#[async_trait]
impl WorkspaceStore for WorkspaceClient {
    async fn fetch(&self, name: &str, namespace: &str) -> Result<Workspace, StoreError> {
        Ok(self.get(name, namespace).await?)
    }

    async fn start(&self, workspace: &Workspace) -> Result<(), StoreError> {
        let metadata = &workspace.metadata;
        Ok(WorkspaceClient::start(self, &metadata.name, &metadata.namespace).await?)
    }

    async fn activity_tick(&self, name: &str, namespace: &str) -> Result<(), StoreError> {
        self.tick(name, namespace).await?;
        Ok(())
    }
}
