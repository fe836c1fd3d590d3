use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Annotation the workspace controller sets when it stops a workspace.
pub const STOPPED_BY_ANNOTATION: &str = "controller.devfile.io/stopped-by";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMetadata {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// The workspace custom resource backing a cloud shell pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: WorkspaceMetadata,
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl Workspace {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            metadata: WorkspaceMetadata {
                name: name.into(),
                namespace: namespace.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.annotations.insert(key.into(), value.into());
        self
    }

    pub fn stopped_by(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(STOPPED_BY_ANNOTATION)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn is_started(&self) -> bool {
        self.spec
            .get("started")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("workspace {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },
    #[error("workspace store error: {0}")]
    Backend(String),
}

/// Where workspace resources live.
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn fetch(&self, name: &str, namespace: &str) -> Result<Workspace, StoreError>;

    /// Asks the controller to (re)start the workspace.
    async fn start(&self, workspace: &Workspace) -> Result<(), StoreError>;

    /// Records user activity so the idle timer does not stop the workspace.
    async fn activity_tick(&self, _name: &str, _namespace: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Simple in-memory store for tests and local wiring.
#[derive(Debug, Default)]
pub struct InMemoryWorkspaceStore {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    workspaces: HashMap<(String, String), Workspace>,
    fail_fetch: Option<String>,
    fetches: usize,
    started: Vec<String>,
    ticks: Vec<String>,
}

impl InMemoryWorkspaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, workspace: Workspace) {
        let key = (
            workspace.metadata.namespace.clone(),
            workspace.metadata.name.clone(),
        );
        self.inner.lock().workspaces.insert(key, workspace);
    }

    /// Makes every subsequent fetch fail with `message`.
    pub fn fail_fetches(&self, message: impl Into<String>) {
        self.inner.lock().fail_fetch = Some(message.into());
    }

    pub fn fetch_count(&self) -> usize {
        self.inner.lock().fetches
    }

    /// `namespace/name` of every started workspace, in order.
    pub fn started(&self) -> Vec<String> {
        self.inner.lock().started.clone()
    }

    pub fn ticks(&self) -> Vec<String> {
        self.inner.lock().ticks.clone()
    }
}

#[async_trait]
impl WorkspaceStore for InMemoryWorkspaceStore {
    async fn fetch(&self, name: &str, namespace: &str) -> Result<Workspace, StoreError> {
        let mut state = self.inner.lock();
        state.fetches += 1;
        if let Some(message) = state.fail_fetch.clone() {
            return Err(StoreError::Backend(message));
        }
        state
            .workspaces
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn start(&self, workspace: &Workspace) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        let key = (
            workspace.metadata.namespace.clone(),
            workspace.metadata.name.clone(),
        );
        let stored = state
            .workspaces
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound {
                namespace: key.0.clone(),
                name: key.1.clone(),
            })?;
        stored.spec = serde_json::json!({ "started": true });
        stored.metadata.annotations.remove(STOPPED_BY_ANNOTATION);
        state.started.push(format!("{}/{}", key.0, key.1));
        Ok(())
    }

    async fn activity_tick(&self, name: &str, namespace: &str) -> Result<(), StoreError> {
        self.inner.lock().ticks.push(format!("{namespace}/{name}"));
        Ok(())
    }
}
