use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use shared::domain::{AgentConfig, VersioningType};
use tokio::sync::RwLock;

use crate::error::SessionError;

pub const GIT_ENABLED: &str = "git.enabled";
pub const GIT_CREATE_NEW_BRANCH: &str = "git.create-new-branch";
pub const GIT_MERGE_USE_DEFAULT_COMMIT_MESSAGE: &str = "git.merge-use-default-commit-message";

/// API keys, stored per model id.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get_api_key(&self, model: &str) -> Result<Option<String>, SessionError>;
    async fn add_api_key(&self, model: &str, api_key: &str) -> Result<(), SessionError>;
}

/// Persistent user preferences addressed by dotted path.
#[async_trait]
pub trait UserSettings: Send + Sync {
    async fn get(&self, path: &str) -> Option<Value>;
    async fn set(&self, path: &str, value: Value) -> Result<(), SessionError>;
    async fn has(&self, path: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectorySelection {
    Selected(PathBuf),
    Cancelled,
}

#[async_trait]
pub trait DirectoryPicker: Send + Sync {
    async fn pick_directory(&self) -> Result<DirectorySelection, SessionError>;
}

#[derive(Default)]
pub struct InMemoryKeyStore {
    keys: RwLock<HashMap<String, String>>,
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn get_api_key(&self, model: &str) -> Result<Option<String>, SessionError> {
        Ok(self.keys.read().await.get(model).cloned())
    }

    async fn add_api_key(&self, model: &str, api_key: &str) -> Result<(), SessionError> {
        self.keys
            .write()
            .await
            .insert(model.to_string(), api_key.to_string());
        Ok(())
    }
}

pub struct InMemoryUserSettings {
    values: RwLock<HashMap<String, Value>>,
}

impl Default for InMemoryUserSettings {
    fn default() -> Self {
        let values = HashMap::from([
            (GIT_ENABLED.to_string(), Value::Bool(true)),
            (GIT_CREATE_NEW_BRANCH.to_string(), Value::Bool(true)),
            (
                GIT_MERGE_USE_DEFAULT_COMMIT_MESSAGE.to_string(),
                Value::Bool(false),
            ),
        ]);
        Self {
            values: RwLock::new(values),
        }
    }
}

#[async_trait]
impl UserSettings for InMemoryUserSettings {
    async fn get(&self, path: &str) -> Option<Value> {
        self.values.read().await.get(path).cloned()
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), SessionError> {
        if path.trim().is_empty() {
            return Err(SessionError::Collaborator(
                "setting path must not be empty".to_string(),
            ));
        }
        self.values.write().await.insert(path.to_string(), value);
        Ok(())
    }

    async fn has(&self, path: &str) -> bool {
        self.values.read().await.contains_key(path)
    }
}

/// Picker for headless use: always answers with the directory it was built with.
pub struct FixedDirectoryPicker {
    directory: Option<PathBuf>,
}

impl FixedDirectoryPicker {
    pub fn new(directory: Option<PathBuf>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl DirectoryPicker for FixedDirectoryPicker {
    async fn pick_directory(&self) -> Result<DirectorySelection, SessionError> {
        match &self.directory {
            None => Ok(DirectorySelection::Cancelled),
            Some(directory) if directory.is_absolute() => {
                Ok(DirectorySelection::Selected(directory.clone()))
            }
            Some(directory) => Err(SessionError::Collaborator(format!(
                "project directory must be absolute: {}",
                directory.display()
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GitSettings {
    pub enabled: bool,
    pub create_new_branch: bool,
    pub merge_use_default_commit_message: bool,
}

impl GitSettings {
    pub fn versioning_type(&self) -> VersioningType {
        VersioningType::from_git_enabled(self.enabled)
    }
}

async fn flag(settings: &dyn UserSettings, path: &str, default: bool) -> bool {
    settings
        .get(path)
        .await
        .and_then(|value| value.as_bool())
        .unwrap_or(default)
}

pub async fn git_settings(settings: &dyn UserSettings) -> GitSettings {
    GitSettings {
        enabled: flag(settings, GIT_ENABLED, true).await,
        create_new_branch: flag(settings, GIT_CREATE_NEW_BRANCH, true).await,
        merge_use_default_commit_message: flag(
            settings,
            GIT_MERGE_USE_DEFAULT_COMMIT_MESSAGE,
            false,
        )
        .await,
    }
}

/// Builds the agent config for `model`. An explicit key is stored for next
/// time; otherwise the stored key is used.
pub async fn resolve_agent_config(
    key_store: &dyn KeyStore,
    model: &str,
    api_key: Option<&str>,
) -> Result<AgentConfig, SessionError> {
    if let Some(api_key) = api_key.filter(|key| !key.trim().is_empty()) {
        key_store.add_api_key(model, api_key).await?;
        return Ok(AgentConfig::new(model, api_key));
    }
    key_store
        .get_api_key(model)
        .await?
        .map(|api_key| AgentConfig::new(model, api_key))
        .ok_or(SessionError::MissingAgentConfig)
}

#[cfg(test)]
#[path = "tests/settings_tests.rs"]
mod tests;
