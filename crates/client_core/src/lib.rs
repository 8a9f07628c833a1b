use std::sync::Arc;

pub mod api;
pub mod checkpoint;
pub mod controller;
pub mod error;
pub mod git;
pub mod machine;
pub mod poller;
pub mod reducer;
pub mod retry;
pub mod settings;
pub mod stream;

pub use api::{HttpSessionApi, SessionApi};
pub use controller::{CommandFailure, ControllerOptions, SessionController, SessionSnapshot};
pub use error::SessionError;
pub use git::GitResolution;
pub use machine::{SessionNotification, SessionState, SetupPhase};
pub use reducer::ServerEventContext;
pub use settings::{
    DirectoryPicker, InMemoryKeyStore, InMemoryUserSettings, KeyStore, UserSettings,
};

/// Collaborators a session controller talks to.
#[derive(Clone)]
pub struct SessionContext {
    pub api: Arc<dyn SessionApi>,
    pub key_store: Arc<dyn KeyStore>,
    pub user_settings: Arc<dyn UserSettings>,
}

impl SessionContext {
    /// Context backed by in-memory key store and settings.
    pub fn new(api: Arc<dyn SessionApi>) -> Self {
        Self {
            api,
            key_store: Arc::new(InMemoryKeyStore::default()),
            user_settings: Arc::new(InMemoryUserSettings::default()),
        }
    }

    pub fn with_key_store(mut self, key_store: Arc<dyn KeyStore>) -> Self {
        self.key_store = key_store;
        self
    }

    pub fn with_user_settings(mut self, user_settings: Arc<dyn UserSettings>) -> Self {
        self.user_settings = user_settings;
        self
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
