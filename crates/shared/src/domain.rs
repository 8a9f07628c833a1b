use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const DEFAULT_SESSION_NAME: &str = "UI";
/// Commit hash the server reports for checkpoints that produced no commit.
pub const NO_COMMIT: &str = "no_commit";

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        // The server sends some ids as numbers and others as strings.
        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                #[derive(Deserialize)]
                #[serde(untagged)]
                enum Raw {
                    Text(String),
                    Number(serde_json::Number),
                }

                Ok(match Raw::deserialize(deserializer)? {
                    Raw::Text(text) => Self(text),
                    Raw::Number(number) => Self(number.to_string()),
                })
            }
        }
    };
}

id_newtype!(SessionName);
id_newtype!(CheckpointId);

impl Default for SessionName {
    fn default() -> Self {
        Self(DEFAULT_SESSION_NAME.to_string())
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub model: String,
    pub api_key: String,
}

impl AgentConfig {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            api_key: api_key.into(),
        }
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersioningType {
    Git,
    #[default]
    None,
}

impl VersioningType {
    pub fn from_git_enabled(enabled: bool) -> Self {
        if enabled {
            Self::Git
        } else {
            Self::None
        }
    }
}

/// Identity of the session a controller drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub host: String,
    pub name: SessionName,
    pub path: Option<String>,
    pub agent_config: Option<AgentConfig>,
}

impl SessionDescriptor {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            name: SessionName::default(),
            path: None,
            agent_config: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<SessionName>) -> Self {
        self.name = name.into();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionRequest {
    pub versioning_type: VersioningType,
    #[serde(flatten)]
    pub agent_config: AgentConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub commit_hash: String,
    #[serde(default)]
    pub commit_message: String,
    #[serde(default)]
    pub agent_history: Value,
    #[serde(default)]
    pub event_id: Option<i64>,
    pub checkpoint_id: CheckpointId,
    #[serde(default)]
    pub index: usize,
}

impl Checkpoint {
    pub fn has_commit(&self) -> bool {
        self.commit_hash != NO_COMMIT
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersioningMetadata {
    #[serde(default)]
    pub current_branch: Option<String>,
    #[serde(default)]
    pub old_branch: Option<String>,
    #[serde(default)]
    pub user_branch: Option<String>,
    #[serde(default)]
    pub initial_commit: Option<String>,
}

/// Server-side view of a session, as returned by the config endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub versioning_type: VersioningType,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub versioning_metadata: VersioningMetadata,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub state: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub name: SessionName,
    #[serde(default)]
    pub path: Option<String>,
}
