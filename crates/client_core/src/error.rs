use shared::{domain::CheckpointId, error::ApiError, protocol::GitAction};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("{command} is not accepted while the session is {state}")]
    Rejected { command: &'static str, state: String },
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("invalid host url {host}: {reason}")]
    InvalidHost { host: String, reason: String },
    #[error("no agent configuration available; create or init with a model and api key")]
    MissingAgentConfig,
    #[error("checkpoint {0} is not part of the current checkpoint list")]
    UnknownCheckpoint(CheckpointId),
    #[error("no checkpoint is selected")]
    NoSelectedCheckpoint,
    #[error("there is no pending {0} prompt")]
    NoPendingPrompt(&'static str),
    #[error("{action:?} does not answer a {prompt} prompt")]
    InvalidResolution {
        prompt: &'static str,
        action: GitAction,
    },
    #[error("no merge commit message given and no default applies")]
    MissingMergeMessage,
    #[error("{0}")]
    Collaborator(String),
    #[error("superseded by a later command")]
    Superseded,
    #[error("session controller is no longer running")]
    ControllerClosed,
}

impl SessionError {
    pub fn api(&self) -> Option<&ApiError> {
        match self {
            Self::Api(err) => Some(err),
            _ => None,
        }
    }
}
