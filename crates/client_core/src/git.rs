use serde_json::json;
use shared::protocol::{GitAction, GitPrompt, MergeResult, OutboundEvent};

use crate::{error::SessionError, reducer::ServerEventContext};

pub const AGENT_BRANCH: &str = "theseus_agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitPromptKind {
    Corrupted,
    Error,
    Init,
    AskUser,
    MergeResult,
}

impl GitPromptKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Corrupted => "corrupted repository",
            Self::Error => "git error",
            Self::Init => "git init",
            Self::AskUser => "git question",
            Self::MergeResult => "merge result",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveGitPrompt {
    Corrupted,
    Error(String),
    Init(String),
    AskUser(GitPrompt),
    MergeResult(MergeResult),
}

impl ActiveGitPrompt {
    pub fn kind(&self) -> GitPromptKind {
        match self {
            Self::Corrupted => GitPromptKind::Corrupted,
            Self::Error(_) => GitPromptKind::Error,
            Self::Init(_) => GitPromptKind::Init,
            Self::AskUser(_) => GitPromptKind::AskUser,
            Self::MergeResult(_) => GitPromptKind::MergeResult,
        }
    }
}

/// All pending prompts, most urgent first: corrupted, error, init, question,
/// merge result.
pub fn pending_prompts(context: &ServerEventContext) -> Vec<ActiveGitPrompt> {
    let mut prompts = Vec::new();
    if context.git_corrupted {
        prompts.push(ActiveGitPrompt::Corrupted);
    }
    if let Some(error) = &context.git_error {
        prompts.push(ActiveGitPrompt::Error(error.clone()));
    }
    if let Some(message) = &context.git_init {
        prompts.push(ActiveGitPrompt::Init(message.clone()));
    }
    if let Some(prompt) = &context.git_message {
        prompts.push(ActiveGitPrompt::AskUser(prompt.clone()));
    }
    if let Some(result) = &context.git_merge_result {
        prompts.push(ActiveGitPrompt::MergeResult(result.clone()));
    }
    prompts
}

pub fn active_prompt(context: &ServerEventContext) -> Option<ActiveGitPrompt> {
    pending_prompts(context).into_iter().next()
}

/// Whether chat input should wait until a prompt is answered. A merge
/// result is informational only.
pub fn blocks_input(context: &ServerEventContext) -> bool {
    pending_prompts(context)
        .iter()
        .any(|prompt| prompt.kind() != GitPromptKind::MergeResult)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitResolution {
    Error(GitAction),
    Init(GitAction),
    AskUser(GitAction),
    Corrupted,
    MergeResult,
}

impl GitResolution {
    pub fn kind(self) -> GitPromptKind {
        match self {
            Self::Error(_) => GitPromptKind::Error,
            Self::Init(_) => GitPromptKind::Init,
            Self::AskUser(_) => GitPromptKind::AskUser,
            Self::Corrupted => GitPromptKind::Corrupted,
            Self::MergeResult => GitPromptKind::MergeResult,
        }
    }

    /// Checks the action fits the prompt and that such a prompt is pending.
    pub fn validate(self, context: &ServerEventContext) -> Result<(), SessionError> {
        let kind = self.kind();
        let allowed = match self {
            Self::Error(action) => matches!(action, GitAction::Retry | GitAction::Nogit),
            Self::Init(action) => matches!(action, GitAction::Git | GitAction::Nogit),
            Self::AskUser(action) => matches!(action, GitAction::Yes | GitAction::No),
            Self::Corrupted | Self::MergeResult => true,
        };
        if !allowed {
            if let Self::Error(action) | Self::Init(action) | Self::AskUser(action) = self {
                return Err(SessionError::InvalidResolution {
                    prompt: kind.name(),
                    action,
                });
            }
        }

        let pending = pending_prompts(context)
            .iter()
            .any(|prompt| prompt.kind() == kind);
        if pending {
            Ok(())
        } else {
            Err(SessionError::NoPendingPrompt(kind.name()))
        }
    }

    pub fn to_event(self) -> OutboundEvent {
        match self {
            Self::Error(action) | Self::Init(action) | Self::AskUser(action) => {
                OutboundEvent::from_user("GitResolve", json!({ "action": action.as_str() }))
            }
            Self::Corrupted => OutboundEvent::from_user(
                "GitCorruptedResolved",
                json!({ "action": GitAction::Yes.as_str() }),
            ),
            Self::MergeResult => OutboundEvent::from_user("GitMergeResolve", json!({})),
        }
    }

    /// A corrupted repository is only recovered by resetting the session.
    pub fn requires_reset(self) -> bool {
        matches!(self, Self::Corrupted)
    }
}

pub fn default_merge_message(branch: &str) -> String {
    format!("Merge branch '{AGENT_BRANCH}' into {branch}")
}

/// Asks the server to merge the agent branch back into the user's branch.
pub fn merge_request(commit_message: &str) -> OutboundEvent {
    OutboundEvent::from_user(
        "GitMerge",
        json!({ "commit_message": commit_message.trim() }),
    )
}

#[cfg(test)]
#[path = "tests/git_tests.rs"]
mod tests;
