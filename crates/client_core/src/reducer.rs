use serde::Serialize;
use shared::protocol::{
    GitAction, GitCommit, GitEventKind, GitEventPayload, GitPrompt, MergeResult, Message,
    MessageKind, ServerEvent,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::error::SessionError;

pub const TOOL_PREFIX: &str = "Running command: ";
pub const TOOL_RESPONSE_SEPARATOR: &str = "|START_RESPONSE|";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Thinking,
    Executing,
    WaitingForUser,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GitData {
    pub base_commit: Option<GitCommit>,
    pub commits: Vec<GitCommit>,
}

/// Everything the client knows about a session, derived from its event log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerEventContext {
    pub messages: Vec<Message>,
    pub ended: bool,
    pub model_loading: bool,
    pub tool_message: String,
    pub user_request: bool,
    pub status: AgentStatus,
    pub git_data: GitData,
    pub git_error: Option<String>,
    pub git_init: Option<String>,
    pub git_message: Option<GitPrompt>,
    pub git_corrupted: bool,
    pub git_merge_result: Option<MergeResult>,
}

impl ServerEventContext {
    fn push(&mut self, kind: MessageKind, text: impl Into<String>) {
        self.messages.push(Message::new(kind, text));
    }
}

pub fn reduce(mut state: ServerEventContext, event: &ServerEvent) -> ServerEventContext {
    match event {
        ServerEvent::SessionReset => return ServerEventContext::default(),
        ServerEvent::Stop { error } => {
            if let Some(error) = error {
                warn!(%error, "agent stopped with an error");
            }
            state.ended = true;
        }
        ServerEvent::ModelRequest => {
            state.model_loading = true;
            state.status = AgentStatus::Thinking;
        }
        ServerEvent::ModelResponse { thought } => {
            state.status = AgentStatus::Idle;
            state.model_loading = false;
            state.push(MessageKind::Thought, thought.clone());
        }
        ServerEvent::ShellRequest(command) => {
            state.push(MessageKind::ShellCommand, command.clone());
        }
        ServerEvent::ShellResponse(output) => {
            state.push(MessageKind::ShellResponse, output.clone());
        }
        ServerEvent::ToolRequest { raw_command } => {
            state.status = AgentStatus::Executing;
            state.tool_message = format!("{TOOL_PREFIX}{}", raw_command.trim());
        }
        ServerEvent::ToolResponse(output) => {
            let text = format!("{}{TOOL_RESPONSE_SEPARATOR}{output}", state.tool_message);
            state.tool_message.clear();
            state.push(MessageKind::Tool, text);
        }
        ServerEvent::Checkpoint(checkpoint_id) => {
            state.status = AgentStatus::Idle;
            state.push(MessageKind::Checkpoint, checkpoint_id.as_str());
        }
        ServerEvent::Task(text) => state.push(MessageKind::Task, text.clone()),
        ServerEvent::Interrupt(text) => state.push(MessageKind::User, text.clone()),
        ServerEvent::UserRequest(text) => {
            state.status = AgentStatus::WaitingForUser;
            state.user_request = true;
            state.push(MessageKind::Agent, text.clone());
        }
        ServerEvent::UserResponse(text) => {
            state.user_request = false;
            state.push(MessageKind::User, text.clone());
        }
        ServerEvent::RateLimit(text) => {
            state.model_loading = false;
            state.push(MessageKind::RateLimit, text.clone());
        }
        ServerEvent::Error(text) => {
            warn!(error = %text, "agent reported an error");
            state.model_loading = false;
            state.push(MessageKind::Error, text.clone());
        }
        ServerEvent::GitEvent(payload) => apply_git_event(&mut state, payload),
        ServerEvent::GitError(message) => state.git_error = Some(message.clone()),
        ServerEvent::GitResolve { action } => match action {
            Some(GitAction::Retry) => state.git_error = None,
            Some(GitAction::Git) => state.git_init = None,
            Some(GitAction::Yes | GitAction::No) => state.git_message = None,
            Some(GitAction::Nogit) => {
                state.git_error = None;
                state.git_init = None;
            }
            None => {
                state.git_error = None;
                state.git_init = None;
                state.git_message = None;
            }
        },
        ServerEvent::GitAskUser(prompt) => state.git_message = Some(prompt.clone()),
        ServerEvent::GitInit(message) => state.git_init = Some(message.clone()),
        ServerEvent::GitCorrupted => state.git_corrupted = true,
        ServerEvent::GitCorruptedResolved => state.git_corrupted = false,
        ServerEvent::GitMergeResult(result) => state.git_merge_result = Some(result.clone()),
        ServerEvent::GitMergeResolve => state.git_merge_result = None,
        ServerEvent::Malformed { kind, reason } => {
            warn!(kind = %kind, %reason, "ignoring malformed server event");
        }
        ServerEvent::Unrecognized { kind } => {
            debug!(kind = %kind, "ignoring unrecognized server event");
        }
    }
    state
}

fn apply_git_event(state: &mut ServerEventContext, payload: &GitEventPayload) {
    let commit = GitCommit::from(payload);
    match payload.kind {
        GitEventKind::BaseCommit => {
            state.git_data = GitData {
                base_commit: Some(commit.clone()),
                commits: vec![commit],
            };
        }
        GitEventKind::Commit => state.git_data.commits.push(commit),
        GitEventKind::Revert => {
            let target = payload.commit_to_go_to.as_deref().unwrap_or_default();
            match state
                .git_data
                .commits
                .iter()
                .position(|existing| existing.hash == target)
            {
                Some(index) => state.git_data.commits.truncate(index + 1),
                None => warn!(revert_to = %target, "revert target not found in commit history"),
            }
            state.git_data.base_commit = Some(commit);
        }
        GitEventKind::Other => debug!("ignoring unknown git event type"),
    }
}

enum ReducerCommand {
    Apply(Vec<ServerEvent>),
    Reset,
    Current(oneshot::Sender<ServerEventContext>),
}

/// Owns the event context on its own task and publishes every new value.
#[derive(Clone)]
pub struct ReducerHandle {
    commands: mpsc::UnboundedSender<ReducerCommand>,
    state: watch::Receiver<ServerEventContext>,
}

impl ReducerHandle {
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (commands, mut inbox) = mpsc::unbounded_channel();
        let (publisher, state) = watch::channel(ServerEventContext::default());

        let task = tokio::spawn(async move {
            let mut context = ServerEventContext::default();
            while let Some(command) = inbox.recv().await {
                match command {
                    ReducerCommand::Apply(events) => {
                        for event in &events {
                            context = reduce(context, event);
                        }
                    }
                    ReducerCommand::Reset => {
                        context = reduce(context, &ServerEvent::SessionReset);
                    }
                    ReducerCommand::Current(reply) => {
                        let _ = reply.send(context.clone());
                        continue;
                    }
                }
                publisher.send_replace(context.clone());
            }
        });

        (Self { commands, state }, task)
    }

    pub fn apply(&self, event: ServerEvent) {
        self.apply_all(vec![event]);
    }

    pub fn apply_all(&self, events: Vec<ServerEvent>) {
        if events.is_empty() {
            return;
        }
        let _ = self.commands.send(ReducerCommand::Apply(events));
    }

    pub fn reset(&self) {
        let _ = self.commands.send(ReducerCommand::Reset);
    }

    /// Context after every command queued before this call has been applied.
    pub async fn current(&self) -> Result<ServerEventContext, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ReducerCommand::Current(reply))
            .map_err(|_| SessionError::ControllerClosed)?;
        response.await.map_err(|_| SessionError::ControllerClosed)
    }

    pub fn latest(&self) -> ServerEventContext {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerEventContext> {
        self.state.clone()
    }
}

#[cfg(test)]
#[path = "tests/reducer_tests.rs"]
mod tests;
