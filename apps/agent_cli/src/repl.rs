use anyhow::{anyhow, bail};
use client_core::{
    checkpoint::CheckpointTracker,
    git::{ActiveGitPrompt, GitPromptKind},
    reducer::{ServerEventContext, TOOL_RESPONSE_SEPARATOR},
    GitResolution, SessionNotification, SessionState,
};
use shared::{
    domain::CheckpointId,
    protocol::{GitAction, Message, MessageKind},
};

pub const HELP: &str = "\
commands:
  <text>             talk to the agent
  /pause /resume     pause or resume the agent (/toggle flips)
  /reset             clear the session and start over
  /delete            delete the session on the server
  /status            show session state
  /checkpoints       list checkpoints
  /select <id|none>  enter or leave time travel
  /revert [id]       revert to a checkpoint (default: selected)
  /diff              diff initial checkpoint against selected or current
  /git <answer>      answer the pending git prompt
                     (retry, nogit, git, yes, no, recover, dismiss)
  /merge [message]   merge the agent branch into yours
  /model <id> [key]  switch model
  /quit              leave";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitAnswer {
    Action(GitAction),
    Recover,
    Dismiss,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Say(String),
    Pause,
    Resume,
    Toggle,
    Reset,
    Delete,
    Status,
    Checkpoints,
    Select(Option<CheckpointId>),
    Revert(Option<CheckpointId>),
    Diff,
    Git(GitAnswer),
    Merge(Option<String>),
    Model {
        model: String,
        api_key: Option<String>,
    },
    Help,
    Quit,
}

/// Parses one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> anyhow::Result<Option<ReplCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(ReplCommand::Say(line.to_string())));
    };

    let (name, argument) = match rest.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, Some(argument.trim()).filter(|arg| !arg.is_empty())),
        None => (rest, None),
    };
    let command = match (name, argument) {
        ("pause", None) => ReplCommand::Pause,
        ("resume", None) => ReplCommand::Resume,
        ("toggle", None) => ReplCommand::Toggle,
        ("reset", None) => ReplCommand::Reset,
        ("delete", None) => ReplCommand::Delete,
        ("status", None) => ReplCommand::Status,
        ("checkpoints", None) => ReplCommand::Checkpoints,
        ("select", Some("none")) => ReplCommand::Select(None),
        ("select", Some(id)) => ReplCommand::Select(Some(CheckpointId::from(id))),
        ("revert", id) => ReplCommand::Revert(id.map(CheckpointId::from)),
        ("diff", None) => ReplCommand::Diff,
        ("git", Some(answer)) => ReplCommand::Git(parse_git_answer(answer)?),
        ("merge", message) => ReplCommand::Merge(message.map(str::to_string)),
        ("model", Some(argument)) => {
            let mut parts = argument.split_whitespace();
            let model = parts
                .next()
                .ok_or_else(|| anyhow!("/model needs a model id"))?
                .to_string();
            ReplCommand::Model {
                model,
                api_key: parts.next().map(str::to_string),
            }
        }
        ("help", _) => ReplCommand::Help,
        ("quit" | "exit", None) => ReplCommand::Quit,
        (name, _) => bail!("unknown or malformed command /{name}; try /help"),
    };
    Ok(Some(command))
}

fn parse_git_answer(answer: &str) -> anyhow::Result<GitAnswer> {
    Ok(match answer.to_ascii_lowercase().as_str() {
        "retry" => GitAnswer::Action(GitAction::Retry),
        "nogit" => GitAnswer::Action(GitAction::Nogit),
        "git" => GitAnswer::Action(GitAction::Git),
        "yes" => GitAnswer::Action(GitAction::Yes),
        "no" => GitAnswer::Action(GitAction::No),
        "recover" => GitAnswer::Recover,
        "dismiss" => GitAnswer::Dismiss,
        other => bail!("unknown git answer {other}"),
    })
}

/// Maps an answer onto the prompt currently shown.
pub fn resolution_for(prompt: &ActiveGitPrompt, answer: GitAnswer) -> anyhow::Result<GitResolution> {
    let resolution = match (prompt.kind(), answer) {
        (GitPromptKind::Error, GitAnswer::Action(action)) => GitResolution::Error(action),
        (GitPromptKind::Init, GitAnswer::Action(action)) => GitResolution::Init(action),
        (GitPromptKind::AskUser, GitAnswer::Action(action)) => GitResolution::AskUser(action),
        (GitPromptKind::Corrupted, GitAnswer::Recover) => GitResolution::Corrupted,
        (GitPromptKind::MergeResult, GitAnswer::Dismiss) => GitResolution::MergeResult,
        (kind, answer) => bail!("{answer:?} does not answer the {} prompt", kind.name()),
    };
    Ok(resolution)
}

pub fn render_message(message: &Message) -> String {
    match message.kind {
        MessageKind::User => format!("> {}", message.text),
        MessageKind::Agent => format!("agent: {}", message.text),
        MessageKind::Task => format!("task: {}", message.text),
        MessageKind::Thought => format!("  ({})", message.text),
        MessageKind::Tool => match message.text.split_once(TOOL_RESPONSE_SEPARATOR) {
            Some((command, output)) => format!("$ {command}\n{output}"),
            None => format!("$ {}", message.text),
        },
        MessageKind::ShellCommand => format!("$ {}", message.text),
        MessageKind::ShellResponse => message.text.clone(),
        MessageKind::RateLimit => format!("rate limited: {}", message.text),
        MessageKind::Error => format!("error: {}", message.text),
        MessageKind::Checkpoint => format!("-- checkpoint {} --", message.text),
    }
}

pub fn render_prompt(prompt: &ActiveGitPrompt) -> String {
    match prompt {
        ActiveGitPrompt::Corrupted => {
            "git: the repository is corrupted; /git recover resets the session".to_string()
        }
        ActiveGitPrompt::Error(message) => format!("git error: {message} (/git retry or /git nogit)"),
        ActiveGitPrompt::Init(message) => format!("git: {message} (/git git or /git nogit)"),
        ActiveGitPrompt::AskUser(prompt) => {
            format!("git: {} [{}] (/git yes or /git no)", prompt.message, prompt.options.join("/"))
        }
        ActiveGitPrompt::MergeResult(result) => {
            let outcome = if result.success { "merged" } else { "merge failed" };
            format!("git: {outcome}: {} (/git dismiss)", result.message)
        }
    }
}

pub fn render_checkpoints(tracker: &CheckpointTracker) -> String {
    if tracker.commits().is_empty() {
        return "no checkpoints yet".to_string();
    }
    let selected = tracker.selected.as_ref().map(|checkpoint| &checkpoint.checkpoint_id);
    tracker
        .commits()
        .iter()
        .map(|checkpoint| {
            let marker = if Some(&checkpoint.checkpoint_id) == selected {
                "*"
            } else {
                " "
            };
            let hash: String = checkpoint.commit_hash.chars().take(8).collect();
            format!(
                "{marker} {:>3}  {}  {}",
                checkpoint.checkpoint_id,
                hash,
                checkpoint.commit_message.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One line for notifications worth showing; the rest go to the log.
pub fn describe(notification: &SessionNotification, host: &str) -> Option<String> {
    match notification {
        SessionNotification::StateChanged { to, .. } => match to {
            SessionState::Running
            | SessionState::Paused
            | SessionState::Error
            | SessionState::Stopped => Some(format!("[{to}]")),
            _ => None,
        },
        SessionNotification::CreationComplete => Some("session ready".to_string()),
        SessionNotification::HealthcheckAdvisory { failures } => Some(format!(
            "{host} has not answered {failures} health checks; is the agent server running?"
        )),
        SessionNotification::SessionEnded => Some("agent finished".to_string()),
        SessionNotification::CommandFailed { command, error } => {
            Some(format!("{command} failed: {error}"))
        }
    }
}

/// Tracks how much of the message log has been printed.
#[derive(Debug, Default)]
pub struct Transcript {
    printed: usize,
    prompt: Option<ActiveGitPrompt>,
}

impl Transcript {
    /// Lines to print for whatever changed since the last call.
    pub fn update(&mut self, context: &ServerEventContext) -> Vec<String> {
        let mut lines = Vec::new();
        if context.messages.len() < self.printed {
            self.printed = 0;
            lines.push("-- history reloaded --".to_string());
        }
        lines.extend(context.messages[self.printed..].iter().map(render_message));
        self.printed = context.messages.len();

        let prompt = client_core::git::active_prompt(context);
        if prompt != self.prompt {
            if let Some(prompt) = &prompt {
                lines.push(render_prompt(prompt));
            }
            self.prompt = prompt;
        }
        lines
    }
}

#[cfg(test)]
#[path = "tests/repl_tests.rs"]
mod tests;
