use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::CheckpointId;

pub const SESSION_RESET: &str = "session.reset";
pub const USER_PRODUCER: &str = "user";
pub const AGENT_CONSUMER: &str = "agent";

/// Event exactly as it arrives from the history endpoint or the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawServerEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer: Option<String>,
}

impl RawServerEvent {
    pub fn new(kind: impl Into<String>, content: Value) -> Self {
        Self {
            kind: kind.into(),
            content,
            identifier: None,
            producer: None,
            consumer: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitEventKind {
    BaseCommit,
    Commit,
    Revert,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitEventPayload {
    #[serde(rename = "type")]
    pub kind: GitEventKind,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub commit_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_to_go_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCommit {
    pub hash: String,
    pub message: String,
}

impl From<&GitEventPayload> for GitCommit {
    fn from(value: &GitEventPayload) -> Self {
        Self {
            hash: value.commit_hash.clone(),
            message: value.message.trim().to_string(),
        }
    }
}

fn default_prompt_options() -> Vec<String> {
    vec!["Yes".to_string(), "No".to_string()]
}

/// Question the server asks before touching the user's repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitPrompt {
    pub message: String,
    #[serde(default = "default_prompt_options")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitAction {
    Retry,
    Nogit,
    Git,
    Yes,
    No,
}

impl GitAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Nogit => "nogit",
            Self::Git => "git",
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    thought: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct ToolCall {
    raw_command: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct StopDetail {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct ResolvePayload {
    #[serde(default)]
    action: Option<String>,
}

/// Every event kind the client understands. Decoding is total: payloads that
/// do not fit their kind become `Malformed`, unknown kinds `Unrecognized`.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SessionReset,
    ModelRequest,
    ModelResponse { thought: String },
    ToolRequest { raw_command: String },
    ToolResponse(String),
    ShellRequest(String),
    ShellResponse(String),
    Task(String),
    Interrupt(String),
    UserRequest(String),
    UserResponse(String),
    Checkpoint(CheckpointId),
    RateLimit(String),
    Error(String),
    Stop { error: Option<String> },
    GitEvent(GitEventPayload),
    GitError(String),
    GitResolve { action: Option<GitAction> },
    GitAskUser(GitPrompt),
    GitInit(String),
    GitCorrupted,
    GitCorruptedResolved,
    GitMergeResult(MergeResult),
    GitMergeResolve,
    Malformed { kind: String, reason: String },
    Unrecognized { kind: String },
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Some payloads arrive as JSON encoded inside a string.
fn decode_content<T: for<'de> Deserialize<'de>>(content: &Value) -> Result<T, String> {
    let decoded = match content {
        Value::String(text) => serde_json::from_str(text),
        other => serde_json::from_value(other.clone()),
    };
    decoded.map_err(|err| err.to_string())
}

impl ServerEvent {
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<RawServerEvent>(value) {
            Ok(raw) => Self::from_raw(&raw),
            Err(err) => Self::Malformed {
                kind: String::new(),
                reason: err.to_string(),
            },
        }
    }

    pub fn from_raw(raw: &RawServerEvent) -> Self {
        let content = &raw.content;
        let decoded = match raw.kind.as_str() {
            SESSION_RESET => Ok(Self::SessionReset),
            "ModelRequest" => Ok(Self::ModelRequest),
            "ModelResponse" => decode_content::<ModelTurn>(content)
                .map(|turn| Self::ModelResponse {
                    thought: turn.thought,
                }),
            "ToolRequest" => decode_content::<ToolCall>(content).map(|call| Self::ToolRequest {
                raw_command: call.raw_command,
            }),
            "ToolResponse" => Ok(Self::ToolResponse(content_text(content))),
            "ShellRequest" => Ok(Self::ShellRequest(content_text(content))),
            "ShellResponse" => Ok(Self::ShellResponse(content_text(content))),
            "Task" => Ok(Self::Task(content_text(content))),
            "Interrupt" => Ok(Self::Interrupt(content_text(content))),
            "UserRequest" => Ok(Self::UserRequest(content_text(content))),
            "UserResponse" => Ok(Self::UserResponse(content_text(content))),
            "Checkpoint" => Ok(Self::Checkpoint(CheckpointId(content_text(content)))),
            "RateLimit" => Ok(Self::RateLimit(content_text(content))),
            "Error" => Ok(Self::Error(content_text(content))),
            "Stop" => Ok(Self::Stop {
                error: decode_content::<StopDetail>(content)
                    .ok()
                    .filter(|detail| detail.kind == "error")
                    .map(|detail| detail.message),
            }),
            "GitEvent" => decode_content::<GitEventPayload>(content).map(Self::GitEvent),
            "GitError" => Ok(Self::GitError(content_text(content))),
            "GitResolve" => Ok(Self::GitResolve {
                action: decode_content::<ResolvePayload>(content)
                    .ok()
                    .and_then(|payload| payload.action)
                    .and_then(|action| {
                        serde_json::from_value::<GitAction>(Value::String(action)).ok()
                    }),
            }),
            "GitAskUser" => match content {
                Value::String(message) if decode_content::<GitPrompt>(content).is_err() => {
                    Ok(Self::GitAskUser(GitPrompt {
                        message: message.clone(),
                        options: default_prompt_options(),
                    }))
                }
                _ => decode_content::<GitPrompt>(content).map(Self::GitAskUser),
            },
            "GitInit" => Ok(Self::GitInit(content_text(content))),
            "GitCorrupted" => Ok(Self::GitCorrupted),
            "GitCorruptedResolved" => Ok(Self::GitCorruptedResolved),
            "GitMergeResult" => decode_content::<MergeResult>(content).map(Self::GitMergeResult),
            "GitMergeResolve" => Ok(Self::GitMergeResolve),
            other => Ok(Self::Unrecognized {
                kind: other.to_string(),
            }),
        };

        decoded.unwrap_or_else(|reason| Self::Malformed {
            kind: raw.kind.clone(),
            reason,
        })
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::SessionReset => SESSION_RESET,
            Self::ModelRequest => "ModelRequest",
            Self::ModelResponse { .. } => "ModelResponse",
            Self::ToolRequest { .. } => "ToolRequest",
            Self::ToolResponse(_) => "ToolResponse",
            Self::ShellRequest(_) => "ShellRequest",
            Self::ShellResponse(_) => "ShellResponse",
            Self::Task(_) => "Task",
            Self::Interrupt(_) => "Interrupt",
            Self::UserRequest(_) => "UserRequest",
            Self::UserResponse(_) => "UserResponse",
            Self::Checkpoint(_) => "Checkpoint",
            Self::RateLimit(_) => "RateLimit",
            Self::Error(_) => "Error",
            Self::Stop { .. } => "Stop",
            Self::GitEvent(_) => "GitEvent",
            Self::GitError(_) => "GitError",
            Self::GitResolve { .. } => "GitResolve",
            Self::GitAskUser(_) => "GitAskUser",
            Self::GitInit(_) => "GitInit",
            Self::GitCorrupted => "GitCorrupted",
            Self::GitCorruptedResolved => "GitCorruptedResolved",
            Self::GitMergeResult(_) => "GitMergeResult",
            Self::GitMergeResolve => "GitMergeResolve",
            Self::Malformed { kind, .. } | Self::Unrecognized { kind } => kind,
        }
    }
}

/// Client-originated event posted to the session's event endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Value,
    pub producer: String,
    pub consumer: String,
}

impl OutboundEvent {
    pub fn from_user(kind: impl Into<String>, content: Value) -> Self {
        Self {
            kind: kind.into(),
            content,
            producer: USER_PRODUCER.to_string(),
            consumer: AGENT_CONSUMER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    User,
    Agent,
    Task,
    Thought,
    Tool,
    ShellCommand,
    ShellResponse,
    RateLimit,
    Error,
    Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

impl Message {
    pub fn new(kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind,
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
