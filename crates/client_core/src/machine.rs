//! Pure session lifecycle state machine.
//!
//! `SessionMachine::handle` consumes one input and returns the effects the
//! runner must perform. It never does I/O, so every transition can be
//! exercised directly in tests.

use std::{collections::HashMap, fmt, time::Duration};

use serde::{Serialize, Serializer};
use shared::{
    domain::{AgentConfig, CheckpointId, SessionConfig, SessionDescriptor, SessionSummary},
    error::ApiError,
    protocol::{OutboundEvent, RawServerEvent, ServerEvent},
};
use tracing::{debug, info, warn};

use crate::{
    error::SessionError,
    retry::{RetryPolicy, HEALTHCHECK_ADVISORY_THRESHOLD},
};

pub type CallId = u64;
pub type Ticket = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupPhase {
    HealthcheckCheck,
    HealthcheckRetry,
    CheckSession,
    SessionDoesNotExist,
    CreatingRequest,
    CreatingRetry,
    SessionCreated,
    SessionExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Setup(SetupPhase),
    SessionReady,
    Initializing,
    Starting,
    Running,
    Paused,
    Resetting,
    Reverting,
    Resuming,
    Deleting,
    Stopped,
    Error,
}

impl SessionState {
    pub fn is_setup(self) -> bool {
        matches!(self, Self::Setup(_))
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    fn forwards_server_events(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Paused)
    }

    fn accepts_state_updates(self) -> bool {
        !matches!(
            self,
            Self::Setup(_) | Self::SessionReady | Self::Stopped | Self::Error
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = match self {
            Self::Setup(SetupPhase::HealthcheckCheck) => "setup.healthcheck.check",
            Self::Setup(SetupPhase::HealthcheckRetry) => "setup.healthcheck.retry",
            Self::Setup(SetupPhase::CheckSession) => "setup.check_session",
            Self::Setup(SetupPhase::SessionDoesNotExist) => "setup.session_does_not_exist",
            Self::Setup(SetupPhase::CreatingRequest) => "setup.creating.request",
            Self::Setup(SetupPhase::CreatingRetry) => "setup.creating.retry",
            Self::Setup(SetupPhase::SessionCreated) => "setup.creating.created",
            Self::Setup(SetupPhase::SessionExists) => "setup.session_exists",
            Self::SessionReady => "session_ready",
            Self::Initializing => "initializing",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Resetting => "resetting",
            Self::Reverting => "reverting",
            Self::Resuming => "resuming",
            Self::Deleting => "deleting",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(path)
    }
}

impl Serialize for SessionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Create {
        path: String,
        agent_config: AgentConfig,
    },
    Init {
        path: Option<String>,
        agent_config: Option<AgentConfig>,
    },
    Pause,
    Resume,
    Toggle,
    Reset,
    Delete,
    Revert {
        checkpoint_id: CheckpointId,
    },
    SendMessage {
        text: String,
    },
    SendEvent(OutboundEvent),
    UpdateConfig(AgentConfig),
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Init { .. } => "init",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Toggle => "toggle",
            Self::Reset => "reset",
            Self::Delete => "delete",
            Self::Revert { .. } => "revert",
            Self::SendMessage { .. } => "send_message",
            Self::SendEvent(_) => "send_event",
            Self::UpdateConfig(_) => "update_config",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Outbound request the runner performs on the machine's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    Health,
    ListSessions,
    CreateSession {
        path: String,
        agent_config: AgentConfig,
    },
    LoadEvents,
    Start {
        api_key: String,
    },
    Pause,
    Resume,
    /// Pause followed by reset.
    Reset,
    Revert {
        checkpoint_id: CheckpointId,
    },
    /// Teardown followed by delete.
    Delete,
    SendMessage {
        text: String,
    },
    SendEvent(OutboundEvent),
    UpdateConfig(AgentConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallOutput {
    Done,
    Sessions(Vec<SessionSummary>),
    Events(Vec<RawServerEvent>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Command { ticket: Ticket, command: Command },
    Completed {
        call: CallId,
        result: Result<CallOutput, ApiError>,
    },
    RetryElapsed { call: CallId },
    ServerEvent(ServerEvent),
    StateUpdate(SessionConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotification {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    CreationComplete,
    HealthcheckAdvisory {
        failures: u32,
    },
    SessionEnded,
    CommandFailed {
        command: &'static str,
        error: SessionError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Call { call: CallId, request: ApiCall },
    ScheduleRetry { call: CallId, delay: Duration },
    ResetReducer,
    ApplyEvents(Vec<ServerEvent>),
    StoreConfig(SessionConfig),
    StartStream,
    StopStream,
    StartPolling,
    StopPolling,
    Settle {
        ticket: Ticket,
        result: Result<(), SessionError>,
    },
    Notify(SessionNotification),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineOptions {
    pub healthcheck: RetryPolicy,
    pub creation: RetryPolicy,
    pub advisory_threshold: u32,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            healthcheck: RetryPolicy::healthcheck(),
            creation: RetryPolicy::creation(),
            advisory_threshold: HEALTHCHECK_ADVISORY_THRESHOLD,
        }
    }
}

pub struct SessionMachine {
    state: SessionState,
    descriptor: SessionDescriptor,
    options: MachineOptions,
    next_call: CallId,
    /// The one lifecycle call or retry timer currently outstanding.
    lifecycle: Option<CallId>,
    /// Command waiting for the lifecycle chain it started.
    pending: Option<Ticket>,
    origin: SessionState,
    side_calls: HashMap<CallId, Ticket>,
    healthcheck_retry: u32,
    creation_failures: u32,
    revert_target: Option<CheckpointId>,
    last_error: Option<ApiError>,
}

impl SessionMachine {
    pub fn new(descriptor: SessionDescriptor, options: MachineOptions) -> Self {
        Self {
            state: SessionState::Setup(SetupPhase::HealthcheckCheck),
            descriptor,
            options,
            next_call: 0,
            lifecycle: None,
            pending: None,
            origin: SessionState::Setup(SetupPhase::HealthcheckCheck),
            side_calls: HashMap::new(),
            healthcheck_retry: 0,
            creation_failures: 0,
            revert_target: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    pub fn healthcheck_retry(&self) -> u32 {
        self.healthcheck_retry
    }

    pub fn last_error(&self) -> Option<&ApiError> {
        self.last_error.as_ref()
    }

    /// Effects of entering the initial state.
    pub fn start(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.enter(self.state, &mut effects);
        effects
    }

    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        let mut effects = Vec::new();
        match input {
            Input::Command { ticket, command } => self.on_command(ticket, command, &mut effects),
            Input::Completed { call, result } => self.on_completed(call, result, &mut effects),
            Input::RetryElapsed { call } => self.on_retry_elapsed(call, &mut effects),
            Input::ServerEvent(event) => {
                if self.state.forwards_server_events() {
                    effects.push(Effect::ApplyEvents(vec![event]));
                } else {
                    debug!(state = %self.state, kind = event.kind(), "dropping server event");
                }
            }
            Input::StateUpdate(config) => {
                if self.state.accepts_state_updates() {
                    effects.push(Effect::StoreConfig(config));
                }
            }
        }
        effects
    }

    fn next_call_id(&mut self) -> CallId {
        self.next_call += 1;
        self.next_call
    }

    fn issue(&mut self, request: ApiCall, effects: &mut Vec<Effect>) {
        let call = self.next_call_id();
        self.lifecycle = Some(call);
        effects.push(Effect::Call { call, request });
    }

    fn issue_side_call(&mut self, ticket: Ticket, request: ApiCall, effects: &mut Vec<Effect>) {
        let call = self.next_call_id();
        self.side_calls.insert(call, ticket);
        effects.push(Effect::Call { call, request });
    }

    fn schedule_retry(&mut self, delay: Duration, effects: &mut Vec<Effect>) {
        let call = self.next_call_id();
        self.lifecycle = Some(call);
        effects.push(Effect::ScheduleRetry { call, delay });
    }

    fn settle(&mut self, result: Result<(), SessionError>, effects: &mut Vec<Effect>) {
        if let Some(ticket) = self.pending.take() {
            effects.push(Effect::Settle { ticket, result });
        }
    }

    fn reject(&self, ticket: Ticket, command: &Command, effects: &mut Vec<Effect>) {
        debug!(state = %self.state, command = command.name(), "rejecting command");
        effects.push(Effect::Settle {
            ticket,
            result: Err(SessionError::Rejected {
                command: command.name(),
                state: self.state.to_string(),
            }),
        });
    }

    /// Starts a lifecycle chain for `ticket`, superseding whatever was running.
    fn begin(&mut self, ticket: Ticket, target: SessionState, effects: &mut Vec<Effect>) {
        self.lifecycle = None;
        self.settle(Err(SessionError::Superseded), effects);
        self.pending = Some(ticket);
        self.origin = self.state;
        self.transition(target, effects);
    }

    fn transition(&mut self, target: SessionState, effects: &mut Vec<Effect>) {
        let from = self.state;
        self.state = target;
        info!(from = %from, to = %target, "session state changed");
        effects.push(Effect::Notify(SessionNotification::StateChanged { from, to: target }));
        self.enter(target, effects);
    }

    /// Returns to a state after a failed call without repeating its entry work.
    fn restore(&mut self, target: SessionState, effects: &mut Vec<Effect>) {
        if target == SessionState::Starting {
            self.transition(target, effects);
            return;
        }
        let from = self.state;
        self.state = target;
        info!(from = %from, to = %target, "session state restored");
        effects.push(Effect::Notify(SessionNotification::StateChanged { from, to: target }));
    }

    fn enter(&mut self, state: SessionState, effects: &mut Vec<Effect>) {
        match state {
            SessionState::Setup(SetupPhase::HealthcheckCheck) => {
                self.issue(ApiCall::Health, effects);
            }
            SessionState::Setup(SetupPhase::HealthcheckRetry) => {
                let delay = self.options.healthcheck.delay_for(self.healthcheck_retry);
                self.schedule_retry(delay, effects);
            }
            SessionState::Setup(SetupPhase::CheckSession) => {
                self.issue(ApiCall::ListSessions, effects);
            }
            SessionState::Setup(SetupPhase::SessionDoesNotExist) => {}
            SessionState::Setup(SetupPhase::CreatingRequest) => {
                match (&self.descriptor.path, &self.descriptor.agent_config) {
                    (Some(path), Some(agent_config)) => {
                        let request = ApiCall::CreateSession {
                            path: path.clone(),
                            agent_config: agent_config.clone(),
                        };
                        self.issue(request, effects);
                    }
                    _ => {
                        self.settle(Err(SessionError::MissingAgentConfig), effects);
                        self.restore(SessionState::Setup(SetupPhase::SessionDoesNotExist), effects);
                    }
                }
            }
            SessionState::Setup(SetupPhase::CreatingRetry) => {
                let delay = self.options.creation.delay_for(self.creation_failures);
                self.schedule_retry(delay, effects);
            }
            SessionState::Setup(SetupPhase::SessionCreated) => {
                self.settle(Ok(()), effects);
                self.transition(SessionState::Setup(SetupPhase::SessionExists), effects);
            }
            SessionState::Setup(SetupPhase::SessionExists) => {
                effects.push(Effect::Notify(SessionNotification::CreationComplete));
                self.transition(SessionState::SessionReady, effects);
            }
            SessionState::SessionReady => {}
            SessionState::Initializing => {
                effects.push(Effect::ResetReducer);
                self.issue(ApiCall::LoadEvents, effects);
            }
            SessionState::Starting => {
                let api_key = self
                    .descriptor
                    .agent_config
                    .as_ref()
                    .map(|config| config.api_key.clone())
                    .unwrap_or_default();
                self.issue(ApiCall::Start { api_key }, effects);
            }
            SessionState::Running => {}
            SessionState::Paused => self.issue(ApiCall::Pause, effects),
            SessionState::Resetting => self.issue(ApiCall::Reset, effects),
            SessionState::Reverting => match self.revert_target.clone() {
                Some(checkpoint_id) => self.issue(ApiCall::Revert { checkpoint_id }, effects),
                None => {
                    self.settle(Err(SessionError::NoSelectedCheckpoint), effects);
                    self.restore(self.origin, effects);
                }
            },
            SessionState::Resuming => self.issue(ApiCall::Resume, effects),
            SessionState::Deleting => self.issue(ApiCall::Delete, effects),
            SessionState::Stopped => {
                effects.push(Effect::StopStream);
                effects.push(Effect::StopPolling);
            }
            SessionState::Error => {}
        }
    }

    fn on_command(&mut self, ticket: Ticket, command: Command, effects: &mut Vec<Effect>) {
        use SessionState as S;

        match (self.state, command) {
            (S::Stopped, command) => self.reject(ticket, &command, effects),
            (_, Command::Shutdown) => {
                self.lifecycle = None;
                self.settle(Err(SessionError::Superseded), effects);
                self.transition(S::Stopped, effects);
                effects.push(Effect::Settle {
                    ticket,
                    result: Ok(()),
                });
            }
            (_, Command::SendEvent(event)) => {
                self.issue_side_call(ticket, ApiCall::SendEvent(event), effects);
            }
            (_, Command::UpdateConfig(config)) => {
                self.descriptor.agent_config = Some(config.clone());
                self.issue_side_call(ticket, ApiCall::UpdateConfig(config), effects);
            }
            (S::Running, Command::SendMessage { text }) => {
                self.issue_side_call(ticket, ApiCall::SendMessage { text }, effects);
            }
            (
                S::Setup(SetupPhase::SessionDoesNotExist),
                Command::Create { path, agent_config },
            ) => {
                self.descriptor.path = Some(path);
                self.descriptor.agent_config = Some(agent_config);
                self.creation_failures = 0;
                self.begin(ticket, S::Setup(SetupPhase::CreatingRequest), effects);
            }
            (S::SessionReady, Command::Init { path, agent_config }) => {
                if let Some(path) = path {
                    self.descriptor.path = Some(path);
                }
                if let Some(agent_config) = agent_config {
                    self.descriptor.agent_config = Some(agent_config);
                }
                if self.descriptor.agent_config.is_none() {
                    effects.push(Effect::Settle {
                        ticket,
                        result: Err(SessionError::MissingAgentConfig),
                    });
                    return;
                }
                self.begin(ticket, S::Initializing, effects);
            }
            (S::Starting | S::Running, Command::Pause | Command::Toggle) => {
                self.begin(ticket, S::Paused, effects);
            }
            (S::Paused, Command::Resume | Command::Toggle) => {
                self.begin(ticket, S::Starting, effects);
            }
            (S::Starting | S::Running | S::Paused, Command::Reset) => {
                self.begin(ticket, S::Resetting, effects);
            }
            (S::SessionReady | S::Starting | S::Running | S::Paused, Command::Delete) => {
                self.begin(ticket, S::Deleting, effects);
            }
            (S::Running | S::Paused, Command::Revert { checkpoint_id }) => {
                self.revert_target = Some(checkpoint_id);
                self.begin(ticket, S::Reverting, effects);
            }
            (_, command) => self.reject(ticket, &command, effects),
        }
    }

    fn on_completed(
        &mut self,
        call: CallId,
        result: Result<CallOutput, ApiError>,
        effects: &mut Vec<Effect>,
    ) {
        if let Some(ticket) = self.side_calls.remove(&call) {
            let result = result.map(|_| ()).map_err(|err| {
                self.last_error = Some(err.clone());
                SessionError::Api(err)
            });
            effects.push(Effect::Settle { ticket, result });
            return;
        }
        if self.lifecycle != Some(call) {
            debug!(call, state = %self.state, "discarding stale completion");
            return;
        }
        self.lifecycle = None;

        let result = match result {
            Ok(output) => Ok(output),
            Err(err) => {
                if !self.state.is_setup() {
                    warn!(state = %self.state, error = %err, "session call failed");
                }
                self.last_error = Some(err.clone());
                Err(err)
            }
        };

        use SessionState as S;
        match (self.state, result) {
            (S::Setup(SetupPhase::HealthcheckCheck), Ok(_)) => {
                self.transition(S::Setup(SetupPhase::CheckSession), effects);
            }
            (S::Setup(SetupPhase::HealthcheckCheck), Err(err)) => {
                self.healthcheck_retry += 1;
                debug!(attempt = self.healthcheck_retry, error = %err, "health check failed");
                if self.healthcheck_retry == self.options.advisory_threshold {
                    effects.push(Effect::Notify(SessionNotification::HealthcheckAdvisory {
                        failures: self.healthcheck_retry,
                    }));
                }
                if self.options.healthcheck.allows_retry(self.healthcheck_retry) {
                    self.transition(S::Setup(SetupPhase::HealthcheckRetry), effects);
                } else {
                    self.fail(err, effects);
                }
            }
            (S::Setup(SetupPhase::CheckSession), Ok(CallOutput::Sessions(sessions))) => {
                let exists = sessions
                    .iter()
                    .any(|session| session.name == self.descriptor.name);
                let target = if exists {
                    SetupPhase::SessionExists
                } else {
                    SetupPhase::SessionDoesNotExist
                };
                self.transition(S::Setup(target), effects);
            }
            (S::Setup(SetupPhase::CheckSession), _) => {
                self.transition(S::Setup(SetupPhase::SessionDoesNotExist), effects);
            }
            (S::Setup(SetupPhase::CreatingRequest), Ok(_)) => {
                self.transition(S::Setup(SetupPhase::SessionCreated), effects);
            }
            (S::Setup(SetupPhase::CreatingRequest), Err(err)) => {
                self.creation_failures += 1;
                warn!(attempt = self.creation_failures, error = %err, "session creation failed");
                if self.options.creation.allows_retry(self.creation_failures) {
                    self.transition(S::Setup(SetupPhase::CreatingRetry), effects);
                } else {
                    self.fail(err, effects);
                }
            }
            (S::Initializing, Ok(CallOutput::Events(events))) => {
                let replay = events.iter().map(ServerEvent::from_raw).collect();
                effects.push(Effect::ApplyEvents(replay));
                self.settle(Ok(()), effects);
                effects.push(Effect::StartStream);
                effects.push(Effect::StartPolling);
                self.transition(S::Starting, effects);
            }
            (S::Initializing, Ok(_)) => {
                effects.push(Effect::StartStream);
                effects.push(Effect::StartPolling);
                self.settle(Ok(()), effects);
                self.transition(S::Starting, effects);
            }
            (S::Initializing, Err(err)) => {
                self.settle(Err(err.into()), effects);
                self.restore(S::SessionReady, effects);
            }
            (S::Starting, Ok(_)) => {
                self.settle(Ok(()), effects);
                self.transition(S::Running, effects);
            }
            (S::Starting, Err(err)) => {
                self.settle(Err(err.into()), effects);
                self.restore(S::Paused, effects);
            }
            (S::Paused, Ok(_)) => self.settle(Ok(()), effects),
            (S::Paused, Err(err)) => {
                self.settle(Err(err.into()), effects);
                self.restore(self.origin, effects);
            }
            (S::Resetting, Ok(_)) => {
                self.settle(Ok(()), effects);
                effects.push(Effect::StopStream);
                effects.push(Effect::ResetReducer);
                self.transition(S::Initializing, effects);
            }
            (S::Reverting, Ok(_)) => {
                self.revert_target = None;
                effects.push(Effect::StopStream);
                self.transition(S::Resuming, effects);
            }
            (S::Resuming, result) => {
                self.settle(result.map(|_| ()).map_err(SessionError::from), effects);
                self.transition(S::Initializing, effects);
            }
            (S::Deleting, Ok(_)) => {
                self.settle(Ok(()), effects);
                effects.push(Effect::StopStream);
                effects.push(Effect::StopPolling);
                self.healthcheck_retry = 0;
                self.transition(S::Setup(SetupPhase::HealthcheckCheck), effects);
            }
            (S::Resetting | S::Reverting | S::Deleting, Err(err)) => {
                self.revert_target = None;
                self.settle(Err(err.into()), effects);
                self.restore(self.origin, effects);
            }
            (state, _) => {
                debug!(state = %state, "completion does not apply to current state");
            }
        }
    }

    fn on_retry_elapsed(&mut self, call: CallId, effects: &mut Vec<Effect>) {
        if self.lifecycle != Some(call) {
            return;
        }
        self.lifecycle = None;
        match self.state {
            SessionState::Setup(SetupPhase::HealthcheckRetry) => {
                self.transition(SessionState::Setup(SetupPhase::HealthcheckCheck), effects);
            }
            SessionState::Setup(SetupPhase::CreatingRetry) => {
                self.transition(SessionState::Setup(SetupPhase::CreatingRequest), effects);
            }
            _ => {}
        }
    }

    fn fail(&mut self, err: ApiError, effects: &mut Vec<Effect>) {
        warn!(state = %self.state, error = %err, "retries exhausted");
        self.settle(Err(err.into()), effects);
        self.transition(SessionState::Error, effects);
    }
}

#[cfg(test)]
#[path = "tests/machine_tests.rs"]
mod tests;
