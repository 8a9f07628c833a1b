use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use shared::{
    domain::{
        AgentConfig, CheckpointId, CreateSessionRequest, SessionConfig, SessionDescriptor,
        SessionName,
    },
    error::{ApiError, ErrorCode},
    protocol::{OutboundEvent, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::SessionApi,
    checkpoint::{CheckpointTracker, RevertRollback},
    error::SessionError,
    git::{self, GitResolution},
    machine::{
        ApiCall, CallId, CallOutput, Command, Effect, Input, MachineOptions, SessionMachine,
        SessionNotification, SessionState, Ticket,
    },
    poller::{spawn_poller, PollerHandle, DEFAULT_POLL_INTERVAL},
    reducer::{ReducerHandle, ServerEventContext},
    settings::{git_settings, UserSettings},
    stream::{spawn_stream_consumer, StreamConsumerHandle, StreamFrame},
    SessionContext,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    pub machine: MachineOptions,
    pub poll_interval: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            machine: MachineOptions::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandFailure {
    pub command: String,
    pub code: Option<ErrorCode>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Everything an observer needs to render the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub name: SessionName,
    pub path: Option<String>,
    pub model: Option<String>,
    pub context: ServerEventContext,
    pub config: Option<SessionConfig>,
    pub checkpoints: CheckpointTracker,
    pub healthcheck_retry: u32,
    pub last_failure: Option<CommandFailure>,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum ControllerMessage {
    Command {
        command: Command,
        reply: Reply<()>,
    },
    SelectCheckpoint {
        checkpoint_id: Option<CheckpointId>,
        reply: Reply<()>,
    },
    RevertTo {
        checkpoint_id: Option<CheckpointId>,
        reply: Reply<()>,
    },
    TakeCommitMessage {
        reply: oneshot::Sender<Option<String>>,
    },
}

/// Cloneable handle to a running session controller.
#[derive(Clone)]
pub struct SessionController {
    inbox: mpsc::UnboundedSender<ControllerMessage>,
    snapshot: watch::Receiver<SessionSnapshot>,
    notifications: broadcast::Sender<SessionNotification>,
    api: Arc<dyn SessionApi>,
    user_settings: Arc<dyn UserSettings>,
    name: SessionName,
}

impl SessionController {
    pub fn spawn(
        descriptor: SessionDescriptor,
        context: SessionContext,
        options: ControllerOptions,
    ) -> (Self, JoinHandle<()>) {
        let (inbox, messages) = mpsc::unbounded_channel();
        let (inputs_tx, inputs) = mpsc::unbounded_channel();
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (configs_tx, configs) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(1024);

        let name = descriptor.name.clone();
        let (reducer, _) = ReducerHandle::spawn();
        let (stream, _) = spawn_stream_consumer(Arc::clone(&context.api), name.clone(), frames_tx);
        let (poller, _) = spawn_poller(
            Arc::clone(&context.api),
            name.clone(),
            options.poll_interval,
            configs_tx,
        );

        let machine = SessionMachine::new(descriptor, options.machine);
        let initial = SessionSnapshot {
            state: machine.state(),
            name: name.clone(),
            path: machine.descriptor().path.clone(),
            model: None,
            context: ServerEventContext::default(),
            config: None,
            checkpoints: CheckpointTracker::default(),
            healthcheck_retry: 0,
            last_failure: None,
        };
        let (snapshot_tx, snapshot) = watch::channel(initial);

        let runner = Runner {
            machine,
            api: Arc::clone(&context.api),
            user_settings: Arc::clone(&context.user_settings),
            reducer: reducer.clone(),
            reducer_updates: reducer.subscribe(),
            stream,
            poller,
            messages,
            inputs_tx,
            inputs,
            frames,
            configs,
            snapshot: snapshot_tx,
            notifications: notifications.clone(),
            replies: HashMap::new(),
            outbox: Vec::new(),
            next_ticket: 0,
            stream_generation: 0,
            stream_open: false,
            context: ServerEventContext::default(),
            config: None,
            tracker: CheckpointTracker::default(),
            pending_revert: None,
            last_failure: None,
        };
        let task = tokio::spawn(runner.run());

        (
            Self {
                inbox,
                snapshot,
                notifications,
                api: context.api,
                user_settings: context.user_settings,
                name,
            },
            task,
        )
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        self.notifications.subscribe()
    }

    async fn request(&self, command: Command) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(ControllerMessage::Command { command, reply })
            .map_err(|_| SessionError::ControllerClosed)?;
        response.await.map_err(|_| SessionError::ControllerClosed)?
    }

    pub async fn create(
        &self,
        path: impl Into<String>,
        agent_config: AgentConfig,
    ) -> Result<(), SessionError> {
        self.request(Command::Create {
            path: path.into(),
            agent_config,
        })
        .await
    }

    pub async fn init(
        &self,
        path: Option<String>,
        agent_config: Option<AgentConfig>,
    ) -> Result<(), SessionError> {
        self.request(Command::Init { path, agent_config }).await
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<(), SessionError> {
        self.request(Command::Resume).await
    }

    pub async fn toggle(&self) -> Result<(), SessionError> {
        self.request(Command::Toggle).await
    }

    pub async fn reset(&self) -> Result<(), SessionError> {
        self.request(Command::Reset).await
    }

    pub async fn delete(&self) -> Result<(), SessionError> {
        self.request(Command::Delete).await
    }

    pub async fn revert(&self, checkpoint_id: CheckpointId) -> Result<(), SessionError> {
        self.revert_to(Some(checkpoint_id)).await
    }

    /// Reverts to `checkpoint_id`, or to the selected checkpoint when `None`.
    pub async fn revert_to(&self, checkpoint_id: Option<CheckpointId>) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(ControllerMessage::RevertTo {
                checkpoint_id,
                reply,
            })
            .map_err(|_| SessionError::ControllerClosed)?;
        response.await.map_err(|_| SessionError::ControllerClosed)?
    }

    pub async fn select_checkpoint(
        &self,
        checkpoint_id: Option<CheckpointId>,
    ) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(ControllerMessage::SelectCheckpoint {
                checkpoint_id,
                reply,
            })
            .map_err(|_| SessionError::ControllerClosed)?;
        response.await.map_err(|_| SessionError::ControllerClosed)?
    }

    /// Message to prefill the input with after a revert. Returned once.
    pub async fn take_commit_message(&self) -> Result<Option<String>, SessionError> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(ControllerMessage::TakeCommitMessage { reply })
            .map_err(|_| SessionError::ControllerClosed)?;
        response.await.map_err(|_| SessionError::ControllerClosed)
    }

    pub async fn send_message(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.request(Command::SendMessage { text: text.into() })
            .await
    }

    pub async fn send_event(
        &self,
        kind: impl Into<String>,
        content: Value,
    ) -> Result<(), SessionError> {
        self.request(Command::SendEvent(OutboundEvent::from_user(kind, content)))
            .await
    }

    pub async fn update_config(&self, agent_config: AgentConfig) -> Result<(), SessionError> {
        self.request(Command::UpdateConfig(agent_config)).await
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(Command::Shutdown).await
    }

    pub async fn resolve_git(&self, resolution: GitResolution) -> Result<(), SessionError> {
        resolution.validate(&self.snapshot.borrow().context)?;
        self.request(Command::SendEvent(resolution.to_event()))
            .await?;
        if resolution.requires_reset() {
            self.reset().await?;
        }
        Ok(())
    }

    /// Merges the agent branch into the user's branch. Without an explicit
    /// message the default one is used when the user enabled it.
    pub async fn request_merge(&self, commit_message: Option<&str>) -> Result<(), SessionError> {
        let message = match commit_message.filter(|message| !message.trim().is_empty()) {
            Some(message) => message.to_string(),
            None => {
                let settings = git_settings(self.user_settings.as_ref()).await;
                let branch = self.snapshot.borrow().config.as_ref().and_then(|config| {
                    let metadata = &config.versioning_metadata;
                    metadata
                        .user_branch
                        .clone()
                        .or_else(|| metadata.old_branch.clone())
                });
                match branch {
                    Some(branch) if settings.merge_use_default_commit_message => {
                        git::default_merge_message(&branch)
                    }
                    _ => return Err(SessionError::MissingMergeMessage),
                }
            }
        };
        self.request(Command::SendEvent(git::merge_request(&message)))
            .await
    }

    pub async fn diff(
        &self,
        src: &CheckpointId,
        dest: &CheckpointId,
    ) -> Result<Value, SessionError> {
        Ok(self.api.diff(&self.name, src, dest).await?)
    }

    /// Diff of the initial checkpoint against the selected (or current) one.
    pub async fn diff_checkpoints(&self) -> Result<Value, SessionError> {
        let range = self.snapshot.borrow().checkpoints.diff_range();
        let (src, dest) = range.ok_or(SessionError::NoSelectedCheckpoint)?;
        self.diff(&src, &dest).await
    }
}

struct PendingReply {
    command: &'static str,
    reply: Reply<()>,
}

struct Runner {
    machine: SessionMachine,
    api: Arc<dyn SessionApi>,
    user_settings: Arc<dyn UserSettings>,
    reducer: ReducerHandle,
    reducer_updates: watch::Receiver<ServerEventContext>,
    stream: StreamConsumerHandle,
    poller: PollerHandle,
    messages: mpsc::UnboundedReceiver<ControllerMessage>,
    inputs_tx: mpsc::UnboundedSender<Input>,
    inputs: mpsc::UnboundedReceiver<Input>,
    frames: mpsc::UnboundedReceiver<StreamFrame>,
    configs: mpsc::UnboundedReceiver<SessionConfig>,
    snapshot: watch::Sender<SessionSnapshot>,
    notifications: broadcast::Sender<SessionNotification>,
    replies: HashMap<Ticket, PendingReply>,
    /// Settled replies, delivered once the snapshot reflecting them is out.
    outbox: Vec<(Reply<()>, Result<(), SessionError>)>,
    next_ticket: Ticket,
    stream_generation: u64,
    stream_open: bool,
    context: ServerEventContext,
    config: Option<SessionConfig>,
    tracker: CheckpointTracker,
    /// Revert in flight and the tracker state to restore if it fails.
    pending_revert: Option<(Ticket, RevertRollback)>,
    last_failure: Option<CommandFailure>,
}

impl Runner {
    async fn run(mut self) {
        let effects = self.machine.start();
        self.execute(effects);
        self.publish();
        self.deliver();

        loop {
            tokio::select! {
                message = self.messages.recv() => match message {
                    Some(message) => self.on_message(message),
                    None => break,
                },
                Some(input) = self.inputs.recv() => self.dispatch(input),
                Some(frame) = self.frames.recv() => self.on_frame(frame),
                Some(config) = self.configs.recv() => self.dispatch(Input::StateUpdate(config)),
                Ok(()) = self.reducer_updates.changed() => self.on_context_changed(),
            }
            self.publish();
            self.deliver();
            if self.machine.state() == SessionState::Stopped {
                break;
            }
        }

        self.stream.shutdown();
        self.poller.shutdown();
        debug!("session controller stopped");
    }

    fn on_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::Command { command, reply } => self.submit(command, reply),
            ControllerMessage::SelectCheckpoint {
                checkpoint_id,
                reply,
            } => {
                let selected = self.tracker.select(checkpoint_id.as_ref());
                self.outbox.push((reply, selected));
            }
            ControllerMessage::RevertTo {
                checkpoint_id,
                reply,
            } => {
                let target = checkpoint_id.or_else(|| {
                    self.tracker
                        .selected
                        .as_ref()
                        .map(|checkpoint| checkpoint.checkpoint_id.clone())
                });
                let Some(target) = target else {
                    let _ = reply.send(Err(SessionError::NoSelectedCheckpoint));
                    return;
                };
                if self.tracker.find(&target).is_none() {
                    let _ = reply.send(Err(SessionError::UnknownCheckpoint(target)));
                    return;
                }
                let command = Command::Revert {
                    checkpoint_id: target,
                };
                let ticket = self.register(command.name(), reply);
                if matches!(
                    self.machine.state(),
                    SessionState::Running | SessionState::Paused
                ) {
                    let messages = self.reducer.latest().messages;
                    let rollback = self.tracker.begin_revert(&messages);
                    self.pending_revert = Some((ticket, rollback));
                }
                self.dispatch(Input::Command { ticket, command });
            }
            ControllerMessage::TakeCommitMessage { reply } => {
                let _ = reply.send(self.tracker.take_commit_message());
            }
        }
    }

    fn submit(&mut self, command: Command, reply: Reply<()>) {
        let ticket = self.register(command.name(), reply);
        self.dispatch(Input::Command { ticket, command });
    }

    fn register(&mut self, command: &'static str, reply: Reply<()>) -> Ticket {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        debug!(command, ticket, "dispatching session command");
        self.replies.insert(ticket, PendingReply { command, reply });
        ticket
    }

    fn dispatch(&mut self, input: Input) {
        let effects = self.machine.handle(input);
        self.execute(effects);
        if self.machine.state() == SessionState::Stopped {
            self.stream.shutdown();
            self.poller.shutdown();
        }
    }

    fn on_frame(&mut self, frame: StreamFrame) {
        if !self.stream_open || frame.generation != self.stream_generation {
            debug!(generation = frame.generation, "dropping frame from closed stream");
            return;
        }
        self.dispatch(Input::ServerEvent(ServerEvent::from_value(frame.payload)));
    }

    fn on_context_changed(&mut self) {
        let context = self.reducer_updates.borrow_and_update().clone();
        let ended = !self.context.ended && context.ended;
        self.context = context;
        if ended {
            info!("agent session ended");
            let _ = self.notifications.send(SessionNotification::SessionEnded);
        }
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Call { call, request } => self.spawn_call(call, request),
                Effect::ScheduleRetry { call, delay } => {
                    let inputs = self.inputs_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = inputs.send(Input::RetryElapsed { call });
                    });
                }
                Effect::ResetReducer => self.reducer.reset(),
                Effect::ApplyEvents(events) => self.reducer.apply_all(events),
                Effect::StoreConfig(config) => {
                    self.tracker.sync(&config);
                    self.config = Some(config);
                }
                Effect::StartStream => {
                    if !self.stream_open {
                        self.stream_generation += 1;
                        self.stream_open = true;
                        self.stream.start(self.stream_generation);
                    }
                }
                Effect::StopStream => {
                    self.stream_generation += 1;
                    self.stream_open = false;
                    self.stream.stop();
                }
                Effect::StartPolling => self.poller.start_fetching(),
                Effect::StopPolling => self.poller.stop_fetching(),
                Effect::Settle { ticket, result } => self.settle(ticket, result),
                Effect::Notify(notification) => {
                    let _ = self.notifications.send(notification);
                }
            }
        }
    }

    fn settle(&mut self, ticket: Ticket, result: Result<(), SessionError>) {
        if matches!(&self.pending_revert, Some((reverting, _)) if *reverting == ticket) {
            if let Some((_, rollback)) = self.pending_revert.take() {
                // A failed revert call puts the machine back where it started.
                if result.is_err()
                    && matches!(
                        self.machine.state(),
                        SessionState::Running | SessionState::Paused
                    )
                {
                    self.tracker.abort_revert(rollback);
                }
            }
        }
        let Some(pending) = self.replies.remove(&ticket) else {
            return;
        };
        if let Err(error) = &result {
            if let Some(api_error) = error.api() {
                warn!(command = pending.command, error = %api_error, "session command failed");
                self.last_failure = Some(CommandFailure {
                    command: pending.command.to_string(),
                    code: Some(api_error.code),
                    message: api_error.message.clone(),
                    at: Utc::now(),
                });
                let _ = self.notifications.send(SessionNotification::CommandFailed {
                    command: pending.command,
                    error: error.clone(),
                });
            }
        }
        self.outbox.push((pending.reply, result));
    }

    fn deliver(&mut self) {
        for (reply, result) in self.outbox.drain(..) {
            let _ = reply.send(result);
        }
    }

    fn spawn_call(&self, call: CallId, request: ApiCall) {
        let api = Arc::clone(&self.api);
        let user_settings = Arc::clone(&self.user_settings);
        let reducer = self.reducer.clone();
        let name = self.machine.descriptor().name.clone();
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            let result = perform(
                api.as_ref(),
                user_settings.as_ref(),
                &reducer,
                &name,
                request,
            )
            .await;
            let _ = inputs.send(Input::Completed { call, result });
        });
    }

    fn publish(&self) {
        let descriptor = self.machine.descriptor();
        let next = SessionSnapshot {
            state: self.machine.state(),
            name: descriptor.name.clone(),
            path: descriptor.path.clone(),
            model: descriptor
                .agent_config
                .as_ref()
                .map(|config| config.model.clone()),
            context: self.context.clone(),
            config: self.config.clone(),
            checkpoints: self.tracker.clone(),
            healthcheck_retry: self.machine.healthcheck_retry(),
            last_failure: self.last_failure.clone(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn perform(
    api: &dyn SessionApi,
    user_settings: &dyn UserSettings,
    reducer: &ReducerHandle,
    name: &SessionName,
    request: ApiCall,
) -> Result<CallOutput, ApiError> {
    match request {
        ApiCall::Health => api.health().await.map(|()| CallOutput::Done),
        ApiCall::ListSessions => api.list_sessions().await.map(CallOutput::Sessions),
        ApiCall::CreateSession { path, agent_config } => {
            let versioning_type = git_settings(user_settings).await.versioning_type();
            let request = CreateSessionRequest {
                versioning_type,
                agent_config,
            };
            api.create_session(name, &path, &request)
                .await
                .map(|()| CallOutput::Done)
        }
        ApiCall::LoadEvents => api.load_events(name).await.map(CallOutput::Events),
        ApiCall::Start { api_key } => api.start(name, &api_key).await.map(|()| CallOutput::Done),
        ApiCall::Pause => api.pause(name).await.map(|()| CallOutput::Done),
        ApiCall::Resume => api.resume(name).await.map(|()| CallOutput::Done),
        ApiCall::Reset => {
            api.pause(name).await?;
            api.reset(name).await.map(|()| CallOutput::Done)
        }
        ApiCall::Revert { checkpoint_id } => api
            .revert(name, &checkpoint_id)
            .await
            .map(|()| CallOutput::Done),
        ApiCall::Delete => api.delete(name).await.map(|()| CallOutput::Done),
        ApiCall::SendMessage { text } => {
            let waiting_for_user = reducer
                .current()
                .await
                .map(|context| context.user_request)
                .map_err(|err| ApiError::invalid_state(err.to_string()))?;
            let sent = if waiting_for_user {
                api.respond(name, &text).await
            } else {
                let event = OutboundEvent::from_user("Interrupt", Value::String(text));
                api.send_event(name, &event).await
            };
            sent.map(|()| CallOutput::Done)
        }
        ApiCall::SendEvent(event) => api.send_event(name, &event).await.map(|()| CallOutput::Done),
        ApiCall::UpdateConfig(config) => api
            .update_config(name, &config)
            .await
            .map(|()| CallOutput::Done),
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
