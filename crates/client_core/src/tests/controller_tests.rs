use super::*;
use crate::{
    retry::RetryPolicy,
    settings::{InMemoryUserSettings, GIT_MERGE_USE_DEFAULT_COMMIT_MESSAGE},
    test_support::{config_at, FakeApi, FrameSender},
    SetupPhase,
};
use serde_json::json;
use shared::{
    domain::{Checkpoint, VersioningMetadata},
    protocol::GitAction,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(3);

fn options() -> ControllerOptions {
    ControllerOptions {
        machine: MachineOptions {
            healthcheck: RetryPolicy::fixed(Duration::from_millis(10)),
            creation: RetryPolicy::exponential(
                Duration::from_millis(5),
                2,
                Duration::from_millis(20),
            )
            .with_max_attempts(Some(3)),
            advisory_threshold: 10,
        },
        poll_interval: Duration::from_millis(10),
    }
}

fn spawn_with(context: SessionContext) -> SessionController {
    let (controller, _task) = spawn_with_task(context);
    controller
}

fn spawn_with_task(context: SessionContext) -> (SessionController, JoinHandle<()>) {
    SessionController::spawn(
        SessionDescriptor::new("http://agent.test"),
        context,
        options(),
    )
}

fn spawn(api: &Arc<FakeApi>) -> SessionController {
    let api: Arc<dyn SessionApi> = api.clone();
    spawn_with(SessionContext::new(api))
}

async fn wait_until(
    controller: &SessionController,
    predicate: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut snapshots = controller.subscribe_snapshot();
    let snapshot = timeout(WAIT, snapshots.wait_for(predicate))
        .await
        .expect("snapshot in time")
        .expect("controller running");
    (*snapshot).clone()
}

async fn bring_up(controller: &SessionController) {
    wait_until(controller, |snapshot| {
        snapshot.state == SessionState::Setup(SetupPhase::SessionDoesNotExist)
    })
    .await;
    controller
        .create("/work", AgentConfig::new("claude", "sk-test"))
        .await
        .expect("create");
    controller.init(None, None).await.expect("init");
    wait_until(controller, |snapshot| snapshot.state == SessionState::Running).await;
}

fn frame(kind: &str, content: Value) -> Result<Value, ApiError> {
    Ok(json!({"type": kind, "content": content}))
}

fn checkpoint(id: &str, hash: &str) -> Checkpoint {
    Checkpoint {
        commit_hash: hash.to_string(),
        commit_message: String::new(),
        agent_history: Value::Null,
        event_id: None,
        checkpoint_id: CheckpointId::from(id),
        index: 0,
    }
}

fn versioned_config() -> SessionConfig {
    SessionConfig {
        checkpoints: vec![checkpoint("1", "aaa"), checkpoint("2", "bbb")],
        versioning_metadata: VersioningMetadata {
            user_branch: Some("main".to_string()),
            ..VersioningMetadata::default()
        },
        ..config_at("/work")
    }
}

fn position(calls: &[String], call: &str) -> usize {
    calls
        .iter()
        .position(|recorded| recorded == call)
        .unwrap_or_else(|| panic!("{call} never called: {calls:?}"))
}

#[tokio::test]
async fn new_session_is_created_initialized_and_started() {
    let api = FakeApi::with_configs(vec![config_at("/work")]);
    let _server = api.push_stream();
    let controller = spawn(&api);

    bring_up(&controller).await;

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.path.as_deref(), Some("/work"));
    assert_eq!(snapshot.model.as_deref(), Some("claude"));
    assert_eq!(snapshot.healthcheck_retry, 0);

    let calls = api.calls();
    assert!(position(&calls, "health") < position(&calls, "list_sessions"));
    assert!(position(&calls, "list_sessions") < position(&calls, "create_session"));
    let loaded = position(&calls, "load_events");
    assert!(position(&calls, "create_session") < loaded);
    assert!(loaded < position(&calls, "open_event_stream"));
    assert!(loaded < position(&calls, "start"));

    let snapshot = wait_until(&controller, |snapshot| snapshot.config.is_some()).await;
    assert!(loaded < position(&api.calls(), "fetch_config"));
    assert_eq!(snapshot.config.and_then(|config| config.path).as_deref(), Some("/work"));
}

#[tokio::test]
async fn rejected_commands_report_the_state() {
    let api = FakeApi::shared();
    let controller = spawn(&api);
    wait_until(&controller, |snapshot| {
        snapshot.state == SessionState::Setup(SetupPhase::SessionDoesNotExist)
    })
    .await;

    let err = controller.pause().await.expect_err("not running");
    assert_eq!(
        err,
        SessionError::Rejected {
            command: "pause",
            state: "setup.session_does_not_exist".to_string(),
        }
    );
    assert!(controller.snapshot().last_failure.is_none());
}

#[tokio::test]
async fn messages_interrupt_unless_the_agent_asked() {
    let api = FakeApi::with_configs(vec![config_at("/work")]);
    let server = api.push_stream();
    let controller = spawn(&api);
    bring_up(&controller).await;

    controller.send_message("use tokio").await.expect("interrupt");
    assert_eq!(api.count("send_event"), 1);
    assert_eq!(api.count("respond"), 0);

    server
        .send(frame("UserRequest", json!("which branch?")))
        .expect("send frame");
    wait_until(&controller, |snapshot| snapshot.context.user_request).await;

    controller.send_message("main").await.expect("respond");
    assert_eq!(api.count("respond"), 1);
    assert_eq!(api.count("send_event"), 1);
}

#[tokio::test]
async fn stop_event_announces_session_end() {
    let api = FakeApi::with_configs(vec![config_at("/work")]);
    let server = api.push_stream();
    let controller = spawn(&api);
    let mut notifications = controller.subscribe();
    bring_up(&controller).await;

    server.send(frame("Stop", Value::Null)).expect("send frame");

    let ended = timeout(WAIT, async {
        loop {
            match notifications.recv().await {
                Ok(SessionNotification::SessionEnded) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .expect("notification in time");
    assert!(ended);
    assert!(controller.snapshot().context.ended);
}

#[tokio::test]
async fn revert_to_selection_restores_the_typed_message() {
    let api = FakeApi::with_configs(vec![versioned_config()]);
    let server = api.push_stream();
    let _after_revert = api.push_stream();
    let controller = spawn(&api);
    bring_up(&controller).await;

    wait_until(&controller, |snapshot| snapshot.checkpoints.current.is_some()).await;
    server.send(frame("Checkpoint", json!(1))).expect("send frame");
    server
        .send(frame("Interrupt", json!("rename the crate")))
        .expect("send frame");
    wait_until(&controller, |snapshot| snapshot.context.messages.len() == 2).await;

    controller
        .select_checkpoint(Some(CheckpointId::from("1")))
        .await
        .expect("select");
    let diff = controller.diff_checkpoints().await.expect("diff");
    assert_eq!(diff, json!({"files": []}));

    controller.revert_to(None).await.expect("revert");

    assert_eq!(
        controller.take_commit_message().await.expect("message"),
        Some("rename the crate".to_string())
    );
    assert_eq!(controller.take_commit_message().await.expect("message"), None);
    assert!(controller.snapshot().checkpoints.selected.is_none());
    assert_eq!(api.count("revert"), 1);
    assert_eq!(api.count("resume"), 1);
    wait_until(&controller, |snapshot| snapshot.state == SessionState::Running).await;
    assert_eq!(api.count("load_events"), 2);
}

#[tokio::test]
async fn revert_without_selection_is_refused() {
    let api = FakeApi::with_configs(vec![versioned_config()]);
    let controller = spawn(&api);
    bring_up(&controller).await;

    let err = controller.revert_to(None).await.expect_err("nothing selected");
    assert_eq!(err, SessionError::NoSelectedCheckpoint);

    wait_until(&controller, |snapshot| snapshot.checkpoints.current.is_some()).await;
    let err = controller
        .revert(CheckpointId::from("9"))
        .await
        .expect_err("unknown checkpoint");
    assert_eq!(err, SessionError::UnknownCheckpoint(CheckpointId::from("9")));
    assert_eq!(api.count("revert"), 0);
}

#[tokio::test]
async fn git_prompts_are_answered_and_corruption_resets() {
    let api = FakeApi::with_configs(vec![config_at("/work")]);
    let server = api.push_stream();
    let _after_reset = api.push_stream();
    let controller = spawn(&api);
    bring_up(&controller).await;

    let err = controller
        .resolve_git(GitResolution::Init(GitAction::Git))
        .await
        .expect_err("nothing pending");
    assert_eq!(err, SessionError::NoPendingPrompt("git init"));

    server
        .send(frame("GitInit", json!("no repository found")))
        .expect("send frame");
    wait_until(&controller, |snapshot| snapshot.context.git_init.is_some()).await;
    controller
        .resolve_git(GitResolution::Init(GitAction::Git))
        .await
        .expect("answer init");
    assert_eq!(api.count("send_event"), 1);

    server.send(frame("GitCorrupted", Value::Null)).expect("send frame");
    wait_until(&controller, |snapshot| snapshot.context.git_corrupted).await;
    controller
        .resolve_git(GitResolution::Corrupted)
        .await
        .expect("recover repository");
    assert_eq!(api.count("send_event"), 2);
    assert_eq!(api.count("reset"), 1);
}

#[tokio::test]
async fn merge_uses_default_message_only_when_enabled() {
    let api = FakeApi::with_configs(vec![versioned_config()]);
    let dyn_api: Arc<dyn SessionApi> = api.clone();
    let settings = Arc::new(InMemoryUserSettings::default());
    let controller =
        spawn_with(SessionContext::new(dyn_api).with_user_settings(settings.clone()));
    bring_up(&controller).await;
    wait_until(&controller, |snapshot| snapshot.config.is_some()).await;

    let err = controller
        .request_merge(None)
        .await
        .expect_err("default message disabled");
    assert_eq!(err, SessionError::MissingMergeMessage);

    controller
        .request_merge(Some("Bring agent work home"))
        .await
        .expect("explicit message");

    settings
        .set(GIT_MERGE_USE_DEFAULT_COMMIT_MESSAGE, Value::Bool(true))
        .await
        .expect("enable default");
    controller.request_merge(None).await.expect("default message");
    assert_eq!(api.count("send_event"), 2);
}

#[tokio::test]
async fn shutdown_stops_for_good() {
    let api = FakeApi::with_configs(vec![config_at("/work")]);
    let dyn_api: Arc<dyn SessionApi> = api.clone();
    let (controller, task) = spawn_with_task(SessionContext::new(dyn_api));
    let observer = controller.clone();
    bring_up(&controller).await;

    controller.shutdown().await.expect("shutdown");
    assert_eq!(controller.snapshot().state, SessionState::Stopped);

    timeout(WAIT, task)
        .await
        .expect("controller task ends while handles are alive")
        .expect("controller task joined");

    let err = observer.resume().await.expect_err("stopped");
    assert_eq!(err, SessionError::ControllerClosed);
    assert_eq!(observer.snapshot().state, SessionState::Stopped);
}

#[tokio::test]
async fn failed_revert_keeps_time_travel() {
    let api = FakeApi::with_configs(vec![versioned_config()]);
    let server = api.push_stream();
    let controller = spawn(&api);
    bring_up(&controller).await;

    wait_until(&controller, |snapshot| snapshot.checkpoints.current.is_some()).await;
    server.send(frame("Checkpoint", json!(1))).expect("send frame");
    server
        .send(frame("Interrupt", json!("rename the crate")))
        .expect("send frame");
    wait_until(&controller, |snapshot| snapshot.context.messages.len() == 2).await;
    controller
        .select_checkpoint(Some(CheckpointId::from("1")))
        .await
        .expect("select");

    api.fail("revert");
    let err = controller.revert_to(None).await.expect_err("server refused");
    assert!(err.api().is_some());

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.state, SessionState::Running);
    assert_eq!(
        snapshot
            .checkpoints
            .selected
            .map(|checkpoint| checkpoint.checkpoint_id),
        Some(CheckpointId::from("1"))
    );
    assert_eq!(snapshot.last_failure.map(|failure| failure.command).as_deref(), Some("revert"));
    assert_eq!(controller.take_commit_message().await.expect("message"), None);
    assert_eq!(api.count("revert"), 1);
    assert_eq!(api.count("resume"), 0);
}
