use super::*;
use crate::test_support::{config_at, FakeApi};
use tokio::time::timeout;

const PERIOD: Duration = Duration::from_millis(10);
const WAIT: Duration = Duration::from_secs(2);

fn poller(api: &Arc<FakeApi>) -> (PollerHandle, mpsc::UnboundedReceiver<SessionConfig>) {
    let (updates, received) = mpsc::unbounded_channel();
    let api: Arc<dyn SessionApi> = api.clone();
    let (handle, _task) = spawn_poller(api, SessionName::default(), PERIOD, updates);
    (handle, received)
}

async fn next_update(received: &mut mpsc::UnboundedReceiver<SessionConfig>) -> SessionConfig {
    timeout(WAIT, received.recv())
        .await
        .expect("update in time")
        .expect("update channel open")
}

#[tokio::test]
async fn idle_poller_does_not_fetch() {
    let api = FakeApi::with_configs(vec![config_at("/work")]);
    let (_handle, mut received) = poller(&api);

    assert!(timeout(PERIOD * 5, received.recv()).await.is_err());
    assert_eq!(api.count("fetch_config"), 0);
}

#[tokio::test]
async fn only_changed_configs_are_forwarded() {
    let api = FakeApi::with_configs(vec![
        config_at("/a"),
        config_at("/a"),
        config_at("/b"),
    ]);
    let (handle, mut received) = poller(&api);

    handle.start_fetching();
    assert_eq!(next_update(&mut received).await.path.as_deref(), Some("/a"));
    assert_eq!(next_update(&mut received).await.path.as_deref(), Some("/b"));

    assert!(timeout(PERIOD * 5, received.recv()).await.is_err());
    assert!(api.count("fetch_config") >= 3);
}

#[tokio::test]
async fn restart_after_stop_forwards_the_same_config_again() {
    let api = FakeApi::with_configs(vec![config_at("/work")]);
    let (handle, mut received) = poller(&api);

    handle.start_fetching();
    next_update(&mut received).await;

    handle.stop_fetching();
    handle.start_fetching();
    assert_eq!(
        next_update(&mut received).await.path.as_deref(),
        Some("/work")
    );
}

#[tokio::test]
async fn shutdown_ends_the_task() {
    let api = FakeApi::shared();
    let (updates, _received) = mpsc::unbounded_channel();
    let dyn_api: Arc<dyn SessionApi> = api.clone();
    let (handle, task) = spawn_poller(dyn_api, SessionName::default(), PERIOD, updates);

    handle.start_fetching();
    handle.shutdown();
    timeout(WAIT, task)
        .await
        .expect("poller stopped in time")
        .expect("poller task");
}
