use std::time::Duration;

use super::*;
use crate::test_support::FakeApi;
use serde_json::json;
use shared::error::ApiError;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn consumer(
    api: &Arc<FakeApi>,
) -> (StreamConsumerHandle, mpsc::UnboundedReceiver<StreamFrame>) {
    let (frames, received) = mpsc::unbounded_channel();
    let api: Arc<dyn SessionApi> = api.clone();
    let (handle, _task) = spawn_stream_consumer(api, SessionName::default(), frames);
    (handle, received)
}

async fn next_frame(received: &mut mpsc::UnboundedReceiver<StreamFrame>) -> StreamFrame {
    timeout(WAIT, received.recv())
        .await
        .expect("frame in time")
        .expect("frame channel open")
}

#[tokio::test]
async fn frames_carry_the_connection_generation() {
    let api = FakeApi::shared();
    let server = api.push_stream();
    let (handle, mut received) = consumer(&api);

    handle.start(1);
    server
        .send(Ok(json!({"type": "Task", "content": "go"})))
        .expect("send frame");

    let frame = next_frame(&mut received).await;
    assert_eq!(frame.generation, 1);
    assert_eq!(frame.payload["type"], "Task");
}

#[tokio::test]
async fn undecodable_frames_are_skipped() {
    let api = FakeApi::shared();
    let server = api.push_stream();
    let (handle, mut received) = consumer(&api);

    handle.start(3);
    server
        .send(Err(ApiError::new(ErrorCode::Decode, "not json")))
        .expect("send bad frame");
    server
        .send(Ok(json!({"type": "Stop"})))
        .expect("send frame");

    let frame = next_frame(&mut received).await;
    assert_eq!(frame.payload["type"], "Stop");
}

#[tokio::test]
async fn start_while_open_keeps_the_connection() {
    let api = FakeApi::shared();
    let server = api.push_stream();
    let (handle, mut received) = consumer(&api);

    handle.start(1);
    server.send(Ok(json!({"n": 1}))).expect("send frame");
    next_frame(&mut received).await;

    handle.start(2);
    server.send(Ok(json!({"n": 2}))).expect("send frame");
    let frame = next_frame(&mut received).await;

    assert_eq!(frame.generation, 1);
    assert_eq!(api.count("open_event_stream"), 1);
}

#[tokio::test]
async fn reset_replaces_the_connection() {
    let api = FakeApi::shared();
    let first = api.push_stream();
    let second = api.push_stream();
    let (handle, mut received) = consumer(&api);

    handle.start(1);
    first.send(Ok(json!({"n": 1}))).expect("send frame");
    next_frame(&mut received).await;

    handle.reset(2);
    timeout(WAIT, first.closed())
        .await
        .expect("old connection closed");
    second.send(Ok(json!({"n": 2}))).expect("send frame");

    let frame = next_frame(&mut received).await;
    assert_eq!(frame.generation, 2);
    assert_eq!(frame.payload["n"], 2);
}

#[tokio::test]
async fn stop_closes_the_connection() {
    let api = FakeApi::shared();
    let server = api.push_stream();
    let (handle, mut received) = consumer(&api);

    handle.start(1);
    server.send(Ok(json!({"n": 1}))).expect("send frame");
    next_frame(&mut received).await;

    handle.stop();
    timeout(WAIT, server.closed())
        .await
        .expect("connection closed");
}

#[tokio::test]
async fn transport_error_ends_the_connection_until_started_again() {
    let api = FakeApi::shared();
    let first = api.push_stream();
    let second = api.push_stream();
    let (handle, mut received) = consumer(&api);

    handle.start(1);
    first
        .send(Err(ApiError::new(ErrorCode::Unavailable, "reset by peer")))
        .expect("send error");
    timeout(WAIT, first.closed())
        .await
        .expect("connection ended");
    assert_eq!(api.count("open_event_stream"), 1);

    handle.start(2);
    second.send(Ok(json!({"n": 2}))).expect("send frame");
    let frame = next_frame(&mut received).await;
    assert_eq!(frame.generation, 2);
}
