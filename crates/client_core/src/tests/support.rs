use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use shared::{
    domain::{
        AgentConfig, CheckpointId, CreateSessionRequest, SessionConfig, SessionName,
        SessionSummary,
    },
    error::{ApiError, ErrorCode},
    protocol::{OutboundEvent, RawServerEvent},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::api::{EventStream, SessionApi};

pub(crate) type FrameSender = mpsc::UnboundedSender<Result<Value, ApiError>>;

/// In-process stand-in for the agent server. Records every call by name.
#[derive(Default)]
pub(crate) struct FakeApi {
    calls: Mutex<Vec<String>>,
    configs: Mutex<VecDeque<SessionConfig>>,
    streams: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<Value, ApiError>>>>,
    failing: Mutex<Vec<&'static str>>,
}

impl FakeApi {
    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Configs returned by successive polls; the last one repeats.
    pub(crate) fn with_configs(configs: Vec<SessionConfig>) -> Arc<Self> {
        Arc::new(Self {
            configs: Mutex::new(configs.into()),
            ..Self::default()
        })
    }

    /// Queues the stream handed to the next `open_event_stream` call.
    pub(crate) fn push_stream(&self) -> FrameSender {
        let (frames, receiver) = mpsc::unbounded_channel();
        self.streams
            .lock()
            .expect("streams lock")
            .push_back(receiver);
        frames
    }

    /// Makes every later `call` answer with a server error.
    pub(crate) fn fail(&self, call: &'static str) {
        self.failing.lock().expect("failing lock").push(call);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn count(&self, call: &str) -> usize {
        self.calls()
            .iter()
            .filter(|recorded| recorded.as_str() == call)
            .count()
    }

    fn record(&self, call: &str) {
        self.calls
            .lock()
            .expect("calls lock")
            .push(call.to_string());
    }

    fn answer(&self, call: &str) -> Result<(), ApiError> {
        self.record(call);
        let failing = self.failing.lock().expect("failing lock");
        if failing.iter().any(|failing| *failing == call) {
            return Err(ApiError::new(ErrorCode::Internal, format!("{call} failed")));
        }
        Ok(())
    }
}

pub(crate) fn config_at(path: &str) -> SessionConfig {
    SessionConfig {
        path: Some(path.to_string()),
        ..SessionConfig::default()
    }
}

#[async_trait]
impl SessionApi for FakeApi {
    async fn health(&self) -> Result<(), ApiError> {
        self.record("health");
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ApiError> {
        self.record("list_sessions");
        Ok(Vec::new())
    }

    async fn create_session(
        &self,
        _name: &SessionName,
        _path: &str,
        _request: &CreateSessionRequest,
    ) -> Result<(), ApiError> {
        self.answer("create_session")
    }

    async fn load_events(&self, _name: &SessionName) -> Result<Vec<RawServerEvent>, ApiError> {
        self.record("load_events");
        Ok(Vec::new())
    }

    async fn start(&self, _name: &SessionName, _api_key: &str) -> Result<(), ApiError> {
        self.answer("start")
    }

    async fn pause(&self, _name: &SessionName) -> Result<(), ApiError> {
        self.answer("pause")
    }

    async fn resume(&self, _name: &SessionName) -> Result<(), ApiError> {
        self.answer("resume")
    }

    async fn reset(&self, _name: &SessionName) -> Result<(), ApiError> {
        self.answer("reset")
    }

    async fn revert(
        &self,
        _name: &SessionName,
        _checkpoint_id: &CheckpointId,
    ) -> Result<(), ApiError> {
        self.answer("revert")
    }

    async fn delete(&self, _name: &SessionName) -> Result<(), ApiError> {
        self.answer("delete")
    }

    async fn send_event(&self, _name: &SessionName, _event: &OutboundEvent) -> Result<(), ApiError> {
        self.answer("send_event")
    }

    async fn respond(&self, _name: &SessionName, _response: &str) -> Result<(), ApiError> {
        self.answer("respond")
    }

    async fn fetch_config(&self, _name: &SessionName) -> Result<SessionConfig, ApiError> {
        self.record("fetch_config");
        let mut configs = self.configs.lock().expect("configs lock");
        let next = if configs.len() > 1 {
            configs.pop_front()
        } else {
            configs.front().cloned()
        };
        next.ok_or_else(|| ApiError::new(ErrorCode::NotFound, "no config queued"))
    }

    async fn update_config(
        &self,
        _name: &SessionName,
        _config: &AgentConfig,
    ) -> Result<(), ApiError> {
        self.answer("update_config")
    }

    async fn diff(
        &self,
        _name: &SessionName,
        _src: &CheckpointId,
        _dest: &CheckpointId,
    ) -> Result<Value, ApiError> {
        self.record("diff");
        Ok(json!({"files": []}))
    }

    async fn open_event_stream(&self, _name: &SessionName) -> Result<EventStream, ApiError> {
        self.record("open_event_stream");
        let receiver = self.streams.lock().expect("streams lock").pop_front();
        match receiver {
            Some(receiver) => Ok(UnboundedReceiverStream::new(receiver).boxed()),
            None => Err(ApiError::new(ErrorCode::Unavailable, "no stream queued")),
        }
    }
}
