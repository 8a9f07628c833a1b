use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{stream::BoxStream, StreamExt};
use reqwest::{header::ACCEPT, Client, RequestBuilder, Response};
use serde_json::Value;
use shared::{
    domain::{
        AgentConfig, CheckpointId, CreateSessionRequest, SessionConfig, SessionName,
        SessionSummary,
    },
    error::{ApiError, ErrorCode},
    protocol::{OutboundEvent, RawServerEvent},
};
use tracing::debug;
use url::Url;

use crate::error::SessionError;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Frames of the session event stream. `Decode` errors are per-frame; any
/// other error ends the stream.
pub type EventStream = BoxStream<'static, Result<Value, ApiError>>;

/// HTTP contract of the agent server.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn health(&self) -> Result<(), ApiError>;
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ApiError>;
    async fn create_session(
        &self,
        name: &SessionName,
        path: &str,
        request: &CreateSessionRequest,
    ) -> Result<(), ApiError>;
    async fn load_events(&self, name: &SessionName) -> Result<Vec<RawServerEvent>, ApiError>;
    async fn start(&self, name: &SessionName, api_key: &str) -> Result<(), ApiError>;
    async fn pause(&self, name: &SessionName) -> Result<(), ApiError>;
    async fn resume(&self, name: &SessionName) -> Result<(), ApiError>;
    async fn reset(&self, name: &SessionName) -> Result<(), ApiError>;
    async fn revert(&self, name: &SessionName, checkpoint_id: &CheckpointId)
        -> Result<(), ApiError>;
    async fn delete(&self, name: &SessionName) -> Result<(), ApiError>;
    async fn send_event(&self, name: &SessionName, event: &OutboundEvent) -> Result<(), ApiError>;
    async fn respond(&self, name: &SessionName, response: &str) -> Result<(), ApiError>;
    async fn fetch_config(&self, name: &SessionName) -> Result<SessionConfig, ApiError>;
    async fn update_config(&self, name: &SessionName, config: &AgentConfig)
        -> Result<(), ApiError>;
    async fn diff(
        &self,
        name: &SessionName,
        src: &CheckpointId,
        dest: &CheckpointId,
    ) -> Result<Value, ApiError>;
    async fn open_event_stream(&self, name: &SessionName) -> Result<EventStream, ApiError>;
}

#[derive(Clone)]
pub struct HttpSessionApi {
    http: Client,
    host: Url,
    request_timeout: Duration,
}

impl HttpSessionApi {
    pub fn new(host: &str) -> Result<Self, SessionError> {
        Self::with_timeout(host, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(host: &str, request_timeout: Duration) -> Result<Self, SessionError> {
        let host = Url::parse(host).map_err(|err| SessionError::InvalidHost {
            host: host.to_string(),
            reason: err.to_string(),
        })?;
        if host.cannot_be_a_base() {
            return Err(SessionError::InvalidHost {
                host: host.to_string(),
                reason: "url cannot carry a path".to_string(),
            });
        }
        Ok(Self {
            http: Client::new(),
            host,
            request_timeout,
        })
    }

    pub fn host(&self) -> &Url {
        &self.host
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.host.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn session_endpoint(&self, name: &SessionName, tail: &[&str]) -> Url {
        let mut segments = vec!["sessions", name.as_str()];
        segments.extend_from_slice(tail);
        self.endpoint(&segments)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let response = request
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(classify)?;
        check_status(response).await
    }
}

fn classify(err: reqwest::Error) -> ApiError {
    let code = if err.is_timeout() {
        ErrorCode::Timeout
    } else if err.is_connect() || err.is_request() {
        ErrorCode::Unavailable
    } else if err.is_decode() {
        ErrorCode::Decode
    } else if let Some(status) = err.status() {
        ErrorCode::from_status(status.as_u16())
    } else {
        ErrorCode::Internal
    };
    ApiError::new(code, err.to_string())
}

async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.trim())
    };
    Err(ApiError::from_status(status.as_u16(), detail))
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn health(&self) -> Result<(), ApiError> {
        self.send(self.http.get(self.endpoint(&[]))).await?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ApiError> {
        self.send(self.http.get(self.endpoint(&["sessions"])))
            .await?
            .json()
            .await
            .map_err(classify)
    }

    async fn create_session(
        &self,
        name: &SessionName,
        path: &str,
        request: &CreateSessionRequest,
    ) -> Result<(), ApiError> {
        self.send(
            self.http
                .post(self.session_endpoint(name, &[]))
                .query(&[("path", path)])
                .json(request),
        )
        .await?;
        Ok(())
    }

    async fn load_events(&self, name: &SessionName) -> Result<Vec<RawServerEvent>, ApiError> {
        self.send(self.http.get(self.session_endpoint(name, &["events"])))
            .await?
            .json()
            .await
            .map_err(classify)
    }

    async fn start(&self, name: &SessionName, api_key: &str) -> Result<(), ApiError> {
        self.send(
            self.http
                .patch(self.session_endpoint(name, &["start"]))
                .query(&[("api_key", api_key)]),
        )
        .await?;
        Ok(())
    }

    async fn pause(&self, name: &SessionName) -> Result<(), ApiError> {
        self.send(self.http.patch(self.session_endpoint(name, &["pause"])))
            .await?;
        Ok(())
    }

    async fn resume(&self, name: &SessionName) -> Result<(), ApiError> {
        self.send(self.http.patch(self.session_endpoint(name, &["resume"])))
            .await?;
        Ok(())
    }

    async fn reset(&self, name: &SessionName) -> Result<(), ApiError> {
        self.send(self.http.patch(self.session_endpoint(name, &["reset"])))
            .await?;
        Ok(())
    }

    async fn revert(
        &self,
        name: &SessionName,
        checkpoint_id: &CheckpointId,
    ) -> Result<(), ApiError> {
        self.send(
            self.http
                .patch(self.session_endpoint(name, &["revert"]))
                .query(&[("checkpoint_id", checkpoint_id.as_str())]),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, name: &SessionName) -> Result<(), ApiError> {
        self.send(self.http.get(self.session_endpoint(name, &["teardown"])))
            .await?;
        self.send(self.http.delete(self.session_endpoint(name, &[])))
            .await?;
        Ok(())
    }

    async fn send_event(&self, name: &SessionName, event: &OutboundEvent) -> Result<(), ApiError> {
        debug!(session = %name, kind = %event.kind, "posting client event");
        self.send(
            self.http
                .post(self.session_endpoint(name, &["event"]))
                .json(event),
        )
        .await?;
        Ok(())
    }

    async fn respond(&self, name: &SessionName, response: &str) -> Result<(), ApiError> {
        self.send(
            self.http
                .post(self.session_endpoint(name, &["response"]))
                .query(&[("response", response)]),
        )
        .await?;
        Ok(())
    }

    async fn fetch_config(&self, name: &SessionName) -> Result<SessionConfig, ApiError> {
        self.send(self.http.get(self.session_endpoint(name, &["config"])))
            .await?
            .json()
            .await
            .map_err(classify)
    }

    async fn update_config(
        &self,
        name: &SessionName,
        config: &AgentConfig,
    ) -> Result<(), ApiError> {
        self.send(
            self.http
                .patch(self.session_endpoint(name, &["update"]))
                .json(config),
        )
        .await?;
        Ok(())
    }

    async fn diff(
        &self,
        name: &SessionName,
        src: &CheckpointId,
        dest: &CheckpointId,
    ) -> Result<Value, ApiError> {
        self.send(
            self.http
                .get(self.session_endpoint(name, &["diff"]))
                .query(&[
                    ("src_checkpoint_id", src.as_str()),
                    ("dest_checkpoint_id", dest.as_str()),
                ]),
        )
        .await?
        .json()
        .await
        .map_err(classify)
    }

    async fn open_event_stream(&self, name: &SessionName) -> Result<EventStream, ApiError> {
        // No request timeout here: the connection stays open for the session's lifetime.
        let response = self
            .http
            .get(self.session_endpoint(name, &["events", "stream"]))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(classify)?;
        let response = check_status(response).await?;

        let frames = response
            .bytes_stream()
            .eventsource()
            .filter_map(|frame| async move {
                match frame {
                    Ok(event)
                        if (!event.event.is_empty() && event.event != "message")
                            || event.data.is_empty() =>
                    {
                        None
                    }
                    Ok(event) => Some(serde_json::from_str::<Value>(&event.data).map_err(|err| {
                        ApiError::new(ErrorCode::Decode, format!("{err}: {}", event.data))
                    })),
                    Err(err) => Some(Err(ApiError::new(ErrorCode::Unavailable, err.to_string()))),
                }
            });
        Ok(frames.boxed())
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
