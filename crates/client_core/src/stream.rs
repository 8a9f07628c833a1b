use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use shared::{domain::SessionName, error::ErrorCode};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::api::SessionApi;

/// A frame read from one connection. The generation identifies the
/// connection so frames from a closed one can be told apart.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    pub generation: u64,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamCommand {
    Start { generation: u64 },
    Reset { generation: u64 },
    Stop,
    Shutdown,
}

#[derive(Clone)]
pub struct StreamConsumerHandle {
    commands: mpsc::UnboundedSender<StreamCommand>,
}

impl StreamConsumerHandle {
    /// Opens a connection unless one is already open.
    pub fn start(&self, generation: u64) {
        let _ = self.commands.send(StreamCommand::Start { generation });
    }

    /// Closes the current connection, if any, and opens a new one.
    pub fn reset(&self, generation: u64) {
        let _ = self.commands.send(StreamCommand::Reset { generation });
    }

    pub fn stop(&self) {
        let _ = self.commands.send(StreamCommand::Stop);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(StreamCommand::Shutdown);
    }
}

struct Connection {
    generation: u64,
    task: JoinHandle<()>,
}

impl Connection {
    fn close(self) {
        self.task.abort();
    }
}

pub fn spawn_stream_consumer(
    api: Arc<dyn SessionApi>,
    name: SessionName,
    frames: mpsc::UnboundedSender<StreamFrame>,
) -> (StreamConsumerHandle, JoinHandle<()>) {
    let (commands, mut inbox) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        let mut connection: Option<Connection> = None;
        while let Some(command) = inbox.recv().await {
            match command {
                StreamCommand::Start { generation } => {
                    let open = connection
                        .as_ref()
                        .is_some_and(|current| !current.task.is_finished());
                    if open {
                        debug!("event stream already open");
                        continue;
                    }
                    connection = Some(open_connection(&api, &name, generation, &frames));
                }
                StreamCommand::Reset { generation } => {
                    if let Some(current) = connection.take() {
                        current.close();
                    }
                    connection = Some(open_connection(&api, &name, generation, &frames));
                }
                StreamCommand::Stop => {
                    if let Some(current) = connection.take() {
                        debug!(generation = current.generation, "closing event stream");
                        current.close();
                    }
                }
                StreamCommand::Shutdown => break,
            }
        }
        if let Some(current) = connection.take() {
            current.close();
        }
    });

    (StreamConsumerHandle { commands }, task)
}

fn open_connection(
    api: &Arc<dyn SessionApi>,
    name: &SessionName,
    generation: u64,
    frames: &mpsc::UnboundedSender<StreamFrame>,
) -> Connection {
    let api = Arc::clone(api);
    let name = name.clone();
    let frames = frames.clone();

    let task = tokio::spawn(async move {
        let mut stream = match api.open_event_stream(&name).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(session = %name, error = %err, "failed to open event stream");
                return;
            }
        };
        info!(session = %name, generation, "event stream connected");

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(payload) => {
                    if frames.send(StreamFrame { generation, payload }).is_err() {
                        return;
                    }
                }
                Err(err) if err.code == ErrorCode::Decode => {
                    warn!(session = %name, error = %err, "skipping undecodable stream frame");
                }
                Err(err) => {
                    warn!(session = %name, error = %err, "event stream failed");
                    return;
                }
            }
        }
        info!(session = %name, generation, "event stream closed by server");
    });

    Connection { generation, task }
}

#[cfg(test)]
#[path = "tests/stream_tests.rs"]
mod tests;
