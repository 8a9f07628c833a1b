use std::{sync::Arc, time::Duration};

use shared::domain::{SessionConfig, SessionName};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, Interval, MissedTickBehavior},
};
use tracing::debug;

use crate::api::SessionApi;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollerCommand {
    StartFetching,
    StopFetching,
    Shutdown,
}

#[derive(Clone)]
pub struct PollerHandle {
    commands: mpsc::UnboundedSender<PollerCommand>,
}

impl PollerHandle {
    pub fn start_fetching(&self) {
        let _ = self.commands.send(PollerCommand::StartFetching);
    }

    pub fn stop_fetching(&self) {
        let _ = self.commands.send(PollerCommand::StopFetching);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(PollerCommand::Shutdown);
    }
}

enum Flow {
    Continue,
    Break,
}

struct Poller {
    period: Duration,
    ticker: Option<Interval>,
    last: Option<SessionConfig>,
}

impl Poller {
    fn handle(&mut self, command: Option<PollerCommand>) -> Flow {
        match command {
            Some(PollerCommand::StartFetching) => {
                if self.ticker.is_none() {
                    let mut ticker = interval(self.period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.ticker = Some(ticker);
                }
                Flow::Continue
            }
            Some(PollerCommand::StopFetching) => {
                self.ticker = None;
                self.last = None;
                Flow::Continue
            }
            Some(PollerCommand::Shutdown) | None => Flow::Break,
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Polls the session config and forwards it only when it changed.
pub fn spawn_poller(
    api: Arc<dyn SessionApi>,
    name: SessionName,
    period: Duration,
    updates: mpsc::UnboundedSender<SessionConfig>,
) -> (PollerHandle, JoinHandle<()>) {
    let (commands, mut inbox) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        let mut poller = Poller {
            period,
            ticker: None,
            last: None,
        };

        loop {
            tokio::select! {
                command = inbox.recv() => {
                    if let Flow::Break = poller.handle(command) {
                        break;
                    }
                }
                _ = next_tick(&mut poller.ticker) => {
                    // A command arriving mid-fetch wins; stop discards the result.
                    let fetched = tokio::select! {
                        result = api.fetch_config(&name) => Some(result),
                        command = inbox.recv() => {
                            if let Flow::Break = poller.handle(command) {
                                break;
                            }
                            None
                        }
                    };
                    match fetched {
                        Some(Ok(config)) => {
                            if poller.last.as_ref() != Some(&config) {
                                poller.last = Some(config.clone());
                                if updates.send(config).is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Err(err)) => {
                            debug!(session = %name, error = %err, "session config poll failed");
                        }
                        None => {}
                    }
                }
            }
        }
    });

    (PollerHandle { commands }, task)
}

#[cfg(test)]
#[path = "tests/poller_tests.rs"]
mod tests;
