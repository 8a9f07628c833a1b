use std::collections::HashMap;

use serde::Serialize;
use shared::{
    domain::{Checkpoint, CheckpointId, SessionConfig},
    protocol::{Message, MessageKind},
};
use tracing::debug;

use crate::error::SessionError;

/// Time-travel view over the session's committed checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckpointTracker {
    pub initial: Option<Checkpoint>,
    pub current: Option<Checkpoint>,
    pub selected: Option<Checkpoint>,
    /// User message to put back in the input box once after a revert.
    pub consume_commit_message: Option<String>,
    #[serde(skip)]
    commits: Vec<Checkpoint>,
    #[serde(skip)]
    path: Option<String>,
}

/// Tracker fields displaced by `begin_revert`.
#[derive(Debug, Clone, PartialEq)]
pub struct RevertRollback {
    selected: Option<Checkpoint>,
    consume_commit_message: Option<String>,
}

/// Checkpoints that produced a commit, re-indexed from zero.
pub fn committed_checkpoints(checkpoints: &[Checkpoint]) -> Vec<Checkpoint> {
    checkpoints
        .iter()
        .filter(|checkpoint| checkpoint.has_commit())
        .enumerate()
        .map(|(index, checkpoint)| Checkpoint {
            index,
            ..checkpoint.clone()
        })
        .collect()
}

/// Maps each checkpoint id to the first user message logged after it.
pub fn checkpoint_message_mappings(messages: &[Message]) -> HashMap<CheckpointId, String> {
    let mut mappings = HashMap::new();
    let mut last_checkpoint: Option<CheckpointId> = None;
    for message in messages {
        match message.kind {
            MessageKind::Checkpoint => {
                last_checkpoint = Some(CheckpointId::from(message.text.as_str()));
            }
            MessageKind::User => {
                if let Some(checkpoint_id) = last_checkpoint.take() {
                    mappings.insert(checkpoint_id, message.text.clone());
                }
            }
            _ => {}
        }
    }
    mappings
}

impl CheckpointTracker {
    pub fn commits(&self) -> &[Checkpoint] {
        &self.commits
    }

    pub fn is_time_travelling(&self) -> bool {
        self.selected.is_some()
    }

    pub fn sync(&mut self, config: &SessionConfig) {
        if self.path.is_some() && self.path != config.path {
            debug!(from = ?self.path, to = ?config.path, "project path changed, clearing checkpoints");
            *self = Self::default();
        }
        self.path = config.path.clone();
        self.commits = committed_checkpoints(&config.checkpoints);

        if self.commits.is_empty() {
            self.initial = None;
            self.current = None;
            self.selected = None;
            return;
        }
        self.initial = self.commits.first().cloned();
        self.current = self.commits.last().cloned();
    }

    pub fn find(&self, checkpoint_id: &CheckpointId) -> Option<&Checkpoint> {
        self.commits
            .iter()
            .find(|checkpoint| &checkpoint.checkpoint_id == checkpoint_id)
    }

    /// Enters time travel at `checkpoint_id`, or leaves it with `None`.
    pub fn select(&mut self, checkpoint_id: Option<&CheckpointId>) -> Result<(), SessionError> {
        self.selected = match checkpoint_id {
            Some(checkpoint_id) => Some(
                self.find(checkpoint_id)
                    .cloned()
                    .ok_or_else(|| SessionError::UnknownCheckpoint(checkpoint_id.clone()))?,
            ),
            None => None,
        };
        Ok(())
    }

    /// Checkpoint pair for the diff view: initial against selected, or
    /// against current when nothing is selected.
    pub fn diff_range(&self) -> Option<(CheckpointId, CheckpointId)> {
        let initial = self.initial.as_ref()?;
        let dest = self.selected.as_ref().or(self.current.as_ref())?;
        Some((initial.checkpoint_id.clone(), dest.checkpoint_id.clone()))
    }

    /// Leaves time travel ahead of a revert, remembering the message the user
    /// typed after the selected checkpoint. Returns what `abort_revert` needs
    /// to undo this.
    pub fn begin_revert(&mut self, messages: &[Message]) -> RevertRollback {
        let rollback = RevertRollback {
            selected: self.selected.clone(),
            consume_commit_message: self.consume_commit_message.clone(),
        };
        if let Some(selected) = self.selected.take() {
            self.consume_commit_message =
                checkpoint_message_mappings(messages).remove(&selected.checkpoint_id);
        }
        rollback
    }

    /// Puts time travel back the way it was before a revert that failed.
    pub fn abort_revert(&mut self, rollback: RevertRollback) {
        debug!("revert failed, restoring checkpoint selection");
        self.selected = rollback.selected;
        self.consume_commit_message = rollback.consume_commit_message;
    }

    pub fn take_commit_message(&mut self) -> Option<String> {
        self.consume_commit_message.take()
    }
}

#[cfg(test)]
#[path = "tests/checkpoint_tests.rs"]
mod tests;
