use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use client_core::{
    machine::MachineOptions,
    retry::{RetryPolicy, CREATION_BASE_DELAY, CREATION_MAX_DELAY},
    ControllerOptions,
};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Looked up next to the working directory as agent.toml, agent.json, ...
pub const DEFAULT_CONFIG_NAME: &str = "agent";
pub const ENV_PREFIX: &str = "APP";

/// Terminal client for a coding agent server
#[derive(Parser, Debug, Default)]
#[command(name = "agent-cli")]
pub struct Args {
    /// Agent server url
    #[arg(long, env = "AGENT_HOST")]
    pub host: Option<String>,

    /// Session name on the server
    #[arg(long)]
    pub session: Option<String>,

    /// Project directory for a new session
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Model id the agent runs with
    #[arg(long, env = "AGENT_MODEL")]
    pub model: Option<String>,

    /// API key for the model; stored for the rest of the run
    #[arg(long, env = "AGENT_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Config file; defaults to agent.toml when present
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Create sessions without git versioning
    #[arg(long)]
    pub no_git: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GitPreferences {
    pub enabled: bool,
    pub create_new_branch: bool,
    pub merge_use_default_commit_message: bool,
}

impl Default for GitPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            create_new_branch: true,
            merge_use_default_commit_message: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub session: String,
    pub model: Option<String>,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub healthcheck_interval_ms: u64,
    pub healthcheck_advisory_after: u32,
    pub creation_max_attempts: u32,
    pub git: GitPreferences,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "http://localhost:8000".into(),
            session: shared::domain::DEFAULT_SESSION_NAME.into(),
            model: None,
            poll_interval_ms: 1000,
            request_timeout_ms: 30_000,
            healthcheck_interval_ms: 5000,
            healthcheck_advisory_after: 10,
            creation_max_attempts: 10,
            git: GitPreferences::default(),
        }
    }
}

impl Settings {
    /// Command line flags win over file and environment values.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(host) = &args.host {
            self.host = host.clone();
        }
        if let Some(session) = &args.session {
            self.session = session.clone();
        }
        if let Some(model) = &args.model {
            self.model = Some(model.clone());
        }
        if args.no_git {
            self.git.enabled = false;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn controller_options(&self) -> ControllerOptions {
        let creation = RetryPolicy::exponential(CREATION_BASE_DELAY, 2, CREATION_MAX_DELAY)
            .with_max_attempts(Some(self.creation_max_attempts.max(1)));
        ControllerOptions {
            machine: MachineOptions {
                healthcheck: RetryPolicy::fixed(Duration::from_millis(
                    self.healthcheck_interval_ms,
                )),
                creation,
                advisory_threshold: self.healthcheck_advisory_after,
            },
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
        }
    }
}

pub fn load_settings(path: Option<&PathBuf>) -> anyhow::Result<Settings> {
    let file = match path {
        Some(path) => File::from(path.as_path()).required(true),
        None => File::with_name(DEFAULT_CONFIG_NAME).required(false),
    };
    Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to read client configuration")?
        .try_deserialize()
        .context("invalid client configuration")
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
