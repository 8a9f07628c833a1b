mod config;
mod repl;

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context};
use clap::Parser;
use client_core::{
    git::{active_prompt, blocks_input},
    settings::{
        resolve_agent_config, DirectorySelection, FixedDirectoryPicker, GIT_CREATE_NEW_BRANCH,
        GIT_ENABLED, GIT_MERGE_USE_DEFAULT_COMMIT_MESSAGE,
    },
    DirectoryPicker, HttpSessionApi, InMemoryUserSettings, SessionContext, SessionController,
    SessionSnapshot, SessionState, SetupPhase, UserSettings,
};
use serde_json::Value;
use shared::domain::SessionDescriptor;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{
    wrappers::{BroadcastStream, WatchStream},
    StreamExt,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::{load_settings, Args, Settings},
    repl::{
        describe, parse_line, render_checkpoints, render_prompt, resolution_for, ReplCommand,
        Transcript, HELP,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut settings = load_settings(args.config.as_ref())?;
    settings.apply_args(&args);

    let api = HttpSessionApi::with_timeout(&settings.host, settings.request_timeout())?;
    let user_settings = InMemoryUserSettings::default();
    user_settings
        .set(GIT_ENABLED, Value::Bool(settings.git.enabled))
        .await?;
    user_settings
        .set(GIT_CREATE_NEW_BRANCH, Value::Bool(settings.git.create_new_branch))
        .await?;
    user_settings
        .set(
            GIT_MERGE_USE_DEFAULT_COMMIT_MESSAGE,
            Value::Bool(settings.git.merge_use_default_commit_message),
        )
        .await?;
    let context =
        SessionContext::new(Arc::new(api)).with_user_settings(Arc::new(user_settings));

    let descriptor =
        SessionDescriptor::new(settings.host.clone()).with_name(settings.session.clone());
    let (controller, task) = SessionController::spawn(
        descriptor,
        context.clone(),
        settings.controller_options(),
    );
    info!(host = %settings.host, session = %settings.session, "session controller started");

    let printer = tokio::spawn(print_updates(controller.clone(), settings.host.clone()));
    let outcome = match bring_up(&controller, &context, &settings, &args).await {
        Ok(()) => run_repl(&controller, &context).await,
        Err(err) => Err(err),
    };

    if let Err(err) = controller.shutdown().await {
        warn!("shutdown: {err}");
    }
    let _ = task.await;
    printer.abort();
    outcome
}

/// Waits for setup to settle, creates the session if the server has none,
/// then initializes it.
async fn bring_up(
    controller: &SessionController,
    context: &SessionContext,
    settings: &Settings,
    args: &Args,
) -> anyhow::Result<()> {
    let mut snapshots = controller.subscribe_snapshot();
    let state = snapshots
        .wait_for(|snapshot| {
            matches!(
                snapshot.state,
                SessionState::Setup(SetupPhase::SessionDoesNotExist)
                    | SessionState::SessionReady
                    | SessionState::Error
            )
        })
        .await
        .context("session controller stopped during setup")?
        .state;

    let agent_config = match &settings.model {
        Some(model) => Some(
            resolve_agent_config(context.key_store.as_ref(), model, args.api_key.as_deref())
                .await?,
        ),
        None => None,
    };

    match state {
        SessionState::Setup(SetupPhase::SessionDoesNotExist) => {
            let Some(agent_config) = agent_config.clone() else {
                bail!("session {} does not exist; pass --model to create it", settings.session);
            };
            let path = project_directory(args.path.clone()).await?;
            println!("creating session {} in {path}", settings.session);
            controller
                .create(path, agent_config)
                .await
                .context("failed to create session")?;
        }
        SessionState::Error => bail!("session could not be set up on {}", settings.host),
        _ => {}
    }

    controller.init(None, agent_config).await?;
    Ok(())
}

async fn project_directory(path: Option<PathBuf>) -> anyhow::Result<String> {
    let directory = match path {
        Some(path) if path.is_relative() => Some(std::env::current_dir()?.join(path)),
        Some(path) => Some(path),
        None => Some(std::env::current_dir()?),
    };
    match FixedDirectoryPicker::new(directory).pick_directory().await? {
        DirectorySelection::Selected(path) => Ok(path.display().to_string()),
        DirectorySelection::Cancelled => bail!("no project directory selected"),
    }
}

async fn run_repl(controller: &SessionController, context: &SessionContext) -> anyhow::Result<()> {
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            return Ok(());
        };
        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        if command == ReplCommand::Quit {
            return Ok(());
        }
        if let Err(err) = execute(controller, context, command).await {
            println!("error: {err:#}");
        }
    }
}

async fn execute(
    controller: &SessionController,
    context: &SessionContext,
    command: ReplCommand,
) -> anyhow::Result<()> {
    match command {
        ReplCommand::Say(text) => {
            let snapshot = controller.snapshot();
            if blocks_input(&snapshot.context) {
                if let Some(prompt) = active_prompt(&snapshot.context) {
                    println!("{}", render_prompt(&prompt));
                }
                return Ok(());
            }
            controller.send_message(text).await?;
        }
        ReplCommand::Pause => controller.pause().await?,
        ReplCommand::Resume => controller.resume().await?,
        ReplCommand::Toggle => controller.toggle().await?,
        ReplCommand::Reset => controller.reset().await?,
        ReplCommand::Delete => controller.delete().await?,
        ReplCommand::Status => println!("{}", status_line(&controller.snapshot())),
        ReplCommand::Checkpoints => {
            println!("{}", render_checkpoints(&controller.snapshot().checkpoints))
        }
        ReplCommand::Select(checkpoint_id) => controller.select_checkpoint(checkpoint_id).await?,
        ReplCommand::Revert(checkpoint_id) => {
            controller.revert_to(checkpoint_id).await?;
            if let Some(message) = controller.take_commit_message().await? {
                println!("your message at that point was: {message}");
            }
        }
        ReplCommand::Diff => {
            let diff = controller.diff_checkpoints().await?;
            println!("{}", serde_json::to_string_pretty(&diff)?);
        }
        ReplCommand::Git(answer) => {
            let Some(prompt) = active_prompt(&controller.snapshot().context) else {
                bail!("no git prompt is pending");
            };
            controller
                .resolve_git(resolution_for(&prompt, answer)?)
                .await?;
        }
        ReplCommand::Merge(message) => controller.request_merge(message.as_deref()).await?,
        ReplCommand::Model { model, api_key } => {
            let agent_config =
                resolve_agent_config(context.key_store.as_ref(), &model, api_key.as_deref())
                    .await?;
            controller.update_config(agent_config).await?;
        }
        ReplCommand::Help => println!("{HELP}"),
        ReplCommand::Quit => {}
    }
    Ok(())
}

fn status_line(snapshot: &SessionSnapshot) -> String {
    let mut line = format!(
        "{} [{}] model={} path={}",
        snapshot.name,
        snapshot.state,
        snapshot.model.as_deref().unwrap_or("-"),
        snapshot.path.as_deref().unwrap_or("-"),
    );
    if let Some(selected) = &snapshot.checkpoints.selected {
        line.push_str(&format!(" viewing checkpoint {}", selected.checkpoint_id));
    }
    if let Some(failure) = &snapshot.last_failure {
        line.push_str(&format!(" last failure: {} ({})", failure.message, failure.command));
    }
    line
}

/// Prints new messages, prompts and notable notifications as they arrive.
async fn print_updates(controller: SessionController, host: String) {
    let mut snapshots = WatchStream::new(controller.subscribe_snapshot());
    let mut notifications = BroadcastStream::new(controller.subscribe());
    let mut transcript = Transcript::default();
    loop {
        tokio::select! {
            Some(snapshot) = snapshots.next() => {
                for line in transcript.update(&snapshot.context) {
                    println!("{line}");
                }
            }
            Some(notification) = notifications.next() => match notification {
                Ok(notification) => {
                    if let Some(line) = describe(&notification, &host) {
                        println!("{line}");
                    }
                }
                Err(err) => warn!("notifications lagged: {err}"),
            },
            else => break,
        }
    }
}
