// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use anyhow::Context;
use cardsign::{
    card::CommandCardProvider,
    channel::{self, Role},
    cli,
    credentials::{CredentialStore, SessionKeyProtector},
    pinentry::PinentryPrompt,
    protocol::Submission,
    service::{ConsoleObserver, Orchestrator},
};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), anyhow::Error> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(EnvFilter::from_env("CARDSIGN_LOG"));
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    let opts = cli::Cli::parse();
    let config = opts.config.unwrap_or_default();
    match opts.command {
        cli::Command::Sign { profile, files } => {
            let profile = config.profile(profile.as_deref())?;
            let submission = Submission::new(profile.identity(), &profile.sign_command, &files)
                .context("failed to resolve the files to sign")?;

            match channel::acquire(&config.runtime_directory()).await? {
                Role::Client(client) => {
                    if submission.files.is_empty() {
                        tracing::info!("A signing server is already running; nothing to submit");
                        return Ok(());
                    }
                    client.submit(&submission).await?;
                    Ok(())
                }
                Role::Server(listener) => {
                    let halt_token = CancellationToken::new();
                    tokio::spawn(signal_handler(halt_token.clone()));

                    let credentials = CredentialStore::new(
                        Box::new(CommandCardProvider::new(
                            config.card_status_command.clone(),
                            config.min_pin_length,
                            config.max_pin_length,
                        )),
                        Box::new(PinentryPrompt::new(&config.pinentry)),
                        Box::new(SessionKeyProtector::new()?),
                    );
                    let mut orchestrator = Orchestrator::new(
                        credentials,
                        Box::new(ConsoleObserver),
                        config.idle_timeout(),
                    );
                    orchestrator
                        .enqueue_local(submission.identity, &submission.sign_command, &submission.files)
                        .context("failed to queue the files to sign")?;
                    orchestrator.run(listener, halt_token).await?;

                    print!("{}", orchestrator.queue().summary());
                    Ok(())
                }
            }
        }
        cli::Command::Config => {
            println!("{config}");
            Ok(())
        }
    }
}

/// Install and manage signal handlers for the process.
///
/// # SIGTERM and SIGINT
///
/// Sending SIGTERM or SIGINT to the server will cause it to stop accepting new
/// files. The file being signed is allowed to complete before the process
/// shuts down; files still waiting in the queue are not signed.
async fn signal_handler(halt_token: CancellationToken) -> Result<(), anyhow::Error> {
    let mut sigterm_stream = signal(SignalKind::terminate()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGTERM signal handler")
    })?;
    let mut sigint_stream = signal(SignalKind::interrupt()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGINT signal handler")
    })?;

    loop {
        tokio::select! {
            _ = sigterm_stream.recv() => {
                tracing::info!("SIGTERM received, beginning server shutdown");
                halt_token.cancel();
            }
            _ = sigint_stream.recv() => {
                tracing::info!("SIGINT received, beginning server shutdown");
                halt_token.cancel();
            }
        }
    }
}
